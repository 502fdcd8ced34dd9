//! Retry utilities with configurable backoff and jitter.
//!
//! Every retried operation in Stratus goes through [`retry_with_backoff`] or
//! [`retry_with_backoff_if`]: external tool invocations, reply delivery and
//! message acknowledgement only differ in the [`RetryConfig`] they pass.
//!
//! # Example
//!
//! ```ignore
//! use stratus_common::retry::{retry_with_backoff, RetryConfig};
//!
//! let config = RetryConfig::linear(3, Duration::from_secs(5));
//! retry_with_backoff(&config, "terraform apply", || runner.run(&invocation)).await?;
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

/// Shape of the delay between attempts
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Backoff {
    /// Same delay before every retry
    Fixed,
    /// Delay grows as `attempt * initial_delay`
    Linear,
    /// Delay grows as `initial_delay * multiplier^(attempt - 1)`
    Exponential {
        /// Growth factor
        multiplier: f64,
    },
}

/// Randomisation applied on top of the computed delay
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Jitter {
    /// No randomisation
    None,
    /// Scale the delay by a factor in `0.5..1.5`
    Proportional,
    /// Add a random duration in `0..=max`
    Additive(Duration),
}

/// Configuration for operations that may fail transiently.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = infinite)
    pub max_attempts: u32,
    /// Base delay between attempts
    pub initial_delay: Duration,
    /// Upper bound for any single delay, applied after jitter
    pub max_delay: Duration,
    /// Delay growth
    pub backoff: Backoff,
    /// Delay randomisation
    pub jitter: Jitter,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0, // infinite
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff: Backoff::Exponential { multiplier: 2.0 },
            jitter: Jitter::Proportional,
        }
    }
}

impl RetryConfig {
    /// Linear backoff without jitter, as used for external tool invocations
    pub fn linear(attempts: u32, step: Duration) -> Self {
        Self {
            max_attempts: attempts,
            initial_delay: step,
            max_delay: step.saturating_mul(attempts.max(1)),
            backoff: Backoff::Linear,
            jitter: Jitter::None,
        }
    }

    /// Fixed delay plus up to `jitter` of random extra wait
    pub fn fixed_with_jitter(attempts: u32, delay: Duration, jitter: Duration) -> Self {
        Self {
            max_attempts: attempts,
            initial_delay: delay,
            max_delay: delay + jitter,
            backoff: Backoff::Fixed,
            jitter: Jitter::Additive(jitter),
        }
    }

    /// Cap every delay at `max_delay`
    pub fn capped_at(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Delay before the retry that follows failed attempt number `attempt` (1-based),
    /// before jitter
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let delay = match self.backoff {
            Backoff::Fixed => self.initial_delay,
            Backoff::Linear => self.initial_delay.saturating_mul(attempt),
            Backoff::Exponential { multiplier } => {
                let factor = multiplier.powi(attempt.saturating_sub(1).min(64) as i32);
                Duration::from_secs_f64(
                    (self.initial_delay.as_secs_f64() * factor).min(self.max_delay.as_secs_f64()),
                )
            }
        };
        delay.min(self.max_delay)
    }

    /// Delay before the next retry including jitter, never above `max_delay`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        let jittered = match self.jitter {
            Jitter::None => base,
            Jitter::Proportional => {
                let factor = rand::thread_rng().gen_range(0.5..1.5);
                Duration::from_secs_f64(base.as_secs_f64() * factor)
            }
            Jitter::Additive(max) if max.is_zero() => base,
            Jitter::Additive(max) => {
                base + Duration::from_millis(rand::thread_rng().gen_range(0..=max.as_millis() as u64))
            }
        };
        jittered.min(self.max_delay)
    }

    fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts > 0 && attempt >= self.max_attempts
    }
}

/// Execute an async operation, retrying every failure.
///
/// Retries indefinitely (or up to `max_attempts`) until success and returns the
/// last error when attempts are exhausted.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_with_backoff_if(config, operation_name, operation, |_| true).await
}

/// Execute an async operation, retrying only failures `is_retryable` accepts.
///
/// A non-retryable error is returned immediately without sleeping.
pub async fn retry_with_backoff_if<F, Fut, T, E, R>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
    is_retryable: R,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    R: Fn(&E) -> bool,
{
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if !is_retryable(&e) {
                    warn!(
                        operation = %operation_name,
                        attempt,
                        error = %e,
                        "Operation failed with non-retryable error"
                    );
                    return Err(e);
                }

                if config.exhausted(attempt) {
                    error!(
                        operation = %operation_name,
                        attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                let delay = config.delay_for(attempt);
                warn!(
                    operation = %operation_name,
                    attempt,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "Operation failed, retrying"
                );

                tokio::time::sleep(delay).await;
            }
        }
    }
}
