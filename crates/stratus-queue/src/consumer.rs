//! Durable work queue consumer
//!
//! Each worker slot fetches one message at a time and drives it through:
//!
//! 1. header and body parsing; a message that cannot be parsed is poison and
//!    is answered with a single best-effort reply, then dropped
//! 2. task execution under a [`LeaseRefresher`]
//! 3. reply delivery, retried within a deadline while the consumer still
//!    exists; a reply that cannot be delivered leads to a nak
//! 4. acknowledgement, retried for about a minute
//!
//! Delivery is at-least-once: a crash between reply and ack produces a
//! duplicate reply, which the orchestrator tolerates.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use stratus_common::model::{Task, TaskResult};
use stratus_common::retry::{retry_with_backoff, retry_with_backoff_if, RetryConfig};
use stratus_pipeline::TaskProcessor;

use crate::error::{ConsumerError, ParseError};
use crate::lease::{refresh_interval, LeaseRefresher};
use crate::queue::{Headers, Message, WorkQueue, CLUSTER, MANIFEST, REPLY_SUBJECT, TASK_ID};

/// Reply published for every processed task
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Reply {
    /// Manifest the task belonged to
    pub input_manifest: String,
    /// Cluster the task belonged to
    pub cluster: String,
    /// Task id from the request
    pub task_id: String,
    /// Outcome of the task
    pub result: TaskResult,
}

/// Routing information carried in message headers
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    /// Task id
    pub task_id: Uuid,
    /// Where the reply goes
    pub reply_subject: String,
    /// Project manifest name
    pub manifest: String,
    /// Cluster name
    pub cluster: String,
}

impl Envelope {
    /// Read and validate the routing headers of `message`
    pub fn parse(message: &Message) -> Result<Self, ParseError> {
        let required = |name: &'static str| {
            message
                .header(name)
                .map(str::to_string)
                .ok_or(ParseError::MissingHeader(name))
        };

        let raw_id = required(TASK_ID)?;
        let task_id =
            Uuid::parse_str(&raw_id).map_err(|_| ParseError::InvalidTaskId(raw_id.clone()))?;

        Ok(Self {
            task_id,
            reply_subject: required(REPLY_SUBJECT)?,
            manifest: required(MANIFEST)?,
            cluster: required(CLUSTER)?,
        })
    }

    /// Headers describing this envelope
    pub fn headers(&self) -> Headers {
        Headers::from([
            (TASK_ID.to_string(), self.task_id.to_string()),
            (REPLY_SUBJECT.to_string(), self.reply_subject.clone()),
            (MANIFEST.to_string(), self.manifest.clone()),
            (CLUSTER.to_string(), self.cluster.clone()),
        ])
    }
}

/// How a message left the consumer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Processed, replied and acknowledged
    Acked,
    /// Reply could not be delivered; handed back for redelivery
    Nakked,
    /// Poison message removed from the queue
    Dropped,
    /// Left unacknowledged; the lease will expire and the message returns
    LeftToExpire,
}

/// Consumer tuning
#[derive(Clone, Debug)]
pub struct ConsumerConfig {
    /// Messages processed concurrently
    pub worker_slots: usize,
    /// Longest a single fetch waits before checking for shutdown again
    pub fetch_wait: Duration,
    /// Pause after a failed fetch
    pub fetch_error_backoff: Duration,
    /// Reply delivery attempts
    pub reply_attempts: u32,
    /// Overall deadline for delivering one reply
    pub reply_deadline: Duration,
    /// Base delay between reply attempts
    pub reply_delay: Duration,
    /// Extra random delay between reply attempts
    pub reply_jitter: Duration,
    /// Acknowledgement attempts
    pub ack_attempts: u32,
    /// Base delay between acknowledgement attempts
    pub ack_delay: Duration,
    /// Extra random delay between acknowledgement attempts
    pub ack_jitter: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            worker_slots: stratus_common::config::DEFAULT_WORKER_SLOTS,
            fetch_wait: Duration::from_secs(1),
            fetch_error_backoff: Duration::from_secs(1),
            reply_attempts: 5,
            reply_deadline: Duration::from_secs(5 * 60),
            reply_delay: Duration::from_secs(5),
            reply_jitter: Duration::from_millis(750),
            // 45 attempts of 1s to 1.5s span about a minute
            ack_attempts: 45,
            ack_delay: Duration::from_secs(1),
            ack_jitter: Duration::from_millis(500),
        }
    }
}

/// Pulls tasks from a [`WorkQueue`] and runs them through a [`TaskProcessor`]
pub struct Consumer {
    queue: Arc<dyn WorkQueue>,
    processor: Arc<dyn TaskProcessor>,
    config: ConsumerConfig,
}

impl Consumer {
    /// Consumer for `queue` delegating execution to `processor`
    pub fn new(
        queue: Arc<dyn WorkQueue>,
        processor: Arc<dyn TaskProcessor>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            queue,
            processor,
            config,
        }
    }

    fn refresh_interval(&self) -> Duration {
        refresh_interval(self.queue.ack_wait())
    }

    /// Run every worker slot until `shutdown` fires, then wait for in-flight
    /// messages to finish.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let slots = self.config.worker_slots.max(1);
        info!(slots, "starting queue consumer");

        let mut workers = JoinSet::new();
        for slot in 0..slots {
            let consumer = Arc::clone(&self);
            let shutdown = shutdown.clone();
            workers.spawn(
                async move { consumer.worker(shutdown).await }
                    .instrument(info_span!("worker", slot)),
            );
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "queue worker panicked");
            }
        }
        info!("queue consumer stopped");
    }

    async fn worker(&self, shutdown: CancellationToken) {
        loop {
            let fetched = tokio::select! {
                _ = shutdown.cancelled() => break,
                fetched = self.queue.fetch(self.config.fetch_wait) => fetched,
            };

            match fetched {
                Ok(Some(message)) => {
                    let outcome = self.handle(message, &shutdown).await;
                    debug!(?outcome, "message handled");
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, "fetch failed");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config.fetch_error_backoff) => {}
                    }
                }
            }
        }
    }

    /// Drive one message from parsing to acknowledgement
    pub async fn handle(&self, message: Message, shutdown: &CancellationToken) -> Outcome {
        let parsed = Envelope::parse(&message).and_then(|envelope| {
            serde_json::from_slice::<Task>(&message.payload)
                .map(|task| (envelope, task))
                .map_err(|e| ParseError::InvalidBody(e.to_string()))
        });

        match parsed {
            Ok((envelope, task)) => {
                let span = info_span!(
                    "task",
                    task_id = %envelope.task_id,
                    manifest = %envelope.manifest,
                    cluster = %envelope.cluster,
                    delivered = message.delivered,
                );
                self.process(message.id, envelope, task, shutdown)
                    .instrument(span)
                    .await
            }
            Err(e) => self.reject(&message, e).await,
        }
    }

    /// Answer a poison message once with a no-op result and drop it
    async fn reject(&self, message: &Message, reason: ParseError) -> Outcome {
        warn!(id = message.id, error = %reason, "poison message, replying with no-op");

        let Some(reply_subject) = message.header(REPLY_SUBJECT) else {
            self.ack(message.id).await;
            return Outcome::Dropped;
        };

        let reply = Reply {
            input_manifest: message.header(MANIFEST).unwrap_or_default().to_string(),
            cluster: message.header(CLUSTER).unwrap_or_default().to_string(),
            task_id: message.header(TASK_ID).unwrap_or_default().to_string(),
            result: TaskResult::None,
        };

        let sent = match serde_json::to_vec(&reply) {
            Ok(payload) => self
                .queue
                .publish(reply_subject, message.headers.clone(), payload)
                .await
                .map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };

        match sent {
            Ok(()) => {
                self.ack(message.id).await;
                Outcome::Dropped
            }
            Err(e) => {
                warn!(id = message.id, error = %e, "poison reply failed, leaving lease to expire");
                Outcome::LeftToExpire
            }
        }
    }

    async fn process(
        &self,
        id: u64,
        envelope: Envelope,
        task: Task,
        shutdown: &CancellationToken,
    ) -> Outcome {
        let refresher =
            LeaseRefresher::start(Arc::clone(&self.queue), id, self.refresh_interval(), shutdown);

        info!(task = %task.kind(), "processing task");
        let result = self.processor.process(shutdown, task).await;
        if let TaskResult::Error { description, .. } = &result {
            warn!(error = %description, "task failed");
        }

        let reply = Reply {
            input_manifest: envelope.manifest.clone(),
            cluster: envelope.cluster.clone(),
            task_id: envelope.task_id.to_string(),
            result,
        };
        refresher.stop().await;
        let delivered = self.deliver(&envelope, &reply).await;

        match delivered {
            Ok(()) => {
                self.ack(id).await;
                Outcome::Acked
            }
            Err(e) => {
                error!(error = %e, "reply delivery failed, nakking");
                if let Err(e) = self.queue.nak(id).await {
                    warn!(error = %e, "nak failed, lease will expire");
                }
                Outcome::Nakked
            }
        }
    }

    /// Publish `reply`, checking before every attempt that the consumer exists
    async fn deliver(&self, envelope: &Envelope, reply: &Reply) -> Result<(), ConsumerError> {
        let payload = serde_json::to_vec(reply).map_err(crate::error::QueueError::from)?;
        let headers = envelope.headers();
        let retry = RetryConfig::fixed_with_jitter(
            self.config.reply_attempts,
            self.config.reply_delay,
            self.config.reply_jitter,
        )
        .capped_at(self.refresh_interval());

        let attempts = retry_with_backoff_if(
            &retry,
            "deliver reply",
            || async {
                if !self.queue.consumer_exists().await? {
                    return Err(ConsumerError::ConsumerGone);
                }
                self.queue
                    .publish(&envelope.reply_subject, headers.clone(), payload.clone())
                    .await?;
                Ok(())
            },
            ConsumerError::is_retryable,
        );

        tokio::time::timeout(self.config.reply_deadline, attempts)
            .await
            .map_err(|_| ConsumerError::DeliveryTimeout(self.config.reply_deadline.as_secs()))?
    }

    /// Acknowledge with retries; a failed ack means the message comes back
    async fn ack(&self, id: u64) {
        let retry = RetryConfig::fixed_with_jitter(
            self.config.ack_attempts,
            self.config.ack_delay,
            self.config.ack_jitter,
        );
        if let Err(e) = retry_with_backoff(&retry, "ack", || self.queue.ack(id)).await {
            error!(id, error = %e, "ack failed, message will be redelivered");
        }
    }
}
