//! Lease renewal for messages being processed
//!
//! Tasks routinely outlive the queue's ack-wait. While a handler runs, a
//! [`LeaseRefresher`] keeps telling the queue the message is still in
//! progress. The refresher is owned by the handler and joined when it
//! finishes; it is never left running detached.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::queue::WorkQueue;

/// Lower bound of the refresh interval
pub const MIN_REFRESH_INTERVAL: Duration = Duration::from_millis(100);

/// Interval between lease refreshes: a tenth of the ack-wait, at least 100ms
pub fn refresh_interval(ack_wait: Duration) -> Duration {
    (ack_wait / 10).max(MIN_REFRESH_INTERVAL)
}

/// Background task extending the lease of one message
pub struct LeaseRefresher {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl LeaseRefresher {
    /// Start refreshing the lease of message `id` every `interval`.
    ///
    /// Stops on its own when `shutdown` is cancelled.
    pub fn start(
        queue: Arc<dyn WorkQueue>,
        id: u64,
        interval: Duration,
        shutdown: &CancellationToken,
    ) -> Self {
        let cancel = shutdown.child_token();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        match queue.in_progress(id).await {
                            Ok(()) => debug!(id, "lease refreshed"),
                            Err(e) => warn!(id, error = %e, "failed to refresh lease"),
                        }
                    }
                }
            }
        });

        Self { cancel, handle }
    }

    /// Stop refreshing and wait for the background task to exit
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            warn!(error = %e, "lease refresher panicked");
        }
    }
}
