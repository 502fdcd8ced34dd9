//! Request side of the work queue
//!
//! [`QueueDispatcher`] publishes one task with a fresh id and private reply
//! subject, then waits for the consumer's [`Reply`].

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument};
use uuid::Uuid;

use stratus_common::model::{Task, TaskResult};

use crate::consumer::{Envelope, Reply};
use crate::error::QueueError;
use crate::queue::WorkQueue;

/// Publishes tasks on the work subject and awaits their replies
#[derive(Clone)]
pub struct QueueDispatcher {
    queue: Arc<dyn WorkQueue>,
    subject: String,
    reply_timeout: Option<Duration>,
}

impl QueueDispatcher {
    /// Dispatcher publishing on `subject`.
    ///
    /// Without a reply timeout a dispatch waits as long as the task runs.
    pub fn new(
        queue: Arc<dyn WorkQueue>,
        subject: impl Into<String>,
        reply_timeout: Option<Duration>,
    ) -> Self {
        Self {
            queue,
            subject: subject.into(),
            reply_timeout,
        }
    }

    /// Send `task` and return the result the consumer reported for it
    #[instrument(skip(self, task), fields(task = %task.kind()))]
    pub async fn dispatch(
        &self,
        manifest: &str,
        cluster: &str,
        task: &Task,
    ) -> Result<TaskResult, QueueError> {
        let task_id = Uuid::new_v4();
        let envelope = Envelope {
            task_id,
            reply_subject: format!("{}.reply.{task_id}", self.subject),
            manifest: manifest.to_string(),
            cluster: cluster.to_string(),
        };

        let pending = self.queue.expect_reply(&envelope.reply_subject).await?;
        let _wait = ReplyWait {
            queue: self.queue.as_ref(),
            subject: &envelope.reply_subject,
        };
        let payload = serde_json::to_vec(task)?;
        self.queue
            .publish(&self.subject, envelope.headers(), payload)
            .await?;
        debug!(task_id = %envelope.task_id, "task published");

        let message = match self.reply_timeout {
            Some(limit) => tokio::time::timeout(limit, pending)
                .await
                .map_err(|_| QueueError::ReplyTimeout {
                    subject: envelope.reply_subject.clone(),
                    timeout_secs: limit.as_secs(),
                })?,
            None => pending.await,
        }
        .map_err(|_| QueueError::ReplyDropped(envelope.reply_subject.clone()))?;

        let reply: Reply = serde_json::from_slice(&message.payload)?;
        let expected = envelope.task_id.to_string();
        if reply.task_id != expected {
            return Err(QueueError::ReplyMismatch {
                expected,
                got: reply.task_id,
            });
        }
        Ok(reply.result)
    }
}

/// Drops the reply subscription when a dispatch ends, including on timeout
/// or when the dispatching future is dropped
struct ReplyWait<'a> {
    queue: &'a dyn WorkQueue,
    subject: &'a str,
}

impl Drop for ReplyWait<'_> {
    fn drop(&mut self) {
        self.queue.release_reply(self.subject);
    }
}
