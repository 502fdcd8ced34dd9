//! Work queue abstraction
//!
//! A durable, at-least-once queue: every fetched message is leased for
//! [`WorkQueue::ack_wait`] and redelivered unless it is acked before the lease
//! runs out. Handlers extend their lease with [`WorkQueue::in_progress`].

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;

#[cfg(test)]
use mockall::automock;

use crate::error::QueueError;

/// Header carrying the task UUID
pub const TASK_ID: &str = "task-id";
/// Header naming the subject the reply must be published to
pub const REPLY_SUBJECT: &str = "reply-subject";
/// Header naming the project manifest the task belongs to
pub const MANIFEST: &str = "manifest";
/// Header naming the cluster the task belongs to
pub const CLUSTER: &str = "cluster";

/// Message headers
pub type Headers = BTreeMap<String, String>;

/// A message as seen by a consumer
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Message {
    /// Delivery id used to ack, nak or extend the lease
    pub id: u64,
    /// Subject the message was published on
    pub subject: String,
    /// Headers
    pub headers: Headers,
    /// Body
    pub payload: Vec<u8>,
    /// How many times this message has been delivered, starting at 1
    pub delivered: u32,
}

impl Message {
    /// Non-empty header value
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(name)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }
}

/// Durable work queue with leased delivery and request/reply
#[cfg_attr(test, automock)]
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Wait up to `max_wait` for the next message and lease it
    async fn fetch(&self, max_wait: Duration) -> Result<Option<Message>, QueueError>;

    /// Acknowledge a message; it will not be delivered again
    async fn ack(&self, id: u64) -> Result<(), QueueError>;

    /// Reject a message; it is redelivered immediately
    async fn nak(&self, id: u64) -> Result<(), QueueError>;

    /// Reset the lease of a message
    async fn in_progress(&self, id: u64) -> Result<(), QueueError>;

    /// Whether the durable consumer is still registered
    async fn consumer_exists(&self) -> Result<bool, QueueError>;

    /// Publish a message
    async fn publish(
        &self,
        subject: &str,
        headers: Headers,
        payload: Vec<u8>,
    ) -> Result<(), QueueError>;

    /// Subscribe to the single reply that will be published on `subject`
    async fn expect_reply(&self, subject: &str)
        -> Result<oneshot::Receiver<Message>, QueueError>;

    /// Stop waiting for a reply on `subject`; a late reply is discarded
    fn release_reply(&self, subject: &str);

    /// Lease granted to each fetched message
    fn ack_wait(&self) -> Duration;
}
