//! Queue error types

use thiserror::Error;

/// Errors raised by a work queue
#[derive(Debug, Error)]
pub enum QueueError {
    /// The message is not leased (already acked, or its lease expired)
    #[error("message {0} is not leased")]
    NotLeased(u64),

    /// The queue has been shut down
    #[error("queue closed")]
    Closed,

    /// Publishing failed
    #[error("failed to publish to {subject}: {message}")]
    Publish {
        /// Target subject
        subject: String,
        /// What went wrong
        message: String,
    },

    /// A payload could not be encoded or decoded
    #[error("payload error: {0}")]
    Payload(#[from] serde_json::Error),

    /// No reply arrived in time
    #[error("no reply on {subject} within {timeout_secs}s")]
    ReplyTimeout {
        /// Reply subject waited on
        subject: String,
        /// Time waited
        timeout_secs: u64,
    },

    /// The reply waiter was dropped before a reply arrived
    #[error("reply subscription on {0} closed")]
    ReplyDropped(String),

    /// A reply answered a different task
    #[error("reply for task {got} while waiting for {expected}")]
    ReplyMismatch {
        /// Task id that was dispatched
        expected: String,
        /// Task id the reply carried
        got: String,
    },
}

impl QueueError {
    /// Create a publish error
    pub fn publish(subject: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Publish {
            subject: subject.into(),
            message: message.into(),
        }
    }
}

/// Errors while delivering a reply
#[derive(Debug, Error)]
pub enum ConsumerError {
    /// The durable consumer no longer exists; nobody will read the reply
    #[error("consumer no longer exists")]
    ConsumerGone,

    /// The reply could not be delivered before the deadline
    #[error("reply not delivered within {0}s")]
    DeliveryTimeout(u64),

    /// The queue rejected the operation
    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl ConsumerError {
    /// Whether another delivery attempt may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Queue(_))
    }
}

/// Why a message cannot be processed
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    /// A required header is absent or empty
    #[error("missing header {0}")]
    MissingHeader(&'static str),

    /// The task id is not a UUID
    #[error("invalid task id {0:?}")]
    InvalidTaskId(String),

    /// The payload is not a task
    #[error("invalid task payload: {0}")]
    InvalidBody(String),
}
