//! Durable work queue for Stratus
//!
//! Tasks travel from the orchestrator to the builder over a leased,
//! at-least-once queue:
//! - [`queue`] - the [`WorkQueue`] abstraction and message headers
//! - [`broker`] - in-process [`MemoryBroker`] implementation
//! - [`consumer`] - worker slots that parse, execute, reply and acknowledge
//! - [`lease`] - lease renewal while a task runs
//! - [`dispatcher`] - publishes a task and waits for its reply

#![deny(missing_docs)]

pub mod broker;
pub mod consumer;
pub mod dispatcher;
pub mod error;
pub mod lease;
pub mod queue;

pub use broker::MemoryBroker;
pub use consumer::{Consumer, ConsumerConfig, Envelope, Outcome, Reply};
pub use dispatcher::QueueDispatcher;
pub use error::{ConsumerError, ParseError, QueueError};
pub use lease::{refresh_interval, LeaseRefresher};
pub use queue::{Headers, Message, WorkQueue};
