//! Task pipeline for Stratus
//!
//! Turns one [`Task`](stratus_common::model::Task) into exactly one
//! [`TaskResult`](stratus_common::model::TaskResult):
//! - [`pass`] - the passes a task is split into and their severities
//! - [`executor`] - runs passes in order, honouring cancellation and levels
//! - [`stages`] - the downstream operations passes delegate to
//! - [`tool`] - bounded, retried execution of external tools

#![deny(missing_docs)]

pub mod error;
pub mod executor;
pub mod pass;
pub mod stages;
pub mod tool;
pub mod tracker;

pub use error::{StageError, ToolError};
pub use executor::{Executor, TaskProcessor, Work};
pub use pass::{passes_for, ErrorLevel, Pass, PassKind};
pub use stages::{Stages, ToolStages};
pub use tool::{OutputFormat, ToolInvocation, ToolRunner};
pub use tracker::Tracker;
