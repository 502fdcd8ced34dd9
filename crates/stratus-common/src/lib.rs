//! Common types for Stratus: cluster model, errors, retry and telemetry
//!
//! Every other Stratus crate builds on this one:
//! - [`model`] - clusters, node pools, tasks, results and workflows
//! - [`retry`] - the single retry-with-backoff utility used for tools, replies and acks
//! - [`telemetry`] - tracing subscriber and OpenTelemetry export setup
//! - [`config`] - operator configuration loaded from YAML

#![deny(missing_docs)]

pub mod config;
pub mod error;
pub mod model;
pub mod retry;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
