//! Pipeline error types

use thiserror::Error;

use stratus_reconcile::EndpointError;

/// Errors from running an external tool
#[derive(Debug, Error)]
pub enum ToolError {
    /// The process could not be started
    #[error("failed to start {program}: {source}")]
    Spawn {
        /// Program that failed to start
        program: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// The process exited with a non-zero status
    #[error("{program} failed ({status}): {message}")]
    Failed {
        /// Program that failed
        program: String,
        /// Exit status as reported by the OS
        status: String,
        /// Aggregated failure description
        message: String,
    },

    /// The subprocess pool has been shut down
    #[error("subprocess pool closed")]
    PoolClosed,
}

impl ToolError {
    /// Whether running the tool again may succeed.
    ///
    /// A non-zero exit is treated as transient; a program that cannot be
    /// started will not start on the next attempt either.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

/// Errors from a downstream stage
#[derive(Debug, Error)]
pub enum StageError {
    /// The external tool failed
    #[error(transparent)]
    Tool(#[from] ToolError),

    /// The API endpoint could not be resolved
    #[error(transparent)]
    Endpoint(#[from] EndpointError),

    /// Reading or writing the snapshot exchanged with a tool failed
    #[error(transparent)]
    Snapshot(#[from] stratus_common::Error),

    /// The snapshot cannot be processed by this stage
    #[error("invalid snapshot: {0}")]
    Invalid(String),
}

impl StageError {
    /// Create an invalid-snapshot error
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }

    /// Whether retrying the stage may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Tool(e) => e.is_retryable(),
            Self::Snapshot(e) => e.is_retryable(),
            Self::Endpoint(_) | Self::Invalid(_) => false,
        }
    }
}
