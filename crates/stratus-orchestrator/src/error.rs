//! Orchestrator error types

use thiserror::Error;

use stratus_queue::QueueError;

/// Errors raised while reconciling a project
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The project is not registered
    #[error("unknown project {0}")]
    UnknownProject(String),

    /// Workflow state could not be read or written
    #[error("workflow store error for {project}: {message}")]
    Store {
        /// Project whose workflows were being persisted
        project: String,
        /// What went wrong
        message: String,
    },

    /// The task could not be handed to the builder or its reply was lost
    #[error("dispatch failed: {0}")]
    Dispatch(#[from] QueueError),

    /// The builder reported a failed task
    #[error("{stage} failed for {cluster}: {description}")]
    Task {
        /// Cluster the task belonged to
        cluster: String,
        /// Stage that failed
        stage: String,
        /// Diagnostics reported by the builder
        description: String,
    },

    /// Reconciliation was cancelled between steps
    #[error("reconciliation of {0} cancelled")]
    Cancelled(String),
}

impl OrchestratorError {
    /// Create a store error
    pub fn store(project: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Store {
            project: project.into(),
            message: message.into(),
        }
    }

    /// Whether a later reconciliation round may succeed without user action
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Store { .. } | Self::Dispatch(_))
    }
}
