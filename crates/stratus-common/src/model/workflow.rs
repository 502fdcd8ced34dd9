//! Per-cluster workflow state visible to users

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Step of a cluster's reconciliation plan currently being executed
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum Stage {
    /// Nothing scheduled
    #[default]
    None,
    /// Building a cluster from scratch
    Create,
    /// Applying the intermediate representation (additions before deletions)
    IntermediateApply,
    /// Moving the API endpoint
    ApiEndpoint,
    /// Removing nodes queued for deletion
    DeleteNodes,
    /// Applying the final desired state
    Apply,
    /// Destroying the cluster or detached load balancers
    Delete,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::None => "none",
            Self::Create => "create",
            Self::IntermediateApply => "intermediate-apply",
            Self::ApiEndpoint => "api-endpoint",
            Self::DeleteNodes => "delete-nodes",
            Self::Apply => "apply",
            Self::Delete => "delete",
        };
        write!(f, "{s}")
    }
}

/// Status of a cluster's workflow
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStatus {
    /// Never processed
    #[default]
    None,
    /// A stage is running
    InProgress,
    /// Converged
    Done,
    /// Last stage failed; see the description
    Error,
}

/// Externally observable progress of one cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    /// Current stage
    pub stage: Stage,
    /// Current status
    pub status: WorkflowStatus,
    /// Human-readable detail
    #[serde(default)]
    pub description: String,
    /// Last mutation time
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Workflow {
    /// Mark `stage` as running
    pub fn start(&mut self, stage: Stage, description: impl Into<String>) {
        self.stage = stage;
        self.status = WorkflowStatus::InProgress;
        self.description = description.into();
        self.updated_at = Some(Utc::now());
    }

    /// Mark the whole plan as converged
    pub fn finish(&mut self) {
        self.stage = Stage::None;
        self.status = WorkflowStatus::Done;
        self.description.clear();
        self.updated_at = Some(Utc::now());
    }

    /// Mark the current stage as failed
    pub fn fail(&mut self, description: impl Into<String>) {
        self.status = WorkflowStatus::Error;
        self.description = description.into();
        self.updated_at = Some(Utc::now());
    }

    /// Whether the last stage failed
    pub fn is_error(&self) -> bool {
        self.status == WorkflowStatus::Error
    }
}
