//! Project orchestration for Stratus
//!
//! Drives every cluster of a project from its current to its desired state:
//! - [`view`] - project manifests regrouped per cluster, with result folding
//! - [`planner`] - the ordered steps that reconcile one cluster
//! - [`orchestrator`] - bounded concurrent execution and workflow tracking
//! - [`store`] - workflow persistence

#![deny(missing_docs)]

pub mod error;
pub mod orchestrator;
pub mod planner;
pub mod store;
pub mod view;

pub use error::OrchestratorError;
pub use orchestrator::{Orchestrator, ProjectLocks, ProjectOutcome, TaskDispatcher};
pub use planner::{plan, Step};
pub use store::{FileWorkflowStore, MemoryWorkflowStore, ProjectWorkflows, WorkflowStore};
pub use view::{ClusterEntry, ClusterView, ProjectManifest, ProjectState};
