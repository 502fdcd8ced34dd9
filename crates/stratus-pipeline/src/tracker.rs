//! Per-task result tracking shared by pass handlers

use stratus_common::model::{ClusterState, TaskErrorKind, TaskResult};

/// Result and diagnostics accumulated while a task runs
#[derive(Debug, Default)]
pub struct Tracker {
    /// Latest result committed by a handler
    pub result: TaskResult,
    /// Failures recorded so far, in order
    pub diagnostics: Vec<String>,
}

impl Tracker {
    /// Record a failure
    pub fn diagnose(&mut self, message: impl Into<String>) {
        self.diagnostics.push(message.into());
    }

    /// Commit a new snapshot as the task result
    pub fn commit(&mut self, state: ClusterState) {
        self.result = TaskResult::update(state);
    }

    /// Report that everything the task covered is gone
    pub fn clear(&mut self) {
        self.result = TaskResult::Clear;
    }

    /// Snapshot the next handler should work on: the last committed one, or
    /// `base` if nothing has been committed yet
    pub fn latest(&self, base: &ClusterState) -> ClusterState {
        match &self.result {
            TaskResult::Update {
                kubernetes,
                load_balancers,
            } => ClusterState::new(kubernetes.clone(), load_balancers.clone()),
            _ => base.clone(),
        }
    }

    /// Partial-failure result carrying every diagnostic
    pub fn failure(&self) -> TaskResult {
        TaskResult::Error {
            kind: TaskErrorKind::Partial,
            description: self.diagnostics.join("; "),
        }
    }
}
