//! Workflow persistence
//!
//! Workflows are stored per project as a map of cluster name to
//! [`Workflow`]. The orchestrator saves before and after every downstream
//! call, so a restarted operator sees which stage each cluster was in.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use stratus_common::model::Workflow;

use crate::error::OrchestratorError;

/// Cluster name to workflow
pub type ProjectWorkflows = BTreeMap<String, Workflow>;

/// Persists per-cluster workflows of each project
#[cfg_attr(test, automock)]
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    /// Every workflow of `project`; empty when nothing was saved yet
    async fn load(&self, project: &str) -> Result<ProjectWorkflows, OrchestratorError>;

    /// Save the workflow of one cluster
    async fn save(
        &self,
        project: &str,
        cluster: &str,
        workflow: &Workflow,
    ) -> Result<(), OrchestratorError>;
}

/// Stores each project as `<dir>/<project>.json`
pub struct FileWorkflowStore {
    dir: PathBuf,
    // Serialises read-modify-write cycles of concurrently finishing clusters
    write: Mutex<()>,
}

impl FileWorkflowStore {
    /// Store rooted at `dir`, created on first save
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write: Mutex::new(()),
        }
    }

    fn path(&self, project: &str) -> PathBuf {
        self.dir.join(format!("{project}.json"))
    }

    async fn read(path: &Path, project: &str) -> Result<ProjectWorkflows, OrchestratorError> {
        match tokio::fs::read(path).await {
            Ok(data) => serde_json::from_slice(&data)
                .map_err(|e| OrchestratorError::store(project, format!("{}: {e}", path.display()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ProjectWorkflows::new()),
            Err(e) => Err(OrchestratorError::store(
                project,
                format!("{}: {e}", path.display()),
            )),
        }
    }
}

#[async_trait]
impl WorkflowStore for FileWorkflowStore {
    async fn load(&self, project: &str) -> Result<ProjectWorkflows, OrchestratorError> {
        Self::read(&self.path(project), project).await
    }

    async fn save(
        &self,
        project: &str,
        cluster: &str,
        workflow: &Workflow,
    ) -> Result<(), OrchestratorError> {
        let _guard = self.write.lock().await;
        let path = self.path(project);
        let io_err = |e: std::io::Error| OrchestratorError::store(project, e.to_string());

        let mut workflows = Self::read(&path, project).await?;
        workflows.insert(cluster.to_string(), workflow.clone());
        let data = serde_json::to_vec_pretty(&workflows)
            .map_err(|e| OrchestratorError::store(project, e.to_string()))?;

        tokio::fs::create_dir_all(&self.dir).await.map_err(io_err)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, data).await.map_err(io_err)?;
        tokio::fs::rename(&tmp, &path).await.map_err(io_err)?;

        debug!(project, cluster, stage = %workflow.stage, status = ?workflow.status, "workflow saved");
        Ok(())
    }
}

/// In-memory store that also keeps every saved revision
#[derive(Default)]
pub struct MemoryWorkflowStore {
    projects: DashMap<String, ProjectWorkflows>,
    history: DashMap<(String, String), Vec<Workflow>>,
}

impl MemoryWorkflowStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Every revision saved for one cluster, oldest first
    pub fn history(&self, project: &str, cluster: &str) -> Vec<Workflow> {
        self.history
            .get(&(project.to_string(), cluster.to_string()))
            .map(|h| h.value().clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl WorkflowStore for MemoryWorkflowStore {
    async fn load(&self, project: &str) -> Result<ProjectWorkflows, OrchestratorError> {
        Ok(self
            .projects
            .get(project)
            .map(|p| p.value().clone())
            .unwrap_or_default())
    }

    async fn save(
        &self,
        project: &str,
        cluster: &str,
        workflow: &Workflow,
    ) -> Result<(), OrchestratorError> {
        self.projects
            .entry(project.to_string())
            .or_default()
            .insert(cluster.to_string(), workflow.clone());
        self.history
            .entry((project.to_string(), cluster.to_string()))
            .or_default()
            .push(workflow.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratus_common::model::{Stage, WorkflowStatus};

    fn running(stage: Stage) -> Workflow {
        let mut wf = Workflow::default();
        wf.start(stage, "working");
        wf
    }

    #[tokio::test]
    async fn file_store_keeps_every_cluster_of_a_project() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileWorkflowStore::new(dir.path().join("workflows"));

        assert!(store.load("shop").await.unwrap().is_empty());

        store.save("shop", "prod", &running(Stage::Apply)).await.unwrap();
        store.save("shop", "staging", &running(Stage::Create)).await.unwrap();
        let mut done = running(Stage::Apply);
        done.finish();
        store.save("shop", "prod", &done).await.unwrap();

        let loaded = store.load("shop").await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded["prod"].status, WorkflowStatus::Done);
        assert_eq!(loaded["staging"].stage, Stage::Create);
        assert!(dir.path().join("workflows/shop.json").exists());
        assert!(!dir.path().join("workflows/shop.json.tmp").exists());
    }

    #[tokio::test]
    async fn file_store_rejects_corrupt_documents() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("shop.json"), b"not json").unwrap();
        let store = FileWorkflowStore::new(dir.path());

        let err = store.load("shop").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Store { .. }));
    }

    #[tokio::test]
    async fn memory_store_records_history() {
        let store = MemoryWorkflowStore::new();
        store.save("shop", "prod", &running(Stage::Create)).await.unwrap();
        store.save("shop", "prod", &running(Stage::Apply)).await.unwrap();

        let history = store.history("shop", "prod");
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].stage, Stage::Apply);
        assert_eq!(store.load("shop").await.unwrap()["prod"].stage, Stage::Apply);
    }
}
