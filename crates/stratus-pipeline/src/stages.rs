//! Downstream stages driven by pipeline passes
//!
//! [`Stages`] is the seam between pass handlers and the systems that actually
//! change clusters. [`ToolStages`] implements it with external tools: each
//! call writes the snapshot to a per-cluster working directory, runs the
//! configured tool and reads back the snapshot the tool produced.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, instrument};

#[cfg(test)]
use mockall::automock;

use stratus_common::config::{ToolCommand, ToolsConfig};
use stratus_common::model::ClusterState;
use stratus_common::Error;

use crate::error::StageError;
use crate::tool::{retry_for, OutputFormat, ToolInvocation, ToolRunner};

/// File a tool reads its input snapshot from
pub const INPUT_FILE: &str = "input.json";

/// File a tool writes its resulting snapshot to
pub const OUTPUT_FILE: &str = "output.json";

/// Operations the pipeline delegates to the outside world
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Stages: Send + Sync {
    /// Create, resize or remove machines so `current` becomes `desired`
    async fn build_infrastructure(
        &self,
        current: &ClusterState,
        desired: &ClusterState,
    ) -> Result<ClusterState, StageError>;

    /// Join every node into the VPN mesh
    async fn install_vpn(&self, state: &ClusterState) -> Result<ClusterState, StageError>;

    /// Install or upgrade Kubernetes on the nodes
    async fn bootstrap(&self, state: &ClusterState) -> Result<ClusterState, StageError>;

    /// Point certificates, kubeconfigs and nodes at a new API server address
    async fn rewrite_api_endpoint(
        &self,
        state: &ClusterState,
        old: &str,
        new: &str,
    ) -> Result<(), StageError>;

    /// Drain and remove the named nodes (pool name to node names) from Kubernetes
    async fn delete_nodes(
        &self,
        state: &ClusterState,
        nodes: &BTreeMap<String, Vec<String>>,
    ) -> Result<(), StageError>;

    /// Enable or disable the HTTP proxy used by the nodes
    async fn replace_proxy(&self, state: &ClusterState, enabled: bool) -> Result<(), StageError>;

    /// Install or reconfigure the storage engine
    async fn reconcile_storage(&self, state: &ClusterState) -> Result<(), StageError>;

    /// Install or reconfigure the cluster autoscaler
    async fn reconcile_autoscaler(&self, state: &ClusterState) -> Result<(), StageError>;

    /// Destroy every machine in the snapshot
    async fn destroy(&self, state: &ClusterState) -> Result<(), StageError>;
}

/// Input document for infrastructure reconciliation
#[derive(Serialize)]
struct InfrastructureInput<'a> {
    current: &'a ClusterState,
    desired: &'a ClusterState,
}

/// [`Stages`] backed by external tools
pub struct ToolStages {
    runner: ToolRunner,
    tools: ToolsConfig,
    work_root: PathBuf,
}

impl ToolStages {
    /// Stages running `tools` through `runner`, with working directories under `work_root`
    pub fn new(runner: ToolRunner, tools: ToolsConfig, work_root: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            tools,
            work_root: work_root.into(),
        }
    }

    /// Working directory of one stage of one cluster
    pub fn stage_dir(&self, state: &ClusterState, stage: &str) -> PathBuf {
        let cluster = match &state.kubernetes {
            Some(k8s) => k8s.info.id(),
            None => state
                .load_balancers
                .first()
                .map(|lb| lb.target_cluster.clone())
                .unwrap_or_else(|| "unassigned".to_string()),
        };
        self.work_root.join(cluster).join(stage)
    }

    /// Write `input`, run `command` with `args`, return the stage directory
    async fn invoke<T: Serialize + ?Sized>(
        &self,
        command: &ToolCommand,
        state: &ClusterState,
        stage: &str,
        input: &T,
        args: &[String],
        output: OutputFormat,
    ) -> Result<PathBuf, StageError> {
        let dir = self.stage_dir(state, stage);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::io(&dir, e))?;

        let input_path = dir.join(INPUT_FILE);
        let body = serde_json::to_vec_pretty(input).map_err(Error::from)?;
        tokio::fs::write(&input_path, body)
            .await
            .map_err(|e| Error::io(&input_path, e))?;

        // A stale output from a previous run must not be mistaken for this one.
        let output_path = dir.join(OUTPUT_FILE);
        if tokio::fs::try_exists(&output_path).await.unwrap_or(false) {
            tokio::fs::remove_file(&output_path)
                .await
                .map_err(|e| Error::io(&output_path, e))?;
        }

        let invocation = ToolInvocation::from_command(command, &dir)
            .arg(stage)
            .args(["--input", INPUT_FILE, "--output", OUTPUT_FILE])
            .args(args.iter().cloned())
            .env("STRATUS_STAGE", stage)
            .output(output);

        self.runner.run(&invocation, &retry_for(command)).await?;
        debug!(stage, dir = %dir.display(), "stage tool finished");
        Ok(dir)
    }

    async fn read_output(dir: &Path) -> Result<ClusterState, StageError> {
        let path = dir.join(OUTPUT_FILE);
        let data = tokio::fs::read(&path)
            .await
            .map_err(|e| Error::io(&path, e))?;
        Ok(serde_json::from_slice(&data).map_err(Error::from)?)
    }
}

#[async_trait]
impl Stages for ToolStages {
    #[instrument(skip_all, fields(stage = "infrastructure"))]
    async fn build_infrastructure(
        &self,
        current: &ClusterState,
        desired: &ClusterState,
    ) -> Result<ClusterState, StageError> {
        let input = InfrastructureInput { current, desired };
        let dir = self
            .invoke(&self.tools.infrastructure, desired, "apply", &input, &[], OutputFormat::Raw)
            .await?;
        Self::read_output(&dir).await
    }

    #[instrument(skip_all, fields(stage = "vpn"))]
    async fn install_vpn(&self, state: &ClusterState) -> Result<ClusterState, StageError> {
        let dir = self
            .invoke(
                &self.tools.config_management,
                state,
                "vpn",
                state,
                &[],
                OutputFormat::HostTaskJson,
            )
            .await?;
        Self::read_output(&dir).await
    }

    #[instrument(skip_all, fields(stage = "bootstrap"))]
    async fn bootstrap(&self, state: &ClusterState) -> Result<ClusterState, StageError> {
        let dir = self
            .invoke(&self.tools.bootstrap, state, "bootstrap", state, &[], OutputFormat::Raw)
            .await?;
        Self::read_output(&dir).await
    }

    #[instrument(skip_all, fields(stage = "api-endpoint", old = %old, new = %new))]
    async fn rewrite_api_endpoint(
        &self,
        state: &ClusterState,
        old: &str,
        new: &str,
    ) -> Result<(), StageError> {
        let args = [
            "--old-endpoint".to_string(),
            old.to_string(),
            "--new-endpoint".to_string(),
            new.to_string(),
        ];
        self.invoke(
            &self.tools.config_management,
            state,
            "api-endpoint",
            state,
            &args,
            OutputFormat::HostTaskJson,
        )
        .await?;
        Ok(())
    }

    #[instrument(skip_all, fields(stage = "delete-nodes"))]
    async fn delete_nodes(
        &self,
        state: &ClusterState,
        nodes: &BTreeMap<String, Vec<String>>,
    ) -> Result<(), StageError> {
        #[derive(Serialize)]
        struct DeleteInput<'a> {
            state: &'a ClusterState,
            nodes: &'a BTreeMap<String, Vec<String>>,
        }

        self.invoke(
            &self.tools.bootstrap,
            state,
            "delete-nodes",
            &DeleteInput { state, nodes },
            &[],
            OutputFormat::Raw,
        )
        .await?;
        Ok(())
    }

    #[instrument(skip_all, fields(stage = "proxy", enabled = enabled))]
    async fn replace_proxy(&self, state: &ClusterState, enabled: bool) -> Result<(), StageError> {
        let flag = if enabled { "--enable" } else { "--disable" };
        self.invoke(
            &self.tools.config_management,
            state,
            "proxy",
            state,
            &[flag.to_string()],
            OutputFormat::HostTaskJson,
        )
        .await?;
        Ok(())
    }

    #[instrument(skip_all, fields(stage = "storage"))]
    async fn reconcile_storage(&self, state: &ClusterState) -> Result<(), StageError> {
        self.invoke(&self.tools.addons, state, "storage", state, &[], OutputFormat::Raw)
            .await?;
        Ok(())
    }

    #[instrument(skip_all, fields(stage = "autoscaler"))]
    async fn reconcile_autoscaler(&self, state: &ClusterState) -> Result<(), StageError> {
        self.invoke(&self.tools.addons, state, "autoscaler", state, &[], OutputFormat::Raw)
            .await?;
        Ok(())
    }

    #[instrument(skip_all, fields(stage = "destroy"))]
    async fn destroy(&self, state: &ClusterState) -> Result<(), StageError> {
        self.invoke(&self.tools.infrastructure, state, "destroy", state, &[], OutputFormat::Raw)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratus_common::model::{KubernetesCluster, NodePool};

    /// Tool that copies its input to its output, adding a kubeconfig
    fn echo_tool() -> ToolCommand {
        ToolCommand {
            program: "sh".to_string(),
            args: vec![
                "-c".to_string(),
                r#"sed 's/"kubeconfig": ""/"kubeconfig": "issued"/' input.json > output.json"#
                    .to_string(),
                "stage-tool".to_string(),
            ],
            attempts: 1,
            backoff_secs: 0,
        }
    }

    fn failing_tool() -> ToolCommand {
        ToolCommand {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), "echo boom >&2; exit 3".to_string(), "x".to_string()],
            attempts: 2,
            backoff_secs: 0,
        }
    }

    fn state() -> ClusterState {
        let mut k8s = KubernetesCluster::new("prod", "h1");
        k8s.node_pools.push(NodePool::dynamic("workers", "aws", 2));
        ClusterState::new(Some(k8s), vec![])
    }

    fn stages(tools: ToolsConfig, root: &Path) -> ToolStages {
        ToolStages::new(ToolRunner::new(2), tools, root)
    }

    #[test]
    fn stage_dir_is_per_cluster_and_stage() {
        let stages = stages(ToolsConfig::default(), Path::new("/work"));
        assert_eq!(
            stages.stage_dir(&state(), "vpn"),
            PathBuf::from("/work/prod-h1/vpn")
        );
    }

    /// Story: the bootstrap tool reads the snapshot and writes back the
    /// cluster with its kubeconfig issued.
    #[tokio::test]
    async fn story_bootstrap_round_trips_the_snapshot_through_the_tool() {
        let root = tempfile::tempdir().unwrap();
        let tools = ToolsConfig {
            bootstrap: echo_tool(),
            ..Default::default()
        };

        let out = stages(tools, root.path())
            .bootstrap(&state())
            .await
            .unwrap();

        assert_eq!(out.kubernetes.unwrap().kubeconfig, "issued");
        assert!(root.path().join("prod-h1/bootstrap/input.json").exists());
    }

    #[tokio::test]
    async fn tool_failure_surfaces_as_stage_error() {
        let root = tempfile::tempdir().unwrap();
        let tools = ToolsConfig {
            addons: failing_tool(),
            ..Default::default()
        };

        let err = stages(tools, root.path())
            .reconcile_storage(&state())
            .await
            .unwrap_err();

        assert!(matches!(err, StageError::Tool(_)));
        assert!(err.to_string().contains("boom"));
    }

    #[tokio::test]
    async fn missing_output_is_an_error() {
        let root = tempfile::tempdir().unwrap();
        let tools = ToolsConfig {
            config_management: ToolCommand {
                program: "true".to_string(),
                args: vec![],
                attempts: 1,
                backoff_secs: 0,
            },
            ..Default::default()
        };

        let err = stages(tools, root.path())
            .install_vpn(&state())
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::Snapshot(Error::Io { .. })));
    }
}
