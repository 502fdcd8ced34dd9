//! Operator configuration
//!
//! Loaded from a YAML file; every field has a default so an empty file (or no
//! file at all) yields a working single-process setup.

use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Default lease (ack-wait) granted by the work queue
pub const DEFAULT_ACK_WAIT_SECS: u64 = 300;

/// Default number of concurrently processed messages
pub const DEFAULT_WORKER_SLOTS: usize = 4;

/// Default cap on concurrently running external tool subprocesses
pub const DEFAULT_SUBPROCESS_LIMIT: usize = 8;

/// Default number of clusters of one project reconciled in parallel
pub const DEFAULT_CLUSTER_CONCURRENCY: usize = 4;

/// Attempts an external tool may be given; zero would mean retrying forever
pub const TOOL_ATTEMPTS: RangeInclusive<u32> = 2..=5;

/// Top-level operator configuration
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct OperatorConfig {
    /// Directory holding per-cluster working directories and persisted workflows
    pub state_dir: PathBuf,
    /// Queue consumer settings
    pub queue: QueueConfig,
    /// Clusters of one project reconciled in parallel
    pub cluster_concurrency: usize,
    /// Seconds between automatic reconciliation rounds
    pub reconcile_interval_secs: u64,
    /// External tools driven by the pipeline
    pub tools: ToolsConfig,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("/var/lib/stratus"),
            queue: QueueConfig::default(),
            cluster_concurrency: DEFAULT_CLUSTER_CONCURRENCY,
            reconcile_interval_secs: 60,
            tools: ToolsConfig::default(),
        }
    }
}

impl OperatorConfig {
    /// Load configuration from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        let config: Self = serde_yaml::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would stall the operator
    pub fn validate(&self) -> Result<()> {
        if self.queue.worker_slots == 0 {
            return Err(Error::validation("queue.workerSlots must be at least 1"));
        }
        if self.queue.subprocess_limit == 0 {
            return Err(Error::validation("queue.subprocessLimit must be at least 1"));
        }
        if self.queue.ack_wait_secs == 0 {
            return Err(Error::validation("queue.ackWaitSecs must be positive"));
        }
        if self.cluster_concurrency == 0 {
            return Err(Error::validation("clusterConcurrency must be at least 1"));
        }
        for (name, tool) in self.tools.iter() {
            if !TOOL_ATTEMPTS.contains(&tool.attempts) {
                return Err(Error::validation(format!(
                    "tools.{name}.attempts must be between {} and {}, got {}",
                    TOOL_ATTEMPTS.start(),
                    TOOL_ATTEMPTS.end(),
                    tool.attempts
                )));
            }
        }
        Ok(())
    }

    /// Directory under which per-cluster tool working directories are created
    pub fn work_dir(&self) -> PathBuf {
        self.state_dir.join("clusters")
    }

    /// Directory holding persisted workflow documents
    pub fn workflow_dir(&self) -> PathBuf {
        self.state_dir.join("workflows")
    }
}

/// Work queue consumer settings
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct QueueConfig {
    /// Subject tasks are published on
    pub subject: String,
    /// Lease granted per message before redelivery
    pub ack_wait_secs: u64,
    /// Messages processed concurrently
    pub worker_slots: usize,
    /// Concurrent external tool subprocesses
    pub subprocess_limit: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            subject: "stratus.tasks".to_string(),
            ack_wait_secs: DEFAULT_ACK_WAIT_SECS,
            worker_slots: DEFAULT_WORKER_SLOTS,
            subprocess_limit: DEFAULT_SUBPROCESS_LIMIT,
        }
    }
}

impl QueueConfig {
    /// Lease duration as a `Duration`
    pub fn ack_wait(&self) -> Duration {
        Duration::from_secs(self.ack_wait_secs)
    }
}

/// Command line of one external tool
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolCommand {
    /// Executable name or path
    pub program: String,
    /// Arguments passed before the stage-specific ones
    #[serde(default)]
    pub args: Vec<String>,
    /// Attempts before a non-zero exit is treated as fatal
    #[serde(default = "default_tool_attempts")]
    pub attempts: u32,
    /// Base delay of the linear backoff between attempts, in seconds
    #[serde(default = "default_tool_backoff_secs")]
    pub backoff_secs: u64,
}

fn default_tool_attempts() -> u32 {
    3
}

fn default_tool_backoff_secs() -> u64 {
    5
}

impl ToolCommand {
    /// Command with default retry settings
    pub fn new(program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
            attempts: default_tool_attempts(),
            backoff_secs: default_tool_backoff_secs(),
        }
    }
}

/// External tools invoked by pipeline passes
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ToolsConfig {
    /// Infrastructure provisioning (also destroys infrastructure)
    pub infrastructure: ToolCommand,
    /// Configuration management (VPN mesh, node setup, endpoint rewrite, proxy)
    pub config_management: ToolCommand,
    /// Kubernetes bootstrap and node removal
    pub bootstrap: ToolCommand,
    /// Storage engine, autoscaler and kubeconfig installers
    pub addons: ToolCommand,
}

impl ToolsConfig {
    /// Every tool with its configuration key
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &ToolCommand)> {
        [
            ("infrastructure", &self.infrastructure),
            ("configManagement", &self.config_management),
            ("bootstrap", &self.bootstrap),
            ("addons", &self.addons),
        ]
        .into_iter()
    }
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            infrastructure: ToolCommand::new("stratus-infra", &[]),
            config_management: ToolCommand::new("stratus-config", &[]),
            bootstrap: ToolCommand::new("stratus-bootstrap", &[]),
            addons: ToolCommand::new("stratus-addons", &[]),
        }
    }
}
