//! Work items sent to the builder and the results it reports back

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::cluster::{ClusterState, KubernetesCluster, LoadBalancerCluster};

/// One unit of work for a single cluster
///
/// Handlers match on the variant exhaustively; a pass that receives a variant
/// it does not handle treats the task as a scheduling mismatch and does nothing.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Task {
    /// Build a cluster from scratch
    Create(CreateState),
    /// Move an existing cluster towards a new state
    Update(UpdateState),
    /// Tear a cluster (or some of its load balancers) down
    Delete(DeleteState),
}

impl Task {
    /// Short variant name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Task::Create(_) => "create",
            Task::Update(u) => u.delta.kind(),
            Task::Delete(_) => "delete",
        }
    }

    /// Name of the Kubernetes cluster the task concerns, if known
    pub fn cluster_name(&self) -> Option<&str> {
        let state = match self {
            Task::Create(c) => &c.desired,
            Task::Update(u) => &u.state,
            Task::Delete(d) => &d.state,
        };
        state
            .kubernetes
            .as_ref()
            .map(|k| k.name())
            .or_else(|| state.load_balancers.first().map(|lb| lb.target_cluster.as_str()))
    }
}

/// Payload of [`Task::Create`]
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CreateState {
    /// State to build
    pub desired: ClusterState,
}

/// Payload of [`Task::Update`]
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UpdateState {
    /// Current committed state
    pub state: ClusterState,
    /// Change to apply
    pub delta: Delta,
}

/// Payload of [`Task::Delete`]
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeleteState {
    /// What to destroy. A snapshot without a Kubernetes cluster removes only
    /// the listed load balancers.
    pub state: ClusterState,
}

/// Change carried by an update task
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Delta {
    /// Reconcile infrastructure, VPN and bootstrap towards `desired`
    Apply {
        /// Target state (the final desired state or an intermediate one)
        desired: ClusterState,
    },
    /// Move the API endpoint to match the desired load balancers.
    ///
    /// `state` of the enclosing update is the working snapshot that already
    /// contains both the outgoing and the incoming load balancers.
    #[serde(rename_all = "camelCase")]
    ApiEndpoint {
        /// Load balancers as they were before this reconciliation
        current_load_balancers: Vec<LoadBalancerCluster>,
        /// Load balancers as the user wants them
        desired_load_balancers: Vec<LoadBalancerCluster>,
        /// Control pools being removed; the endpoint node must leave them
        #[serde(default)]
        leaving_pools: Vec<String>,
    },
    /// Attach a new load balancer
    #[serde(rename_all = "camelCase")]
    AddLoadBalancer {
        /// Load balancer to attach
        load_balancer: LoadBalancerCluster,
    },
    /// Reconcile roles and targets of an existing load balancer
    #[serde(rename_all = "camelCase")]
    ReconcileLoadBalancer {
        /// Desired load balancer
        load_balancer: LoadBalancerCluster,
    },
    /// Toggle the HTTP proxy used by cluster nodes
    ReplaceProxy {
        /// Whether the proxy should be in use
        enabled: bool,
    },
    /// Remove nodes from pools; a count equal to the pool size removes the pool
    DeleteNodes {
        /// Pool name to number of nodes to remove
        nodepools: BTreeMap<String, u32>,
    },
}

impl Delta {
    /// Short variant name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Delta::Apply { .. } => "apply",
            Delta::ApiEndpoint { .. } => "api-endpoint",
            Delta::AddLoadBalancer { .. } => "add-load-balancer",
            Delta::ReconcileLoadBalancer { .. } => "reconcile-load-balancer",
            Delta::ReplaceProxy { .. } => "replace-proxy",
            Delta::DeleteNodes { .. } => "delete-nodes",
        }
    }
}

/// Category of a failed task
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskErrorKind {
    /// Some passes ran; the cluster may be partially reconciled
    Partial,
}

impl std::fmt::Display for TaskErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Partial => write!(f, "PARTIAL"),
        }
    }
}

/// Outcome of one task, produced exactly once and merged back into the cluster view
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TaskResult {
    /// Nothing changed
    #[default]
    None,
    /// Handlers committed a new snapshot
    Update {
        /// Updated Kubernetes cluster
        kubernetes: Option<KubernetesCluster>,
        /// Updated load balancers
        #[serde(rename = "loadBalancers")]
        load_balancers: Vec<LoadBalancerCluster>,
    },
    /// The cluster (or the listed load balancers) no longer exist
    Clear,
    /// The task failed
    Error {
        /// Failure category
        kind: TaskErrorKind,
        /// Joined diagnostics
        description: String,
    },
}

impl TaskResult {
    /// Build an update result from a snapshot
    pub fn update(state: ClusterState) -> Self {
        TaskResult::Update {
            kubernetes: state.kubernetes,
            load_balancers: state.load_balancers,
        }
    }

    /// Whether the task failed
    pub fn is_error(&self) -> bool {
        matches!(self, TaskResult::Error { .. })
    }
}
