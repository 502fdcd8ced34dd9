//! Data model shared by every Stratus component

mod cluster;
mod task;
mod workflow;

pub use cluster::{
    ClusterInfo, ClusterState, Dns, KubernetesCluster, LoadBalancerCluster, Node, NodePool,
    NodePoolKind, NodeType, Role, RoleType,
};
pub use task::{
    CreateState, DeleteState, Delta, Task, TaskErrorKind, TaskResult, UpdateState,
};
pub use workflow::{Stage, Workflow, WorkflowStatus};
