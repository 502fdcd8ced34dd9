//! Pipeline passes
//!
//! A task is executed as an ordered list of [`Pass`]es. Each pass names the
//! handler to run and how severe its failures are.

use stratus_common::model::{Delta, Task};

/// Handler a pass dispatches to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PassKind {
    /// Create, resize or remove machines and load balancers
    BuildInfrastructure,
    /// Join nodes into the VPN mesh
    InstallVpn,
    /// Move the API server address
    ReconcileApiEndpoint,
    /// Install or upgrade Kubernetes
    BootstrapKubernetes,
    /// Drain, remove and release nodes
    DeleteNodes,
    /// Toggle the node HTTP proxy
    ReplaceProxy,
    /// Reconcile the storage engine
    ReconcileStorage,
    /// Reconcile the cluster autoscaler
    ReconcileAutoscaler,
    /// Destroy every machine of the cluster
    DestroyInfrastructure,
}

impl PassKind {
    /// Severity used by default plans
    pub fn default_level(self) -> ErrorLevel {
        match self {
            Self::ReconcileStorage | Self::ReconcileAutoscaler => ErrorLevel::Warn,
            _ => ErrorLevel::Fatal,
        }
    }

    /// Whether this pass has a handler for `task`
    pub fn accepts(self, task: &Task) -> bool {
        match (self, task) {
            (
                Self::BuildInfrastructure
                | Self::InstallVpn
                | Self::BootstrapKubernetes
                | Self::ReconcileStorage
                | Self::ReconcileAutoscaler,
                Task::Create(_),
            ) => true,
            (Self::DestroyInfrastructure, Task::Delete(_)) => true,
            (_, Task::Update(update)) => matches!(
                (self, &update.delta),
                (
                    Self::BuildInfrastructure,
                    Delta::Apply { .. }
                        | Delta::AddLoadBalancer { .. }
                        | Delta::ReconcileLoadBalancer { .. }
                ) | (Self::InstallVpn, Delta::Apply { .. } | Delta::AddLoadBalancer { .. })
                    | (
                        Self::BootstrapKubernetes
                            | Self::ReconcileStorage
                            | Self::ReconcileAutoscaler,
                        Delta::Apply { .. }
                    )
                    | (Self::ReconcileApiEndpoint, Delta::ApiEndpoint { .. })
                    | (Self::DeleteNodes, Delta::DeleteNodes { .. })
                    | (Self::ReplaceProxy, Delta::ReplaceProxy { .. })
            ),
            _ => false,
        }
    }
}

impl std::fmt::Display for PassKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::BuildInfrastructure => "build-infrastructure",
            Self::InstallVpn => "install-vpn",
            Self::ReconcileApiEndpoint => "reconcile-api-endpoint",
            Self::BootstrapKubernetes => "bootstrap-kubernetes",
            Self::DeleteNodes => "delete-nodes",
            Self::ReplaceProxy => "replace-proxy",
            Self::ReconcileStorage => "reconcile-storage",
            Self::ReconcileAutoscaler => "reconcile-autoscaler",
            Self::DestroyInfrastructure => "destroy-infrastructure",
        };
        f.write_str(name)
    }
}

/// What a failing pass does to the rest of the task
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorLevel {
    /// Abort the task with a partial error
    Fatal,
    /// Log and continue with the next pass
    Warn,
}

/// One step of a task
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pass {
    /// Handler to run
    pub kind: PassKind,
    /// Failure severity
    pub level: ErrorLevel,
    /// Human readable description used in logs and workflow descriptions
    pub description: String,
}

impl Pass {
    /// Pass with its default severity
    pub fn new(kind: PassKind, description: impl Into<String>) -> Self {
        Self {
            kind,
            level: kind.default_level(),
            description: description.into(),
        }
    }
}

/// Default ordered passes for a task
pub fn passes_for(task: &Task) -> Vec<Pass> {
    let full_apply = || {
        vec![
            Pass::new(PassKind::BuildInfrastructure, "building infrastructure"),
            Pass::new(PassKind::InstallVpn, "installing VPN"),
            Pass::new(PassKind::BootstrapKubernetes, "bootstrapping kubernetes"),
            Pass::new(PassKind::ReconcileStorage, "reconciling storage"),
            Pass::new(PassKind::ReconcileAutoscaler, "reconciling autoscaler"),
        ]
    };

    match task {
        Task::Create(_) => full_apply(),
        Task::Delete(_) => vec![Pass::new(
            PassKind::DestroyInfrastructure,
            "destroying infrastructure",
        )],
        Task::Update(update) => match &update.delta {
            Delta::Apply { .. } => full_apply(),
            Delta::AddLoadBalancer { .. } => vec![
                Pass::new(PassKind::BuildInfrastructure, "building load balancer"),
                Pass::new(PassKind::InstallVpn, "joining load balancer to VPN"),
            ],
            Delta::ReconcileLoadBalancer { .. } => vec![Pass::new(
                PassKind::BuildInfrastructure,
                "reconciling load balancer",
            )],
            Delta::ApiEndpoint { .. } => vec![Pass::new(
                PassKind::ReconcileApiEndpoint,
                "moving API endpoint",
            )],
            Delta::DeleteNodes { .. } => {
                vec![Pass::new(PassKind::DeleteNodes, "deleting nodes")]
            }
            Delta::ReplaceProxy { .. } => {
                vec![Pass::new(PassKind::ReplaceProxy, "replacing proxy")]
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use stratus_common::model::{ClusterState, CreateState, DeleteState, UpdateState};

    fn update(delta: Delta) -> Task {
        Task::Update(UpdateState {
            state: ClusterState::default(),
            delta,
        })
    }

    #[test]
    fn default_plans_only_contain_passes_that_accept_the_task() {
        let tasks = [
            Task::Create(CreateState {
                desired: ClusterState::default(),
            }),
            Task::Delete(DeleteState {
                state: ClusterState::default(),
            }),
            update(Delta::Apply {
                desired: ClusterState::default(),
            }),
            update(Delta::ReplaceProxy { enabled: true }),
            update(Delta::DeleteNodes {
                nodepools: BTreeMap::new(),
            }),
            update(Delta::ApiEndpoint {
                current_load_balancers: vec![],
                desired_load_balancers: vec![],
                leaving_pools: vec![],
            }),
        ];

        for task in &tasks {
            let passes = passes_for(task);
            assert!(!passes.is_empty());
            for pass in passes {
                assert!(pass.kind.accepts(task), "{} rejects {}", pass.kind, task.kind());
            }
        }
    }

    #[test]
    fn addon_passes_only_warn() {
        let create = Task::Create(CreateState {
            desired: ClusterState::default(),
        });
        let levels: Vec<_> = passes_for(&create)
            .iter()
            .map(|p| (p.kind, p.level))
            .collect();
        assert_eq!(
            levels,
            vec![
                (PassKind::BuildInfrastructure, ErrorLevel::Fatal),
                (PassKind::InstallVpn, ErrorLevel::Fatal),
                (PassKind::BootstrapKubernetes, ErrorLevel::Fatal),
                (PassKind::ReconcileStorage, ErrorLevel::Warn),
                (PassKind::ReconcileAutoscaler, ErrorLevel::Warn),
            ]
        );
    }

    #[test]
    fn destroy_rejects_updates() {
        assert!(!PassKind::DestroyInfrastructure.accepts(&update(Delta::ReplaceProxy {
            enabled: false
        })));
        assert!(!PassKind::ReplaceProxy.accepts(&Task::Delete(DeleteState {
            state: ClusterState::default()
        })));
    }
}
