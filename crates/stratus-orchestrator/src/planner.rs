//! Reconciliation planning for one cluster
//!
//! [`plan`] turns a cluster's current and desired snapshot into an ordered
//! list of [`Step`]s. A step only records intent; the task it sends is built
//! from the latest folded state right before it runs, so every step sees what
//! the previous one produced.
//!
//! For an existing cluster the order is:
//!
//! 1. intermediate apply: new pools and load balancers are added while every
//!    shrinking or leaving pool keeps its nodes
//! 2. API endpoint move
//! 3. node deletion
//! 4. final apply of the desired state
//! 5. teardown of load balancers that are no longer wanted

use std::collections::BTreeMap;

use tracing::debug;

use stratus_common::model::{
    ClusterState, CreateState, DeleteState, Delta, KubernetesCluster, LoadBalancerCluster, Stage,
    Task, UpdateState,
};
use stratus_reconcile::{classify, diff, EndpointChange};

/// One step of a cluster's plan
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Step {
    /// Build the cluster from scratch
    Create,
    /// Apply a transitional snapshot that only adds capacity
    IntermediateApply {
        /// Kubernetes cluster holding both old and new pools
        kubernetes: KubernetesCluster,
        /// Current load balancers plus the desired ones
        load_balancers: Vec<LoadBalancerCluster>,
    },
    /// Move the API endpoint
    ApiEndpoint {
        /// Load balancers before reconciliation
        current_load_balancers: Vec<LoadBalancerCluster>,
        /// Load balancers the user asked for
        desired_load_balancers: Vec<LoadBalancerCluster>,
        /// Control pools that are going away with the endpoint node
        leaving_pools: Vec<String>,
    },
    /// Remove nodes queued by the diff
    DeleteNodes {
        /// Pool name to number of nodes
        nodepools: BTreeMap<String, u32>,
    },
    /// Apply the desired state
    Apply,
    /// Tear down load balancers no longer wanted
    DeleteLoadBalancers {
        /// Load balancers to destroy
        load_balancers: Vec<LoadBalancerCluster>,
    },
    /// Destroy the cluster and its load balancers
    Delete,
}

impl Step {
    /// Workflow stage reported while this step runs
    pub fn stage(&self) -> Stage {
        match self {
            Step::Create => Stage::Create,
            Step::IntermediateApply { .. } => Stage::IntermediateApply,
            Step::ApiEndpoint { .. } => Stage::ApiEndpoint,
            Step::DeleteNodes { .. } => Stage::DeleteNodes,
            Step::Apply => Stage::Apply,
            Step::DeleteLoadBalancers { .. } | Step::Delete => Stage::Delete,
        }
    }

    /// Human-readable summary for the workflow description
    pub fn describe(&self) -> String {
        match self {
            Step::Create => "creating cluster".to_string(),
            Step::IntermediateApply { .. } => "adding capacity before removing nodes".to_string(),
            Step::ApiEndpoint { .. } => "moving API endpoint".to_string(),
            Step::DeleteNodes { nodepools } => format!(
                "deleting {} node(s) from {}",
                nodepools.values().sum::<u32>(),
                nodepools.keys().cloned().collect::<Vec<_>>().join(", ")
            ),
            Step::Apply => "applying desired state".to_string(),
            Step::DeleteLoadBalancers { load_balancers } => format!(
                "deleting load balancer(s) {}",
                load_balancers
                    .iter()
                    .map(|lb| lb.name())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            Step::Delete => "deleting cluster".to_string(),
        }
    }

    /// Task for this step given the latest running state and the desired state
    pub fn task(&self, working: &ClusterState, desired: &ClusterState) -> Task {
        match self {
            Step::Create => Task::Create(CreateState {
                desired: desired.clone(),
            }),
            Step::IntermediateApply {
                kubernetes,
                load_balancers,
            } => update(
                working,
                Delta::Apply {
                    desired: carry_runtime(
                        &ClusterState::new(Some(kubernetes.clone()), load_balancers.clone()),
                        working,
                    ),
                },
            ),
            Step::ApiEndpoint {
                current_load_balancers,
                desired_load_balancers,
                leaving_pools,
            } => update(
                working,
                Delta::ApiEndpoint {
                    current_load_balancers: current_load_balancers.clone(),
                    desired_load_balancers: desired_load_balancers.clone(),
                    leaving_pools: leaving_pools.clone(),
                },
            ),
            Step::DeleteNodes { nodepools } => update(
                working,
                Delta::DeleteNodes {
                    nodepools: nodepools.clone(),
                },
            ),
            Step::Apply => update(
                working,
                Delta::Apply {
                    desired: carry_runtime(desired, working),
                },
            ),
            Step::DeleteLoadBalancers { load_balancers } => Task::Delete(DeleteState {
                state: ClusterState::new(None, load_balancers.clone()),
            }),
            Step::Delete => Task::Delete(DeleteState {
                state: working.clone(),
            }),
        }
    }

    /// Snapshot a [`TaskResult::Clear`](stratus_common::model::TaskResult::Clear)
    /// of this step removes
    pub fn scope(&self, working: &ClusterState) -> ClusterState {
        match self {
            Step::DeleteLoadBalancers { load_balancers } => {
                ClusterState::new(None, load_balancers.clone())
            }
            _ => working.clone(),
        }
    }
}

fn update(working: &ClusterState, delta: Delta) -> Task {
    Task::Update(UpdateState {
        state: working.clone(),
        delta,
    })
}

/// Plan the steps that take one cluster from `current` to `desired`
pub fn plan(
    current: &ClusterState,
    desired: &ClusterState,
    deleted_load_balancers: &[LoadBalancerCluster],
) -> Vec<Step> {
    let mut steps = Vec::new();

    match (&current.kubernetes, &desired.kubernetes) {
        (None, Some(_)) => steps.push(Step::Create),
        (Some(_), None) => {
            steps.push(Step::Delete);
            return steps;
        }
        (None, None) => {}
        (Some(current_k8s), Some(desired_k8s)) => {
            let mut ir = diff(current, desired);
            let change = classify(&current.load_balancers, &desired.load_balancers);

            let leaving_pools: Vec<String> = if ir.control_plane_endpoint_replace {
                ir.removed_pools(desired_k8s)
                    .filter(|name| {
                        current_k8s
                            .node_pool(name)
                            .is_some_and(|p| p.has_api_endpoint())
                    })
                    .map(str::to_string)
                    .collect()
            } else {
                Vec::new()
            };

            let moves_endpoint = change != EndpointChange::NoChange || !leaving_pools.is_empty();

            // The endpoint can only move to a load balancer whose DNS record already exists
            let intermediate = match ir.ir.take() {
                Some(k8s) => Some(k8s),
                None if moves_endpoint && needs_build(current, desired) => {
                    Some(current_k8s.clone())
                }
                None => None,
            };
            if let Some(kubernetes) = intermediate {
                steps.push(Step::IntermediateApply {
                    kubernetes,
                    load_balancers: merge_load_balancers(
                        &current.load_balancers,
                        &desired.load_balancers,
                    ),
                });
            }

            if moves_endpoint {
                steps.push(Step::ApiEndpoint {
                    current_load_balancers: current.load_balancers.clone(),
                    desired_load_balancers: desired.load_balancers.clone(),
                    leaving_pools,
                });
            }

            if !ir.to_delete.is_empty() {
                debug!(nodes = ir.total_deletions(), "nodes queued for removal");
                steps.push(Step::DeleteNodes {
                    nodepools: ir.to_delete,
                });
            }

            steps.push(Step::Apply);
        }
    }

    if !deleted_load_balancers.is_empty() {
        steps.push(Step::DeleteLoadBalancers {
            load_balancers: deleted_load_balancers.to_vec(),
        });
    }

    debug!(
        steps = ?steps.iter().map(Step::stage).collect::<Vec<_>>(),
        "planned reconciliation"
    );
    steps
}

/// Whether a desired load balancer is new or asks for a different DNS record
fn needs_build(current: &ClusterState, desired: &ClusterState) -> bool {
    desired.load_balancers.iter().any(|lb| {
        current
            .load_balancers
            .iter()
            .find(|c| c.info == lb.info)
            .map_or(true, |c| c.dns_name() != lb.dns_name())
    })
}

/// Current load balancers with desired ones replacing or joining them
fn merge_load_balancers(
    current: &[LoadBalancerCluster],
    desired: &[LoadBalancerCluster],
) -> Vec<LoadBalancerCluster> {
    let mut merged = current.to_vec();
    for lb in desired {
        match merged.iter_mut().find(|c| c.info == lb.info) {
            // Keep the running endpoint bookkeeping until the endpoint step moves it
            Some(existing) => {
                let used = existing.used_api_endpoint;
                *existing = lb.clone();
                existing.used_api_endpoint = used;
            }
            None => merged.push(lb.clone()),
        }
    }
    merged
}

/// `target` with the runtime data the builder learned carried over from `working`:
/// kubeconfig, node identities and types, and load-balancer endpoint bookkeeping.
fn carry_runtime(target: &ClusterState, working: &ClusterState) -> ClusterState {
    let mut out = target.clone();

    if let (Some(k8s), Some(running)) = (out.kubernetes.as_mut(), working.kubernetes.as_ref()) {
        if k8s.kubeconfig.is_empty() {
            k8s.kubeconfig = running.kubeconfig.clone();
        }
        for pool in k8s.node_pools.iter_mut() {
            let Some(running_pool) = running.node_pool(&pool.name) else {
                continue;
            };
            if pool.nodes.is_empty() {
                pool.nodes = running_pool.nodes.clone();
                continue;
            }
            for node in pool.nodes.iter_mut() {
                if let Some(seen) = running_pool.nodes.iter().find(|n| n.name == node.name) {
                    *node = seen.clone();
                }
            }
        }
    }

    for lb in out.load_balancers.iter_mut() {
        if let Some(seen) = working.load_balancers.iter().find(|w| w.info == lb.info) {
            lb.used_api_endpoint = seen.used_api_endpoint;
            if lb.dns_name() != seen.dns_name() {
                continue;
            }
            if let (Some(dns), Some(seen_dns)) = (lb.dns.as_mut(), seen.dns.as_ref()) {
                if dns.endpoint.is_empty() {
                    dns.endpoint = seen_dns.endpoint.clone();
                }
            }
        }
    }

    out
}
