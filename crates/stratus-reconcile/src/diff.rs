//! Node pool diffing
//!
//! Compares the running topology of a cluster with the desired one and
//! produces an [`IntermediateRepresentation`]: an optional transitional
//! snapshot that adds capacity before anything is removed, plus the set of
//! nodes to remove once the additions have succeeded.
//!
//! Shrinking a pool never happens in the same apply that grows another one.
//! The transitional snapshot pins every shrinking pool to its current size and
//! keeps pools that are going away entirely, so all their nodes stay
//! addressable until the deletion step runs.

use std::collections::BTreeMap;

use tracing::debug;

use stratus_common::model::{ClusterState, KubernetesCluster, NodePool, NodePoolKind};

/// Result of diffing two topologies of one cluster
#[derive(Clone, Debug, Default, PartialEq)]
pub struct IntermediateRepresentation {
    /// Transitional snapshot to apply before deleting anything
    pub ir: Option<KubernetesCluster>,
    /// Pool name to number of nodes to remove
    pub to_delete: BTreeMap<String, u32>,
    /// The API endpoint node sits in a pool that is going away
    pub control_plane_endpoint_replace: bool,
}

impl IntermediateRepresentation {
    /// Whether nothing needs to happen beyond a regular apply
    pub fn is_empty(&self) -> bool {
        self.ir.is_none() && self.to_delete.is_empty() && !self.control_plane_endpoint_replace
    }

    /// Total number of nodes queued for removal
    pub fn total_deletions(&self) -> u32 {
        self.to_delete.values().sum()
    }

    /// Names of pools that disappear completely, given the desired cluster
    pub fn removed_pools<'a>(&'a self, desired: &'a KubernetesCluster) -> impl Iterator<Item = &'a str> {
        self.to_delete
            .keys()
            .map(String::as_str)
            .filter(move |name| desired.node_pool(name).is_none())
    }
}

/// Diff the current and desired state of one cluster.
///
/// Returns an empty representation when either side has no Kubernetes
/// cluster: there is nothing to reconcile against yet.
pub fn diff(current: &ClusterState, desired: &ClusterState) -> IntermediateRepresentation {
    let (Some(current_k8s), Some(desired_k8s)) = (&current.kubernetes, &desired.kubernetes) else {
        return IntermediateRepresentation::default();
    };

    let mut snapshot = desired_k8s.clone();
    let mut to_delete = BTreeMap::new();
    let mut adding = false;
    let mut deleting = false;
    let mut endpoint_replace = false;

    for pool in snapshot.node_pools.iter_mut() {
        let Some(running) = current_k8s.node_pool(&pool.name) else {
            adding = true;
            continue;
        };

        let (have, want) = (running.count(), pool.count());
        if want > have {
            adding = true;
        } else if want < have {
            deleting = true;
            to_delete.insert(pool.name.clone(), have - want);
            pin_to(pool, running);
        }
    }

    for running in &current_k8s.node_pools {
        if desired_k8s.node_pool(&running.name).is_some() {
            continue;
        }
        deleting = true;
        to_delete.insert(running.name.clone(), running.count());
        snapshot.node_pools.push(running.clone());
        if running.has_api_endpoint() {
            endpoint_replace = true;
        }
    }

    let attaching_api_lb =
        current.api_load_balancer().is_none() && desired.api_load_balancer().is_some();

    // The endpoint moves to the new load balancer instead of another node.
    if attaching_api_lb {
        endpoint_replace = false;
    }

    let needs_intermediate = (adding && deleting) || attaching_api_lb;

    debug!(
        cluster = %desired_k8s.name(),
        adding,
        deleting,
        attaching_api_lb,
        endpoint_replace,
        deletions = to_delete.values().sum::<u32>(),
        "computed node pool diff"
    );

    IntermediateRepresentation {
        ir: needs_intermediate.then_some(snapshot),
        to_delete,
        control_plane_endpoint_replace: endpoint_replace,
    }
}

/// Keep the desired pool's settings but the running pool's size and nodes
fn pin_to(pool: &mut NodePool, running: &NodePool) {
    if let (NodePoolKind::Dynamic { count, .. }, NodePoolKind::Dynamic { count: have, .. }) =
        (&mut pool.kind, &running.kind)
    {
        *count = *have;
    }
    pool.nodes = running.nodes.clone();
}
