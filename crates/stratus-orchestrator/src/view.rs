//! Per-project view of current and desired clusters
//!
//! A project manifest lists Kubernetes clusters and load balancers for both
//! the running (current) and the requested (desired) state. [`ClusterView`]
//! regroups them per Kubernetes cluster so every cluster can be reconciled on
//! its own, and folds task results back into the current state as they
//! arrive.

use std::collections::{BTreeSet, HashSet};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use stratus_common::model::{
    ClusterInfo, ClusterState, KubernetesCluster, LoadBalancerCluster, TaskResult,
};

/// Clusters and load balancers of one side of a project
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProjectState {
    /// Kubernetes clusters
    #[serde(default)]
    pub clusters: Vec<KubernetesCluster>,
    /// Load balancers; each names the cluster it fronts
    #[serde(default)]
    pub load_balancers: Vec<LoadBalancerCluster>,
}

impl ProjectState {
    /// Snapshot of one cluster together with the load balancers targeting it
    pub fn cluster_state(&self, name: &str) -> ClusterState {
        ClusterState::new(
            self.clusters.iter().find(|k| k.name() == name).cloned(),
            self.load_balancers
                .iter()
                .filter(|lb| lb.target_cluster == name)
                .cloned()
                .collect(),
        )
    }

    /// Names of every cluster referenced by a Kubernetes cluster or a load balancer
    pub fn cluster_names(&self) -> BTreeSet<String> {
        self.clusters
            .iter()
            .map(|k| k.name().to_string())
            .chain(self.load_balancers.iter().map(|lb| lb.target_cluster.clone()))
            .collect()
    }
}

/// A project as submitted by the user
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProjectManifest {
    /// Project name
    pub name: String,
    /// What is running
    #[serde(default)]
    pub current: ProjectState,
    /// What should be running
    #[serde(default)]
    pub desired: ProjectState,
}

/// Current and desired state of one cluster
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClusterEntry {
    /// Running state, updated as tasks complete
    pub current: ClusterState,
    /// Requested state
    pub desired: ClusterState,
    /// Load balancers to tear down after the cluster converged
    pub deleted_load_balancers: Vec<LoadBalancerCluster>,
}

/// Per-cluster view of a project
#[derive(Debug, Default)]
pub struct ClusterView {
    clusters: DashMap<String, ClusterEntry>,
}

impl ClusterView {
    /// Group `manifest` by cluster.
    ///
    /// A current load balancer whose name and hash appear nowhere in the
    /// desired state is marked for deletion.
    pub fn new(manifest: &ProjectManifest) -> Self {
        let desired_lbs: HashSet<&ClusterInfo> = manifest
            .desired
            .load_balancers
            .iter()
            .map(|lb| &lb.info)
            .collect();

        let mut names = manifest.current.cluster_names();
        names.extend(manifest.desired.cluster_names());

        let clusters = DashMap::new();
        for name in names {
            let current = manifest.current.cluster_state(&name);
            let deleted_load_balancers = current
                .load_balancers
                .iter()
                .filter(|lb| !desired_lbs.contains(&lb.info))
                .cloned()
                .collect();
            let entry = ClusterEntry {
                current,
                desired: manifest.desired.cluster_state(&name),
                deleted_load_balancers,
            };
            clusters.insert(name, entry);
        }

        Self { clusters }
    }

    /// Cluster names in stable order
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.clusters.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Copy of one cluster's entry
    pub fn entry(&self, name: &str) -> Option<ClusterEntry> {
        self.clusters.get(name).map(|e| e.value().clone())
    }

    /// Latest known running state of one cluster
    pub fn current(&self, name: &str) -> ClusterState {
        self.clusters
            .get(name)
            .map(|e| e.current.clone())
            .unwrap_or_default()
    }

    /// Fold the result of a task run against `scope` into the current state.
    ///
    /// `scope` is the snapshot the task operated on; a [`TaskResult::Clear`]
    /// removes exactly what it contains.
    pub fn fold(&self, name: &str, scope: &ClusterState, result: &TaskResult) {
        let Some(mut entry) = self.clusters.get_mut(name) else {
            return;
        };
        let current = &mut entry.current;

        match result {
            TaskResult::None | TaskResult::Error { .. } => {}
            TaskResult::Update {
                kubernetes,
                load_balancers,
            } => {
                if kubernetes.is_some() {
                    current.kubernetes = kubernetes.clone();
                }
                current.load_balancers = load_balancers.clone();
            }
            TaskResult::Clear => {
                if scope.kubernetes.is_some() {
                    current.kubernetes = None;
                }
                current
                    .load_balancers
                    .retain(|lb| !scope.load_balancers.iter().any(|gone| gone.info == lb.info));
            }
        }
        debug!(
            cluster = name,
            has_kubernetes = current.kubernetes.is_some(),
            load_balancers = current.load_balancers.len(),
            "folded task result"
        );
    }

    /// Running state of the whole project
    pub fn current_project(&self) -> ProjectState {
        let mut project = ProjectState::default();
        for name in self.names() {
            if let Some(entry) = self.clusters.get(&name) {
                project.clusters.extend(entry.current.kubernetes.clone());
                project
                    .load_balancers
                    .extend(entry.current.load_balancers.iter().cloned());
            }
        }
        project
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lb(name: &str, hash: &str, target: &str) -> LoadBalancerCluster {
        LoadBalancerCluster::new(name, hash, target)
    }

    fn manifest() -> ProjectManifest {
        ProjectManifest {
            name: "shop".to_string(),
            current: ProjectState {
                clusters: vec![KubernetesCluster::new("prod", "p1")],
                load_balancers: vec![lb("api", "a1", "prod"), lb("ingress", "i1", "prod")],
            },
            desired: ProjectState {
                clusters: vec![
                    KubernetesCluster::new("prod", "p1"),
                    KubernetesCluster::new("staging", "s1"),
                ],
                load_balancers: vec![lb("api", "a1", "prod"), lb("ingress", "i2", "prod")],
            },
        }
    }

    #[test]
    fn groups_by_cluster_and_detects_deleted_load_balancers() {
        let view = ClusterView::new(&manifest());
        assert_eq!(view.names(), vec!["prod", "staging"]);

        let prod = view.entry("prod").unwrap();
        assert_eq!(prod.current.load_balancers.len(), 2);
        // Same name, different hash: the old one is replaced
        assert_eq!(prod.deleted_load_balancers, vec![lb("ingress", "i1", "prod")]);

        let staging = view.entry("staging").unwrap();
        assert!(staging.current.is_empty());
        assert!(staging.desired.kubernetes.is_some());
    }

    #[test]
    fn load_balancer_only_clusters_are_included() {
        let manifest = ProjectManifest {
            name: "shop".to_string(),
            current: ProjectState {
                clusters: vec![],
                load_balancers: vec![lb("orphan", "o1", "gone")],
            },
            desired: ProjectState::default(),
        };
        let view = ClusterView::new(&manifest);
        assert_eq!(view.names(), vec!["gone"]);
        assert_eq!(view.entry("gone").unwrap().deleted_load_balancers.len(), 1);
    }

    #[test]
    fn fold_applies_updates_and_clears() {
        let view = ClusterView::new(&manifest());
        let mut built = KubernetesCluster::new("staging", "s1");
        built.kubeconfig = "kubeconfig".to_string();

        view.fold(
            "staging",
            &ClusterState::default(),
            &TaskResult::update(ClusterState::new(Some(built.clone()), vec![])),
        );
        assert_eq!(view.current("staging").kubernetes, Some(built));

        let scope = ClusterState::new(None, vec![lb("ingress", "i1", "prod")]);
        view.fold("prod", &scope, &TaskResult::Clear);
        let prod = view.current("prod");
        assert!(prod.kubernetes.is_some());
        assert_eq!(prod.load_balancers, vec![lb("api", "a1", "prod")]);

        view.fold("prod", &view.current("prod"), &TaskResult::Clear);
        assert!(view.current("prod").is_empty());

        let project = view.current_project();
        assert_eq!(project.clusters.len(), 1);
        assert!(project.load_balancers.is_empty());
    }

    #[test]
    fn manifest_reads_from_yaml() {
        let yaml = r#"
name: shop
desired:
  clusters:
    - info: { name: prod, hash: p1 }
  loadBalancers:
    - info: { name: api, hash: a1 }
      targetCluster: prod
"#;
        let manifest: ProjectManifest = serde_yaml::from_str(yaml).unwrap();
        assert!(manifest.current.clusters.is_empty());
        assert_eq!(manifest.desired.cluster_state("prod").load_balancers.len(), 1);
    }
}
