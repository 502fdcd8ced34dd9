//! Task executor
//!
//! Runs the passes of one task in order against a [`Tracker`]. After every
//! pass that recorded new diagnostics the pass level decides: a fatal pass
//! aborts the task with a partial error, a warning pass lets the task go on.
//! Cancellation is honoured between passes only; a running pass always
//! finishes.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use stratus_common::model::{
    ClusterState, Delta, KubernetesCluster, LoadBalancerCluster, NodePoolKind, NodeType, Task,
    TaskResult, UpdateState,
};
use stratus_common::retry::{retry_with_backoff, RetryConfig};
use stratus_reconcile::{classify, replace_endpoint_node, resolve, EndpointChange};

use crate::error::StageError;
use crate::pass::{passes_for, ErrorLevel, Pass, PassKind};
use crate::stages::Stages;
use crate::tracker::Tracker;

/// Attempts at rewriting the API endpoint before the pass fails
pub const ENDPOINT_REWRITE_ATTEMPTS: u32 = 3;

/// Base delay between endpoint rewrite attempts
pub const ENDPOINT_REWRITE_STEP: Duration = Duration::from_secs(10);

/// A task together with the passes to run for it
#[derive(Clone, Debug)]
pub struct Work {
    /// Task to execute
    pub task: Task,
    /// Ordered passes
    pub passes: Vec<Pass>,
}

impl Work {
    /// Work item with the default passes for `task`
    pub fn new(task: Task) -> Self {
        let passes = passes_for(&task);
        Self { task, passes }
    }
}

/// Something that turns a task into exactly one result
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TaskProcessor: Send + Sync {
    /// Execute `task`, stopping between passes once `cancel` fires
    async fn process(&self, cancel: &CancellationToken, task: Task) -> TaskResult;
}

/// Executes pipeline passes through a [`Stages`] implementation
pub struct Executor {
    stages: Arc<dyn Stages>,
    endpoint_retry: RetryConfig,
}

impl Executor {
    /// Executor delegating to `stages`
    pub fn new(stages: Arc<dyn Stages>) -> Self {
        Self {
            stages,
            endpoint_retry: RetryConfig::linear(ENDPOINT_REWRITE_ATTEMPTS, ENDPOINT_REWRITE_STEP),
        }
    }

    /// Override the retry policy of the endpoint rewrite
    pub fn with_endpoint_retry(mut self, retry: RetryConfig) -> Self {
        self.endpoint_retry = retry;
        self
    }

    /// Run every pass of `work` and return the task result
    #[instrument(skip_all, fields(task = %work.task.kind(), cluster = work.task.cluster_name().unwrap_or("unknown")))]
    pub async fn process_task(&self, cancel: &CancellationToken, work: Work) -> TaskResult {
        let mut tracker = Tracker::default();

        for pass in &work.passes {
            if cancel.is_cancelled() {
                warn!(pass = %pass.kind, "task cancelled before pass");
                tracker.diagnose(format!("cancelled before {}", pass.description));
                return tracker.failure();
            }

            let seen = tracker.diagnostics.len();
            info!(pass = %pass.kind, "{}", pass.description);
            self.run_pass(pass.kind, &work.task, &mut tracker).await;

            if tracker.diagnostics.len() > seen {
                let new = tracker.diagnostics[seen..].join("; ");
                match pass.level {
                    ErrorLevel::Fatal => {
                        error!(pass = %pass.kind, error = %new, "fatal pass failure, aborting task");
                        return tracker.failure();
                    }
                    ErrorLevel::Warn => {
                        warn!(pass = %pass.kind, error = %new, "pass failed, continuing");
                    }
                }
            }
        }

        tracker.result
    }

    async fn run_pass(&self, kind: PassKind, task: &Task, tracker: &mut Tracker) {
        let outcome = match kind {
            PassKind::BuildInfrastructure => self.build_infrastructure(task, tracker).await,
            PassKind::InstallVpn => self.install_vpn(task, tracker).await,
            PassKind::ReconcileApiEndpoint => self.reconcile_api_endpoint(task, tracker).await,
            PassKind::BootstrapKubernetes => self.bootstrap(task, tracker).await,
            PassKind::DeleteNodes => self.delete_nodes(task, tracker).await,
            PassKind::ReplaceProxy => self.replace_proxy(task, tracker).await,
            PassKind::ReconcileStorage => self.reconcile_storage(task, tracker).await,
            PassKind::ReconcileAutoscaler => self.reconcile_autoscaler(task, tracker).await,
            PassKind::DestroyInfrastructure => self.destroy(task, tracker).await,
        };

        if let Err(e) = outcome {
            tracker.diagnose(format!("{kind}: {e}"));
        }
    }

    async fn build_infrastructure(&self, task: &Task, tracker: &mut Tracker) -> Result<(), StageError> {
        let (current, desired) = match task {
            Task::Create(create) => (ClusterState::default(), create.desired.clone()),
            Task::Update(UpdateState { state, delta }) => {
                let current = tracker.latest(state);
                let desired = match delta {
                    Delta::Apply { desired } => desired.clone(),
                    Delta::AddLoadBalancer { load_balancer }
                    | Delta::ReconcileLoadBalancer { load_balancer } => {
                        with_load_balancer(&current, load_balancer)
                    }
                    _ => return mismatch(PassKind::BuildInfrastructure, task),
                };
                (current, desired)
            }
            Task::Delete(_) => return mismatch(PassKind::BuildInfrastructure, task),
        };

        let built = self.stages.build_infrastructure(&current, &desired).await?;
        tracker.commit(built);
        Ok(())
    }

    async fn install_vpn(&self, task: &Task, tracker: &mut Tracker) -> Result<(), StageError> {
        let base = match task {
            Task::Create(create) => &create.desired,
            Task::Update(UpdateState {
                state,
                delta: Delta::Apply { .. } | Delta::AddLoadBalancer { .. },
            }) => state,
            _ => return mismatch(PassKind::InstallVpn, task),
        };

        let state = tracker.latest(base);
        let joined = self.stages.install_vpn(&state).await?;
        tracker.commit(joined);
        Ok(())
    }

    async fn bootstrap(&self, task: &Task, tracker: &mut Tracker) -> Result<(), StageError> {
        let Some(base) = full_apply_base(task) else {
            return mismatch(PassKind::BootstrapKubernetes, task);
        };

        let state = tracker.latest(base);
        let bootstrapped = self.stages.bootstrap(&state).await?;
        tracker.commit(bootstrapped);
        Ok(())
    }

    async fn reconcile_storage(&self, task: &Task, tracker: &mut Tracker) -> Result<(), StageError> {
        let Some(base) = full_apply_base(task) else {
            return mismatch(PassKind::ReconcileStorage, task);
        };
        self.stages.reconcile_storage(&tracker.latest(base)).await
    }

    async fn reconcile_autoscaler(
        &self,
        task: &Task,
        tracker: &mut Tracker,
    ) -> Result<(), StageError> {
        let Some(base) = full_apply_base(task) else {
            return mismatch(PassKind::ReconcileAutoscaler, task);
        };
        self.stages.reconcile_autoscaler(&tracker.latest(base)).await
    }

    async fn reconcile_api_endpoint(
        &self,
        task: &Task,
        tracker: &mut Tracker,
    ) -> Result<(), StageError> {
        let Task::Update(UpdateState {
            state,
            delta:
                Delta::ApiEndpoint {
                    current_load_balancers,
                    desired_load_balancers,
                    leaving_pools,
                },
        }) = task
        else {
            return mismatch(PassKind::ReconcileApiEndpoint, task);
        };

        let mut working = tracker.latest(state);
        let change = classify(current_load_balancers, desired_load_balancers);

        let moved = if change == EndpointChange::NoChange && !leaving_pools.is_empty() {
            let cluster = working
                .kubernetes
                .as_mut()
                .ok_or_else(|| StageError::invalid("no kubernetes cluster to move the endpoint in"))?;
            Some(replace_endpoint_node(cluster, leaving_pools)?)
        } else {
            resolve(&change, current_load_balancers, &mut working)?
        };

        let Some(moved) = moved else {
            info!("API endpoint unchanged");
            return Ok(());
        };

        retry_with_backoff(&self.endpoint_retry, "rewrite API endpoint", || {
            self.stages
                .rewrite_api_endpoint(&working, &moved.old, &moved.new)
        })
        .await?;

        tracker.commit(working);
        Ok(())
    }

    async fn delete_nodes(&self, task: &Task, tracker: &mut Tracker) -> Result<(), StageError> {
        let Task::Update(UpdateState {
            state,
            delta: Delta::DeleteNodes { nodepools },
        }) = task
        else {
            return mismatch(PassKind::DeleteNodes, task);
        };

        let before = tracker.latest(state);
        let cluster = before
            .kubernetes
            .as_ref()
            .ok_or_else(|| StageError::invalid("no kubernetes cluster to delete nodes from"))?;
        let victims = select_victims(cluster, nodepools)?;

        self.stages.delete_nodes(&before, &victims).await?;

        let mut after = before.clone();
        if let Some(cluster) = after.kubernetes.as_mut() {
            remove_nodes(cluster, &victims);
        }
        let released = self.stages.build_infrastructure(&before, &after).await?;
        tracker.commit(released);
        Ok(())
    }

    async fn replace_proxy(&self, task: &Task, tracker: &mut Tracker) -> Result<(), StageError> {
        let Task::Update(UpdateState {
            state,
            delta: Delta::ReplaceProxy { enabled },
        }) = task
        else {
            return mismatch(PassKind::ReplaceProxy, task);
        };
        self.stages.replace_proxy(&tracker.latest(state), *enabled).await
    }

    async fn destroy(&self, task: &Task, tracker: &mut Tracker) -> Result<(), StageError> {
        let Task::Delete(delete) = task else {
            return mismatch(PassKind::DestroyInfrastructure, task);
        };
        self.stages.destroy(&delete.state).await?;
        tracker.clear();
        Ok(())
    }
}

#[async_trait]
impl TaskProcessor for Executor {
    async fn process(&self, cancel: &CancellationToken, task: Task) -> TaskResult {
        self.process_task(cancel, Work::new(task)).await
    }
}

/// Log a pass receiving a task it has no handler for. The pass does nothing.
fn mismatch(kind: PassKind, task: &Task) -> Result<(), StageError> {
    warn!(pass = %kind, task = %task.kind(), "scheduling mismatch, skipping pass");
    Ok(())
}

/// Snapshot a full-apply pass starts from, if the task is a full apply
fn full_apply_base(task: &Task) -> Option<&ClusterState> {
    match task {
        Task::Create(create) => Some(&create.desired),
        Task::Update(UpdateState {
            delta: Delta::Apply { desired },
            ..
        }) => Some(desired),
        _ => None,
    }
}

/// `state` with `load_balancer` added, replacing one with the same identity
fn with_load_balancer(state: &ClusterState, load_balancer: &LoadBalancerCluster) -> ClusterState {
    let mut desired = state.clone();
    match desired
        .load_balancers
        .iter_mut()
        .find(|lb| lb.info == load_balancer.info)
    {
        Some(existing) => *existing = load_balancer.clone(),
        None => desired.load_balancers.push(load_balancer.clone()),
    }
    desired
}

/// Pick the nodes to remove from each pool, newest first.
///
/// The API endpoint node is never picked; it has to be moved away first.
fn select_victims(
    cluster: &KubernetesCluster,
    counts: &BTreeMap<String, u32>,
) -> Result<BTreeMap<String, Vec<String>>, StageError> {
    let mut victims = BTreeMap::new();

    for (pool_name, &count) in counts {
        let pool = cluster
            .node_pool(pool_name)
            .ok_or_else(|| StageError::invalid(format!("node pool {pool_name} not found")))?;

        let picked: Vec<String> = pool
            .nodes
            .iter()
            .rev()
            .filter(|n| n.node_type != NodeType::ApiEndpoint)
            .take(count as usize)
            .map(|n| n.name.clone())
            .collect();

        if picked.len() < count as usize {
            return Err(StageError::invalid(format!(
                "node pool {pool_name} has only {} removable nodes, {count} requested",
                picked.len()
            )));
        }
        victims.insert(pool_name.clone(), picked);
    }

    Ok(victims)
}

/// Drop `victims` from the snapshot; pools left without nodes disappear
fn remove_nodes(cluster: &mut KubernetesCluster, victims: &BTreeMap<String, Vec<String>>) {
    for (pool_name, names) in victims {
        let Some(pool) = cluster.node_pool_mut(pool_name) else {
            continue;
        };
        pool.nodes.retain(|n| !names.contains(&n.name));
        if let NodePoolKind::Dynamic { count, .. } = &mut pool.kind {
            *count = count.saturating_sub(names.len() as u32);
        }
    }
    cluster
        .node_pools
        .retain(|np| !(np.count() == 0 && victims.contains_key(&np.name)));
}
