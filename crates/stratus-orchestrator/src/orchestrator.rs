//! Project reconciliation
//!
//! The [`Orchestrator`] plans every cluster of a project, runs the clusters
//! concurrently (bounded) and the steps of one cluster sequentially. Each
//! cluster's [`Workflow`] is persisted before and after every dispatched
//! task. A failing cluster stops its own plan and marks only its own
//! workflow; the other clusters carry on.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

#[cfg(test)]
use mockall::automock;

use stratus_common::model::{Task, TaskResult, Workflow};
use stratus_queue::QueueDispatcher;

use crate::error::OrchestratorError;
use crate::planner::plan;
use crate::store::WorkflowStore;
use crate::view::{ClusterView, ProjectManifest, ProjectState};

/// Hands a task to the builder and waits for its result
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TaskDispatcher: Send + Sync {
    /// Run `task` for `cluster` of project `manifest`
    async fn dispatch(
        &self,
        manifest: &str,
        cluster: &str,
        task: &Task,
    ) -> Result<TaskResult, OrchestratorError>;
}

#[async_trait]
impl TaskDispatcher for QueueDispatcher {
    async fn dispatch(
        &self,
        manifest: &str,
        cluster: &str,
        task: &Task,
    ) -> Result<TaskResult, OrchestratorError> {
        Ok(QueueDispatcher::dispatch(self, manifest, cluster, task).await?)
    }
}

/// Registered projects, each behind its own lock.
///
/// Desired-state edits and reconciliation rounds of one project are
/// serialised; different projects never contend.
#[derive(Default)]
pub struct ProjectLocks {
    projects: DashMap<String, Arc<Mutex<ProjectManifest>>>,
}

impl ProjectLocks {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a project
    pub fn insert(&self, manifest: ProjectManifest) {
        self.projects
            .insert(manifest.name.clone(), Arc::new(Mutex::new(manifest)));
    }

    /// Registered project names
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.projects.iter().map(|p| p.key().clone()).collect();
        names.sort();
        names
    }

    fn lock_for(&self, project: &str) -> Result<Arc<Mutex<ProjectManifest>>, OrchestratorError> {
        self.projects
            .get(project)
            .map(|p| Arc::clone(p.value()))
            .ok_or_else(|| OrchestratorError::UnknownProject(project.to_string()))
    }

    /// Change the desired state of `project` under its lock
    pub async fn edit_desired<R>(
        &self,
        project: &str,
        edit: impl FnOnce(&mut ProjectState) -> R,
    ) -> Result<R, OrchestratorError> {
        let lock = self.lock_for(project)?;
        let mut manifest = lock.lock().await;
        Ok(edit(&mut manifest.desired))
    }

    /// Copy of the project manifest
    pub async fn snapshot(&self, project: &str) -> Result<ProjectManifest, OrchestratorError> {
        let lock = self.lock_for(project)?;
        let manifest = lock.lock().await;
        Ok(manifest.clone())
    }
}

/// Result of one reconciliation round of a project
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProjectOutcome {
    /// Project name
    pub project: String,
    /// Running state after the round
    pub current: ProjectState,
    /// Final workflow of every cluster
    pub workflows: BTreeMap<String, Workflow>,
    /// Whether any cluster failed; the project is not re-enqueued automatically
    pub has_error: bool,
}

/// Reconciles projects by dispatching planned tasks
pub struct Orchestrator {
    dispatcher: Arc<dyn TaskDispatcher>,
    store: Arc<dyn WorkflowStore>,
    cluster_concurrency: usize,
}

impl Orchestrator {
    /// Orchestrator running up to `cluster_concurrency` clusters of a project at once
    pub fn new(
        dispatcher: Arc<dyn TaskDispatcher>,
        store: Arc<dyn WorkflowStore>,
        cluster_concurrency: usize,
    ) -> Self {
        Self {
            dispatcher,
            store,
            cluster_concurrency: cluster_concurrency.max(1),
        }
    }

    /// Reconcile one registered project and commit the new current state.
    ///
    /// The project's lock is held for the whole round.
    pub async fn reconcile_project(
        &self,
        projects: &ProjectLocks,
        project: &str,
        cancel: &CancellationToken,
    ) -> Result<ProjectOutcome, OrchestratorError> {
        let lock = projects.lock_for(project)?;
        let mut manifest = lock.lock().await;
        let outcome = self.reconcile(&manifest, cancel).await?;
        manifest.current = outcome.current.clone();
        Ok(outcome)
    }

    /// Reconcile `manifest` without committing anything back to it
    pub async fn reconcile(
        &self,
        manifest: &ProjectManifest,
        cancel: &CancellationToken,
    ) -> Result<ProjectOutcome, OrchestratorError> {
        let project = manifest.name.as_str();
        let view = ClusterView::new(manifest);
        let mut workflows = self.store.load(project).await?;
        let names = view.names();
        info!(project, clusters = names.len(), "reconciling project");

        let slots = Semaphore::new(self.cluster_concurrency);
        let runs = names.iter().map(|name| {
            let workflow = workflows.get(name).cloned().unwrap_or_default();
            let (view, slots) = (&view, &slots);
            async move {
                let _permit = slots.acquire().await;
                let workflow = self
                    .reconcile_cluster(project, name, view, workflow, cancel)
                    .instrument(info_span!("cluster", project, cluster = %name))
                    .await;
                (name.clone(), workflow)
            }
        });
        let finished = futures::future::join_all(runs).await;

        let mut has_error = false;
        for (name, workflow) in finished {
            has_error |= workflow.is_error();
            workflows.insert(name, workflow);
        }
        if has_error {
            warn!(project, "project has failed clusters, not re-enqueueing");
        } else {
            info!(project, "project reconciled");
        }

        Ok(ProjectOutcome {
            project: project.to_string(),
            current: view.current_project(),
            workflows,
            has_error,
        })
    }

    /// Run the plan of one cluster; returns its final workflow
    async fn reconcile_cluster(
        &self,
        project: &str,
        name: &str,
        view: &ClusterView,
        mut workflow: Workflow,
        cancel: &CancellationToken,
    ) -> Workflow {
        let Some(entry) = view.entry(name) else {
            return workflow;
        };
        let steps = plan(&entry.current, &entry.desired, &entry.deleted_load_balancers);

        for step in steps {
            if cancel.is_cancelled() {
                workflow.fail(OrchestratorError::Cancelled(name.to_string()).to_string());
                self.persist(project, name, &workflow).await;
                return workflow;
            }

            let working = view.current(name);
            let task = step.task(&working, &entry.desired);
            workflow.start(step.stage(), step.describe());
            self.persist(project, name, &workflow).await;

            match self.dispatcher.dispatch(project, name, &task).await {
                Ok(TaskResult::Error { kind, description }) => {
                    let failure = OrchestratorError::Task {
                        cluster: name.to_string(),
                        stage: step.stage().to_string(),
                        description: format!("{kind}: {description}"),
                    };
                    error!(error = %failure, "step failed");
                    workflow.fail(failure.to_string());
                    self.persist(project, name, &workflow).await;
                    return workflow;
                }
                Ok(result) => {
                    view.fold(name, &step.scope(&working), &result);
                    self.persist(project, name, &workflow).await;
                }
                Err(e) => {
                    error!(error = %e, stage = %step.stage(), "dispatch failed");
                    workflow.fail(e.to_string());
                    self.persist(project, name, &workflow).await;
                    return workflow;
                }
            }
        }

        workflow.finish();
        self.persist(project, name, &workflow).await;
        workflow
    }

    async fn persist(&self, project: &str, cluster: &str, workflow: &Workflow) {
        if let Err(e) = self.store.save(project, cluster, workflow).await {
            warn!(project, cluster, error = %e, "failed to persist workflow");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryWorkflowStore, MockWorkflowStore};
    use std::sync::Mutex as StdMutex;
    use stratus_common::model::{
        ClusterState, Delta, Dns, KubernetesCluster, LoadBalancerCluster, NodePool, NodeType, Node,
        Role, Stage, TaskErrorKind, UpdateState, WorkflowStatus,
    };
    use stratus_pipeline::{Executor, StageError, TaskProcessor};

    /// Builder stand-in: applies tasks to their snapshot, optionally failing
    /// one stage of one cluster.
    #[derive(Default)]
    struct FakeBuilder {
        fail: Option<(String, &'static str)>,
        seen: StdMutex<Vec<(String, Task)>>,
    }

    impl FakeBuilder {
        fn failing(cluster: &str, kind: &'static str) -> Self {
            Self {
                fail: Some((cluster.to_string(), kind)),
                ..Default::default()
            }
        }

        fn kinds(&self, cluster: &str) -> Vec<&'static str> {
            self.seen
                .lock()
                .unwrap()
                .iter()
                .filter(|(c, _)| c == cluster)
                .map(|(_, t)| t.kind())
                .collect()
        }
    }

    #[async_trait]
    impl TaskDispatcher for FakeBuilder {
        async fn dispatch(
            &self,
            _manifest: &str,
            cluster: &str,
            task: &Task,
        ) -> Result<TaskResult, OrchestratorError> {
            self.seen
                .lock()
                .unwrap()
                .push((cluster.to_string(), task.clone()));
            if let Some((c, kind)) = &self.fail {
                if c == cluster && *kind == task.kind() {
                    return Ok(TaskResult::Error {
                        kind: TaskErrorKind::Partial,
                        description: "tool exited with 1".to_string(),
                    });
                }
            }
            Ok(match task {
                Task::Create(c) => TaskResult::update(c.desired.clone()),
                Task::Update(UpdateState {
                    delta: Delta::Apply { desired },
                    ..
                }) => TaskResult::update(desired.clone()),
                Task::Update(u) => TaskResult::update(u.state.clone()),
                Task::Delete(_) => TaskResult::Clear,
            })
        }
    }

    fn pool(name: &str, count: u32) -> NodePool {
        NodePool::dynamic(name, "hetzner", count)
    }

    fn k8s(name: &str, pools: Vec<NodePool>) -> KubernetesCluster {
        let mut k = KubernetesCluster::new(name, "h1");
        k.node_pools = pools;
        k
    }

    fn control() -> NodePool {
        pool("control", 1)
            .control()
            .with_nodes(vec![Node::new("control-1", "10.0.0.1", NodeType::ApiEndpoint)])
    }

    fn orchestrator(builder: Arc<FakeBuilder>, store: Arc<MemoryWorkflowStore>) -> Orchestrator {
        Orchestrator::new(builder, store, 2)
    }

    /// Story: a project adds a new cluster and grows another one that also
    /// shrinks a pool. Both converge, every step was persisted as started
    /// before the task went out, and the new current state is the desired one.
    #[tokio::test]
    async fn story_project_converges() {
        let manifest = ProjectManifest {
            name: "shop".to_string(),
            current: ProjectState {
                clusters: vec![k8s("prod", vec![control(), pool("a", 3), pool("b", 4)])],
                load_balancers: vec![],
            },
            desired: ProjectState {
                clusters: vec![
                    k8s("prod", vec![control(), pool("a", 5), pool("b", 2)]),
                    k8s("staging", vec![control()]),
                ],
                load_balancers: vec![],
            },
        };
        let builder = Arc::new(FakeBuilder::default());
        let store = Arc::new(MemoryWorkflowStore::new());

        let outcome = orchestrator(builder.clone(), store.clone())
            .reconcile(&manifest, &CancellationToken::new())
            .await
            .unwrap();

        assert!(!outcome.has_error);
        assert_eq!(builder.kinds("prod"), vec!["apply", "delete-nodes", "apply"]);
        assert_eq!(builder.kinds("staging"), vec!["create"]);
        assert!(outcome
            .workflows
            .values()
            .all(|w| w.status == WorkflowStatus::Done));
        assert_eq!(outcome.current.clusters.len(), 2);

        let history = store.history("shop", "prod");
        let started: Vec<Stage> = history
            .iter()
            .filter(|w| w.status == WorkflowStatus::InProgress)
            .map(|w| w.stage)
            .collect();
        assert!(started.starts_with(&[Stage::IntermediateApply]));
        assert!(started.contains(&Stage::DeleteNodes));
        assert_eq!(history.last().unwrap().status, WorkflowStatus::Done);
    }

    #[tokio::test]
    async fn failing_cluster_does_not_stop_the_others() {
        let manifest = ProjectManifest {
            name: "shop".to_string(),
            current: ProjectState::default(),
            desired: ProjectState {
                clusters: vec![k8s("prod", vec![control()]), k8s("staging", vec![control()])],
                load_balancers: vec![],
            },
        };
        let builder = Arc::new(FakeBuilder::failing("prod", "create"));
        let store = Arc::new(MemoryWorkflowStore::new());

        let outcome = orchestrator(builder, store.clone())
            .reconcile(&manifest, &CancellationToken::new())
            .await
            .unwrap();

        assert!(outcome.has_error);
        let prod = &outcome.workflows["prod"];
        assert!(prod.is_error());
        assert_eq!(prod.stage, Stage::Create);
        assert!(prod.description.contains("tool exited with 1"));
        assert_eq!(outcome.workflows["staging"].status, WorkflowStatus::Done);
        assert_eq!(outcome.current.clusters.len(), 1);
        assert!(store.load("shop").await.unwrap()["prod"].is_error());
    }

    #[tokio::test]
    async fn failed_step_stops_the_rest_of_the_plan() {
        let manifest = ProjectManifest {
            name: "shop".to_string(),
            current: ProjectState {
                clusters: vec![k8s("prod", vec![control(), pool("a", 3), pool("b", 4)])],
                load_balancers: vec![],
            },
            desired: ProjectState {
                clusters: vec![k8s("prod", vec![control(), pool("a", 5), pool("b", 2)])],
                load_balancers: vec![],
            },
        };
        let builder = Arc::new(FakeBuilder::failing("prod", "delete-nodes"));

        let outcome = orchestrator(builder.clone(), Arc::new(MemoryWorkflowStore::new()))
            .reconcile(&manifest, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(builder.kinds("prod"), vec!["apply", "delete-nodes"]);
        assert_eq!(outcome.workflows["prod"].stage, Stage::DeleteNodes);
        // The intermediate apply still landed
        let prod = &outcome.current.clusters[0];
        assert_eq!(prod.node_pool("a").unwrap().count(), 5);
        assert_eq!(prod.node_pool("b").unwrap().count(), 4);
    }

    /// Story: an API load balancer is attached to a running cluster. It is
    /// built first, then the endpoint task receives a working snapshot that
    /// already contains it.
    #[tokio::test]
    async fn story_endpoint_task_sees_the_new_load_balancer() {
        let mut lb = LoadBalancerCluster::new("api", "a1", "prod");
        lb.roles = vec![Role::api_server(vec!["control".to_string()])];
        let manifest = ProjectManifest {
            name: "shop".to_string(),
            current: ProjectState {
                clusters: vec![k8s("prod", vec![control()])],
                load_balancers: vec![],
            },
            desired: ProjectState {
                clusters: vec![k8s("prod", vec![control()])],
                load_balancers: vec![lb.clone()],
            },
        };
        let builder = Arc::new(FakeBuilder::default());

        orchestrator(builder.clone(), Arc::new(MemoryWorkflowStore::new()))
            .reconcile(&manifest, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(builder.kinds("prod"), vec!["apply", "api-endpoint", "apply"]);
        let seen = builder.seen.lock().unwrap();
        let Task::Update(endpoint) = &seen[1].1 else {
            panic!("expected update");
        };
        assert_eq!(endpoint.state.load_balancers, vec![lb]);
    }

    #[tokio::test]
    async fn removed_load_balancer_is_destroyed_after_apply() {
        let manifest = ProjectManifest {
            name: "shop".to_string(),
            current: ProjectState {
                clusters: vec![k8s("prod", vec![control()])],
                load_balancers: vec![LoadBalancerCluster::new("ingress", "i1", "prod")],
            },
            desired: ProjectState {
                clusters: vec![k8s("prod", vec![control()])],
                load_balancers: vec![],
            },
        };
        let builder = Arc::new(FakeBuilder::default());

        let outcome = orchestrator(builder.clone(), Arc::new(MemoryWorkflowStore::new()))
            .reconcile(&manifest, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(builder.kinds("prod"), vec!["apply", "delete"]);
        assert!(outcome.current.load_balancers.is_empty());
        assert_eq!(outcome.current.clusters.len(), 1);
    }

    #[tokio::test]
    async fn cancelled_round_marks_pending_clusters() {
        let manifest = ProjectManifest {
            name: "shop".to_string(),
            current: ProjectState::default(),
            desired: ProjectState {
                clusters: vec![k8s("prod", vec![control()])],
                load_balancers: vec![],
            },
        };
        let builder = Arc::new(FakeBuilder::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = orchestrator(builder.clone(), Arc::new(MemoryWorkflowStore::new()))
            .reconcile(&manifest, &cancel)
            .await
            .unwrap();

        assert!(builder.kinds("prod").is_empty());
        assert!(outcome.workflows["prod"].is_error());
        assert!(outcome.has_error);
    }

    #[tokio::test]
    async fn dispatch_errors_fail_the_workflow() {
        let mut dispatcher = MockTaskDispatcher::new();
        dispatcher.expect_dispatch().times(1).returning(|_, _, _| {
            Err(OrchestratorError::Dispatch(
                stratus_queue::QueueError::ReplyDropped("r".to_string()),
            ))
        });
        let manifest = ProjectManifest {
            name: "shop".to_string(),
            current: ProjectState::default(),
            desired: ProjectState {
                clusters: vec![k8s("prod", vec![control()])],
                load_balancers: vec![],
            },
        };

        let outcome = Orchestrator::new(
            Arc::new(dispatcher),
            Arc::new(MemoryWorkflowStore::new()),
            1,
        )
        .reconcile(&manifest, &CancellationToken::new())
        .await
        .unwrap();

        assert!(outcome.has_error);
        assert!(outcome.current.clusters.is_empty());
    }

    #[tokio::test]
    async fn unreadable_store_aborts_the_round() {
        let mut store = MockWorkflowStore::new();
        store
            .expect_load()
            .returning(|p| Err(OrchestratorError::store(p, "permission denied")));

        let err = Orchestrator::new(Arc::new(FakeBuilder::default()), Arc::new(store), 1)
            .reconcile(
                &ProjectManifest {
                    name: "shop".to_string(),
                    ..Default::default()
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn project_locks_serialise_edits_and_commit_rounds() {
        let projects = ProjectLocks::new();
        projects.insert(ProjectManifest {
            name: "shop".to_string(),
            ..Default::default()
        });

        projects
            .edit_desired("shop", |desired| {
                desired.clusters.push(k8s("prod", vec![control()]))
            })
            .await
            .unwrap();

        let orchestrator =
            orchestrator(Arc::new(FakeBuilder::default()), Arc::new(MemoryWorkflowStore::new()));
        let outcome = orchestrator
            .reconcile_project(&projects, "shop", &CancellationToken::new())
            .await
            .unwrap();
        assert!(!outcome.has_error);

        let manifest = projects.snapshot("shop").await.unwrap();
        assert_eq!(manifest.current.clusters.len(), 1);
        assert_eq!(manifest.current.clusters[0].name(), "prod");

        assert!(matches!(
            projects.edit_desired("nope", |_| ()).await,
            Err(OrchestratorError::UnknownProject(_))
        ));
    }

    /// Machines that never fail: builds return the desired snapshot with
    /// every requested DNS record materialised, and endpoint rewrites are
    /// recorded.
    #[derive(Default)]
    struct RecordingStages {
        rewrites: StdMutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl stratus_pipeline::Stages for RecordingStages {
        async fn build_infrastructure(
            &self,
            _current: &ClusterState,
            desired: &ClusterState,
        ) -> Result<ClusterState, StageError> {
            let mut built = desired.clone();
            for dns in built.load_balancers.iter_mut().filter_map(|lb| lb.dns.as_mut()) {
                if dns.endpoint.is_empty() {
                    dns.endpoint = format!("{}.{}", dns.hostname, dns.dns_zone);
                }
            }
            Ok(built)
        }

        async fn install_vpn(&self, state: &ClusterState) -> Result<ClusterState, StageError> {
            Ok(state.clone())
        }

        async fn bootstrap(&self, state: &ClusterState) -> Result<ClusterState, StageError> {
            Ok(state.clone())
        }

        async fn rewrite_api_endpoint(
            &self,
            _state: &ClusterState,
            old: &str,
            new: &str,
        ) -> Result<(), StageError> {
            self.rewrites
                .lock()
                .unwrap()
                .push((old.to_string(), new.to_string()));
            Ok(())
        }

        async fn delete_nodes(
            &self,
            _state: &ClusterState,
            _nodes: &BTreeMap<String, Vec<String>>,
        ) -> Result<(), StageError> {
            Ok(())
        }

        async fn replace_proxy(&self, _state: &ClusterState, _enabled: bool) -> Result<(), StageError> {
            Ok(())
        }

        async fn reconcile_storage(&self, _state: &ClusterState) -> Result<(), StageError> {
            Ok(())
        }

        async fn reconcile_autoscaler(&self, _state: &ClusterState) -> Result<(), StageError> {
            Ok(())
        }

        async fn destroy(&self, _state: &ClusterState) -> Result<(), StageError> {
            Ok(())
        }
    }

    /// Runs tasks through the real executor instead of a queue
    struct InlineBuilder {
        executor: Executor,
        kinds: StdMutex<Vec<&'static str>>,
    }

    impl InlineBuilder {
        fn new(stages: Arc<RecordingStages>) -> Self {
            Self {
                executor: Executor::new(stages),
                kinds: StdMutex::default(),
            }
        }
    }

    #[async_trait]
    impl TaskDispatcher for InlineBuilder {
        async fn dispatch(
            &self,
            _manifest: &str,
            _cluster: &str,
            task: &Task,
        ) -> Result<TaskResult, OrchestratorError> {
            self.kinds.lock().unwrap().push(task.kind());
            Ok(self
                .executor
                .process(&CancellationToken::new(), task.clone())
                .await)
        }
    }

    fn api_lb(name: &str, hash: &str, hostname: &str, endpoint: &str) -> LoadBalancerCluster {
        let mut lb = LoadBalancerCluster::new(name, hash, "prod");
        lb.roles = vec![Role::api_server(vec!["control".to_string()])];
        lb.dns = Some(Dns {
            dns_zone: "example.com".to_string(),
            hostname: hostname.to_string(),
            endpoint: endpoint.to_string(),
        });
        lb
    }

    async fn converge(
        current_lb: LoadBalancerCluster,
        desired_lb: LoadBalancerCluster,
    ) -> (ProjectOutcome, Vec<&'static str>, Vec<(String, String)>) {
        let manifest = ProjectManifest {
            name: "shop".to_string(),
            current: ProjectState {
                clusters: vec![k8s("prod", vec![control()])],
                load_balancers: vec![current_lb],
            },
            desired: ProjectState {
                clusters: vec![k8s("prod", vec![control()])],
                load_balancers: vec![desired_lb],
            },
        };
        let stages = Arc::new(RecordingStages::default());
        let builder = Arc::new(InlineBuilder::new(stages.clone()));

        let outcome = orchestrator_with(builder.clone())
            .reconcile(&manifest, &CancellationToken::new())
            .await
            .unwrap();
        let kinds = builder.kinds.lock().unwrap().clone();
        let rewrites = stages.rewrites.lock().unwrap().clone();
        (outcome, kinds, rewrites)
    }

    fn orchestrator_with(builder: Arc<InlineBuilder>) -> Orchestrator {
        Orchestrator::new(builder, Arc::new(MemoryWorkflowStore::new()), 1)
    }

    /// Story: the API load balancer keeps its identity but its hostname
    /// changes from `api` to `api2`. The new record is built first, the
    /// nodes are pointed from the old name to the new one, and the final
    /// state keeps the new record as the endpoint.
    #[tokio::test]
    async fn story_renamed_endpoint_is_built_then_rewritten() {
        let mut running = api_lb("api", "a1", "api", "api.example.com");
        running.used_api_endpoint = true;
        let wanted = api_lb("api", "a1", "api2", "");

        let (outcome, kinds, rewrites) = converge(running, wanted).await;

        assert!(!outcome.has_error, "{:?}", outcome.workflows);
        assert_eq!(kinds, vec!["apply", "api-endpoint", "apply"]);
        assert_eq!(
            rewrites,
            vec![("api.example.com".to_string(), "api2.example.com".to_string())]
        );
        let lb = &outcome.current.load_balancers[0];
        assert_eq!(lb.dns_endpoint(), Some("api2.example.com"));
        assert!(lb.used_api_endpoint);
    }

    /// Story: the endpoint moves from load balancer `api` to a new one,
    /// `api-b`. Both exist while the nodes are rewritten, and the old one is
    /// torn down last.
    #[tokio::test]
    async fn story_endpoint_moves_to_a_new_load_balancer() {
        let mut running = api_lb("api", "a1", "api", "api.example.com");
        running.used_api_endpoint = true;
        let wanted = api_lb("api-b", "b1", "api-b", "");

        let (outcome, kinds, rewrites) = converge(running, wanted).await;

        assert!(!outcome.has_error, "{:?}", outcome.workflows);
        assert_eq!(kinds, vec!["apply", "api-endpoint", "apply", "delete"]);
        assert_eq!(
            rewrites,
            vec![("api.example.com".to_string(), "api-b.example.com".to_string())]
        );
        let lbs = &outcome.current.load_balancers;
        assert_eq!(lbs.len(), 1);
        assert_eq!(lbs[0].name(), "api-b");
        assert!(lbs[0].used_api_endpoint);
    }
}
