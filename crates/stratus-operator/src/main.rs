//! Stratus operator - multi-cloud Kubernetes cluster reconciliation

mod manifest;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use stratus_common::config::OperatorConfig;
use stratus_common::telemetry::{init_telemetry, TelemetryConfig};
use stratus_pipeline::{Executor, ToolRunner, ToolStages};
use stratus_queue::{Consumer, ConsumerConfig, MemoryBroker, QueueDispatcher};
use stratus_orchestrator::{plan, ClusterView, FileWorkflowStore, Orchestrator, ProjectLocks};

/// Stratus - resumable multi-cloud Kubernetes cluster reconciliation
#[derive(Parser, Debug)]
#[command(name = "stratus", version, about, long_about = None)]
struct Cli {
    /// Operator configuration file (YAML)
    #[arg(long, global = true, env = "STRATUS_CONFIG")]
    config: Option<PathBuf>,

    /// Human-readable log lines instead of JSON
    #[arg(long, global = true)]
    plain_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Reconcile a project until it converges or fails
    ///
    /// Runs the builder (queue consumer and pipeline) and the orchestrator in
    /// one process. A converged project is reconciled again every
    /// `reconcileIntervalSecs`; a failed one waits for a restart.
    Run {
        /// Project manifest (YAML)
        #[arg(long)]
        manifest: PathBuf,

        /// Exit after a single reconciliation round
        #[arg(long)]
        once: bool,
    },
    /// Print the steps that would reconcile a project
    Plan {
        /// Project manifest (YAML)
        #[arg(long)]
        manifest: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => OperatorConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => OperatorConfig::default(),
    };

    match cli.command {
        Commands::Plan { manifest } => print_plan(&manifest),
        Commands::Run { manifest, once } => {
            let telemetry = init_telemetry(TelemetryConfig {
                service_name: "stratus-operator".to_string(),
                json: !cli.plain_logs,
                ..Default::default()
            })?;
            info!(otlp = telemetry.is_exporting(), "telemetry initialised");
            run(config, &manifest, once).await
        }
    }
}

fn print_plan(path: &Path) -> anyhow::Result<()> {
    let manifest = manifest::load(path)?;
    let view = ClusterView::new(&manifest);

    for name in view.names() {
        let Some(entry) = view.entry(&name) else {
            continue;
        };
        let steps = plan(&entry.current, &entry.desired, &entry.deleted_load_balancers);
        println!("{name}:");
        if steps.is_empty() {
            println!("  (nothing to do)");
        }
        for (i, step) in steps.iter().enumerate() {
            println!("  {}. [{}] {}", i + 1, step.stage(), step.describe());
        }
    }
    Ok(())
}

async fn run(config: OperatorConfig, manifest_path: &Path, once: bool) -> anyhow::Result<()> {
    let mut project = manifest::load(manifest_path)?;
    if manifest::resume(&mut project, &config.state_dir)? {
        info!(project = %project.name, "resuming from checkpoint");
    }

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("shutdown signal received"),
                Err(e) => error!(error = %e, "failed to listen for shutdown signal"),
            }
            shutdown.cancel();
        });
    }

    let broker = Arc::new(MemoryBroker::new(
        config.queue.subject.clone(),
        config.queue.ack_wait(),
    ));

    let stages = ToolStages::new(
        ToolRunner::new(config.queue.subprocess_limit),
        config.tools.clone(),
        config.work_dir(),
    );
    let consumer = Arc::new(Consumer::new(
        broker.clone(),
        Arc::new(Executor::new(Arc::new(stages))),
        ConsumerConfig {
            worker_slots: config.queue.worker_slots,
            ..Default::default()
        },
    ));
    let builder = tokio::spawn(consumer.run(shutdown.clone()));

    let orchestrator = Orchestrator::new(
        Arc::new(QueueDispatcher::new(
            broker,
            config.queue.subject.clone(),
            None,
        )),
        Arc::new(FileWorkflowStore::new(config.workflow_dir())),
        config.cluster_concurrency,
    );

    let name = project.name.clone();
    let projects = ProjectLocks::new();
    projects.insert(project);

    let result = reconcile_loop(&orchestrator, &projects, &name, &config, once, &shutdown).await;

    shutdown.cancel();
    if let Err(e) = builder.await {
        warn!(error = %e, "queue consumer task failed");
    }
    result
}

async fn reconcile_loop(
    orchestrator: &Orchestrator,
    projects: &ProjectLocks,
    name: &str,
    config: &OperatorConfig,
    once: bool,
    shutdown: &CancellationToken,
) -> anyhow::Result<()> {
    let interval = Duration::from_secs(config.reconcile_interval_secs);

    loop {
        let outcome = orchestrator
            .reconcile_project(projects, name, shutdown)
            .await?;
        manifest::checkpoint(&config.state_dir, name, &outcome.current)?;

        if outcome.has_error {
            for (cluster, workflow) in outcome.workflows.iter().filter(|(_, w)| w.is_error()) {
                error!(cluster = %cluster, stage = %workflow.stage, error = %workflow.description, "cluster failed");
            }
            if once || shutdown.is_cancelled() {
                anyhow::bail!("project {name} has failed clusters");
            }
            warn!(project = name, "waiting for restart after failure");
            shutdown.cancelled().await;
            return Ok(());
        }

        if once {
            return Ok(());
        }

        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            _ = tokio::time::sleep(interval) => {}
        }
    }
}
