//! runrelay CLI: run the server and workers, launch runs, inspect them.

use anyhow::Context as _;
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use runrelay::config::Config;
use runrelay::config::secrets::redact_url;
use runrelay::consumer::{ConsumerConfig, Delivery, EventConsumer, EventHandler};
use runrelay::db::{ConnectionManager, Db, DbSettings};
use runrelay::engine::{CommandProcessor, WorkerConfig, WorkerPool};
use runrelay::http::{self, AppState};
use runrelay::model::{JobId, JobPayload, WorkflowId};
use runrelay::publisher::EventPublisher;
use runrelay::queue::{EnqueueOptions, JobQueue, QueueRegistry};
use runrelay::shutdown::on_termination_signal;
use runrelay::sse::SseBridge;
use runrelay::store::{EventLog, HealthCheck, JobStore, LiveChannel, MemoryStore};
use runrelay::telemetry::{TelemetryConfig, init_telemetry};
use runrelay::tracker::WorkflowStateTracker;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "runrelay", about = "Job queue and live event relay for workflow runs")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP server together with the worker pool
    Serve {
        /// Address to listen on (overrides RELAY_BIND_ADDR)
        #[arg(long)]
        bind: Option<SocketAddr>,
        /// Directory containing queue TOML files (overrides RELAY_QUEUES_DIR)
        #[arg(long)]
        queues: Option<PathBuf>,
        /// Keep everything in process memory instead of Postgres
        #[arg(long)]
        in_memory: bool,
        /// Serve HTTP only; leave job execution to separate workers
        #[arg(long)]
        no_workers: bool,
    },
    /// Run the worker pool only
    Worker {
        #[arg(long)]
        queues: Option<PathBuf>,
    },
    /// Launch a workflow run
    Enqueue {
        queue: String,
        /// Workflow name
        name: String,
        /// JSON parameters
        #[arg(long)]
        data: Option<String>,
        #[arg(long)]
        workflow_id: Option<String>,
        #[arg(long)]
        actor: Option<String>,
        #[arg(long)]
        queues: Option<PathBuf>,
    },
    /// Show the current state of a run
    Status { workflow_id: String },
    /// Follow a run's events through a consumer group
    Tail {
        workflow_id: String,
        #[arg(long, default_value = "cli-tail")]
        group: String,
        #[arg(long)]
        consumer: Option<String>,
    },
    /// Job operations
    Job {
        #[command(subcommand)]
        action: JobAction,
    },
}

#[derive(Subcommand)]
enum JobAction {
    /// Show a job record
    Show { id: String },
}

/// The three store seams plus health, over one backend.
struct Backend {
    jobs: Arc<dyn JobStore>,
    log: Arc<dyn EventLog>,
    live: Arc<dyn LiveChannel>,
    health: Arc<dyn HealthCheck>,
    db: Option<Arc<Db>>,
}

impl Backend {
    fn memory() -> Self {
        let store = Arc::new(MemoryStore::new());
        Self {
            jobs: store.clone(),
            log: store.clone(),
            live: store.clone(),
            health: store,
            db: None,
        }
    }

    async fn postgres(config: &Config) -> anyhow::Result<Self> {
        info!(url = %redact_url(&config.database_url), "connecting to postgres");
        let conn = Arc::new(ConnectionManager::new(
            config.database_url.clone(),
            DbSettings::default(),
        ));
        let db = Arc::new(Db::connect(conn).await?);
        db.migrate().await?;
        Ok(Self {
            jobs: db.clone(),
            log: db.clone(),
            live: db.clone(),
            health: db.clone(),
            db: Some(db),
        })
    }

    fn publisher(&self, max_len: usize) -> EventPublisher {
        EventPublisher::new(self.log.clone(), self.live.clone()).with_max_len(max_len)
    }

    async fn close(&self) {
        if let Some(db) = &self.db {
            db.close().await;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            bind,
            queues,
            in_memory,
            no_workers,
        } => cmd_serve(bind, queues, in_memory, no_workers).await,
        Command::Worker { queues } => cmd_worker(queues).await,
        Command::Enqueue {
            queue,
            name,
            data,
            workflow_id,
            actor,
            queues,
        } => {
            let config = Config::from_env()?;
            let backend = Backend::postgres(&config).await?;
            let registry = load_registry(queues.as_deref().unwrap_or(config.queues_dir.as_path()))?;
            let result = cmd_enqueue(&backend, registry, queue, name, data, workflow_id, actor).await;
            backend.close().await;
            result
        }
        Command::Status { workflow_id } => {
            let config = Config::from_env()?;
            let backend = Backend::postgres(&config).await?;
            let result = cmd_status(&backend, workflow_id).await;
            backend.close().await;
            result
        }
        Command::Tail {
            workflow_id,
            group,
            consumer,
        } => cmd_tail(workflow_id, group, consumer).await,
        Command::Job { action } => {
            let config = Config::from_env()?;
            let backend = Backend::postgres(&config).await?;
            let result = match action {
                JobAction::Show { id } => cmd_job_show(&backend, id).await,
            };
            backend.close().await;
            result
        }
    }
}

fn load_registry(dir: &Path) -> anyhow::Result<Arc<QueueRegistry>> {
    let registry = QueueRegistry::load_from_dir(dir)
        .with_context(|| format!("loading queue policies from {}", dir.display()))?;
    if registry.is_empty() {
        warn!(dir = %dir.display(), "no queue policies found");
    }
    Ok(Arc::new(registry))
}

/// A pool with a [`CommandProcessor`] for every queue that names a command.
fn build_pool(
    backend: &Backend,
    registry: Arc<QueueRegistry>,
    max_len: usize,
) -> anyhow::Result<WorkerPool> {
    let mut pool = WorkerPool::new(
        backend.jobs.clone(),
        backend.publisher(max_len),
        registry.clone(),
        WorkerConfig::default(),
    );
    for policy in registry.iter() {
        match &policy.command {
            Some(command) => pool.register(&policy.name, CommandProcessor::from_config(command))?,
            None => warn!(queue = %policy.name, "queue has no command, not consuming it"),
        }
    }
    Ok(pool)
}

async fn cmd_serve(
    bind: Option<SocketAddr>,
    queues: Option<PathBuf>,
    in_memory: bool,
    no_workers: bool,
) -> anyhow::Result<()> {
    let config = if in_memory { None } else { Some(Config::from_env()?) };
    let _guard = init_telemetry(match &config {
        Some(config) => TelemetryConfig::from_config(config, "runrelay"),
        None => TelemetryConfig::from_env("runrelay"),
    })?;

    let (backend, bind_addr, queues_dir, max_len) = match config {
        Some(config) => (
            Backend::postgres(&config).await?,
            bind.unwrap_or(config.bind_addr),
            queues.unwrap_or(config.queues_dir),
            config.max_log_len,
        ),
        None => (
            Backend::memory(),
            bind.unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 8080))),
            queues.unwrap_or_else(|| PathBuf::from("queues")),
            runrelay::config::DEFAULT_MAX_LOG_LEN,
        ),
    };

    let registry = load_registry(&queues_dir)?;
    let queue = JobQueue::new(backend.jobs.clone(), registry.clone());
    queue.ensure_queues().await?;

    let tracker = WorkflowStateTracker::new(backend.log.clone());
    let state = AppState {
        queue,
        tracker: tracker.clone(),
        bridge: SseBridge::new(backend.live.clone(), tracker),
        health: backend.health.clone(),
    };

    let shutdown = on_termination_signal()?;
    let server = tokio::spawn(http::serve(bind_addr, state, shutdown.clone()));

    if !no_workers {
        let pool = build_pool(&backend, registry, max_len)?;
        if pool.queues().next().is_some() {
            let stop = pool.shutdown_token();
            let trigger = shutdown.clone();
            tokio::spawn(async move {
                trigger.cancelled().await;
                stop.cancel();
            });
            if let Err(e) = pool.run().await {
                warn!(error = %e, "worker pool stopped with an error");
                shutdown.cancel();
            }
        }
    }

    server.await??;
    backend.close().await;
    Ok(())
}

async fn cmd_worker(queues: Option<PathBuf>) -> anyhow::Result<()> {
    let config = Config::from_env()?;
    let _guard = init_telemetry(TelemetryConfig::from_config(&config, "runrelay-worker"))?;

    let backend = Backend::postgres(&config).await?;
    let registry = load_registry(queues.as_deref().unwrap_or(config.queues_dir.as_path()))?;
    let pool = build_pool(&backend, registry, config.max_log_len)?;

    let stop = pool.shutdown_token();
    let shutdown = on_termination_signal()?;
    tokio::spawn(async move {
        shutdown.cancelled().await;
        stop.cancel();
    });

    let result = pool.run().await;
    backend.close().await;
    Ok(result?)
}

async fn cmd_enqueue(
    backend: &Backend,
    registry: Arc<QueueRegistry>,
    queue: String,
    name: String,
    data: Option<String>,
    workflow_id: Option<String>,
    actor: Option<String>,
) -> anyhow::Result<()> {
    let data: serde_json::Value = match data {
        Some(json) => serde_json::from_str(&json).context("--data is not valid JSON")?,
        None => serde_json::json!({}),
    };
    let mut options = EnqueueOptions::default();
    if let Some(id) = workflow_id {
        options = options.workflow_id(id);
    }
    if let Some(actor) = actor {
        options = options.actor(actor);
    }

    let jobs = JobQueue::new(backend.jobs.clone(), registry);
    jobs.ensure_queues().await?;
    let job = jobs.enqueue(&queue, JobPayload::new(name, data), options).await?;
    println!("Enqueued job {} for run {}", job.id, job.workflow_id);
    Ok(())
}

async fn cmd_status(backend: &Backend, workflow_id: String) -> anyhow::Result<()> {
    let tracker = WorkflowStateTracker::new(backend.log.clone());
    let status = tracker.status(&WorkflowId::from(workflow_id)).await?;
    println!("Run:     {}", status.workflow_id);
    println!("State:   {}", status.state);
    println!("Events:  {}", status.event_count);
    if let Some(content) = &status.last_content {
        println!("Latest:  {content}");
    }
    Ok(())
}

/// Prints each event on one line.
struct PrintHandler;

#[async_trait]
impl EventHandler for PrintHandler {
    async fn handle(&self, delivery: &Delivery) -> runrelay::error::Result<()> {
        match delivery {
            Delivery::Event { id, record } => println!(
                "{id:>8}  {:<22}  {}",
                record.kind.as_str(),
                record.content.as_deref().unwrap_or("")
            ),
            Delivery::Malformed { id, raw, error } => {
                println!("{id:>8}  <malformed: {error}>  {raw}")
            }
        }
        Ok(())
    }
}

async fn cmd_tail(workflow_id: String, group: String, consumer: Option<String>) -> anyhow::Result<()> {
    let config = Config::from_env()?;
    let backend = Backend::postgres(&config).await?;
    let consumer_name = consumer.unwrap_or_else(|| format!("tail-{}", std::process::id()));

    let events = EventConsumer::new(backend.log.clone(), ConsumerConfig::default());
    let result = events
        .read_group(
            &WorkflowId::from(workflow_id),
            &group,
            &consumer_name,
            &PrintHandler,
            on_termination_signal()?,
        )
        .await;
    backend.close().await;
    Ok(result?)
}

async fn cmd_job_show(backend: &Backend, id: String) -> anyhow::Result<()> {
    let id: JobId = id.parse().context("job id must be a UUID")?;
    let job = backend.jobs.get_job(id).await?;
    println!("ID:          {}", job.id);
    println!("Queue:       {}", job.queue);
    println!("Run:         {}", job.workflow_id);
    println!("Workflow:    {}", job.payload.name);
    println!("State:       {}", job.state);
    println!("Attempts:    {}/{}", job.attempts, job.opts.attempts);
    println!("Created:     {}", job.created_at.format("%Y-%m-%d %H:%M:%S"));
    println!("Updated:     {}", job.updated_at.format("%Y-%m-%d %H:%M:%S"));
    if let Some(finished) = job.finished_at {
        println!("Finished:    {}", finished.format("%Y-%m-%d %H:%M:%S"));
    }
    if let Some(err) = &job.last_error {
        println!("Last error:  {err}");
    }
    println!(
        "Data:        {}",
        serde_json::to_string_pretty(&job.payload.data)?
    );
    Ok(())
}
