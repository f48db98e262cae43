//! CLI command definitions for batchrun.
//!
//! `worker` runs the queue consumers; the other commands launch batches and
//! inspect or repair the Redis state they leave behind.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use redis::aio::ConnectionManager;
use serde::Serialize;
use tracing::{info, warn};

use crate::batch::{
    BatchFinalizer, BatchLauncher, BatchOrchestrator, BatchRequest, ChainExecutor, Parameters,
    ProgressTracker, RedisProgressTracker, RedisRunLogStore,
};
use crate::config::BatchConfig;
use crate::gateway::GatewayClient;
use crate::metrics::{init_metrics, metrics_handler};
use crate::notifications::{Notifier, RedisPublisher};
use crate::scheduler::{
    JobQueue, JobRouter, QueueDispatcher, QueueName, QueueStats, RedisDispatcher, WorkerPool,
};

/// Batch document-run workers and tooling.
#[derive(Parser)]
#[command(name = "batchrun")]
#[command(about = "Run documents over dataset rows through Redis-backed worker queues")]
#[command(version)]
#[command(
    long_about = "batchrun fans a document out over parameter rows, runs each row on a worker pool and tracks the batch's progress in Redis.\n\nExample usage:\n  batchrun dispatch --manifest batch.yaml --rows rows.jsonl\n  batchrun worker --workers 8 --queues default,events"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Redis connection URL (overrides REDIS_URL).
    #[arg(long, global = true)]
    pub redis_url: Option<String>,

    /// Prefix for every Redis key (overrides BATCHRUN_KEY_PREFIX).
    #[arg(long, global = true)]
    pub key_prefix: Option<String>,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Consume queues until interrupted.
    Worker(WorkerArgs),

    /// Launch a batch from a YAML manifest.
    Dispatch(DispatchArgs),

    /// Show a batch's counters.
    Progress(ProgressArgs),

    /// Delete a batch's counters.
    Cleanup(CleanupArgs),

    /// Show queue depths.
    Queues(QueuesArgs),

    /// Show dead-lettered jobs.
    #[command(name = "dead-letters")]
    DeadLetters(DeadLettersArgs),
}

/// Arguments for `batchrun worker`.
#[derive(Parser, Debug)]
pub struct WorkerArgs {
    /// Workers per queue.
    #[arg(short = 'w', long, env = "BATCHRUN_WORKERS")]
    pub workers: Option<usize>,

    /// Comma-separated queues to consume (default, evaluations, events).
    #[arg(short = 'q', long, value_delimiter = ',')]
    pub queues: Vec<QueueName>,

    /// Document gateway base URL.
    #[arg(long, env = "BATCHRUN_GATEWAY_URL")]
    pub gateway_url: Option<String>,

    /// Write Prometheus metrics to this file periodically.
    #[arg(long)]
    pub metrics_file: Option<PathBuf>,

    /// Seconds between metrics file writes.
    #[arg(long, default_value = "15")]
    pub metrics_interval: u64,
}

/// Arguments for `batchrun dispatch`.
#[derive(Parser, Debug)]
pub struct DispatchArgs {
    /// YAML batch manifest.
    #[arg(short = 'm', long)]
    pub manifest: PathBuf,

    /// JSONL file with one parameter object per line, appended to the
    /// manifest's rows.
    #[arg(short = 'r', long)]
    pub rows: Option<PathBuf>,

    /// Batch id, overriding the manifest's.
    #[arg(long)]
    pub batch_id: Option<String>,

    /// Output JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `batchrun progress`.
#[derive(Parser, Debug)]
pub struct ProgressArgs {
    pub batch_id: String,

    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `batchrun cleanup`.
#[derive(Parser, Debug)]
pub struct CleanupArgs {
    pub batch_id: String,
}

/// Arguments for `batchrun queues`.
#[derive(Parser, Debug)]
pub struct QueuesArgs {
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `batchrun dead-letters`.
#[derive(Parser, Debug)]
pub struct DeadLettersArgs {
    /// Queue to inspect.
    #[arg(short = 'q', long, default_value = "default")]
    pub queue: QueueName,

    /// Maximum entries to show.
    #[arg(short = 'n', long, default_value = "10")]
    pub limit: usize,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let mut config = BatchConfig::from_env()?;
    if let Some(url) = cli.redis_url {
        config.redis_url = url;
    }
    if let Some(prefix) = cli.key_prefix {
        config.key_prefix = prefix;
    }

    match cli.command {
        Commands::Worker(args) => run_worker_command(args, config).await,
        Commands::Dispatch(args) => run_dispatch_command(args, config).await,
        Commands::Progress(args) => run_progress_command(args, config).await,
        Commands::Cleanup(args) => run_cleanup_command(args, config).await,
        Commands::Queues(args) => run_queues_command(args, config).await,
        Commands::DeadLetters(args) => run_dead_letters_command(args, config).await,
    }
}

async fn connect_redis(config: &BatchConfig) -> anyhow::Result<ConnectionManager> {
    let client = redis::Client::open(config.redis_url.as_str())
        .with_context(|| format!("Invalid Redis URL '{}'", config.redis_url))?;
    ConnectionManager::new(client)
        .await
        .with_context(|| format!("Failed to connect to Redis at {}", config.redis_url))
}

fn progress_tracker(redis: &ConnectionManager, config: &BatchConfig) -> RedisProgressTracker {
    RedisProgressTracker::from_connection(redis.clone(), &config.key_prefix)
        .with_ttl(config.progress_ttl)
}

fn notifier(redis: &ConnectionManager, config: &BatchConfig) -> Notifier {
    Notifier::new(
        Arc::new(RedisPublisher::from_connection(
            redis.clone(),
            &config.key_prefix,
        )),
        config.publish_timeout,
    )
}

// ============================================================================
// Worker
// ============================================================================

async fn run_worker_command(args: WorkerArgs, mut config: BatchConfig) -> anyhow::Result<()> {
    if let Some(workers) = args.workers {
        config.num_workers = workers;
    }
    if !args.queues.is_empty() {
        config.queues = args.queues;
    }
    if let Some(url) = args.gateway_url {
        config.gateway_url = Some(url);
    }
    config.validate()?;

    let gateway = Arc::new(GatewayClient::new(
        config.require_gateway_url()?,
        config.gateway_api_key.clone(),
        config.gateway_timeout,
    )?);

    if let Err(e) = init_metrics() {
        warn!(error = %e, "Failed to initialize metrics");
    }

    let redis = connect_redis(&config).await?;
    let prefix = config.key_prefix.as_str();

    let progress: Arc<dyn ProgressTracker> = Arc::new(progress_tracker(&redis, &config));
    let dispatcher: Arc<dyn QueueDispatcher> = Arc::new(
        RedisDispatcher::from_connection(redis.clone(), prefix)
            .with_max_attempts(config.max_attempts),
    );
    let notifier = notifier(&redis, &config);
    let logs = Arc::new(
        RedisRunLogStore::from_connection(redis.clone(), prefix).with_ttl(config.run_log_ttl),
    );

    let executor = Arc::new(ChainExecutor::new(gateway.clone(), gateway.clone(), logs));
    let orchestrator = Arc::new(BatchOrchestrator::new(
        executor,
        Arc::clone(&progress),
        dispatcher,
        notifier.clone(),
    ));
    let finalizer = Arc::new(
        BatchFinalizer::new(progress, notifier)
            .with_experiments(gateway.clone())
            .with_cleanup_on_drain(config.cleanup_on_drain),
    );
    let router = JobRouter::new(orchestrator, finalizer).with_evaluations(gateway);

    let queues = config
        .queues
        .iter()
        .map(|name| Arc::new(JobQueue::from_connection(redis.clone(), prefix, *name)))
        .collect();

    let mut pool = WorkerPool::with_queues(config.worker_pool_config(), queues, Arc::new(router))?;
    pool.start().await?;

    let metrics_writer = args.metrics_file.map(|path| {
        let interval = Duration::from_secs(args.metrics_interval.max(1));
        tokio::spawn(write_metrics_periodically(path, interval))
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown requested");

    if let Some(handle) = metrics_writer {
        handle.abort();
    }
    pool.shutdown().await?;

    let stats = pool.stats();
    info!(
        succeeded = stats.jobs_succeeded,
        retried = stats.jobs_retried,
        dead_lettered = stats.jobs_dead_lettered,
        average_ms = stats.average_job_duration.as_millis() as u64,
        "Worker pool stopped"
    );
    Ok(())
}

async fn write_metrics_periodically(path: PathBuf, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        if let Err(e) = tokio::fs::write(&path, metrics_handler().await).await {
            warn!(path = %path.display(), error = %e, "Failed to write metrics file");
        }
    }
}

// ============================================================================
// Dispatch
// ============================================================================

/// Reads a YAML batch manifest.
pub fn load_manifest(path: &Path) -> anyhow::Result<BatchRequest> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read manifest {}", path.display()))?;
    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse manifest {}", path.display()))
}

/// Reads parameter rows from a JSONL file. Blank lines are skipped.
pub fn load_rows(path: &Path) -> anyhow::Result<Vec<Parameters>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read rows {}", path.display()))?;

    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| {
            serde_json::from_str::<Parameters>(line).with_context(|| {
                format!("Invalid row on line {} of {}", index + 1, path.display())
            })
        })
        .collect()
}

async fn run_dispatch_command(args: DispatchArgs, config: BatchConfig) -> anyhow::Result<()> {
    let mut request = load_manifest(&args.manifest)?;
    if let Some(rows_path) = &args.rows {
        request.rows.extend(load_rows(rows_path)?);
    }
    if args.batch_id.is_some() {
        request.batch_id = args.batch_id;
    }

    let redis = connect_redis(&config).await?;
    let launcher = BatchLauncher::new(
        Arc::new(progress_tracker(&redis, &config)),
        Arc::new(
            RedisDispatcher::from_connection(redis.clone(), &config.key_prefix)
                .with_max_attempts(config.max_attempts),
        ),
        notifier(&redis, &config),
    );

    let report = launcher.launch(request).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("✓ Batch dispatched");
        println!("  Batch id: {}", report.batch_id);
        println!("  Tasks:    {}", report.job_ids.len());
        println!("  Progress: {}", report.progress);
    }
    Ok(())
}

// ============================================================================
// Inspection
// ============================================================================

async fn run_progress_command(args: ProgressArgs, config: BatchConfig) -> anyhow::Result<()> {
    let redis = connect_redis(&config).await?;
    let snapshot = progress_tracker(&redis, &config)
        .get_progress(&args.batch_id)
        .await?;

    match (snapshot, args.json) {
        (Some(snapshot), true) => println!("{}", serde_json::to_string_pretty(&snapshot)?),
        (Some(snapshot), false) => {
            println!("Batch {}", args.batch_id);
            println!("  Total:     {}", snapshot.total);
            println!("  Completed: {}", snapshot.completed);
            println!("  Errors:    {}", snapshot.errors);
            println!("  Enqueued:  {}", snapshot.enqueued);
            println!("  Drained:   {}", snapshot.is_drained());
        }
        (None, true) => println!("null"),
        (None, false) => println!("No progress recorded for batch {}", args.batch_id),
    }
    Ok(())
}

async fn run_cleanup_command(args: CleanupArgs, config: BatchConfig) -> anyhow::Result<()> {
    let redis = connect_redis(&config).await?;
    progress_tracker(&redis, &config)
        .cleanup(&args.batch_id)
        .await?;
    println!("✓ Cleaned up batch {}", args.batch_id);
    Ok(())
}

#[derive(Debug, Serialize)]
struct QueuesOutput {
    queues: Vec<QueueStats>,
}

async fn run_queues_command(args: QueuesArgs, config: BatchConfig) -> anyhow::Result<()> {
    let redis = connect_redis(&config).await?;
    let queues: Vec<JobQueue> = QueueName::ALL
        .into_iter()
        .map(|name| JobQueue::from_connection(redis.clone(), &config.key_prefix, name))
        .collect();

    let stats = futures::future::try_join_all(queues.iter().map(|q| q.stats())).await?;

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&QueuesOutput { queues: stats })?
        );
    } else {
        println!(
            "{:<12} {:>8} {:>10} {:>8} {:>12}",
            "QUEUE", "PENDING", "PROCESSING", "DELAYED", "DEAD-LETTER"
        );
        for s in stats {
            println!(
                "{:<12} {:>8} {:>10} {:>8} {:>12}",
                s.queue_name, s.pending_jobs, s.processing_jobs, s.delayed_jobs, s.dead_letter_jobs
            );
        }
    }
    Ok(())
}

async fn run_dead_letters_command(
    args: DeadLettersArgs,
    config: BatchConfig,
) -> anyhow::Result<()> {
    let redis = connect_redis(&config).await?;
    let queue = JobQueue::from_connection(redis, &config.key_prefix, args.queue);
    let entries = queue.peek_dead_letter(args.limit).await?;

    println!("{}", serde_json::to_string_pretty(&entries)?);
    Ok(())
}
