//! Worker pool for processing jobs from the Redis queues.
//!
//! Each configured queue gets `num_workers` workers. A worker runs as an
//! independent async task: it promotes delayed jobs whose backoff elapsed,
//! pulls the next job, runs the handler under the job timeout and settles
//! the delivery.
//!
//! # Failure policy
//!
//! | Failure | Action |
//! |---|---|
//! | rate limit, timeout | retry after backoff while attempts remain, then dead-letter |
//! | fatal | dead-letter immediately (retried like rate limits if `retry_fatal`) |
//! | anything else | retry after backoff while attempts remain, then dead-letter |
//!
//! # Consumer lease
//!
//! Each queue of the pool heartbeats every quarter of `consumer_lease` and,
//! on the same tick, takes back the jobs of consumers whose heartbeat
//! expired. Jobs still held by live processes are never touched.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::job::{BackoffPolicy, Job, JobStatus, QueueName};
use super::queue::{Delivery, JobQueue, QueueError};
use super::router::{JobFailure, JobHandler};
use crate::batch::classifier::ErrorClassification;
use crate::metrics::MetricsCollector;

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Failed to connect to a job queue.
    #[error("Queue connection failed: {0}")]
    QueueConnection(#[from] QueueError),

    #[error("Pool has no queues to consume")]
    NoQueues,

    #[error("Pool is already running")]
    AlreadyRunning,

    #[error("Pool is not running")]
    NotRunning,

    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Workers spawned per queue.
    pub num_workers: usize,
    pub redis_url: String,
    /// Prefix of every Redis key.
    pub key_prefix: String,
    /// Queues this process consumes.
    pub queues: Vec<QueueName>,
    /// How long a dequeue blocks when the queue is empty.
    pub poll_interval: Duration,
    /// Maximum time allowed for processing a single job.
    pub job_timeout: Duration,
    /// Timeout for graceful shutdown.
    pub shutdown_timeout: Duration,
    pub backoff: BackoffPolicy,
    /// Retry fatal failures like rate limits instead of dead-lettering them.
    pub retry_fatal: bool,
    /// How long a consumer may go without a heartbeat before its in-flight
    /// jobs are recovered by another process.
    pub consumer_lease: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            num_workers: 4,
            redis_url: "redis://localhost:6379".to_string(),
            key_prefix: "batchrun".to_string(),
            queues: QueueName::ALL.to_vec(),
            poll_interval: Duration::from_secs(1),
            job_timeout: Duration::from_secs(600),
            shutdown_timeout: Duration::from_secs(60),
            backoff: BackoffPolicy::default(),
            retry_fatal: false,
            consumer_lease: Duration::from_secs(60),
        }
    }
}

impl WorkerPoolConfig {
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers,
            ..Default::default()
        }
    }

    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = url.into();
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_queues(mut self, queues: Vec<QueueName>) -> Self {
        self.queues = queues;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_retry_fatal(mut self, retry_fatal: bool) -> Self {
        self.retry_fatal = retry_fatal;
        self
    }

    pub fn with_consumer_lease(mut self, lease: Duration) -> Self {
        self.consumer_lease = lease;
        self
    }

    /// Interval between heartbeats, a quarter of the lease.
    pub fn heartbeat_interval(&self) -> Duration {
        (self.consumer_lease / 4).max(Duration::from_secs(1))
    }
}

/// What to do with a job whose handler failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    RetryAfter(Duration),
    DeadLetter,
}

/// Decides the fate of a failed job. `job.attempts` already counts the
/// failed attempt.
pub fn failure_action(
    job: &Job,
    failure: &JobFailure,
    backoff: &BackoffPolicy,
    retry_fatal: bool,
) -> FailureAction {
    let fatal = matches!(
        failure,
        JobFailure::Escalated {
            classification: ErrorClassification::Fatal,
            ..
        }
    );

    if (fatal && !retry_fatal) || !job.should_retry() {
        FailureAction::DeadLetter
    } else {
        FailureAction::RetryAfter(backoff.delay_for(job.attempts))
    }
}

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Total number of workers in the pool.
    pub num_workers: usize,
    /// Number of workers currently processing jobs.
    pub active_workers: usize,
    pub jobs_succeeded: u64,
    pub jobs_retried: u64,
    pub jobs_dead_lettered: u64,
    pub average_job_duration: Duration,
}

impl PoolStats {
    pub fn total_processed(&self) -> u64 {
        self.jobs_succeeded + self.jobs_retried + self.jobs_dead_lettered
    }

    /// Share of processed jobs that succeeded, as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        (self.jobs_succeeded as f64 / total as f64) * 100.0
    }
}

/// Shared state for tracking pool statistics.
struct SharedPoolStats {
    jobs_succeeded: AtomicU64,
    jobs_retried: AtomicU64,
    jobs_dead_lettered: AtomicU64,
    total_duration_ms: AtomicU64,
    active_workers: AtomicU64,
}

impl SharedPoolStats {
    fn new() -> Self {
        Self {
            jobs_succeeded: AtomicU64::new(0),
            jobs_retried: AtomicU64::new(0),
            jobs_dead_lettered: AtomicU64::new(0),
            total_duration_ms: AtomicU64::new(0),
            active_workers: AtomicU64::new(0),
        }
    }

    fn record(&self, status: JobStatus, duration: Duration) {
        let counter = match status {
            JobStatus::Succeeded => &self.jobs_succeeded,
            JobStatus::Retried => &self.jobs_retried,
            JobStatus::DeadLettered => &self.jobs_dead_lettered,
        };
        counter.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn increment_active(&self) {
        self.active_workers.fetch_add(1, Ordering::SeqCst);
    }

    fn decrement_active(&self) {
        self.active_workers.fetch_sub(1, Ordering::SeqCst);
    }

    fn to_pool_stats(&self, num_workers: usize) -> PoolStats {
        let succeeded = self.jobs_succeeded.load(Ordering::SeqCst);
        let retried = self.jobs_retried.load(Ordering::SeqCst);
        let dead_lettered = self.jobs_dead_lettered.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);
        let active = self.active_workers.load(Ordering::SeqCst);

        let total_jobs = succeeded + retried + dead_lettered;
        let average_duration = if total_jobs > 0 {
            Duration::from_millis(total_duration_ms / total_jobs)
        } else {
            Duration::ZERO
        };

        PoolStats {
            num_workers,
            active_workers: active as usize,
            jobs_succeeded: succeeded,
            jobs_retried: retried,
            jobs_dead_lettered: dead_lettered,
            average_job_duration: average_duration,
        }
    }
}

/// Worker pool that manages workers over one or more queues.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    queues: Vec<Arc<JobQueue>>,
    handler: Arc<dyn JobHandler>,
    shutdown_tx: broadcast::Sender<()>,
    worker_handles: Vec<JoinHandle<()>>,
    stats: Arc<SharedPoolStats>,
    is_running: AtomicBool,
}

impl WorkerPool {
    /// Connects to every configured queue.
    ///
    /// # Errors
    ///
    /// Returns `PoolError` if a queue connection fails or no queue is
    /// configured.
    pub async fn connect(
        config: WorkerPoolConfig,
        handler: Arc<dyn JobHandler>,
    ) -> Result<Self, PoolError> {
        let mut queues = Vec::with_capacity(config.queues.len());
        for name in &config.queues {
            let queue = JobQueue::connect(&config.redis_url, &config.key_prefix, *name).await?;
            queues.push(Arc::new(queue));
        }
        Self::with_queues(config, queues, handler)
    }

    /// Creates a pool over already opened queues.
    pub fn with_queues(
        config: WorkerPoolConfig,
        queues: Vec<Arc<JobQueue>>,
        handler: Arc<dyn JobHandler>,
    ) -> Result<Self, PoolError> {
        if queues.is_empty() {
            return Err(PoolError::NoQueues);
        }

        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            config,
            queues,
            handler,
            shutdown_tx,
            worker_handles: Vec::new(),
            stats: Arc::new(SharedPoolStats::new()),
            is_running: AtomicBool::new(false),
        })
    }

    /// Registers every queue's consumer, recovers jobs orphaned by stale
    /// consumers, then spawns the workers and the lease keepers.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::AlreadyRunning` if the pool is already running.
    pub async fn start(&mut self) -> Result<(), PoolError> {
        if self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::AlreadyRunning);
        }

        for queue in &self.queues {
            if let Err(e) = queue.heartbeat().await {
                warn!(queue = %queue.name(), error = %e, "Failed to register consumer");
            }
            recover_stale(queue, self.config.consumer_lease).await;

            self.worker_handles.push(tokio::spawn(keep_lease(
                Arc::clone(queue),
                self.config.consumer_lease,
                self.config.heartbeat_interval(),
                self.shutdown_tx.subscribe(),
            )));

            for i in 0..self.config.num_workers {
                let worker = Worker {
                    id: format!("{}-worker-{}", queue.name(), i),
                    queue: Arc::clone(queue),
                    handler: Arc::clone(&self.handler),
                    shutdown_rx: self.shutdown_tx.subscribe(),
                    poll_interval: self.config.poll_interval,
                    job_timeout: self.config.job_timeout,
                    backoff: self.config.backoff,
                    retry_fatal: self.config.retry_fatal,
                    stats: Arc::clone(&self.stats),
                    metrics: MetricsCollector::new(),
                };

                self.worker_handles.push(tokio::spawn(worker.run()));
            }
        }

        self.is_running.store(true, Ordering::SeqCst);
        let total = self.total_workers();
        MetricsCollector::new().update_workers(total);
        info!(
            num_workers = total,
            queues = ?self.config.queues,
            "Worker pool started"
        );

        Ok(())
    }

    /// Gracefully shuts down all workers.
    ///
    /// Workers finish their current job before stopping.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::ShutdownTimeout` if workers don't stop within
    /// the configured timeout.
    pub async fn shutdown(&mut self) -> Result<(), PoolError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::NotRunning);
        }

        info!("Initiating worker pool shutdown");

        // Workers may have already stopped.
        let _ = self.shutdown_tx.send(());

        let shutdown_future = async {
            for handle in self.worker_handles.drain(..) {
                if let Err(e) = handle.await {
                    error!(error = %e, "Worker task panicked during shutdown");
                }
            }
        };

        let result = tokio::time::timeout(self.config.shutdown_timeout, shutdown_future).await;
        self.is_running.store(false, Ordering::SeqCst);
        MetricsCollector::new().update_workers(0);

        match result {
            Ok(()) => {
                info!("Worker pool shutdown complete");
                Ok(())
            }
            Err(_) => Err(PoolError::ShutdownTimeout(self.config.shutdown_timeout)),
        }
    }

    pub fn stats(&self) -> PoolStats {
        self.stats.to_pool_stats(self.total_workers())
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Workers across all queues.
    pub fn total_workers(&self) -> usize {
        self.config.num_workers * self.queues.len()
    }
}

async fn recover_stale(queue: &JobQueue, lease: Duration) {
    match queue.recover_processing_jobs(lease).await {
        Ok(recovered) if recovered > 0 => {
            info!(
                queue = %queue.name(),
                recovered = recovered,
                "Recovered jobs from stale consumers"
            );
        }
        Ok(_) => {}
        Err(e) => {
            warn!(queue = %queue.name(), error = %e, "Failed to recover processing jobs");
        }
    }
}

/// Heartbeats the queue's consumer and recovers stale consumers until
/// shutdown.
async fn keep_lease(
    queue: Arc<JobQueue>,
    lease: Duration,
    interval: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = ticker.tick() => {
                if let Err(e) = queue.heartbeat().await {
                    warn!(queue = %queue.name(), error = %e, "Heartbeat failed");
                }
                recover_stale(&queue, lease).await;
            }
        }
    }

    debug!(queue = %queue.name(), consumer = queue.consumer_id(), "Lease keeper stopped");
}

/// A single worker bound to one queue.
pub struct Worker {
    id: String,
    queue: Arc<JobQueue>,
    handler: Arc<dyn JobHandler>,
    shutdown_rx: broadcast::Receiver<()>,
    poll_interval: Duration,
    job_timeout: Duration,
    backoff: BackoffPolicy,
    retry_fatal: bool,
    stats: Arc<SharedPoolStats>,
    metrics: MetricsCollector,
}

impl Worker {
    /// Polls and processes jobs until a shutdown signal is received.
    async fn run(mut self) {
        info!(worker_id = %self.id, "Worker started");

        loop {
            match self.shutdown_rx.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Closed) => {
                    info!(worker_id = %self.id, "Worker received shutdown signal");
                    break;
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(broadcast::error::TryRecvError::Empty) => {}
            }

            if let Err(e) = self.queue.promote_due().await {
                warn!(worker_id = %self.id, error = %e, "Failed to promote delayed jobs");
            }

            match self.queue.dequeue(self.poll_interval).await {
                Ok(Some(delivery)) => {
                    self.process_job(delivery).await;
                }
                Ok(None) => {
                    debug!(worker_id = %self.id, "No jobs available");
                    if let Ok(depth) = self.queue.len().await {
                        self.metrics
                            .update_queue_depth(self.queue.name().as_str(), depth);
                    }
                }
                Err(e) => {
                    error!(worker_id = %self.id, error = %e, "Failed to dequeue job");
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }

        info!(worker_id = %self.id, "Worker stopped");
    }

    async fn process_job(&self, delivery: Delivery) {
        let mut job = delivery.job.clone();
        let job_id = job.id;
        let start_time = Instant::now();

        job.increment_attempts();
        info!(
            worker_id = %self.id,
            job_id = %job_id,
            kind = job.payload.kind(),
            batch_id = job.payload.batch_id(),
            attempt = job.attempts,
            "Processing job"
        );

        self.stats.increment_active();
        self.metrics.inc_jobs_in_progress();

        let result = self.execute_job_with_timeout(&job).await;

        self.metrics.dec_jobs_in_progress();
        self.stats.decrement_active();
        let duration = start_time.elapsed();

        let status = match result {
            Ok(()) => {
                if let Err(e) = self.queue.ack(&delivery).await {
                    error!(worker_id = %self.id, job_id = %job_id, error = %e, "Failed to ack job");
                }
                info!(
                    worker_id = %self.id,
                    job_id = %job_id,
                    duration_ms = duration.as_millis() as u64,
                    "Job completed"
                );
                JobStatus::Succeeded
            }
            Err(failure) => self.settle_failure(&delivery, job, failure).await,
        };

        self.stats.record(status, duration);
        self.metrics
            .record_job(self.queue.name().as_str(), status.as_str());
    }

    async fn settle_failure(&self, delivery: &Delivery, mut job: Job, failure: JobFailure) -> JobStatus {
        let job_id = job.id;
        job.record_failure(failure.to_string());

        match failure_action(&job, &failure, &self.backoff, self.retry_fatal) {
            FailureAction::RetryAfter(delay) => {
                warn!(
                    worker_id = %self.id,
                    job_id = %job_id,
                    reason = failure.reason(),
                    error = %failure,
                    remaining_attempts = job.remaining_attempts(),
                    delay_ms = delay.as_millis() as u64,
                    "Job failed, scheduling retry"
                );
                if let Err(e) = self.queue.retry_later(delivery, &job, delay).await {
                    error!(worker_id = %self.id, job_id = %job_id, error = %e, "Failed to schedule retry");
                }
                JobStatus::Retried
            }
            FailureAction::DeadLetter => {
                error!(
                    worker_id = %self.id,
                    job_id = %job_id,
                    reason = failure.reason(),
                    error = %failure,
                    attempts = job.attempts,
                    "Job failed, moving to dead letter queue"
                );
                if let Err(e) = self
                    .queue
                    .dead_letter(delivery, &job, &failure.to_string())
                    .await
                {
                    error!(
                        worker_id = %self.id,
                        job_id = %job_id,
                        error = %e,
                        "Failed to move job to dead letter queue"
                    );
                }
                JobStatus::DeadLettered
            }
        }
    }

    async fn execute_job_with_timeout(&self, job: &Job) -> Result<(), JobFailure> {
        match tokio::time::timeout(self.job_timeout, self.handler.handle(job)).await {
            Ok(result) => result,
            Err(_) => Err(JobFailure::TimedOut(self.job_timeout)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::progress::ProgressSnapshot;
    use crate::batch::types::{Batch, BatchDrained};
    use crate::scheduler::job::JobPayload;

    fn job_after_attempts(attempts: u32) -> Job {
        let mut job = Job::new(
            QueueName::Events,
            JobPayload::BatchDrained(BatchDrained {
                batch: Batch {
                    batch_id: "batch1".to_string(),
                    workspace_id: 1,
                    document_uuid: uuid::Uuid::new_v4(),
                    evaluation: None,
                },
                experiment_uuid: None,
                progress: ProgressSnapshot::new(1),
            }),
        )
        .with_max_attempts(3);
        for _ in 0..attempts {
            job.increment_attempts();
        }
        job
    }

    fn escalated(classification: ErrorClassification) -> JobFailure {
        JobFailure::Escalated {
            classification,
            message: "Test error".to_string(),
        }
    }

    #[test]
    fn test_worker_pool_config_default() {
        let config = WorkerPoolConfig::default();

        assert_eq!(config.num_workers, 4);
        assert_eq!(config.redis_url, "redis://localhost:6379");
        assert_eq!(config.key_prefix, "batchrun");
        assert_eq!(config.queues, QueueName::ALL.to_vec());
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert!(!config.retry_fatal);
        assert_eq!(config.consumer_lease, Duration::from_secs(60));
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(15));
    }

    #[test]
    fn test_heartbeat_interval_has_a_floor() {
        let config = WorkerPoolConfig::default().with_consumer_lease(Duration::from_secs(2));
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_unclassified_failures_are_retried() {
        let backoff = BackoffPolicy::Fixed(Duration::from_secs(5));
        let failure = escalated(ErrorClassification::Recoverable);

        assert_eq!(
            failure_action(&job_after_attempts(1), &failure, &backoff, false),
            FailureAction::RetryAfter(Duration::from_secs(5))
        );
        assert_eq!(
            failure_action(&job_after_attempts(3), &failure, &backoff, false),
            FailureAction::DeadLetter
        );
    }

    #[test]
    fn test_worker_pool_config_builder() {
        let config = WorkerPoolConfig::new(8)
            .with_redis_url("redis://custom:6380")
            .with_key_prefix("prod")
            .with_queues(vec![QueueName::Evaluations])
            .with_poll_interval(Duration::from_secs(5))
            .with_job_timeout(Duration::from_secs(3600))
            .with_shutdown_timeout(Duration::from_secs(120))
            .with_backoff(BackoffPolicy::Fixed(Duration::from_secs(3)))
            .with_retry_fatal(true);

        assert_eq!(config.num_workers, 8);
        assert_eq!(config.redis_url, "redis://custom:6380");
        assert_eq!(config.key_prefix, "prod");
        assert_eq!(config.queues, vec![QueueName::Evaluations]);
        assert_eq!(config.job_timeout, Duration::from_secs(3600));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(120));
        assert_eq!(config.backoff, BackoffPolicy::Fixed(Duration::from_secs(3)));
        assert!(config.retry_fatal);
    }

    #[test]
    fn test_rate_limit_retries_with_backoff_until_exhausted() {
        let backoff = BackoffPolicy::Exponential {
            base: Duration::from_secs(1),
            max: Duration::from_secs(60),
        };
        let failure = escalated(ErrorClassification::RateLimit);

        assert_eq!(
            failure_action(&job_after_attempts(1), &failure, &backoff, false),
            FailureAction::RetryAfter(Duration::from_secs(1))
        );
        assert_eq!(
            failure_action(&job_after_attempts(2), &failure, &backoff, false),
            FailureAction::RetryAfter(Duration::from_secs(2))
        );
        assert_eq!(
            failure_action(&job_after_attempts(3), &failure, &backoff, false),
            FailureAction::DeadLetter
        );
    }

    #[test]
    fn test_fatal_dead_letters_unless_configured() {
        let backoff = BackoffPolicy::Fixed(Duration::from_secs(5));
        let failure = escalated(ErrorClassification::Fatal);

        assert_eq!(
            failure_action(&job_after_attempts(1), &failure, &backoff, false),
            FailureAction::DeadLetter
        );
        assert_eq!(
            failure_action(&job_after_attempts(1), &failure, &backoff, true),
            FailureAction::RetryAfter(Duration::from_secs(5))
        );
    }

    #[test]
    fn test_timeouts_are_retried() {
        let backoff = BackoffPolicy::Fixed(Duration::from_secs(5));
        let failure = JobFailure::TimedOut(Duration::from_secs(30));

        assert_eq!(
            failure_action(&job_after_attempts(1), &failure, &backoff, false),
            FailureAction::RetryAfter(Duration::from_secs(5))
        );
    }

    #[test]
    fn test_pool_stats_calculations() {
        let stats = PoolStats {
            num_workers: 4,
            active_workers: 2,
            jobs_succeeded: 80,
            jobs_retried: 15,
            jobs_dead_lettered: 5,
            average_job_duration: Duration::from_secs(60),
        };

        assert_eq!(stats.total_processed(), 100);
        assert!((stats.success_rate() - 80.0).abs() < f64::EPSILON);
        assert!((PoolStats::default().success_rate() - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_shared_pool_stats() {
        let stats = SharedPoolStats::new();

        stats.record(JobStatus::Succeeded, Duration::from_secs(10));
        stats.record(JobStatus::Succeeded, Duration::from_secs(20));
        stats.record(JobStatus::DeadLettered, Duration::from_secs(5));
        stats.increment_active();
        stats.increment_active();
        stats.decrement_active();

        let pool_stats = stats.to_pool_stats(4);

        assert_eq!(pool_stats.num_workers, 4);
        assert_eq!(pool_stats.active_workers, 1);
        assert_eq!(pool_stats.jobs_succeeded, 2);
        assert_eq!(pool_stats.jobs_dead_lettered, 1);
        // (10000 + 20000 + 5000) / 3 = 11666 ms
        assert!(pool_stats.average_job_duration.as_millis() > 11000);
        assert!(pool_stats.average_job_duration.as_millis() < 12000);
    }

    #[test]
    fn test_pool_error_display() {
        assert!(PoolError::AlreadyRunning.to_string().contains("already running"));
        assert!(PoolError::NotRunning.to_string().contains("not running"));
        assert!(PoolError::NoQueues.to_string().contains("no queues"));
        assert!(PoolError::ShutdownTimeout(Duration::from_secs(60))
            .to_string()
            .contains("60"));
    }
}
