//! Enqueueing typed payloads onto the logical queues.

use std::sync::Mutex;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tracing::debug;
use uuid::Uuid;

use super::job::{Job, JobPayload, QueueName, DEFAULT_MAX_ATTEMPTS};
use super::queue::{JobQueue, QueueError};

/// Puts work on a named queue.
///
/// Retry and backoff belong to the queue, not to callers: a dispatcher only
/// stores the job.
#[async_trait]
pub trait QueueDispatcher: Send + Sync {
    /// Enqueues `payload` and returns the new job's id.
    async fn enqueue(&self, queue: QueueName, payload: JobPayload) -> Result<Uuid, QueueError>;
}

/// Dispatcher over the three Redis-backed queues.
pub struct RedisDispatcher {
    default: JobQueue,
    evaluations: JobQueue,
    events: JobQueue,
    max_attempts: u32,
}

impl RedisDispatcher {
    pub async fn connect(redis_url: &str, key_prefix: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;
        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;
        Ok(Self::from_connection(redis, key_prefix))
    }

    pub fn from_connection(redis: ConnectionManager, key_prefix: &str) -> Self {
        Self {
            default: JobQueue::from_connection(redis.clone(), key_prefix, QueueName::Default),
            evaluations: JobQueue::from_connection(
                redis.clone(),
                key_prefix,
                QueueName::Evaluations,
            ),
            events: JobQueue::from_connection(redis, key_prefix, QueueName::Events),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Sets the attempt budget stamped on every new job.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn queue(&self, name: QueueName) -> &JobQueue {
        match name {
            QueueName::Default => &self.default,
            QueueName::Evaluations => &self.evaluations,
            QueueName::Events => &self.events,
        }
    }
}

#[async_trait]
impl QueueDispatcher for RedisDispatcher {
    async fn enqueue(&self, queue: QueueName, payload: JobPayload) -> Result<Uuid, QueueError> {
        let job = Job::new(queue, payload).with_max_attempts(self.max_attempts);
        self.queue(queue).enqueue(&job).await?;

        debug!(
            queue = %queue,
            job_id = %job.id,
            kind = job.payload.kind(),
            batch_id = job.payload.batch_id(),
            "Enqueued job"
        );
        Ok(job.id)
    }
}

/// Dispatcher that keeps jobs in memory, in enqueue order.
#[derive(Debug, Default)]
pub struct MemoryDispatcher {
    jobs: Mutex<Vec<Job>>,
}

impl MemoryDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every job enqueued so far.
    pub fn jobs(&self) -> Vec<Job> {
        match self.jobs.lock() {
            Ok(jobs) => jobs.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Payloads enqueued on one queue.
    pub fn payloads(&self, queue: QueueName) -> Vec<JobPayload> {
        self.jobs()
            .into_iter()
            .filter(|job| job.queue == queue)
            .map(|job| job.payload)
            .collect()
    }

    /// Removes and returns every job enqueued on `queue`.
    pub fn take(&self, queue: QueueName) -> Vec<Job> {
        let mut guard = match self.jobs.lock() {
            Ok(jobs) => jobs,
            Err(poisoned) => poisoned.into_inner(),
        };
        let (taken, kept): (Vec<Job>, Vec<Job>) =
            guard.drain(..).partition(|job| job.queue == queue);
        *guard = kept;
        taken
    }
}

#[async_trait]
impl QueueDispatcher for MemoryDispatcher {
    async fn enqueue(&self, queue: QueueName, payload: JobPayload) -> Result<Uuid, QueueError> {
        let job = Job::new(queue, payload);
        let id = job.id;
        match self.jobs.lock() {
            Ok(mut jobs) => jobs.push(job),
            Err(poisoned) => poisoned.into_inner().push(job),
        }
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::progress::ProgressSnapshot;
    use crate::batch::types::{Batch, BatchDrained};

    fn drained(batch_id: &str) -> JobPayload {
        JobPayload::BatchDrained(BatchDrained {
            batch: Batch {
                batch_id: batch_id.to_string(),
                workspace_id: 1,
                document_uuid: Uuid::new_v4(),
                evaluation: None,
            },
            experiment_uuid: None,
            progress: ProgressSnapshot::new(0),
        })
    }

    #[tokio::test]
    async fn test_memory_dispatcher_keeps_order_per_queue() {
        let dispatcher = MemoryDispatcher::new();

        let first = dispatcher
            .enqueue(QueueName::Events, drained("a"))
            .await
            .expect("enqueue");
        dispatcher
            .enqueue(QueueName::Default, drained("b"))
            .await
            .expect("enqueue");
        dispatcher
            .enqueue(QueueName::Events, drained("c"))
            .await
            .expect("enqueue");

        let events = dispatcher.payloads(QueueName::Events);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].batch_id(), "a");
        assert_eq!(events[1].batch_id(), "c");
        assert_eq!(dispatcher.jobs()[0].id, first);

        let taken = dispatcher.take(QueueName::Events);
        assert_eq!(taken.len(), 2);
        assert_eq!(dispatcher.jobs().len(), 1);
        assert!(dispatcher.payloads(QueueName::Events).is_empty());
    }
}
