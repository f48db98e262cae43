//! Redis-based job queue with reliable dequeue.
//!
//! # Queue Structure
//!
//! Each logical queue uses these Redis keys under `{prefix}:queue:{name}`:
//!
//! - `{key}`: main list; producers LPUSH, workers pop from the right
//! - `{key}:processing:{consumer}`: jobs handed to one consumer's workers
//!   (for crash recovery)
//! - `{key}:consumers`: sorted set of consumer ids scored by their last
//!   heartbeat, in epoch milliseconds
//! - `{key}:delayed`: sorted set of jobs waiting out a backoff, scored by the
//!   epoch millisecond at which they become due
//! - `{key}:dead_letter`: jobs that exhausted their attempts or failed fatally
//!
//! # Reliability
//!
//! Jobs move from the main list to the consumer's processing list atomically
//! on dequeue (BRPOPLPUSH). Every later transition (ack, retry, dead-letter)
//! removes the exact raw entry from the processing list in the same
//! transaction that writes it elsewhere, so a job is never in two places at
//! once.
//!
//! Every [`JobQueue`] is its own consumer. Only the processing lists of
//! consumers whose heartbeat is older than the lease are recovered, so a
//! process that starts while others are mid-job leaves their work alone.

use std::time::Duration;

use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use super::job::{Job, QueueName};

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Failed to connect to Redis.
    #[error("Redis connection failed: {0}")]
    ConnectionFailed(String),

    /// Redis operation failed.
    #[error("Redis operation failed: {0}")]
    RedisError(#[from] redis::RedisError),

    /// Failed to serialize job data.
    #[error("Serialization failed: {0}")]
    SerializationFailed(#[from] serde_json::Error),

    /// The queue refused the job.
    #[error("Queue '{queue}' rejected job: {reason}")]
    Rejected { queue: QueueName, reason: String },
}

/// A dequeued job together with the exact bytes stored in the processing
/// list, needed to remove it again.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub job: Job,
    raw: String,
}

impl Delivery {
    pub fn raw(&self) -> &str {
        &self.raw
    }
}

/// Moves every due delayed job back onto the main list.
const PROMOTE_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, ARGV[2])
for _, job in ipairs(due) do
  redis.call('ZREM', KEYS[1], job)
  redis.call('LPUSH', KEYS[2], job)
end
return #due
"#;

/// Moves one raw entry out of a processing list, only if it is still there.
///
/// KEYS[1] processing list, KEYS[2] destination list. ARGV[1] raw entry,
/// ARGV[2] entry to push, ARGV[3] `right` to push on the consuming end.
const RECLAIM_SCRIPT: &str = r#"
if redis.call('LREM', KEYS[1], 1, ARGV[1]) == 0 then
  return 0
end
if ARGV[3] == 'right' then
  redis.call('RPUSH', KEYS[2], ARGV[2])
else
  redis.call('LPUSH', KEYS[2], ARGV[2])
end
return 1
"#;

/// Maximum number of delayed jobs promoted per call.
const PROMOTE_BATCH: usize = 100;

/// Redis key of a logical queue's main list.
pub fn queue_key(prefix: &str, queue: QueueName) -> String {
    format!("{}:queue:{}", prefix, queue)
}

/// Redis key of one consumer's processing list.
pub fn processing_key(queue_key: &str, consumer_id: &str) -> String {
    format!("{}:processing:{}", queue_key, consumer_id)
}

/// Redis-backed job queue.
pub struct JobQueue {
    redis: ConnectionManager,
    name: QueueName,
    consumer_id: String,
    queue_key: String,
    processing_key: String,
    consumers_key: String,
    delayed_key: String,
    dead_letter_key: String,
    promote_script: redis::Script,
    reclaim_script: redis::Script,
}

impl JobQueue {
    /// Connects to Redis and opens the queue.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::ConnectionFailed` if the connection fails.
    pub async fn connect(
        redis_url: &str,
        key_prefix: &str,
        name: QueueName,
    ) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        Ok(Self::from_connection(redis, key_prefix, name))
    }

    /// Opens the queue on an existing connection manager, as a new consumer.
    pub fn from_connection(redis: ConnectionManager, key_prefix: &str, name: QueueName) -> Self {
        let queue_key = queue_key(key_prefix, name);
        let consumer_id = Uuid::new_v4().to_string();
        Self {
            redis,
            name,
            processing_key: processing_key(&queue_key, &consumer_id),
            consumers_key: format!("{}:consumers", queue_key),
            delayed_key: format!("{}:delayed", queue_key),
            dead_letter_key: format!("{}:dead_letter", queue_key),
            consumer_id,
            queue_key,
            promote_script: redis::Script::new(PROMOTE_SCRIPT),
            reclaim_script: redis::Script::new(RECLAIM_SCRIPT),
        }
    }

    pub fn name(&self) -> QueueName {
        self.name
    }

    pub fn consumer_id(&self) -> &str {
        &self.consumer_id
    }

    /// Marks this consumer alive. Its processing list is left alone while
    /// the last heartbeat is younger than the lease.
    pub async fn heartbeat(&self) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        conn.zadd::<_, _, _, ()>(
            &self.consumers_key,
            &self.consumer_id,
            Utc::now().timestamp_millis(),
        )
        .await?;
        Ok(())
    }

    /// Enqueues a job at the back of the queue.
    pub async fn enqueue(&self, job: &Job) -> Result<(), QueueError> {
        let serialized = serde_json::to_string(job)?;
        let mut conn = self.redis.clone();
        conn.lpush::<_, _, ()>(&self.queue_key, serialized).await?;
        Ok(())
    }

    /// Enqueues several jobs in one round trip.
    pub async fn enqueue_batch(&self, jobs: &[Job]) -> Result<(), QueueError> {
        if jobs.is_empty() {
            return Ok(());
        }

        let serialized = jobs
            .iter()
            .map(serde_json::to_string)
            .collect::<Result<Vec<String>, _>>()?;

        let mut pipe = redis::pipe();
        for job_data in &serialized {
            pipe.lpush(&self.queue_key, job_data).ignore();
        }

        let mut conn = self.redis.clone();
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    /// Dequeues the next job, blocking until one is available or `timeout`.
    ///
    /// An entry that does not decode as a [`Job`] is moved to the dead-letter
    /// list and `Ok(None)` is returned.
    pub async fn dequeue(&self, timeout: Duration) -> Result<Option<Delivery>, QueueError> {
        self.heartbeat().await?;

        let mut conn = self.redis.clone();
        let timeout_secs = timeout.as_secs().max(1) as usize;

        let raw: Option<String> = redis::cmd("BRPOPLPUSH")
            .arg(&self.queue_key)
            .arg(&self.processing_key)
            .arg(timeout_secs)
            .query_async(&mut conn)
            .await?;

        let Some(raw) = raw else {
            return Ok(None);
        };

        match serde_json::from_str::<Job>(&raw) {
            Ok(job) => Ok(Some(Delivery { job, raw })),
            Err(e) => {
                warn!(queue = %self.name, error = %e, "Quarantining malformed job");
                self.quarantine(&self.processing_key, &raw, &e.to_string())
                    .await?;
                Ok(None)
            }
        }
    }

    /// Acknowledges a delivery, dropping it from the processing list.
    pub async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        conn.lrem::<_, _, ()>(&self.processing_key, 1, &delivery.raw)
            .await?;
        Ok(())
    }

    /// Schedules `job` (the updated envelope of `delivery`) to run again
    /// after `delay`.
    pub async fn retry_later(
        &self,
        delivery: &Delivery,
        job: &Job,
        delay: Duration,
    ) -> Result<(), QueueError> {
        let serialized = serde_json::to_string(job)?;
        let due_at = Utc::now().timestamp_millis() + delay.as_millis() as i64;

        let mut pipe = redis::pipe();
        pipe.atomic()
            .lrem(&self.processing_key, 1, &delivery.raw)
            .ignore()
            .zadd(&self.delayed_key, serialized, due_at)
            .ignore();

        let mut conn = self.redis.clone();
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    /// Moves delayed jobs whose backoff has elapsed back to the main list.
    ///
    /// Returns the number of jobs promoted.
    pub async fn promote_due(&self) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let promoted: usize = self
            .promote_script
            .key(&self.delayed_key)
            .key(&self.queue_key)
            .arg(Utc::now().timestamp_millis())
            .arg(PROMOTE_BATCH)
            .invoke_async(&mut conn)
            .await?;
        Ok(promoted)
    }

    /// Moves a delivery to the dead-letter list.
    pub async fn dead_letter(
        &self,
        delivery: &Delivery,
        job: &Job,
        error: &str,
    ) -> Result<(), QueueError> {
        let entry = serde_json::json!({
            "job": job,
            "error": error,
            "moved_at": Utc::now().to_rfc3339(),
        });
        let entry = serde_json::to_string(&entry)?;
        self.move_to_dead_letter(&self.processing_key, &delivery.raw, entry)
            .await
    }

    async fn quarantine(&self, source: &str, raw: &str, error: &str) -> Result<(), QueueError> {
        let entry = serde_json::json!({
            "raw": raw,
            "error": format!("Malformed job: {}", error),
            "moved_at": Utc::now().to_rfc3339(),
        });
        self.move_to_dead_letter(source, raw, serde_json::to_string(&entry)?)
            .await
    }

    async fn move_to_dead_letter(
        &self,
        source: &str,
        raw: &str,
        entry: String,
    ) -> Result<(), QueueError> {
        let mut pipe = redis::pipe();
        pipe.atomic()
            .lrem(source, 1, raw)
            .ignore()
            .lpush(&self.dead_letter_key, entry)
            .ignore();

        let mut conn = self.redis.clone();
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    /// Returns the number of jobs in the main list.
    pub async fn len(&self) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let len: usize = conn.llen(&self.queue_key).await?;
        Ok(len)
    }

    pub async fn is_empty(&self) -> Result<bool, QueueError> {
        Ok(self.len().await? == 0)
    }

    /// Recovers jobs held by consumers that stopped heartbeating.
    ///
    /// A consumer is stale once its last heartbeat is older than `lease`;
    /// this queue's own consumer never is. Each recovered job counts as an
    /// attempt; jobs out of attempts are dead-lettered instead. An entry is
    /// only moved if it is still in the stale list, so concurrent recoveries
    /// never duplicate a job.
    ///
    /// # Returns
    ///
    /// The number of jobs put back on the main list.
    pub async fn recover_processing_jobs(&self, lease: Duration) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let cutoff = Utc::now().timestamp_millis() - lease.as_millis() as i64;

        let stale: Vec<String> = conn
            .zrangebyscore(&self.consumers_key, "-inf", cutoff)
            .await?;

        let mut recovered = 0;
        for consumer in stale.iter().filter(|c| **c != self.consumer_id) {
            let source = processing_key(&self.queue_key, consumer);
            recovered += self.reclaim(&source).await?;

            let remaining: usize = conn.llen(&source).await?;
            if remaining == 0 {
                conn.zrem::<_, _, ()>(&self.consumers_key, consumer).await?;
                info!(queue = %self.name, consumer = %consumer, "Released stale consumer");
            }
        }

        Ok(recovered)
    }

    async fn reclaim(&self, source: &str) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let entries: Vec<String> = conn.lrange(source, 0, -1).await?;

        let mut recovered = 0;
        for raw in entries {
            let mut job = match serde_json::from_str::<Job>(&raw) {
                Ok(job) => job,
                Err(e) => {
                    self.quarantine(source, &raw, &e.to_string()).await?;
                    continue;
                }
            };

            job.increment_attempts();
            let (destination, entry, side) = if job.should_retry() {
                (&self.queue_key, serde_json::to_string(&job)?, "right")
            } else {
                let entry = serde_json::json!({
                    "job": job,
                    "error": "Recovered from processing queue after max attempts",
                    "moved_at": Utc::now().to_rfc3339(),
                });
                (&self.dead_letter_key, serde_json::to_string(&entry)?, "left")
            };

            let moved: i64 = self
                .reclaim_script
                .key(source)
                .key(destination)
                .arg(&raw)
                .arg(entry)
                .arg(side)
                .invoke_async(&mut conn)
                .await?;
            if moved == 1 && side == "right" {
                recovered += 1;
            }
        }

        Ok(recovered)
    }

    /// Deletes every key of the queue.
    ///
    /// **Warning**: This permanently deletes all jobs.
    pub async fn clear(&self) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        let consumers: Vec<String> = conn.zrange(&self.consumers_key, 0, -1).await?;

        let mut pipe = redis::pipe();
        for consumer in &consumers {
            pipe.del(processing_key(&self.queue_key, consumer)).ignore();
        }
        pipe.del(&self.processing_key)
            .ignore()
            .del(&self.consumers_key)
            .ignore()
            .del(&self.queue_key)
            .ignore()
            .del(&self.delayed_key)
            .ignore()
            .del(&self.dead_letter_key)
            .ignore();

        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    /// Returns queue statistics. `processing_jobs` spans every consumer.
    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        let mut conn = self.redis.clone();
        let consumers: Vec<String> = conn.zrange(&self.consumers_key, 0, -1).await?;

        let mut pipe = redis::pipe();
        pipe.llen(&self.queue_key)
            .zcard(&self.delayed_key)
            .llen(&self.dead_letter_key);
        let (pending, delayed, dead_letter): (usize, usize, usize) =
            pipe.query_async(&mut conn).await?;

        let mut processing = 0;
        if !consumers.is_empty() {
            let mut pipe = redis::pipe();
            for consumer in &consumers {
                pipe.llen(processing_key(&self.queue_key, consumer));
            }
            let lengths: Vec<usize> = pipe.query_async(&mut conn).await?;
            processing = lengths.iter().sum();
        }

        Ok(QueueStats {
            queue_name: self.name.to_string(),
            pending_jobs: pending,
            processing_jobs: processing,
            delayed_jobs: delayed,
            dead_letter_jobs: dead_letter,
        })
    }

    /// Peeks at dead-letter entries without removing them, newest first.
    pub async fn peek_dead_letter(
        &self,
        limit: usize,
    ) -> Result<Vec<serde_json::Value>, QueueError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut conn = self.redis.clone();
        let data: Vec<String> = conn
            .lrange(&self.dead_letter_key, 0, limit as isize - 1)
            .await?;

        let entries = data
            .iter()
            .map(|s| serde_json::from_str(s))
            .collect::<Result<Vec<serde_json::Value>, _>>()?;
        Ok(entries)
    }
}

/// Statistics about queue state.
#[derive(Debug, Clone, serde::Serialize)]
pub struct QueueStats {
    pub queue_name: String,
    /// Jobs waiting to be processed.
    pub pending_jobs: usize,
    /// Jobs handed to a worker and not yet settled.
    pub processing_jobs: usize,
    /// Jobs waiting out a retry backoff.
    pub delayed_jobs: usize,
    pub dead_letter_jobs: usize,
}

impl QueueStats {
    /// Returns the total number of jobs across all lists.
    pub fn total_jobs(&self) -> usize {
        self.pending_jobs + self.processing_jobs + self.delayed_jobs + self.dead_letter_jobs
    }
}
