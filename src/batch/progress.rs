//! Per-batch progress counters.
//!
//! Every batch owns four counters: `total`, `completed`, `errors` and
//! `enqueued`. Workers on different machines bump them concurrently, so the
//! production store is Redis and every mutation runs server-side as a Lua
//! script. Callers never read a counter, add to it and write it back.
//!
//! Invariants kept by both stores:
//! - `completed + errors <= total`
//! - `enqueued <= total`
//!
//! An increment that would break an invariant is refused with
//! [`ProgressError::Saturated`] and leaves the counters untouched.
//!
//! Queues deliver at least once, so a task can be run again after it was
//! already counted. Increments made on behalf of a task carry its id, and a
//! task id moves the `completed`/`errors` counters at most once per batch.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Errors returned by progress stores.
#[derive(Debug, Error)]
pub enum ProgressError {
    /// The batch was already sized with a different total.
    #[error("Batch '{batch_id}' already initialized with total {existing}, refusing total {requested}")]
    TotalMismatch {
        batch_id: String,
        existing: u64,
        requested: u64,
    },

    /// No counters exist for the batch (never initialized, or cleaned up).
    #[error("Batch '{0}' has no progress counters")]
    UnknownBatch(String),

    /// The batch was already created by an earlier claim.
    #[error("Batch '{batch_id}' already exists ({snapshot})")]
    AlreadyClaimed {
        batch_id: String,
        snapshot: ProgressSnapshot,
    },

    /// The task already moved a counter of this batch.
    #[error("Task {task_id} was already counted in batch '{batch_id}'")]
    AlreadyCounted {
        batch_id: String,
        task_id: Uuid,
        snapshot: ProgressSnapshot,
    },

    /// The increment would push the counters past the batch total.
    #[error("Batch '{batch_id}' counters already at total ({snapshot})")]
    Saturated {
        batch_id: String,
        snapshot: ProgressSnapshot,
    },

    #[error("Redis connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Redis operation failed: {0}")]
    RedisError(#[from] redis::RedisError),

    #[error("Malformed progress reply for batch '{batch_id}': {reply:?}")]
    MalformedReply { batch_id: String, reply: Vec<i64> },
}

/// Immutable read of a batch's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub total: u64,
    pub completed: u64,
    pub errors: u64,
    pub enqueued: u64,
}

impl ProgressSnapshot {
    pub fn new(total: u64) -> Self {
        Self {
            total,
            ..Default::default()
        }
    }

    /// Tasks that reached a terminal outcome.
    pub fn processed(&self) -> u64 {
        self.completed + self.errors
    }

    /// Tasks still to be processed.
    pub fn remaining(&self) -> u64 {
        self.total.saturating_sub(self.processed())
    }

    /// Whether every task of the batch reached a terminal outcome.
    pub fn is_drained(&self) -> bool {
        self.processed() == self.total
    }
}

impl std::fmt::Display for ProgressSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "total={} completed={} errors={} enqueued={}",
            self.total, self.completed, self.errors, self.enqueued
        )
    }
}

/// Counter fields that can be incremented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    Completed,
    Errors,
    Enqueued,
}

impl Counter {
    pub fn as_str(&self) -> &'static str {
        match self {
            Counter::Completed => "completed",
            Counter::Errors => "errors",
            Counter::Enqueued => "enqueued",
        }
    }
}

/// Durable per-batch counters shared by every worker.
#[async_trait]
pub trait ProgressTracker: Send + Sync {
    /// Sizes a batch. Re-initializing with the same total is a no-op that
    /// returns the current snapshot.
    async fn initialize(&self, batch_id: &str, total: u64)
        -> Result<ProgressSnapshot, ProgressError>;

    /// Sizes a batch that must not exist yet. Fails with
    /// [`ProgressError::AlreadyClaimed`] when it does, whatever its total.
    async fn claim(&self, batch_id: &str, total: u64) -> Result<ProgressSnapshot, ProgressError>;

    /// Atomically bumps one counter and returns the post-increment snapshot.
    async fn increment(
        &self,
        batch_id: &str,
        counter: Counter,
    ) -> Result<ProgressSnapshot, ProgressError>;

    /// Like [`increment`](Self::increment), but records `task_id` in the
    /// same atomic step. A task that was already counted is refused with
    /// [`ProgressError::AlreadyCounted`].
    async fn increment_for_task(
        &self,
        batch_id: &str,
        task_id: Uuid,
        counter: Counter,
    ) -> Result<ProgressSnapshot, ProgressError>;

    /// Whether `task_id` already moved a counter of the batch.
    async fn is_counted(&self, batch_id: &str, task_id: Uuid) -> Result<bool, ProgressError>;

    /// Reads the counters without mutating them.
    async fn get_progress(&self, batch_id: &str) -> Result<Option<ProgressSnapshot>, ProgressError>;

    /// Releases the batch's counters. Unknown ids are ignored.
    async fn cleanup(&self, batch_id: &str) -> Result<(), ProgressError>;

    async fn increment_completed(&self, batch_id: &str) -> Result<ProgressSnapshot, ProgressError> {
        self.increment(batch_id, Counter::Completed).await
    }

    async fn increment_errors(&self, batch_id: &str) -> Result<ProgressSnapshot, ProgressError> {
        self.increment(batch_id, Counter::Errors).await
    }

    async fn increment_enqueued(&self, batch_id: &str) -> Result<ProgressSnapshot, ProgressError> {
        self.increment(batch_id, Counter::Enqueued).await
    }
}

/// Applies an increment to a snapshot, refusing it if an invariant would
/// break.
fn apply_increment(snapshot: &mut ProgressSnapshot, counter: Counter) -> bool {
    match counter {
        Counter::Enqueued => {
            if snapshot.enqueued >= snapshot.total {
                return false;
            }
            snapshot.enqueued += 1;
        }
        Counter::Completed | Counter::Errors => {
            if snapshot.processed() >= snapshot.total {
                return false;
            }
            if counter == Counter::Completed {
                snapshot.completed += 1;
            } else {
                snapshot.errors += 1;
            }
        }
    }
    true
}

#[derive(Debug, Default)]
struct BatchState {
    snapshot: ProgressSnapshot,
    counted: HashSet<Uuid>,
}

/// In-process progress store.
///
/// Only safe for workers living in one process; use
/// [`RedisProgressTracker`] when the batch spans machines.
#[derive(Debug, Default)]
pub struct MemoryProgressTracker {
    batches: Mutex<HashMap<String, BatchState>>,
}

impl MemoryProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of batches currently tracked.
    pub fn len(&self) -> usize {
        self.batches.lock().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn with_batches<T>(&self, f: impl FnOnce(&mut HashMap<String, BatchState>) -> T) -> T {
        // A poisoned lock only means another worker panicked mid-update of a
        // plain counter struct; the data is still consistent.
        let mut guard = match self.batches.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }
}

fn insert_batch(
    batches: &mut HashMap<String, BatchState>,
    batch_id: &str,
    total: u64,
) -> ProgressSnapshot {
    let snapshot = ProgressSnapshot::new(total);
    batches.insert(
        batch_id.to_string(),
        BatchState {
            snapshot,
            counted: HashSet::new(),
        },
    );
    snapshot
}

fn bump(
    batch_id: &str,
    state: &mut BatchState,
    counter: Counter,
) -> Result<ProgressSnapshot, ProgressError> {
    if apply_increment(&mut state.snapshot, counter) {
        Ok(state.snapshot)
    } else {
        Err(ProgressError::Saturated {
            batch_id: batch_id.to_string(),
            snapshot: state.snapshot,
        })
    }
}

#[async_trait]
impl ProgressTracker for MemoryProgressTracker {
    async fn initialize(
        &self,
        batch_id: &str,
        total: u64,
    ) -> Result<ProgressSnapshot, ProgressError> {
        self.with_batches(|batches| match batches.get(batch_id) {
            Some(existing) if existing.snapshot.total == total => Ok(existing.snapshot),
            Some(existing) => Err(ProgressError::TotalMismatch {
                batch_id: batch_id.to_string(),
                existing: existing.snapshot.total,
                requested: total,
            }),
            None => Ok(insert_batch(batches, batch_id, total)),
        })
    }

    async fn claim(&self, batch_id: &str, total: u64) -> Result<ProgressSnapshot, ProgressError> {
        self.with_batches(|batches| match batches.get(batch_id) {
            Some(existing) => Err(ProgressError::AlreadyClaimed {
                batch_id: batch_id.to_string(),
                snapshot: existing.snapshot,
            }),
            None => Ok(insert_batch(batches, batch_id, total)),
        })
    }

    async fn increment(
        &self,
        batch_id: &str,
        counter: Counter,
    ) -> Result<ProgressSnapshot, ProgressError> {
        self.with_batches(|batches| {
            let state = batches
                .get_mut(batch_id)
                .ok_or_else(|| ProgressError::UnknownBatch(batch_id.to_string()))?;
            bump(batch_id, state, counter)
        })
    }

    async fn increment_for_task(
        &self,
        batch_id: &str,
        task_id: Uuid,
        counter: Counter,
    ) -> Result<ProgressSnapshot, ProgressError> {
        self.with_batches(|batches| {
            let state = batches
                .get_mut(batch_id)
                .ok_or_else(|| ProgressError::UnknownBatch(batch_id.to_string()))?;

            if state.counted.contains(&task_id) {
                return Err(ProgressError::AlreadyCounted {
                    batch_id: batch_id.to_string(),
                    task_id,
                    snapshot: state.snapshot,
                });
            }

            let snapshot = bump(batch_id, state, counter)?;
            state.counted.insert(task_id);
            Ok(snapshot)
        })
    }

    async fn is_counted(&self, batch_id: &str, task_id: Uuid) -> Result<bool, ProgressError> {
        Ok(self.with_batches(|batches| {
            batches
                .get(batch_id)
                .is_some_and(|state| state.counted.contains(&task_id))
        }))
    }

    async fn get_progress(&self, batch_id: &str) -> Result<Option<ProgressSnapshot>, ProgressError> {
        Ok(self.with_batches(|batches| batches.get(batch_id).map(|state| state.snapshot)))
    }

    async fn cleanup(&self, batch_id: &str) -> Result<(), ProgressError> {
        self.with_batches(|batches| batches.remove(batch_id));
        Ok(())
    }
}

/// Creates the hash unless it exists.
///
/// `ARGV[3]` is `1` for a claim, which refuses any existing hash.
///
/// Reply: `{status, total, completed, errors, enqueued}` with status 0 for
/// success and 1 for a total mismatch or an existing claimed batch.
const INITIALIZE_SCRIPT: &str = r#"
local existing = redis.call('HMGET', KEYS[1], 'total', 'completed', 'errors', 'enqueued')
if existing[1] then
  local status = 0
  if ARGV[3] == '1' or tonumber(existing[1]) ~= tonumber(ARGV[1]) then status = 1 end
  return {status, tonumber(existing[1]), tonumber(existing[2]), tonumber(existing[3]), tonumber(existing[4])}
end
redis.call('HSET', KEYS[1], 'total', ARGV[1], 'completed', 0, 'errors', 0, 'enqueued', 0)
if tonumber(ARGV[2]) > 0 then redis.call('EXPIRE', KEYS[1], ARGV[2]) end
return {0, tonumber(ARGV[1]), 0, 0, 0}
"#;

/// Bumps one counter if the invariants allow it.
///
/// `KEYS[2]` is the set of counted task ids and `ARGV[2]` the task id, or an
/// empty string for an increment not tied to a task. The set shares the
/// hash's expiry.
///
/// Reply: `{status, total, completed, errors, enqueued}` with status 0 for
/// applied, 1 for saturated, 2 for an already counted task and -1 for an
/// unknown batch.
const INCREMENT_SCRIPT: &str = r#"
local h = redis.call('HMGET', KEYS[1], 'total', 'completed', 'errors', 'enqueued')
if not h[1] then return {-1, 0, 0, 0, 0} end
local total = tonumber(h[1])
local completed = tonumber(h[2])
local errors = tonumber(h[3])
local enqueued = tonumber(h[4])
local field = ARGV[1]
local task = ARGV[2]
if task ~= '' and redis.call('SISMEMBER', KEYS[2], task) == 1 then
  return {2, total, completed, errors, enqueued}
end
if field == 'enqueued' then
  if enqueued >= total then return {1, total, completed, errors, enqueued} end
  enqueued = redis.call('HINCRBY', KEYS[1], 'enqueued', 1)
else
  if completed + errors >= total then return {1, total, completed, errors, enqueued} end
  if field == 'completed' then
    completed = redis.call('HINCRBY', KEYS[1], 'completed', 1)
  else
    errors = redis.call('HINCRBY', KEYS[1], 'errors', 1)
  end
end
if task ~= '' then
  redis.call('SADD', KEYS[2], task)
  local ttl = redis.call('PTTL', KEYS[1])
  if ttl > 0 then redis.call('PEXPIRE', KEYS[2], ttl) end
end
return {0, total, completed, errors, enqueued}
"#;

/// Redis-backed progress store shared by every worker process.
///
/// Each batch is a hash at `{prefix}:batch:{batch_id}:progress` plus the
/// set of counted task ids at `{prefix}:batch:{batch_id}:counted`.
pub struct RedisProgressTracker {
    redis: ConnectionManager,
    key_prefix: String,
    /// Expiry applied when a batch is sized; zero disables it.
    ttl: Duration,
    initialize_script: redis::Script,
    increment_script: redis::Script,
}

impl RedisProgressTracker {
    /// Connects to Redis and creates a tracker.
    pub async fn connect(redis_url: &str, key_prefix: &str) -> Result<Self, ProgressError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| ProgressError::ConnectionFailed(e.to_string()))?;

        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| ProgressError::ConnectionFailed(e.to_string()))?;

        Ok(Self::from_connection(redis, key_prefix))
    }

    /// Creates a tracker from an existing connection manager.
    pub fn from_connection(redis: ConnectionManager, key_prefix: &str) -> Self {
        Self {
            redis,
            key_prefix: key_prefix.to_string(),
            ttl: Duration::ZERO,
            initialize_script: redis::Script::new(INITIALIZE_SCRIPT),
            increment_script: redis::Script::new(INCREMENT_SCRIPT),
        }
    }

    /// Sets the expiry applied to newly sized batches.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    fn key(&self, batch_id: &str) -> String {
        progress_key(&self.key_prefix, batch_id)
    }

    fn counted_key(&self, batch_id: &str) -> String {
        counted_key(&self.key_prefix, batch_id)
    }

    async fn create(
        &self,
        batch_id: &str,
        total: u64,
        claim: bool,
    ) -> Result<(i64, ProgressSnapshot), ProgressError> {
        let mut conn = self.redis.clone();
        let reply: Vec<i64> = self
            .initialize_script
            .key(self.key(batch_id))
            .arg(total)
            .arg(self.ttl.as_secs())
            .arg(if claim { "1" } else { "0" })
            .invoke_async(&mut conn)
            .await?;
        parse_reply(batch_id, reply)
    }

    async fn run_increment(
        &self,
        batch_id: &str,
        task_id: Option<Uuid>,
        counter: Counter,
    ) -> Result<ProgressSnapshot, ProgressError> {
        let mut conn = self.redis.clone();
        let reply: Vec<i64> = self
            .increment_script
            .key(self.key(batch_id))
            .key(self.counted_key(batch_id))
            .arg(counter.as_str())
            .arg(task_id.map(|id| id.to_string()).unwrap_or_default())
            .invoke_async(&mut conn)
            .await?;

        match parse_reply(batch_id, reply)? {
            (0, snapshot) => Ok(snapshot),
            (1, snapshot) => Err(ProgressError::Saturated {
                batch_id: batch_id.to_string(),
                snapshot,
            }),
            (2, snapshot) => Err(ProgressError::AlreadyCounted {
                batch_id: batch_id.to_string(),
                task_id: task_id.unwrap_or_default(),
                snapshot,
            }),
            _ => Err(ProgressError::UnknownBatch(batch_id.to_string())),
        }
    }
}

/// Redis key holding a batch's counters.
pub fn progress_key(prefix: &str, batch_id: &str) -> String {
    format!("{}:batch:{}:progress", prefix, batch_id)
}

/// Redis key holding the ids of tasks a batch already counted.
pub fn counted_key(prefix: &str, batch_id: &str) -> String {
    format!("{}:batch:{}:counted", prefix, batch_id)
}

/// Decodes a `{status, total, completed, errors, enqueued}` script reply.
fn parse_reply(batch_id: &str, reply: Vec<i64>) -> Result<(i64, ProgressSnapshot), ProgressError> {
    let malformed = || ProgressError::MalformedReply {
        batch_id: batch_id.to_string(),
        reply: reply.clone(),
    };

    let [status, total, completed, errors, enqueued] = reply[..] else {
        return Err(malformed());
    };

    let counter = |v: i64| u64::try_from(v).map_err(|_| malformed());

    Ok((
        status,
        ProgressSnapshot {
            total: counter(total)?,
            completed: counter(completed)?,
            errors: counter(errors)?,
            enqueued: counter(enqueued)?,
        },
    ))
}

#[async_trait]
impl ProgressTracker for RedisProgressTracker {
    async fn initialize(
        &self,
        batch_id: &str,
        total: u64,
    ) -> Result<ProgressSnapshot, ProgressError> {
        match self.create(batch_id, total, false).await? {
            (0, snapshot) => Ok(snapshot),
            (_, existing) => Err(ProgressError::TotalMismatch {
                batch_id: batch_id.to_string(),
                existing: existing.total,
                requested: total,
            }),
        }
    }

    async fn claim(&self, batch_id: &str, total: u64) -> Result<ProgressSnapshot, ProgressError> {
        match self.create(batch_id, total, true).await? {
            (0, snapshot) => Ok(snapshot),
            (_, snapshot) => Err(ProgressError::AlreadyClaimed {
                batch_id: batch_id.to_string(),
                snapshot,
            }),
        }
    }

    async fn increment(
        &self,
        batch_id: &str,
        counter: Counter,
    ) -> Result<ProgressSnapshot, ProgressError> {
        self.run_increment(batch_id, None, counter).await
    }

    async fn increment_for_task(
        &self,
        batch_id: &str,
        task_id: Uuid,
        counter: Counter,
    ) -> Result<ProgressSnapshot, ProgressError> {
        self.run_increment(batch_id, Some(task_id), counter).await
    }

    async fn is_counted(&self, batch_id: &str, task_id: Uuid) -> Result<bool, ProgressError> {
        let mut conn = self.redis.clone();
        let counted: bool = redis::cmd("SISMEMBER")
            .arg(self.counted_key(batch_id))
            .arg(task_id.to_string())
            .query_async(&mut conn)
            .await?;
        Ok(counted)
    }

    async fn get_progress(&self, batch_id: &str) -> Result<Option<ProgressSnapshot>, ProgressError> {
        let mut conn = self.redis.clone();
        let values: Vec<Option<u64>> = redis::cmd("HMGET")
            .arg(self.key(batch_id))
            .arg("total")
            .arg("completed")
            .arg("errors")
            .arg("enqueued")
            .query_async(&mut conn)
            .await?;

        match values[..] {
            [Some(total), completed, errors, enqueued] => Ok(Some(ProgressSnapshot {
                total,
                completed: completed.unwrap_or(0),
                errors: errors.unwrap_or(0),
                enqueued: enqueued.unwrap_or(0),
            })),
            _ => Ok(None),
        }
    }

    async fn cleanup(&self, batch_id: &str) -> Result<(), ProgressError> {
        let mut conn = self.redis.clone();
        redis::cmd("DEL")
            .arg(self.key(batch_id))
            .arg(self.counted_key(batch_id))
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_initialize_is_idempotent_for_same_total() {
        let tracker = MemoryProgressTracker::new();

        let first = tracker.initialize("b1", 5).await.expect("first init");
        assert_eq!(first, ProgressSnapshot::new(5));

        tracker.increment_completed("b1").await.expect("increment");
        let again = tracker.initialize("b1", 5).await.expect("second init");
        assert_eq!(again.completed, 1, "re-initializing must not reset counters");
    }

    #[tokio::test]
    async fn test_initialize_rejects_different_total() {
        let tracker = MemoryProgressTracker::new();
        tracker.initialize("b1", 5).await.expect("init");

        let err = tracker.initialize("b1", 6).await.unwrap_err();
        assert!(matches!(
            err,
            ProgressError::TotalMismatch {
                existing: 5,
                requested: 6,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_increments_return_post_increment_snapshot() {
        let tracker = MemoryProgressTracker::new();
        tracker.initialize("b1", 3).await.expect("init");

        let s = tracker.increment_enqueued("b1").await.expect("enqueued");
        assert_eq!(s.enqueued, 1);

        let s = tracker.increment_completed("b1").await.expect("completed");
        assert_eq!((s.completed, s.errors), (1, 0));

        let s = tracker.increment_errors("b1").await.expect("errors");
        assert_eq!((s.completed, s.errors), (1, 1));
        assert_eq!(s.remaining(), 1);
        assert!(!s.is_drained());
    }

    #[tokio::test]
    async fn test_increment_refused_past_total() {
        let tracker = MemoryProgressTracker::new();
        tracker.initialize("b1", 1).await.expect("init");

        let s = tracker.increment_errors("b1").await.expect("errors");
        assert!(s.is_drained());

        let err = tracker.increment_completed("b1").await.unwrap_err();
        match err {
            ProgressError::Saturated { snapshot, .. } => {
                assert_eq!(snapshot.completed, 0);
                assert_eq!(snapshot.errors, 1);
            }
            other => panic!("expected saturation, got {other:?}"),
        }

        tracker.increment_enqueued("b1").await.expect("enqueued");
        assert!(matches!(
            tracker.increment_enqueued("b1").await,
            Err(ProgressError::Saturated { .. })
        ));
    }

    #[tokio::test]
    async fn test_task_is_counted_once() {
        let tracker = MemoryProgressTracker::new();
        tracker.initialize("b1", 3).await.expect("init");
        let task_id = Uuid::new_v4();

        assert!(!tracker.is_counted("b1", task_id).await.expect("lookup"));
        let s = tracker
            .increment_for_task("b1", task_id, Counter::Completed)
            .await
            .expect("first count");
        assert_eq!(s.completed, 1);
        assert!(tracker.is_counted("b1", task_id).await.expect("lookup"));

        // A redelivery that failed this time must not count as an error either.
        match tracker.increment_for_task("b1", task_id, Counter::Errors).await {
            Err(ProgressError::AlreadyCounted { snapshot, .. }) => {
                assert_eq!((snapshot.completed, snapshot.errors), (1, 0));
            }
            other => panic!("expected already counted, got {other:?}"),
        }

        let s = tracker
            .increment_for_task("b1", Uuid::new_v4(), Counter::Errors)
            .await
            .expect("another task");
        assert_eq!((s.completed, s.errors), (1, 1));
        assert!(!tracker.is_counted("missing", task_id).await.expect("lookup"));
    }

    #[tokio::test]
    async fn test_refused_increment_does_not_mark_task() {
        let tracker = MemoryProgressTracker::new();
        tracker.initialize("b1", 1).await.expect("init");
        tracker.increment_completed("b1").await.expect("fill");

        let task_id = Uuid::new_v4();
        assert!(matches!(
            tracker.increment_for_task("b1", task_id, Counter::Completed).await,
            Err(ProgressError::Saturated { .. })
        ));
        assert!(!tracker.is_counted("b1", task_id).await.expect("lookup"));
    }

    #[tokio::test]
    async fn test_claim_refuses_existing_batch() {
        let tracker = MemoryProgressTracker::new();

        let s = tracker.claim("b1", 2).await.expect("first claim");
        assert_eq!(s, ProgressSnapshot::new(2));

        assert!(matches!(
            tracker.claim("b1", 2).await,
            Err(ProgressError::AlreadyClaimed { .. })
        ));
        assert!(matches!(
            tracker.claim("b1", 7).await,
            Err(ProgressError::AlreadyClaimed { snapshot, .. }) if snapshot.total == 2
        ));
    }

    #[tokio::test]
    async fn test_cleanup_forgets_counted_tasks() {
        let tracker = MemoryProgressTracker::new();
        tracker.initialize("b1", 1).await.expect("init");
        let task_id = Uuid::new_v4();
        tracker
            .increment_for_task("b1", task_id, Counter::Completed)
            .await
            .expect("count");

        tracker.cleanup("b1").await.expect("cleanup");
        assert!(!tracker.is_counted("b1", task_id).await.expect("lookup"));
    }

    #[tokio::test]
    async fn test_increment_unknown_batch() {
        let tracker = MemoryProgressTracker::new();
        let err = tracker.increment_completed("missing").await.unwrap_err();
        assert!(matches!(err, ProgressError::UnknownBatch(id) if id == "missing"));
    }

    #[tokio::test]
    async fn test_cleanup_is_idempotent() {
        let tracker = MemoryProgressTracker::new();
        tracker.initialize("b1", 2).await.expect("init");

        tracker.cleanup("b1").await.expect("first cleanup");
        tracker.cleanup("b1").await.expect("second cleanup");
        tracker.cleanup("never-seen").await.expect("unknown cleanup");

        assert!(tracker.get_progress("b1").await.expect("read").is_none());
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_increments_are_monotonic_and_bounded() {
        let tracker = Arc::new(MemoryProgressTracker::new());
        tracker.initialize("b1", 40).await.expect("init");

        let mut handles = Vec::new();
        for i in 0..60 {
            let tracker = Arc::clone(&tracker);
            handles.push(tokio::spawn(async move {
                if i % 3 == 0 {
                    tracker.increment_errors("b1").await
                } else {
                    tracker.increment_completed("b1").await
                }
            }));
        }

        let reader = {
            let tracker = Arc::clone(&tracker);
            tokio::spawn(async move {
                let mut last = 0;
                for _ in 0..100 {
                    let s = tracker
                        .get_progress("b1")
                        .await
                        .expect("read")
                        .expect("batch exists");
                    assert!(s.processed() >= last, "progress went backwards");
                    assert!(s.processed() <= s.total);
                    last = s.processed();
                    tokio::task::yield_now().await;
                }
            })
        };

        let mut applied = 0;
        for handle in handles {
            if handle.await.expect("task panicked").is_ok() {
                applied += 1;
            }
        }
        reader.await.expect("reader panicked");

        assert_eq!(applied, 40);
        let final_snapshot = tracker.get_progress("b1").await.expect("read").expect("exists");
        assert!(final_snapshot.is_drained());
    }

    #[test]
    fn test_parse_reply() {
        let (status, snapshot) = parse_reply("b1", vec![0, 5, 3, 2, 5]).expect("valid reply");
        assert_eq!(status, 0);
        assert_eq!(
            snapshot,
            ProgressSnapshot {
                total: 5,
                completed: 3,
                errors: 2,
                enqueued: 5
            }
        );

        assert!(matches!(
            parse_reply("b1", vec![0, 5]),
            Err(ProgressError::MalformedReply { .. })
        ));
        assert!(matches!(
            parse_reply("b1", vec![0, -5, 0, 0, 0]),
            Err(ProgressError::MalformedReply { .. })
        ));
    }

    #[test]
    fn test_progress_key_and_display() {
        assert_eq!(progress_key("batchrun", "abc"), "batchrun:batch:abc:progress");
        assert_eq!(counted_key("batchrun", "abc"), "batchrun:batch:abc:counted");

        let snapshot = ProgressSnapshot {
            total: 5,
            completed: 3,
            errors: 2,
            enqueued: 5,
        };
        assert_eq!(snapshot.to_string(), "total=5 completed=3 errors=2 enqueued=5");
        assert!(snapshot.is_drained());
    }

    /// Requires a running Redis. Run with:
    /// REDIS_URL=redis://localhost:6379 cargo test -- --ignored
    #[tokio::test]
    #[ignore]
    async fn test_redis_tracker_lifecycle() {
        let url = std::env::var("REDIS_URL").expect("REDIS_URL must be set");
        let tracker = RedisProgressTracker::connect(&url, "batchrun-test")
            .await
            .expect("connect")
            .with_ttl(Duration::from_secs(60));
        let batch_id = uuid::Uuid::new_v4().to_string();

        tracker.initialize(&batch_id, 2).await.expect("init");
        assert!(tracker.initialize(&batch_id, 2).await.is_ok());
        assert!(matches!(
            tracker.initialize(&batch_id, 3).await,
            Err(ProgressError::TotalMismatch { .. })
        ));

        tracker.increment_completed(&batch_id).await.expect("completed");
        let s = tracker.increment_errors(&batch_id).await.expect("errors");
        assert!(s.is_drained());
        assert!(matches!(
            tracker.increment_errors(&batch_id).await,
            Err(ProgressError::Saturated { .. })
        ));

        let read = tracker.get_progress(&batch_id).await.expect("read");
        assert_eq!(read, Some(s));

        let other = uuid::Uuid::new_v4().to_string();
        tracker.claim(&other, 2).await.expect("claim");
        assert!(matches!(
            tracker.claim(&other, 2).await,
            Err(ProgressError::AlreadyClaimed { .. })
        ));
        let task_id = Uuid::new_v4();
        tracker
            .increment_for_task(&other, task_id, Counter::Completed)
            .await
            .expect("count");
        assert!(matches!(
            tracker.increment_for_task(&other, task_id, Counter::Completed).await,
            Err(ProgressError::AlreadyCounted { .. })
        ));
        assert!(tracker.is_counted(&other, task_id).await.expect("lookup"));
        tracker.cleanup(&other).await.expect("cleanup");
        assert!(!tracker.is_counted(&other, task_id).await.expect("lookup"));

        tracker.cleanup(&batch_id).await.expect("cleanup");
        tracker.cleanup(&batch_id).await.expect("cleanup twice");
        assert_eq!(tracker.get_progress(&batch_id).await.expect("read"), None);
        assert!(matches!(
            tracker.increment_completed(&batch_id).await,
            Err(ProgressError::UnknownBatch(_))
        ));
    }
}
