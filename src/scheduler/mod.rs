//! Queues and workers.
//!
//! - **JobQueue**: Redis queue with reliable dequeue (BRPOPLPUSH), a delayed
//!   set for backoff retries and a dead-letter list
//! - **QueueDispatcher**: enqueues typed payloads onto the logical queues
//! - **WorkerPool**: workers that pull jobs and hand them to a `JobHandler`
//! - **JobRouter**: the handler that sends each job kind to its component
//!
//! # Architecture
//!
//! ```text
//!   launcher ──► default ─────► worker ──► orchestrator ──┬──► evaluations
//!                                                         └──► events
//!   evaluations ──► worker ──► evaluation handler
//!   events      ──► worker ──► finalizer
//! ```
//!
//! # Reliability Features
//!
//! - **Atomic dequeue**: jobs move to a processing list as they are taken
//! - **Crash recovery**: processing lists are requeued when a pool starts
//! - **Backoff**: retried jobs wait in a delayed set until due
//! - **Dead letter queue**: exhausted or fatal jobs are kept for inspection
//! - **Graceful shutdown**: workers finish their current job before stopping

pub mod dispatcher;
pub mod job;
pub mod queue;
pub mod router;
pub mod worker_pool;

pub use dispatcher::{MemoryDispatcher, QueueDispatcher, RedisDispatcher};
pub use job::{BackoffPolicy, Job, JobPayload, JobStatus, QueueName};
pub use queue::{processing_key, queue_key, Delivery, JobQueue, QueueError, QueueStats};
pub use router::{EvaluationHandler, JobFailure, JobHandler, JobRouter};
pub use worker_pool::{
    failure_action, FailureAction, PoolError, PoolStats, Worker, WorkerPool, WorkerPoolConfig,
};
