//! Batch document runs.
//!
//! A batch runs one document against many parameter rows. The launcher sizes
//! the batch and enqueues one [`DocumentRunTask`] per row; workers hand each
//! task to the [`BatchOrchestrator`], which runs it, classifies any failure
//! and keeps the batch's shared counters. The task that drains the batch
//! enqueues a [`BatchDrained`] job, handled by the [`BatchFinalizer`].
//!
//! # Failure handling
//!
//! | Classification | Orchestrator | Counters |
//! |---|---|---|
//! | `Recoverable` | absorbs, task acknowledged | `errors += 1` |
//! | `RateLimit` | returns the error to the queue | untouched |
//! | `Fatal` | returns the error to the queue | untouched |
//!
//! `Fatal` is reserved for tasks that cannot be run at all: an unknown
//! document or commit, a denied workspace, an invalid payload. Any other
//! error raised while running a row is `Recoverable`.

pub mod classifier;
pub mod executor;
pub mod finalizer;
pub mod launcher;
pub mod orchestrator;
pub mod progress;
pub mod run_log;
pub mod types;

pub use classifier::{classify, ErrorClassification};
pub use executor::{
    ChainEvent, ChainExecutor, ChainResponse, ChainRun, ChainRunner, Deferred, DeferredError,
    DocumentResolver, DocumentRunExecutor, ExecutionResult, LogSource, Message, ResolvedDocument,
    RunLogOutcome, RunLogRecord, RunLogStore, ToolCall,
};
pub use finalizer::{BatchFinalizer, ExperimentStore};
pub use launcher::{BatchLauncher, BatchRequest, LaunchError, LaunchReport};
pub use orchestrator::{BatchOrchestrator, TaskOutcome};
pub use progress::{
    Counter, MemoryProgressTracker, ProgressError, ProgressSnapshot, ProgressTracker,
    RedisProgressTracker,
};
pub use run_log::RedisRunLogStore;
pub use types::{
    Batch, BatchDrained, DocumentRunTask, EvaluationRef, Experiment, Parameters, RunEvaluationJob,
};
