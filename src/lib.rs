//! batchrun: batch document-run orchestration.
//!
//! A batch runs one document over many parameter rows. Rows are enqueued as
//! tasks on Redis-backed queues, worker pools run them, and each batch's
//! progress is kept in shared counters that are pushed to workspace
//! subscribers as it changes.

// Core modules
pub mod batch;
pub mod cli;
pub mod config;
pub mod error;
pub mod gateway;
pub mod metrics;
pub mod notifications;
pub mod scheduler;

// Re-export commonly used error types
pub use config::ConfigError;
pub use error::{RunError, RunErrorCode, TaskError};
