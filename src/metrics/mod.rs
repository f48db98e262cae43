//! Prometheus metrics for workers and batch processing.
//!
//! # Example
//!
//! ```ignore
//! use batchrun::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//!
//! let collector = MetricsCollector::new();
//! collector.record_task("absorbed", "recoverable", 1.5);
//!
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics, metrics_handler};

pub use prometheus::{
    ACTIVE_WORKERS, JOBS_IN_PROGRESS, JOBS_TOTAL, NOTIFICATIONS_TOTAL, QUEUE_DEPTH, REGISTRY,
    TASKS_TOTAL, TASK_DURATION,
};
