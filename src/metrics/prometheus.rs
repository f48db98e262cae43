//! Prometheus metrics registration and export.
//!
//! Defines every metric batchrun exposes and the functions that initialize,
//! register and export them.

use prometheus::{
    CounterVec, Encoder, Gauge, GaugeVec, HistogramVec, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all batchrun metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Document run tasks processed, labeled by outcome and failure classification.
pub static TASKS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Task processing duration in seconds, labeled by outcome.
pub static TASK_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Jobs finished by workers, labeled by queue and status.
pub static JOBS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Number of jobs in queue, labeled by queue name.
pub static QUEUE_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

/// Number of jobs currently being processed.
pub static JOBS_IN_PROGRESS: OnceLock<Gauge> = OnceLock::new();

/// Workspace notifications, labeled by event and status.
pub static NOTIFICATIONS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Number of active workers.
pub static ACTIVE_WORKERS: OnceLock<Gauge> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup. Calling it again leaves the first registration in
/// place.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    // Task metrics
    let tasks_total = CounterVec::new(
        Opts::new("batchrun_tasks_total", "Document run tasks processed"),
        &["outcome", "classification"],
    )?;

    let task_duration = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "batchrun_task_duration_seconds",
            "Document run task duration in seconds",
        )
        .buckets(vec![0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]),
        &["outcome"],
    )?;

    // Queue metrics
    let jobs_total = CounterVec::new(
        Opts::new("batchrun_jobs_total", "Jobs finished by workers"),
        &["queue", "status"],
    )?;

    let queue_depth = GaugeVec::new(
        Opts::new("batchrun_queue_depth", "Number of jobs in queue"),
        &["queue_name"],
    )?;

    let jobs_in_progress = Gauge::new(
        "batchrun_jobs_in_progress",
        "Number of jobs currently being processed",
    )?;

    // Notification metrics
    let notifications_total = CounterVec::new(
        Opts::new(
            "batchrun_notifications_total",
            "Workspace notifications published",
        ),
        &["event", "status"],
    )?;

    // Worker metrics
    let active_workers = Gauge::new("batchrun_active_workers", "Number of active workers")?;

    registry.register(Box::new(tasks_total.clone()))?;
    registry.register(Box::new(task_duration.clone()))?;
    registry.register(Box::new(jobs_total.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(jobs_in_progress.clone()))?;
    registry.register(Box::new(notifications_total.clone()))?;
    registry.register(Box::new(active_workers.clone()))?;

    // A failed set means metrics were already initialized.
    let _ = REGISTRY.set(registry);
    let _ = TASKS_TOTAL.set(tasks_total);
    let _ = TASK_DURATION.set(task_duration);
    let _ = JOBS_TOTAL.set(jobs_total);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = JOBS_IN_PROGRESS.set(jobs_in_progress);
    let _ = NOTIFICATIONS_TOTAL.set(notifications_total);
    let _ = ACTIVE_WORKERS.set(active_workers);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns an explanatory comment line instead of failing when the registry
/// is missing or encoding fails.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

/// Handler body for a `/metrics` endpoint.
pub async fn metrics_handler() -> String {
    export_metrics()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics() {
        let result = init_metrics();
        assert!(result.is_ok() || REGISTRY.get().is_some());
    }

    #[test]
    fn test_export_metrics_never_empty() {
        let metrics = export_metrics();
        assert!(!metrics.is_empty());
    }

    #[test]
    fn test_metrics_after_init() {
        let _ = init_metrics();

        if let Some(tasks) = TASKS_TOTAL.get() {
            tasks.with_label_values(&["completed", "none"]).inc();
        }

        let metrics = export_metrics();
        assert!(!metrics.starts_with("# Error"));
        if REGISTRY.get().is_some() {
            assert!(metrics.contains("batchrun_tasks_total"));
        }
    }
}
