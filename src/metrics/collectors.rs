//! Convenience wrapper over the raw Prometheus metrics.
//!
//! Every method is a no-op until `init_metrics()` has run, so library code can
//! record unconditionally and tests need no setup.

use super::prometheus::{
    ACTIVE_WORKERS, JOBS_IN_PROGRESS, JOBS_TOTAL, NOTIFICATIONS_TOTAL, QUEUE_DEPTH, TASKS_TOTAL,
    TASK_DURATION,
};

/// Metrics collector for batch processing.
///
/// # Example
///
/// ```ignore
/// use batchrun::metrics::{MetricsCollector, init_metrics};
///
/// init_metrics().expect("Failed to init metrics");
/// let collector = MetricsCollector::new();
///
/// collector.record_task("completed", "none", 3.2);
/// collector.record_job("default", "succeeded");
/// ```
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record a processed document run task.
    ///
    /// # Arguments
    ///
    /// * `outcome` - `completed`, `absorbed` or `escalated`
    /// * `classification` - failure classification, or `none` on success
    /// * `duration_secs` - wall time spent on the task
    pub fn record_task(&self, outcome: &str, classification: &str, duration_secs: f64) {
        if let Some(tasks_total) = TASKS_TOTAL.get() {
            tasks_total
                .with_label_values(&[outcome, classification])
                .inc();
        }

        if let Some(task_duration) = TASK_DURATION.get() {
            task_duration
                .with_label_values(&[outcome])
                .observe(duration_secs);
        }

        tracing::trace!(
            outcome = outcome,
            classification = classification,
            duration_secs = duration_secs,
            "Recorded task metric"
        );
    }

    /// Record a job leaving a worker (`succeeded`, `retried`, `dead_lettered`).
    pub fn record_job(&self, queue: &str, status: &str) {
        if let Some(jobs_total) = JOBS_TOTAL.get() {
            jobs_total.with_label_values(&[queue, status]).inc();
        }

        tracing::trace!(queue = queue, status = status, "Recorded job metric");
    }

    /// Record a workspace notification attempt.
    pub fn record_notification(&self, event: &str, success: bool) {
        let status = if success { "published" } else { "dropped" };

        if let Some(notifications) = NOTIFICATIONS_TOTAL.get() {
            notifications.with_label_values(&[event, status]).inc();
        }
    }

    /// Update the queue depth for a specific queue.
    pub fn update_queue_depth(&self, queue_name: &str, depth: usize) {
        if let Some(queue_depth) = QUEUE_DEPTH.get() {
            queue_depth
                .with_label_values(&[queue_name])
                .set(depth as f64);
        }

        tracing::trace!(
            queue_name = queue_name,
            depth = depth,
            "Updated queue depth metric"
        );
    }

    /// Update the count of active workers.
    pub fn update_workers(&self, count: usize) {
        if let Some(active_workers) = ACTIVE_WORKERS.get() {
            active_workers.set(count as f64);
        }

        tracing::trace!(count = count, "Updated active workers metric");
    }

    pub fn inc_jobs_in_progress(&self) {
        if let Some(jobs_in_progress) = JOBS_IN_PROGRESS.get() {
            jobs_in_progress.inc();
        }
    }

    pub fn dec_jobs_in_progress(&self) {
        if let Some(jobs_in_progress) = JOBS_IN_PROGRESS.get() {
            jobs_in_progress.dec();
        }
    }
}
