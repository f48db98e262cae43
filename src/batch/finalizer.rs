//! Handles `batchDrained` jobs from the events queue.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};
use uuid::Uuid;

use super::progress::ProgressTracker;
use super::types::{BatchDrained, Experiment};
use crate::error::TaskError;
use crate::notifications::{Notifier, WorkspaceEvent};

/// Marks experiments as finished.
#[async_trait]
pub trait ExperimentStore: Send + Sync {
    /// Sets `finished_at` and returns the updated experiment.
    ///
    /// Fails if no experiment was updated.
    async fn complete(&self, workspace_id: i64, experiment_uuid: Uuid) -> anyhow::Result<Experiment>;
}

pub struct BatchFinalizer {
    progress: Arc<dyn ProgressTracker>,
    experiments: Option<Arc<dyn ExperimentStore>>,
    notifier: Notifier,
    cleanup_on_drain: bool,
}

impl BatchFinalizer {
    pub fn new(progress: Arc<dyn ProgressTracker>, notifier: Notifier) -> Self {
        Self {
            progress,
            experiments: None,
            notifier,
            cleanup_on_drain: true,
        }
    }

    pub fn with_experiments(mut self, experiments: Arc<dyn ExperimentStore>) -> Self {
        self.experiments = Some(experiments);
        self
    }

    /// Keep counters readable after the batch drains (they still expire).
    pub fn with_cleanup_on_drain(mut self, cleanup: bool) -> Self {
        self.cleanup_on_drain = cleanup;
        self
    }

    /// Completes the batch's experiment, if any, then releases its counters.
    ///
    /// Both steps are idempotent, so a redelivered job is harmless.
    pub async fn finalize(&self, drained: &BatchDrained) -> Result<(), TaskError> {
        let batch = &drained.batch;

        if let Some(experiment_uuid) = drained.experiment_uuid {
            match &self.experiments {
                Some(store) => {
                    let experiment = store
                        .complete(batch.workspace_id, experiment_uuid)
                        .await
                        .map_err(|e| {
                            TaskError::Unexpected(e.context(format!(
                                "Failed to complete experiment {}",
                                experiment_uuid
                            )))
                        })?;
                    info!(
                        batch_id = %batch.batch_id,
                        experiment_uuid = %experiment_uuid,
                        "Experiment finished"
                    );
                    self.notifier
                        .notify(batch.workspace_id, WorkspaceEvent::experiment_status(experiment))
                        .await;
                }
                None => warn!(
                    batch_id = %batch.batch_id,
                    experiment_uuid = %experiment_uuid,
                    "No experiment store configured, leaving experiment open"
                ),
            }
        }

        if self.cleanup_on_drain {
            self.progress.cleanup(&batch.batch_id).await?;
        }

        info!(
            batch_id = %batch.batch_id,
            completed = drained.progress.completed,
            errors = drained.progress.errors,
            "Batch finalized"
        );
        Ok(())
    }
}
