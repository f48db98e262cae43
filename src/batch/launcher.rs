//! Fan-out side of a batch: size it, then enqueue one task per row.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use super::progress::{ProgressError, ProgressSnapshot, ProgressTracker};
use super::types::{Batch, DocumentRunTask, EvaluationRef, Parameters};
use crate::notifications::{Notifier, WorkspaceEvent};
use crate::scheduler::dispatcher::QueueDispatcher;
use crate::scheduler::job::{JobPayload, QueueName};
use crate::scheduler::queue::QueueError;

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("Batch has no rows")]
    EmptyBatch,

    #[error("Batch '{batch_id}' was already dispatched ({enqueued} tasks enqueued)")]
    AlreadyDispatched { batch_id: String, enqueued: u64 },

    #[error(transparent)]
    Progress(#[from] ProgressError),

    #[error(transparent)]
    Dispatch(#[from] QueueError),
}

/// A document to run over a set of parameter rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRequest {
    /// Generated when absent.
    #[serde(default)]
    pub batch_id: Option<String>,
    pub workspace_id: i64,
    pub project_id: i64,
    pub document_uuid: Uuid,
    pub commit_uuid: Uuid,
    #[serde(flatten)]
    pub evaluation: Option<EvaluationRef>,
    #[serde(default)]
    pub experiment_uuid: Option<Uuid>,
    #[serde(default)]
    pub rows: Vec<Parameters>,
}

/// What a launch produced.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchReport {
    pub batch_id: String,
    pub job_ids: Vec<Uuid>,
    pub progress: ProgressSnapshot,
}

pub struct BatchLauncher {
    progress: Arc<dyn ProgressTracker>,
    dispatcher: Arc<dyn QueueDispatcher>,
    notifier: Notifier,
}

impl BatchLauncher {
    pub fn new(
        progress: Arc<dyn ProgressTracker>,
        dispatcher: Arc<dyn QueueDispatcher>,
        notifier: Notifier,
    ) -> Self {
        Self {
            progress,
            dispatcher,
            notifier,
        }
    }

    /// Declares `total = rows.len()` and enqueues every row on the default
    /// queue, counting each in `enqueued`.
    ///
    /// The batch id is claimed atomically, so a repeated or concurrent launch
    /// of the same id is refused instead of doubling the work. Each row is
    /// counted before it is enqueued: workers may drain and finalize the
    /// batch before this returns, and nothing is left to count by then.
    pub async fn launch(&self, request: BatchRequest) -> Result<LaunchReport, LaunchError> {
        if request.rows.is_empty() {
            return Err(LaunchError::EmptyBatch);
        }

        let batch_id = request
            .batch_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let total = request.rows.len() as u64;

        let mut progress = match self.progress.claim(&batch_id, total).await {
            Ok(snapshot) => snapshot,
            Err(ProgressError::AlreadyClaimed { snapshot, .. }) => {
                return Err(LaunchError::AlreadyDispatched {
                    batch_id,
                    enqueued: snapshot.enqueued,
                })
            }
            Err(e) => return Err(e.into()),
        };

        let mut job_ids = Vec::with_capacity(request.rows.len());
        for parameters in request.rows {
            let task = DocumentRunTask {
                workspace_id: request.workspace_id,
                document_uuid: request.document_uuid,
                commit_uuid: request.commit_uuid,
                project_id: request.project_id,
                parameters,
                evaluation: request.evaluation.clone(),
                batch_id: batch_id.clone(),
                experiment_uuid: request.experiment_uuid,
            };

            progress = self.progress.increment_enqueued(&batch_id).await?;
            let job_id = self
                .dispatcher
                .enqueue(QueueName::Default, JobPayload::DocumentRunTask(task))
                .await?;
            job_ids.push(job_id);
        }

        // Fast workers may have drained and finalized the batch already. The
        // launch still succeeded; the finalizer published the last status.
        match self.progress.get_progress(&batch_id).await? {
            Some(current) => {
                progress = current;
                let batch = Batch {
                    batch_id: batch_id.clone(),
                    workspace_id: request.workspace_id,
                    document_uuid: request.document_uuid,
                    evaluation: request.evaluation,
                };
                self.notifier
                    .notify(
                        request.workspace_id,
                        WorkspaceEvent::batch_status(&batch, progress),
                    )
                    .await;
            }
            None => debug!(batch_id = %batch_id, "Batch finished before launch returned"),
        }

        info!(batch_id = %batch_id, total = total, "Batch dispatched");

        Ok(LaunchReport {
            batch_id,
            job_ids,
            progress,
        })
    }
}
