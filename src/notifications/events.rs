//! Workspace event payloads.
//!
//! Every event kind has a fixed field set. On the wire an event is
//! `{"event": "<kind>", "data": {...}}`, and the published message adds the
//! `workspaceId` it is scoped to.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::batch::progress::ProgressSnapshot;
use crate::batch::types::{Batch, EvaluationRef, Experiment};

/// Progress of a batch that feeds no evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentBatchRunStatus {
    pub document_uuid: Uuid,
    #[serde(flatten)]
    pub progress: ProgressSnapshot,
}

/// Evaluation a status event refers to, tagged with its `version`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "version")]
pub enum EvaluationTarget {
    #[serde(rename = "v1", rename_all = "camelCase")]
    V1 {
        evaluation_id: i64,
        document_uuid: Uuid,
    },
    #[serde(rename = "v2", rename_all = "camelCase")]
    V2 {
        commit_id: i64,
        document_uuid: Uuid,
        evaluation_uuid: Uuid,
    },
}

impl EvaluationTarget {
    pub fn new(evaluation: &EvaluationRef, document_uuid: Uuid) -> Self {
        match *evaluation {
            EvaluationRef::V1 { evaluation_id } => EvaluationTarget::V1 {
                evaluation_id,
                document_uuid,
            },
            EvaluationRef::V2 {
                evaluation_uuid,
                commit_id,
            } => EvaluationTarget::V2 {
                commit_id,
                document_uuid,
                evaluation_uuid,
            },
        }
    }
}

/// Progress of a batch that feeds an evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationStatus {
    pub batch_id: String,
    #[serde(flatten)]
    pub progress: ProgressSnapshot,
    #[serde(flatten)]
    pub target: EvaluationTarget,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentStatus {
    pub experiment: Experiment,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationResultCreated {
    pub workspace_id: i64,
    pub evaluation_id: i64,
    pub document_uuid: Uuid,
    pub evaluation_result_id: i64,
    pub document_log_uuid: Uuid,
    pub row: serde_json::Value,
}

/// Streaming progress of a dataset generation.
///
/// Exactly one of the three shapes is ever sent; the wire form always carries
/// all of `rows`, `error` and `finished`, with the unused ones null.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "DatasetRowsWire", into = "DatasetRowsWire")]
pub enum DatasetRowsCreated {
    Rows {
        dataset_id: i64,
        rows: Vec<serde_json::Value>,
    },
    Failed {
        dataset_id: i64,
        error: String,
    },
    Finished {
        dataset_id: i64,
    },
}

impl DatasetRowsCreated {
    pub fn dataset_id(&self) -> i64 {
        match self {
            DatasetRowsCreated::Rows { dataset_id, .. }
            | DatasetRowsCreated::Failed { dataset_id, .. }
            | DatasetRowsCreated::Finished { dataset_id } => *dataset_id,
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DatasetRowsWire {
    dataset_id: i64,
    #[serde(default)]
    rows: Option<Vec<serde_json::Value>>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    finished: bool,
}

impl From<DatasetRowsCreated> for DatasetRowsWire {
    fn from(event: DatasetRowsCreated) -> Self {
        match event {
            DatasetRowsCreated::Rows { dataset_id, rows } => Self {
                dataset_id,
                rows: Some(rows),
                error: None,
                finished: false,
            },
            DatasetRowsCreated::Failed { dataset_id, error } => Self {
                dataset_id,
                rows: None,
                error: Some(error),
                finished: false,
            },
            DatasetRowsCreated::Finished { dataset_id } => Self {
                dataset_id,
                rows: None,
                error: None,
                finished: true,
            },
        }
    }
}

impl TryFrom<DatasetRowsWire> for DatasetRowsCreated {
    type Error = String;

    fn try_from(wire: DatasetRowsWire) -> Result<Self, Self::Error> {
        let dataset_id = wire.dataset_id;
        match (wire.rows, wire.error, wire.finished) {
            (None, None, true) => Ok(DatasetRowsCreated::Finished { dataset_id }),
            (Some(rows), None, false) => Ok(DatasetRowsCreated::Rows { dataset_id, rows }),
            (None, Some(error), false) => Ok(DatasetRowsCreated::Failed { dataset_id, error }),
            _ => Err(format!(
                "dataset {} event must carry exactly one of rows, error or finished",
                dataset_id
            )),
        }
    }
}

/// A message pushed to a workspace channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum WorkspaceEvent {
    DocumentBatchRunStatus(DocumentBatchRunStatus),
    EvaluationStatus(EvaluationStatus),
    ExperimentStatus(ExperimentStatus),
    EvaluationResultCreated(EvaluationResultCreated),
    DatasetRowsCreated(DatasetRowsCreated),
}

impl WorkspaceEvent {
    /// Progress event for a batch: `evaluationStatus` when the batch feeds an
    /// evaluation, `documentBatchRunStatus` otherwise.
    pub fn batch_status(batch: &Batch, progress: ProgressSnapshot) -> Self {
        match &batch.evaluation {
            Some(evaluation) => WorkspaceEvent::EvaluationStatus(EvaluationStatus {
                batch_id: batch.batch_id.clone(),
                progress,
                target: EvaluationTarget::new(evaluation, batch.document_uuid),
            }),
            None => WorkspaceEvent::DocumentBatchRunStatus(DocumentBatchRunStatus {
                document_uuid: batch.document_uuid,
                progress,
            }),
        }
    }

    pub fn experiment_status(experiment: Experiment) -> Self {
        WorkspaceEvent::ExperimentStatus(ExperimentStatus { experiment })
    }

    /// Wire name of the event kind.
    pub fn name(&self) -> &'static str {
        match self {
            WorkspaceEvent::DocumentBatchRunStatus(_) => "documentBatchRunStatus",
            WorkspaceEvent::EvaluationStatus(_) => "evaluationStatus",
            WorkspaceEvent::ExperimentStatus(_) => "experimentStatus",
            WorkspaceEvent::EvaluationResultCreated(_) => "evaluationResultCreated",
            WorkspaceEvent::DatasetRowsCreated(_) => "datasetRowsCreated",
        }
    }

    /// Counters carried by progress events.
    pub fn progress(&self) -> Option<ProgressSnapshot> {
        match self {
            WorkspaceEvent::DocumentBatchRunStatus(e) => Some(e.progress),
            WorkspaceEvent::EvaluationStatus(e) => Some(e.progress),
            _ => None,
        }
    }
}

/// An event addressed to one workspace.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub workspace_id: i64,
    #[serde(flatten)]
    pub event: WorkspaceEvent,
}
