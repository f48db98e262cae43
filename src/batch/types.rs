//! Payload types shared by the batch components.
//!
//! These are the shapes that travel through the queues. Field names are
//! camelCase on the wire so jobs written by other services decode unchanged.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Row parameters for one document run, keyed by parameter name.
pub type Parameters = BTreeMap<String, serde_json::Value>;

/// Which evaluation a batch feeds.
///
/// Flattened into task payloads: `{"evaluationId": 7}` for v1,
/// `{"evaluationUuid": "...", "commitId": 3}` for v2.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EvaluationRef {
    #[serde(rename_all = "camelCase")]
    V1 { evaluation_id: i64 },
    #[serde(rename_all = "camelCase")]
    V2 { evaluation_uuid: Uuid, commit_id: i64 },
}

impl EvaluationRef {
    pub fn version(&self) -> &'static str {
        match self {
            EvaluationRef::V1 { .. } => "v1",
            EvaluationRef::V2 { .. } => "v2",
        }
    }
}

/// One fan-out round of document runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Batch {
    pub batch_id: String,
    pub workspace_id: i64,
    pub document_uuid: Uuid,
    #[serde(flatten)]
    pub evaluation: Option<EvaluationRef>,
}

/// A single row of a batch: run `document_uuid` at `commit_uuid` with
/// `parameters`.
///
/// Redelivery keeps the same payload, so processing must not count a task
/// twice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentRunTask {
    pub workspace_id: i64,
    pub document_uuid: Uuid,
    pub commit_uuid: Uuid,
    pub project_id: i64,
    #[serde(default)]
    pub parameters: Parameters,
    #[serde(flatten)]
    pub evaluation: Option<EvaluationRef>,
    pub batch_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experiment_uuid: Option<Uuid>,
}

impl DocumentRunTask {
    pub fn batch(&self) -> Batch {
        Batch {
            batch_id: self.batch_id.clone(),
            workspace_id: self.workspace_id,
            document_uuid: self.document_uuid,
            evaluation: self.evaluation.clone(),
        }
    }
}

/// Downstream job asking the evaluations queue to judge one run log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunEvaluationJob {
    pub workspace_id: i64,
    pub document_uuid: Uuid,
    pub provider_log_uuid: Uuid,
    #[serde(flatten)]
    pub evaluation: EvaluationRef,
    pub batch_id: String,
}

/// Emitted once, by the task whose increment finishes a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchDrained {
    #[serde(flatten)]
    pub batch: Batch,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experiment_uuid: Option<Uuid>,
    pub progress: crate::batch::progress::ProgressSnapshot,
}

/// An experiment groups the batches launched for one comparison run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Experiment {
    pub id: i64,
    pub uuid: Uuid,
    pub workspace_id: i64,
    pub name: String,
    #[serde(default)]
    pub finished_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl Experiment {
    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }
}
