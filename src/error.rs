//! Error types for batch document runs.
//!
//! Two layers are defined here:
//! - `RunError`: a structured failure produced by a document run itself,
//!   tagged with a `RunErrorCode` (rate limit, malformed output, ...)
//! - `TaskError`: anything that can go wrong while a worker processes a task,
//!   including unresolved documents and infrastructure failures
//!
//! The split matters for control flow: the classifier in
//! `crate::batch::classifier` decides from these types whether a failure is
//! absorbed into the batch counters or escalated to the queue.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::batch::progress::ProgressError;
use crate::scheduler::queue::QueueError;

/// Structured codes attached to run failures.
///
/// Unrecognized wire codes decode as `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunErrorCode {
    Unknown,
    DocumentConfig,
    MissingProvider,
    ChainCompile,
    AiProviderConfig,
    AiRun,
    RateLimit,
    InvalidResponseFormat,
    ContextLengthExceeded,
    MaxStepCountExceeded,
    ToolExecution,
    UnsupportedProviderResponse,
}

impl RunErrorCode {
    /// Every code, in declaration order.
    pub const ALL: [RunErrorCode; 12] = [
        RunErrorCode::Unknown,
        RunErrorCode::DocumentConfig,
        RunErrorCode::MissingProvider,
        RunErrorCode::ChainCompile,
        RunErrorCode::AiProviderConfig,
        RunErrorCode::AiRun,
        RunErrorCode::RateLimit,
        RunErrorCode::InvalidResponseFormat,
        RunErrorCode::ContextLengthExceeded,
        RunErrorCode::MaxStepCountExceeded,
        RunErrorCode::ToolExecution,
        RunErrorCode::UnsupportedProviderResponse,
    ];

    /// Wire name of the code.
    pub fn as_str(&self) -> &'static str {
        match self {
            RunErrorCode::Unknown => "unknown_error",
            RunErrorCode::DocumentConfig => "document_config_error",
            RunErrorCode::MissingProvider => "missing_provider_error",
            RunErrorCode::ChainCompile => "chain_compile_error",
            RunErrorCode::AiProviderConfig => "ai_provider_config_error",
            RunErrorCode::AiRun => "ai_run_error",
            RunErrorCode::RateLimit => "rate_limit_error",
            RunErrorCode::InvalidResponseFormat => "invalid_response_format_error",
            RunErrorCode::ContextLengthExceeded => "context_length_exceeded_error",
            RunErrorCode::MaxStepCountExceeded => "max_step_count_exceeded_error",
            RunErrorCode::ToolExecution => "tool_execution_error",
            RunErrorCode::UnsupportedProviderResponse => "unsupported_provider_response_error",
        }
    }

    /// Parses a wire name, falling back to `Unknown`.
    pub fn from_wire(name: &str) -> Self {
        Self::ALL
            .into_iter()
            .find(|code| code.as_str() == name)
            .unwrap_or(RunErrorCode::Unknown)
    }
}

impl Serialize for RunErrorCode {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for RunErrorCode {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(Self::from_wire(&name))
    }
}

impl fmt::Display for RunErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure raised by a document run, carrying its run-error code.
///
/// Displays as the bare message so an escalated failure reaches the queue
/// with the text the run produced.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct RunError {
    pub code: RunErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl RunError {
    pub fn new(code: RunErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(RunErrorCode::RateLimit, message)
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn is_rate_limit(&self) -> bool {
        self.code == RunErrorCode::RateLimit
    }
}

/// Errors raised while a worker processes a queued task.
#[derive(Debug, Error)]
pub enum TaskError {
    /// The run itself failed with a structured code.
    #[error(transparent)]
    Run(#[from] RunError),

    #[error("Document {document_uuid} not found at commit {commit_uuid}")]
    DocumentNotFound {
        document_uuid: Uuid,
        commit_uuid: Uuid,
    },

    #[error("Commit {0} not found")]
    CommitNotFound(Uuid),

    #[error("Permission denied in workspace {workspace_id}: {reason}")]
    PermissionDenied { workspace_id: i64, reason: String },

    #[error("Invalid task payload: {0}")]
    InvalidPayload(String),

    #[error("Failed to dispatch job: {0}")]
    Dispatch(#[from] QueueError),

    #[error("Progress tracking failed: {0}")]
    Progress(#[from] ProgressError),

    #[error("Unexpected failure: {0}")]
    Unexpected(#[from] anyhow::Error),
}

impl TaskError {
    /// Returns the structured run error, if this is one.
    pub fn as_run_error(&self) -> Option<&RunError> {
        match self {
            TaskError::Run(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_error_displays_message_only() {
        let err = RunError::rate_limited("Rate limit error");
        assert_eq!(err.to_string(), "Rate limit error");

        let task_err = TaskError::from(err);
        assert_eq!(task_err.to_string(), "Rate limit error");
    }

    #[test]
    fn test_run_error_code_wire_names() {
        for code in RunErrorCode::ALL {
            let json = serde_json::to_value(code).expect("code should serialize");
            assert_eq!(json, serde_json::Value::String(code.as_str().to_string()));

            let back: RunErrorCode = serde_json::from_value(json).expect("code should parse");
            assert_eq!(back, code);
        }
    }

    #[test]
    fn test_unrecognized_code_decodes_as_unknown() {
        let code: RunErrorCode =
            serde_json::from_str("\"brand_new_error\"").expect("should fall back");
        assert_eq!(code, RunErrorCode::Unknown);
    }

    #[test]
    fn test_run_error_roundtrip_with_details() {
        let err = RunError::new(RunErrorCode::ToolExecution, "tool blew up")
            .with_details(serde_json::json!({"tool": "search"}));
        let json = serde_json::to_string(&err).expect("should serialize");
        assert!(json.contains("tool_execution_error"));

        let parsed: RunError = serde_json::from_str(&json).expect("should parse");
        assert_eq!(parsed, err);
    }

    #[test]
    fn test_task_error_display() {
        let doc = Uuid::new_v4();
        let commit = Uuid::new_v4();
        let err = TaskError::DocumentNotFound {
            document_uuid: doc,
            commit_uuid: commit,
        };
        assert!(err.to_string().contains(&doc.to_string()));
        assert!(err.as_run_error().is_none());

        let err = TaskError::InvalidPayload("missing batchId".to_string());
        assert!(err.to_string().contains("missing batchId"));

        let err = TaskError::Unexpected(anyhow::anyhow!("boom"));
        assert!(err.to_string().contains("boom"));
    }
}
