//! Failure classification.
//!
//! Decides whether a task failure is absorbed into the batch (`Recoverable`)
//! or escalated to the queue (`RateLimit`, `Fatal`).

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TaskError;

/// What a failure means for the task that raised it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClassification {
    /// Provider throttling. The queue should retry the task with backoff.
    RateLimit,
    /// Caller or configuration error: the document, commit or payload
    /// cannot be run. Surfaced to the queue's failure tracking.
    Fatal,
    /// Row-level failure, including unrecognized errors raised while running
    /// the row. Counted as an error; the batch continues.
    Recoverable,
}

impl ErrorClassification {
    /// Whether the failure leaves the orchestrator instead of being counted.
    pub fn escalates(&self) -> bool {
        !matches!(self, ErrorClassification::Recoverable)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClassification::RateLimit => "rate_limit",
            ErrorClassification::Fatal => "fatal",
            ErrorClassification::Recoverable => "recoverable",
        }
    }
}

impl fmt::Display for ErrorClassification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maps a task failure to its classification.
///
/// Only the rate limit code and failures that say the task itself cannot be
/// run escalate. Everything else, generic errors included, is a row-level
/// failure.
pub fn classify(failure: &TaskError) -> ErrorClassification {
    match failure {
        TaskError::Run(run_error) if run_error.is_rate_limit() => ErrorClassification::RateLimit,
        TaskError::DocumentNotFound { .. }
        | TaskError::CommitNotFound(_)
        | TaskError::PermissionDenied { .. }
        | TaskError::InvalidPayload(_) => ErrorClassification::Fatal,
        TaskError::Run(_)
        | TaskError::Dispatch(_)
        | TaskError::Progress(_)
        | TaskError::Unexpected(_) => ErrorClassification::Recoverable,
    }
}
