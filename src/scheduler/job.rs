//! Job definitions for the scheduler.
//!
//! - `QueueName`: the three logical queues
//! - `JobPayload`: what a job asks a worker to do
//! - `Job`: the envelope stored in Redis, with retry bookkeeping
//! - `BackoffPolicy`: delay before a failed job is retried

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::batch::types::{BatchDrained, DocumentRunTask, RunEvaluationJob};

/// Default maximum number of attempts for a job.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Logical queues, distinguished by purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueName {
    /// Document run tasks and generic background work.
    Default,
    /// Downstream per-result evaluation jobs.
    Evaluations,
    /// Fan-out side effects such as drained-batch handling.
    Events,
}

impl QueueName {
    pub const ALL: [QueueName; 3] = [QueueName::Default, QueueName::Evaluations, QueueName::Events];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::Default => "default",
            QueueName::Evaluations => "evaluations",
            QueueName::Events => "events",
        }
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "default" => Ok(QueueName::Default),
            "evaluations" => Ok(QueueName::Evaluations),
            "events" => Ok(QueueName::Events),
            other => Err(format!(
                "unknown queue '{}', expected one of: default, evaluations, events",
                other
            )),
        }
    }
}

/// Work carried by a job, tagged by kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "camelCase")]
pub enum JobPayload {
    DocumentRunTask(DocumentRunTask),
    RunEvaluationJob(RunEvaluationJob),
    BatchDrained(BatchDrained),
}

impl JobPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            JobPayload::DocumentRunTask(_) => "documentRunTask",
            JobPayload::RunEvaluationJob(_) => "runEvaluationJob",
            JobPayload::BatchDrained(_) => "batchDrained",
        }
    }

    /// Batch the payload belongs to.
    pub fn batch_id(&self) -> &str {
        match self {
            JobPayload::DocumentRunTask(task) => &task.batch_id,
            JobPayload::RunEvaluationJob(job) => &job.batch_id,
            JobPayload::BatchDrained(drained) => &drained.batch.batch_id,
        }
    }
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

/// A job as stored in a queue.
///
/// `id` is stable across redeliveries; `attempts` counts deliveries that
/// reached a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub queue: QueueName,
    pub payload: JobPayload,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Message of the most recent failure, if any.
    #[serde(default)]
    pub last_error: Option<String>,
}

impl Job {
    pub fn new(queue: QueueName, payload: JobPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            queue,
            payload,
            created_at: Utc::now(),
            attempts: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            last_error: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Called before each execution attempt.
    pub fn increment_attempts(&mut self) {
        self.attempts += 1;
    }

    pub fn record_failure(&mut self, error: impl Into<String>) {
        self.last_error = Some(error.into());
    }

    /// Whether the job may be attempted again.
    pub fn should_retry(&self) -> bool {
        self.attempts < self.max_attempts
    }

    pub fn remaining_attempts(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempts)
    }

    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.created_at
    }
}

/// Final state of a job as seen by a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Handler returned normally; job acknowledged.
    Succeeded,
    /// Scheduled for another attempt after a backoff delay.
    Retried,
    /// Moved to the dead-letter list.
    DeadLettered,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Succeeded => "succeeded",
            JobStatus::Retried => "retried",
            JobStatus::DeadLettered => "dead_lettered",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delay applied before a failed job becomes visible again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffPolicy {
    Fixed(Duration),
    /// `base * 2^(attempt - 1)`, capped at `max`.
    Exponential { base: Duration, max: Duration },
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::Exponential {
            base: Duration::from_secs(2),
            max: Duration::from_secs(300),
        }
    }
}

impl BackoffPolicy {
    /// Delay before retrying after the given (1-based) attempt failed.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match *self {
            BackoffPolicy::Fixed(delay) => delay,
            BackoffPolicy::Exponential { base, max } => {
                let exponent = attempt.saturating_sub(1).min(31);
                base.saturating_mul(1u32 << exponent).min(max)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::types::{EvaluationRef, Parameters};

    fn sample_task() -> DocumentRunTask {
        DocumentRunTask {
            workspace_id: 1,
            document_uuid: Uuid::new_v4(),
            commit_uuid: Uuid::new_v4(),
            project_id: 1,
            parameters: Parameters::new(),
            evaluation: Some(EvaluationRef::V1 { evaluation_id: 1 }),
            batch_id: "batch1".to_string(),
            experiment_uuid: None,
        }
    }

    #[test]
    fn test_queue_name_parse_and_display() {
        for name in QueueName::ALL {
            assert_eq!(name.to_string().parse::<QueueName>(), Ok(name));
        }
        assert_eq!(" Events ".parse::<QueueName>(), Ok(QueueName::Events));
        assert!("priority".parse::<QueueName>().is_err());
    }

    #[test]
    fn test_job_payload_is_tagged_by_kind() {
        let payload = JobPayload::DocumentRunTask(sample_task());
        let value = serde_json::to_value(&payload).expect("serialize");

        assert_eq!(value["kind"], "documentRunTask");
        assert_eq!(value["payload"]["batchId"], "batch1");
        assert_eq!(value["payload"]["evaluationId"], 1);
        assert_eq!(payload.kind(), "documentRunTask");
        assert_eq!(payload.batch_id(), "batch1");
    }

    #[test]
    fn test_job_defaults_when_fields_missing() {
        let job = Job::new(QueueName::Default, JobPayload::DocumentRunTask(sample_task()));
        let mut value = serde_json::to_value(&job).expect("serialize");
        let object = value.as_object_mut().expect("object");
        object.remove("attempts");
        object.remove("max_attempts");
        object.remove("last_error");

        let parsed: Job = serde_json::from_value(value).expect("parse");
        assert_eq!(parsed.id, job.id);
        assert_eq!(parsed.attempts, 0);
        assert_eq!(parsed.max_attempts, DEFAULT_MAX_ATTEMPTS);
        assert!(parsed.last_error.is_none());
    }

    #[test]
    fn test_job_retry_accounting() {
        let mut job =
            Job::new(QueueName::Default, JobPayload::DocumentRunTask(sample_task())).with_max_attempts(2);
        assert!(job.should_retry());

        job.increment_attempts();
        assert_eq!(job.remaining_attempts(), 1);
        assert!(job.should_retry());

        job.increment_attempts();
        job.record_failure("Rate limit error");
        assert!(!job.should_retry());
        assert_eq!(job.last_error.as_deref(), Some("Rate limit error"));

        assert_eq!(
            Job::new(QueueName::Events, JobPayload::DocumentRunTask(sample_task()))
                .with_max_attempts(0)
                .max_attempts,
            1
        );
    }

    #[test]
    fn test_backoff_delays() {
        let fixed = BackoffPolicy::Fixed(Duration::from_secs(5));
        assert_eq!(fixed.delay_for(1), Duration::from_secs(5));
        assert_eq!(fixed.delay_for(10), Duration::from_secs(5));

        let exp = BackoffPolicy::Exponential {
            base: Duration::from_secs(1),
            max: Duration::from_secs(10),
        };
        assert_eq!(exp.delay_for(1), Duration::from_secs(1));
        assert_eq!(exp.delay_for(2), Duration::from_secs(2));
        assert_eq!(exp.delay_for(4), Duration::from_secs(8));
        assert_eq!(exp.delay_for(5), Duration::from_secs(10));
        assert_eq!(exp.delay_for(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn test_job_status_display() {
        assert_eq!(JobStatus::Succeeded.to_string(), "succeeded");
        assert_eq!(JobStatus::DeadLettered.to_string(), "dead_lettered");
    }
}
