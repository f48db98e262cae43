//! Routes dequeued jobs to the component that handles their kind.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::job::{Job, JobPayload};
use crate::batch::classifier::{classify, ErrorClassification};
use crate::batch::finalizer::BatchFinalizer;
use crate::batch::orchestrator::BatchOrchestrator;
use crate::batch::types::RunEvaluationJob;
use crate::error::TaskError;

/// Why a job did not finish normally.
#[derive(Debug, Clone, PartialEq)]
pub enum JobFailure {
    /// The handler returned an error it did not absorb.
    Escalated {
        classification: ErrorClassification,
        message: String,
    },
    /// The handler did not finish within the job timeout.
    TimedOut(Duration),
}

impl JobFailure {
    pub fn fatal(message: impl Into<String>) -> Self {
        JobFailure::Escalated {
            classification: ErrorClassification::Fatal,
            message: message.into(),
        }
    }

    /// Label used in logs and metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            JobFailure::Escalated { classification, .. } => classification.as_str(),
            JobFailure::TimedOut(_) => "timeout",
        }
    }
}

impl From<TaskError> for JobFailure {
    fn from(error: TaskError) -> Self {
        JobFailure::Escalated {
            classification: classify(&error),
            message: error.to_string(),
        }
    }
}

impl fmt::Display for JobFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobFailure::Escalated { message, .. } => f.write_str(message),
            JobFailure::TimedOut(after) => write!(f, "Job execution timed out after {:?}", after),
        }
    }
}

/// Processes one job. `Ok` acknowledges it.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> Result<(), JobFailure>;
}

/// Runs downstream evaluation jobs.
#[async_trait]
pub trait EvaluationHandler: Send + Sync {
    async fn run_evaluation(&self, job: &RunEvaluationJob) -> Result<(), TaskError>;
}

/// The worker-side handler for every job kind.
pub struct JobRouter {
    orchestrator: Arc<BatchOrchestrator>,
    finalizer: Arc<BatchFinalizer>,
    evaluations: Option<Arc<dyn EvaluationHandler>>,
}

impl JobRouter {
    pub fn new(orchestrator: Arc<BatchOrchestrator>, finalizer: Arc<BatchFinalizer>) -> Self {
        Self {
            orchestrator,
            finalizer,
            evaluations: None,
        }
    }

    pub fn with_evaluations(mut self, handler: Arc<dyn EvaluationHandler>) -> Self {
        self.evaluations = Some(handler);
        self
    }
}

#[async_trait]
impl JobHandler for JobRouter {
    async fn handle(&self, job: &Job) -> Result<(), JobFailure> {
        match &job.payload {
            JobPayload::DocumentRunTask(task) => {
                self.orchestrator.run_document_task(job.id, task).await?;
                Ok(())
            }
            JobPayload::BatchDrained(drained) => {
                self.finalizer.finalize(drained).await?;
                Ok(())
            }
            JobPayload::RunEvaluationJob(evaluation) => match &self.evaluations {
                Some(handler) => {
                    handler.run_evaluation(evaluation).await?;
                    Ok(())
                }
                None => Err(JobFailure::fatal(format!(
                    "No handler registered for {} jobs",
                    job.payload.kind()
                ))),
            },
        }
    }
}
