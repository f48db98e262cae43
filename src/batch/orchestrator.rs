//! Per-task state machine.
//!
//! ```text
//!              ┌──────────► Completed   (evaluation enqueued, completed += 1)
//!   Running ───┼──────────► Absorbed    (errors += 1)
//!              └──────────► Escalated   (original error returned, counters untouched)
//! ```
//!
//! Within one task: run log persisted, then evaluation enqueued, then counter
//! incremented, then status published. Tasks of the same batch are not
//! ordered against each other; the counters are increment-only so the
//! published snapshots are monotonic.
//!
//! A task is identified by the id of the job carrying it, which survives
//! redelivery. A task the batch already counted is acknowledged without
//! running it again, and its counter moves at most once.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::classifier::{classify, ErrorClassification};
use super::executor::DocumentRunExecutor;
use super::progress::{Counter, ProgressError, ProgressSnapshot, ProgressTracker};
use super::types::{BatchDrained, DocumentRunTask, RunEvaluationJob};
use crate::error::{RunError, RunErrorCode, TaskError};
use crate::metrics::MetricsCollector;
use crate::notifications::{Notifier, WorkspaceEvent};
use crate::scheduler::dispatcher::QueueDispatcher;
use crate::scheduler::job::{JobPayload, QueueName};

/// How a task left the orchestrator without escalating.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Completed {
        provider_log_uuid: Uuid,
        /// Post-increment counters; `None` when the increment was refused
        /// because the batch is already drained or gone.
        progress: Option<ProgressSnapshot>,
    },
    Absorbed {
        error: RunError,
        progress: Option<ProgressSnapshot>,
    },
    /// The task was already counted by an earlier delivery.
    Duplicate { progress: Option<ProgressSnapshot> },
}

impl TaskOutcome {
    pub fn progress(&self) -> Option<ProgressSnapshot> {
        match self {
            TaskOutcome::Completed { progress, .. }
            | TaskOutcome::Absorbed { progress, .. }
            | TaskOutcome::Duplicate { progress } => *progress,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            TaskOutcome::Completed { .. } => "completed",
            TaskOutcome::Absorbed { .. } => "absorbed",
            TaskOutcome::Duplicate { .. } => "duplicate",
        }
    }
}

/// Runs document tasks and keeps their batch's counters.
pub struct BatchOrchestrator {
    executor: Arc<dyn DocumentRunExecutor>,
    progress: Arc<dyn ProgressTracker>,
    dispatcher: Arc<dyn QueueDispatcher>,
    notifier: Notifier,
    metrics: MetricsCollector,
}

impl BatchOrchestrator {
    pub fn new(
        executor: Arc<dyn DocumentRunExecutor>,
        progress: Arc<dyn ProgressTracker>,
        dispatcher: Arc<dyn QueueDispatcher>,
        notifier: Notifier,
    ) -> Self {
        Self {
            executor,
            progress,
            dispatcher,
            notifier,
            metrics: MetricsCollector::new(),
        }
    }

    /// Processes one task. `task_id` is stable across redeliveries of it.
    ///
    /// `Ok` means the task may be acknowledged. `Err` is an escalation: the
    /// error is the one the run produced, unchanged, and no counter moved.
    pub async fn run_document_task(
        &self,
        task_id: Uuid,
        task: &DocumentRunTask,
    ) -> Result<TaskOutcome, TaskError> {
        let started = Instant::now();

        let result = match self.duplicate_of_counted(task_id, task).await {
            Ok(Some(outcome)) => Ok(outcome),
            Ok(None) => self.process(task_id, task).await,
            Err(e) => Err(e),
        };

        let elapsed = started.elapsed().as_secs_f64();
        match &result {
            Ok(outcome) => {
                let classification = match outcome {
                    TaskOutcome::Absorbed { .. } => ErrorClassification::Recoverable.as_str(),
                    TaskOutcome::Completed { .. } | TaskOutcome::Duplicate { .. } => "none",
                };
                self.metrics.record_task(outcome.label(), classification, elapsed);
            }
            Err(failure) => {
                self.metrics
                    .record_task("escalated", classify(failure).as_str(), elapsed);
            }
        }

        result
    }

    async fn process(
        &self,
        task_id: Uuid,
        task: &DocumentRunTask,
    ) -> Result<TaskOutcome, TaskError> {
        match self.execute(task).await {
            Ok(provider_log_uuid) => self.complete(task_id, task, provider_log_uuid).await,
            Err(failure) => {
                let classification = classify(&failure);
                if classification.escalates() {
                    warn!(
                        batch_id = %task.batch_id,
                        document_uuid = %task.document_uuid,
                        classification = %classification,
                        error = %failure,
                        "Escalating task failure"
                    );
                    Err(failure)
                } else {
                    self.absorb(task_id, task, failure).await
                }
            }
        }
    }

    /// Returns the outcome to acknowledge with when an earlier delivery of
    /// the task was already counted.
    async fn duplicate_of_counted(
        &self,
        task_id: Uuid,
        task: &DocumentRunTask,
    ) -> Result<Option<TaskOutcome>, TaskError> {
        if !self
            .progress
            .is_counted(&task.batch_id, task_id)
            .await
            .map_err(TaskError::Progress)?
        {
            return Ok(None);
        }

        info!(
            batch_id = %task.batch_id,
            task_id = %task_id,
            "Task already counted, skipping redelivery"
        );
        let progress = self
            .progress
            .get_progress(&task.batch_id)
            .await
            .map_err(TaskError::Progress)?;
        Ok(Some(TaskOutcome::Duplicate { progress }))
    }

    /// Runs the task and waits until it settles.
    async fn execute(&self, task: &DocumentRunTask) -> Result<Uuid, TaskError> {
        let result = self.executor.run(task).await?;

        // The error slot settles only after the run log is final.
        if let Some(error) = result.error.wait().await {
            return Err(TaskError::Run(error));
        }
        // A run that died without settling leaves no response either.
        result.last_response.wait().await?;

        Ok(result.errorable_uuid)
    }

    async fn complete(
        &self,
        task_id: Uuid,
        task: &DocumentRunTask,
        provider_log_uuid: Uuid,
    ) -> Result<TaskOutcome, TaskError> {
        // A concurrent delivery may have finished while this one ran.
        if let Some(outcome) = self.duplicate_of_counted(task_id, task).await? {
            return Ok(outcome);
        }

        if let Some(evaluation) = &task.evaluation {
            let job = RunEvaluationJob {
                workspace_id: task.workspace_id,
                document_uuid: task.document_uuid,
                provider_log_uuid,
                evaluation: evaluation.clone(),
                batch_id: task.batch_id.clone(),
            };
            let job_id = self
                .dispatcher
                .enqueue(QueueName::Evaluations, JobPayload::RunEvaluationJob(job))
                .await?;
            debug!(
                batch_id = %task.batch_id,
                job_id = %job_id,
                provider_log_uuid = %provider_log_uuid,
                "Enqueued evaluation"
            );
        }

        let progress = self.record(task_id, task, Counter::Completed).await?;

        info!(
            batch_id = %task.batch_id,
            provider_log_uuid = %provider_log_uuid,
            "Task completed"
        );

        Ok(TaskOutcome::Completed {
            provider_log_uuid,
            progress,
        })
    }

    async fn absorb(
        &self,
        task_id: Uuid,
        task: &DocumentRunTask,
        failure: TaskError,
    ) -> Result<TaskOutcome, TaskError> {
        let error = match failure {
            TaskError::Run(error) => error,
            other => RunError::new(RunErrorCode::Unknown, other.to_string()),
        };

        warn!(
            batch_id = %task.batch_id,
            document_uuid = %task.document_uuid,
            code = %error.code,
            error = %error,
            "Task failed, counting as batch error"
        );

        let progress = self.record(task_id, task, Counter::Errors).await?;
        Ok(TaskOutcome::Absorbed { error, progress })
    }

    /// Bumps a counter for the task, then publishes the post-increment
    /// snapshot.
    ///
    /// A refused increment means the task was already accounted for, or the
    /// batch is drained or gone; it is acknowledged silently.
    async fn record(
        &self,
        task_id: Uuid,
        task: &DocumentRunTask,
        counter: Counter,
    ) -> Result<Option<ProgressSnapshot>, TaskError> {
        let snapshot = match self
            .progress
            .increment_for_task(&task.batch_id, task_id, counter)
            .await
        {
            Ok(snapshot) => snapshot,
            Err(
                e @ (ProgressError::AlreadyCounted { .. }
                | ProgressError::Saturated { .. }
                | ProgressError::UnknownBatch(_)),
            ) => {
                warn!(
                    batch_id = %task.batch_id,
                    counter = counter.as_str(),
                    error = %e,
                    "Progress increment refused, skipping notification"
                );
                return Ok(None);
            }
            Err(e) => return Err(TaskError::Progress(e)),
        };

        self.notifier
            .notify(
                task.workspace_id,
                WorkspaceEvent::batch_status(&task.batch(), snapshot),
            )
            .await;

        if snapshot.is_drained() {
            self.announce_drained(task, snapshot).await;
        }

        Ok(Some(snapshot))
    }

    /// Only the increment that reaches `total` gets here, and a task is
    /// counted once, so each batch is announced once.
    async fn announce_drained(&self, task: &DocumentRunTask, snapshot: ProgressSnapshot) {
        let drained = BatchDrained {
            batch: task.batch(),
            experiment_uuid: task.experiment_uuid,
            progress: snapshot,
        };

        match self
            .dispatcher
            .enqueue(QueueName::Events, JobPayload::BatchDrained(drained))
            .await
        {
            Ok(job_id) => info!(
                batch_id = %task.batch_id,
                job_id = %job_id,
                completed = snapshot.completed,
                errors = snapshot.errors,
                "Batch drained"
            ),
            // The counters expire on their own; only finalization is lost.
            Err(e) => error!(
                batch_id = %task.batch_id,
                error = %e,
                "Failed to enqueue drained batch"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::executor::{ChainResponse, ExecutionResult};
    use crate::batch::progress::MemoryProgressTracker;
    use crate::batch::types::{EvaluationRef, Parameters};
    use crate::notifications::BroadcastPublisher;
    use crate::scheduler::dispatcher::MemoryDispatcher;
    use async_trait::async_trait;
    use std::time::Duration;

    enum Behaviour {
        Succeed,
        Fail(RunError),
        Reject(fn() -> TaskError),
    }

    struct StubExecutor {
        behaviour: Behaviour,
    }

    #[async_trait]
    impl DocumentRunExecutor for StubExecutor {
        async fn run(&self, _task: &DocumentRunTask) -> Result<ExecutionResult, TaskError> {
            match &self.behaviour {
                Behaviour::Succeed => Ok(ExecutionResult::completed(
                    Uuid::new_v4(),
                    ChainResponse::text("ok"),
                )),
                Behaviour::Fail(error) => Ok(ExecutionResult::failed(Uuid::new_v4(), error.clone())),
                Behaviour::Reject(make) => Err(make()),
            }
        }
    }

    struct Harness {
        orchestrator: BatchOrchestrator,
        progress: Arc<MemoryProgressTracker>,
        dispatcher: Arc<MemoryDispatcher>,
        publisher: BroadcastPublisher,
    }

    fn harness(behaviour: Behaviour) -> Harness {
        let progress = Arc::new(MemoryProgressTracker::new());
        let dispatcher = Arc::new(MemoryDispatcher::new());
        let publisher = BroadcastPublisher::new(16);
        let orchestrator = BatchOrchestrator::new(
            Arc::new(StubExecutor { behaviour }),
            progress.clone(),
            dispatcher.clone(),
            Notifier::new(Arc::new(publisher.clone()), Duration::from_secs(1)),
        );
        Harness {
            orchestrator,
            progress,
            dispatcher,
            publisher,
        }
    }

    fn task(evaluation: Option<EvaluationRef>) -> DocumentRunTask {
        DocumentRunTask {
            workspace_id: 1,
            document_uuid: Uuid::new_v4(),
            commit_uuid: Uuid::new_v4(),
            project_id: 1,
            parameters: Parameters::new(),
            evaluation,
            batch_id: "batch1".to_string(),
            experiment_uuid: None,
        }
    }

    #[tokio::test]
    async fn test_completed_without_evaluation_enqueues_nothing() {
        let h = harness(Behaviour::Succeed);
        h.progress.initialize("batch1", 2).await.expect("init");
        let mut rx = h.publisher.subscribe();

        let outcome = h
            .orchestrator
            .run_document_task(Uuid::new_v4(), &task(None))
            .await
            .expect("task should complete");

        assert_eq!(outcome.progress().map(|p| p.completed), Some(1));
        assert!(h.dispatcher.payloads(QueueName::Evaluations).is_empty());

        let envelope = rx.recv().await.expect("status event");
        assert_eq!(envelope.event.name(), "documentBatchRunStatus");
    }

    #[tokio::test]
    async fn test_invalid_payload_escalates_untouched() {
        let h = harness(Behaviour::Reject(|| TaskError::InvalidPayload("bad".to_string())));
        h.progress.initialize("batch1", 2).await.expect("init");

        let err = h
            .orchestrator
            .run_document_task(
                Uuid::new_v4(),
                &task(Some(EvaluationRef::V1 { evaluation_id: 1 })),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, TaskError::InvalidPayload(_)));
        let snapshot = h.progress.get_progress("batch1").await.expect("read").expect("exists");
        assert_eq!((snapshot.completed, snapshot.errors), (0, 0));
    }

    #[tokio::test]
    async fn test_generic_rejection_is_absorbed() {
        let h = harness(Behaviour::Reject(|| {
            TaskError::Unexpected(anyhow::anyhow!("Test error"))
        }));
        h.progress.initialize("batch1", 2).await.expect("init");
        let mut rx = h.publisher.subscribe();

        let outcome = h
            .orchestrator
            .run_document_task(
                Uuid::new_v4(),
                &task(Some(EvaluationRef::V1 { evaluation_id: 1 })),
            )
            .await
            .expect("generic errors are absorbed");

        match &outcome {
            TaskOutcome::Absorbed { error, progress } => {
                assert_eq!(error.code, RunErrorCode::Unknown);
                assert!(error.message.contains("Test error"));
                assert_eq!(progress.map(|p| p.errors), Some(1));
            }
            other => panic!("expected absorbed, got {other:?}"),
        }
        assert!(h.dispatcher.payloads(QueueName::Evaluations).is_empty());

        let envelope = rx.recv().await.expect("status event");
        assert_eq!(envelope.event.name(), "evaluationStatus");
        assert_eq!(envelope.event.progress().map(|p| p.errors), Some(1));
    }

    #[tokio::test]
    async fn test_redelivered_task_is_counted_once() {
        let h = harness(Behaviour::Succeed);
        h.progress.initialize("batch1", 2).await.expect("init");
        let task_id = Uuid::new_v4();
        let task = task(Some(EvaluationRef::V1 { evaluation_id: 1 }));

        h.orchestrator
            .run_document_task(task_id, &task)
            .await
            .expect("first delivery");
        let mut rx = h.publisher.subscribe();
        let again = h
            .orchestrator
            .run_document_task(task_id, &task)
            .await
            .expect("redelivery is acknowledged");

        assert!(matches!(again, TaskOutcome::Duplicate { .. }));
        let snapshot = h.progress.get_progress("batch1").await.expect("read").expect("exists");
        assert_eq!((snapshot.completed, snapshot.errors), (1, 0));
        assert!(!snapshot.is_drained());
        assert_eq!(h.dispatcher.payloads(QueueName::Evaluations).len(), 1);
        assert!(h.dispatcher.payloads(QueueName::Events).is_empty());
        assert!(rx.try_recv().is_err(), "no event for a redelivery");
    }

    #[tokio::test]
    async fn test_late_delivery_after_drain_is_acknowledged_quietly() {
        let h = harness(Behaviour::Fail(RunError::new(RunErrorCode::AiRun, "boom")));
        h.progress.initialize("batch1", 1).await.expect("init");

        let first = h
            .orchestrator
            .run_document_task(Uuid::new_v4(), &task(None))
            .await
            .expect("absorbed");
        assert!(first.progress().expect("snapshot").is_drained());

        let mut rx = h.publisher.subscribe();
        let second = h
            .orchestrator
            .run_document_task(Uuid::new_v4(), &task(None))
            .await
            .expect("acked");
        assert_eq!(second.progress(), None);
        assert!(rx.try_recv().is_err(), "no event for a refused increment");

        assert_eq!(h.dispatcher.payloads(QueueName::Events).len(), 1);
    }

    #[tokio::test]
    async fn test_draining_task_enqueues_batch_drained() {
        let h = harness(Behaviour::Succeed);
        h.progress.initialize("batch1", 2).await.expect("init");

        let mut with_experiment = task(None);
        with_experiment.experiment_uuid = Some(Uuid::new_v4());

        h.orchestrator
            .run_document_task(Uuid::new_v4(), &with_experiment)
            .await
            .expect("first");
        assert!(h.dispatcher.payloads(QueueName::Events).is_empty());

        h.orchestrator
            .run_document_task(Uuid::new_v4(), &with_experiment)
            .await
            .expect("second");
        let events = h.dispatcher.payloads(QueueName::Events);
        assert_eq!(events.len(), 1);
        match &events[0] {
            JobPayload::BatchDrained(drained) => {
                assert_eq!(drained.batch.batch_id, "batch1");
                assert_eq!(drained.experiment_uuid, with_experiment.experiment_uuid);
                assert_eq!(drained.progress.completed, 2);
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_batch_is_acknowledged() {
        let h = harness(Behaviour::Succeed);

        let outcome = h
            .orchestrator
            .run_document_task(Uuid::new_v4(), &task(None))
            .await
            .expect("acknowledged");
        assert!(matches!(outcome, TaskOutcome::Completed { progress: None, .. }));
    }
}
