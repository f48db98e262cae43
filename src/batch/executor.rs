//! Document run executor.
//!
//! Runs one [`DocumentRunTask`] against its versioned document and hands back
//! an [`ExecutionResult`] whose fields resolve independently.
//!
//! Resolution of the document and creation of the run log happen before
//! [`DocumentRunExecutor::run`] returns, so an unknown document or a
//! permission failure is reported synchronously. The provider chain then runs
//! on a spawned task. When it finishes, the final log update is written and
//! only then are the deferred slots resolved, so anything a consumer does
//! after awaiting a slot happens after the log is persisted.
//!
//! Consumers must await [`ExecutionResult::error`] before trusting the
//! success slots: a failed run resolves the error slot and drops the others.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::batch::types::{DocumentRunTask, Parameters};
use crate::error::{RunError, RunErrorCode, TaskError};

// ============================================================================
// Deferred slots
// ============================================================================

/// A value produced after the executor has returned.
#[derive(Debug)]
pub struct Deferred<T> {
    rx: oneshot::Receiver<T>,
}

impl<T> Deferred<T> {
    /// Creates a pending slot and the sender that resolves it.
    pub fn channel() -> (oneshot::Sender<T>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }

    /// Creates a slot that is already resolved.
    pub fn ready(value: T) -> Self {
        let (tx, slot) = Self::channel();
        let _ = tx.send(value);
        slot
    }

    /// Creates a slot that will never resolve.
    pub fn abandoned() -> Self {
        let (_, slot) = Self::channel();
        slot
    }

    /// Waits for the value.
    ///
    /// Fails if the run dropped the slot without resolving it, which is what
    /// happens to every success slot when the run fails.
    pub async fn wait(self) -> Result<T, RunError> {
        self.rx.await.map_err(|_| {
            RunError::new(
                RunErrorCode::Unknown,
                "Run finished without producing this value",
            )
        })
    }
}

/// The error slot of an execution result.
#[derive(Debug)]
pub struct DeferredError {
    rx: oneshot::Receiver<RunError>,
}

impl DeferredError {
    pub fn channel() -> (oneshot::Sender<RunError>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }

    /// An error slot for a run that succeeded.
    pub fn none() -> Self {
        let (_, slot) = Self::channel();
        slot
    }

    /// An error slot holding `error`.
    pub fn resolved(error: RunError) -> Self {
        let (tx, slot) = Self::channel();
        let _ = tx.send(error);
        slot
    }

    /// Waits until the run settles. `Some` only if the run failed.
    pub async fn wait(self) -> Option<RunError> {
        self.rx.await.ok()
    }
}

// ============================================================================
// Run data
// ============================================================================

/// One message of a run's conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// A tool invocation requested by the model during a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

/// Final response of a provider chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainResponse {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<serde_json::Value>,
    #[serde(default)]
    pub tokens: u64,
}

impl ChainResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            object: None,
            tokens: 0,
        }
    }
}

/// Streamed while a chain runs.
#[derive(Debug, Clone, PartialEq)]
pub enum ChainEvent {
    Message(Message),
    ToolCall(ToolCall),
}

/// A document resolved at a commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedDocument {
    pub document_uuid: Uuid,
    pub commit_uuid: Uuid,
    pub path: String,
    pub content: String,
}

/// Everything a chain runner needs for one row.
#[derive(Debug, Clone)]
pub struct ChainRun {
    pub errorable_uuid: Uuid,
    pub workspace_id: i64,
    pub project_id: i64,
    pub document: ResolvedDocument,
    pub parameters: Parameters,
}

/// What produced a run log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogSource {
    Evaluation,
    BatchRun,
}

impl LogSource {
    pub fn for_task(task: &DocumentRunTask) -> Self {
        if task.evaluation.is_some() {
            LogSource::Evaluation
        } else {
            LogSource::BatchRun
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogSource::Evaluation => "evaluation",
            LogSource::BatchRun => "batch_run",
        }
    }
}

/// Initial run log record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunLogRecord {
    pub errorable_uuid: Uuid,
    pub source: LogSource,
    pub workspace_id: i64,
    pub document_uuid: Uuid,
    pub commit_uuid: Uuid,
    pub batch_id: String,
    pub parameters: Parameters,
    pub created_at: DateTime<Utc>,
}

/// How a run ended, as written to its log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunLogOutcome {
    Succeeded {
        response: ChainResponse,
        message_count: usize,
        tool_call_count: usize,
    },
    Failed {
        error: RunError,
    },
}

// ============================================================================
// Collaborators
// ============================================================================

/// Looks up the document a task runs against.
#[async_trait]
pub trait DocumentResolver: Send + Sync {
    /// Errors are `DocumentNotFound`, `CommitNotFound` or `PermissionDenied`.
    async fn resolve(
        &self,
        workspace_id: i64,
        document_uuid: Uuid,
        commit_uuid: Uuid,
    ) -> Result<ResolvedDocument, TaskError>;
}

/// Runs the provider call chain for one row.
///
/// Implementations make exactly one chain invocation and never retry
/// internally; throttling is reported as a `RateLimit` run error.
#[async_trait]
pub trait ChainRunner: Send + Sync {
    async fn run_chain(
        &self,
        run: ChainRun,
        events: mpsc::Sender<ChainEvent>,
    ) -> Result<ChainResponse, RunError>;
}

/// Persists run logs keyed by `errorable_uuid`.
#[async_trait]
pub trait RunLogStore: Send + Sync {
    async fn create(&self, record: &RunLogRecord) -> anyhow::Result<()>;

    async fn record_tool_call(&self, errorable_uuid: Uuid, call: &ToolCall) -> anyhow::Result<()>;

    async fn finish(&self, errorable_uuid: Uuid, outcome: &RunLogOutcome) -> anyhow::Result<()>;
}

// ============================================================================
// Executor
// ============================================================================

/// Outcome of starting one task.
#[derive(Debug)]
pub struct ExecutionResult {
    /// Identifier the run's log is recorded under.
    pub errorable_uuid: Uuid,
    pub last_response: Deferred<ChainResponse>,
    pub tool_calls: Deferred<Vec<ToolCall>>,
    pub messages: Deferred<Vec<Message>>,
    /// Resolves only if the run failed after `run` returned.
    pub error: DeferredError,
}

impl ExecutionResult {
    /// A result whose run already succeeded.
    pub fn completed(errorable_uuid: Uuid, response: ChainResponse) -> Self {
        Self {
            errorable_uuid,
            last_response: Deferred::ready(response),
            tool_calls: Deferred::ready(Vec::new()),
            messages: Deferred::ready(Vec::new()),
            error: DeferredError::none(),
        }
    }

    /// A result whose run already failed.
    pub fn failed(errorable_uuid: Uuid, error: RunError) -> Self {
        Self {
            errorable_uuid,
            last_response: Deferred::abandoned(),
            tool_calls: Deferred::abandoned(),
            messages: Deferred::abandoned(),
            error: DeferredError::resolved(error),
        }
    }
}

/// Runs a single task.
#[async_trait]
pub trait DocumentRunExecutor: Send + Sync {
    async fn run(&self, task: &DocumentRunTask) -> Result<ExecutionResult, TaskError>;
}

/// Capacity of the chain event channel.
const EVENT_BUFFER: usize = 64;

/// Executor built from a resolver, a chain runner and a log store.
pub struct ChainExecutor {
    resolver: Arc<dyn DocumentResolver>,
    runner: Arc<dyn ChainRunner>,
    logs: Arc<dyn RunLogStore>,
}

impl ChainExecutor {
    pub fn new(
        resolver: Arc<dyn DocumentResolver>,
        runner: Arc<dyn ChainRunner>,
        logs: Arc<dyn RunLogStore>,
    ) -> Self {
        Self {
            resolver,
            runner,
            logs,
        }
    }
}

#[async_trait]
impl DocumentRunExecutor for ChainExecutor {
    async fn run(&self, task: &DocumentRunTask) -> Result<ExecutionResult, TaskError> {
        let document = self
            .resolver
            .resolve(task.workspace_id, task.document_uuid, task.commit_uuid)
            .await?;

        let errorable_uuid = Uuid::new_v4();
        let record = RunLogRecord {
            errorable_uuid,
            source: LogSource::for_task(task),
            workspace_id: task.workspace_id,
            document_uuid: task.document_uuid,
            commit_uuid: task.commit_uuid,
            batch_id: task.batch_id.clone(),
            parameters: task.parameters.clone(),
            created_at: Utc::now(),
        };
        self.logs
            .create(&record)
            .await
            .map_err(|e| TaskError::Unexpected(e.context("Failed to create run log")))?;

        let (response_tx, last_response) = Deferred::channel();
        let (tool_calls_tx, tool_calls) = Deferred::channel();
        let (messages_tx, messages) = Deferred::channel();
        let (error_tx, error) = DeferredError::channel();

        let run = ChainRun {
            errorable_uuid,
            workspace_id: task.workspace_id,
            project_id: task.project_id,
            document,
            parameters: task.parameters.clone(),
        };
        let runner = Arc::clone(&self.runner);
        let logs = Arc::clone(&self.logs);

        tokio::spawn(async move {
            let (events_tx, mut events_rx) = mpsc::channel(EVENT_BUFFER);

            let collect = async {
                let mut messages = Vec::new();
                let mut tool_calls = Vec::new();
                while let Some(event) = events_rx.recv().await {
                    match event {
                        ChainEvent::Message(message) => messages.push(message),
                        ChainEvent::ToolCall(call) => {
                            if let Err(e) = logs.record_tool_call(errorable_uuid, &call).await {
                                warn!(
                                    errorable_uuid = %errorable_uuid,
                                    tool = %call.name,
                                    error = %e,
                                    "Failed to record tool call"
                                );
                            }
                            tool_calls.push(call);
                        }
                    }
                }
                (messages, tool_calls)
            };

            let (result, (collected_messages, collected_tool_calls)) =
                tokio::join!(runner.run_chain(run, events_tx), collect);

            let outcome = match &result {
                Ok(response) => RunLogOutcome::Succeeded {
                    response: response.clone(),
                    message_count: collected_messages.len(),
                    tool_call_count: collected_tool_calls.len(),
                },
                Err(e) => RunLogOutcome::Failed { error: e.clone() },
            };

            if let Err(e) = logs.finish(errorable_uuid, &outcome).await {
                warn!(errorable_uuid = %errorable_uuid, error = %e, "Failed to finish run log");
                // A result without a persisted log cannot be evaluated.
                let _ = error_tx.send(RunError::new(
                    RunErrorCode::Unknown,
                    format!("Failed to persist run log: {}", e),
                ));
                return;
            }

            match result {
                Ok(response) => {
                    debug!(errorable_uuid = %errorable_uuid, "Chain completed");
                    let _ = messages_tx.send(collected_messages);
                    let _ = tool_calls_tx.send(collected_tool_calls);
                    let _ = response_tx.send(response);
                }
                Err(e) => {
                    debug!(errorable_uuid = %errorable_uuid, code = %e.code, "Chain failed");
                    let _ = error_tx.send(e);
                }
            }
        });

        Ok(ExecutionResult {
            errorable_uuid,
            last_response,
            tool_calls,
            messages,
            error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::types::EvaluationRef;
    use std::sync::Mutex;

    struct StaticResolver {
        missing: bool,
    }

    #[async_trait]
    impl DocumentResolver for StaticResolver {
        async fn resolve(
            &self,
            _workspace_id: i64,
            document_uuid: Uuid,
            commit_uuid: Uuid,
        ) -> Result<ResolvedDocument, TaskError> {
            if self.missing {
                return Err(TaskError::DocumentNotFound {
                    document_uuid,
                    commit_uuid,
                });
            }
            Ok(ResolvedDocument {
                document_uuid,
                commit_uuid,
                path: "prompts/summarize".to_string(),
                content: "Summarize {{ text }}".to_string(),
            })
        }
    }

    /// Emits one message and one tool call, then returns `result`.
    struct ScriptedRunner {
        result: Result<ChainResponse, RunError>,
        calls: Mutex<u32>,
    }

    impl ScriptedRunner {
        fn new(result: Result<ChainResponse, RunError>) -> Self {
            Self {
                result,
                calls: Mutex::new(0),
            }
        }
    }

    #[async_trait]
    impl ChainRunner for ScriptedRunner {
        async fn run_chain(
            &self,
            _run: ChainRun,
            events: mpsc::Sender<ChainEvent>,
        ) -> Result<ChainResponse, RunError> {
            *self.calls.lock().expect("lock") += 1;
            let _ = events
                .send(ChainEvent::Message(Message::new("user", "hello")))
                .await;
            let _ = events
                .send(ChainEvent::ToolCall(ToolCall {
                    id: "call_1".to_string(),
                    name: "search".to_string(),
                    arguments: serde_json::json!({"q": "rust"}),
                }))
                .await;
            self.result.clone()
        }
    }

    #[derive(Default)]
    struct RecordingLogs {
        created: Mutex<Vec<RunLogRecord>>,
        tool_calls: Mutex<Vec<(Uuid, String)>>,
        finished: Mutex<Vec<(Uuid, RunLogOutcome)>>,
        fail_finish: bool,
    }

    #[async_trait]
    impl RunLogStore for RecordingLogs {
        async fn create(&self, record: &RunLogRecord) -> anyhow::Result<()> {
            self.created.lock().expect("lock").push(record.clone());
            Ok(())
        }

        async fn record_tool_call(&self, errorable_uuid: Uuid, call: &ToolCall) -> anyhow::Result<()> {
            self.tool_calls
                .lock()
                .expect("lock")
                .push((errorable_uuid, call.name.clone()));
            Ok(())
        }

        async fn finish(&self, errorable_uuid: Uuid, outcome: &RunLogOutcome) -> anyhow::Result<()> {
            if self.fail_finish {
                anyhow::bail!("disk full");
            }
            self.finished
                .lock()
                .expect("lock")
                .push((errorable_uuid, outcome.clone()));
            Ok(())
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

    fn executor(
        missing: bool,
        runner: Arc<ScriptedRunner>,
        logs: Arc<RecordingLogs>,
    ) -> ChainExecutor {
        ChainExecutor::new(Arc::new(StaticResolver { missing }), runner, logs)
    }

    #[tokio::test]
    async fn test_successful_run_resolves_success_slots() {
        let runner = Arc::new(ScriptedRunner::new(Ok(ChainResponse::text("done"))));
        let logs = Arc::new(RecordingLogs::default());
        let executor = executor(false, Arc::clone(&runner), Arc::clone(&logs));

        let result = executor
            .run(&task(Some(EvaluationRef::V1 { evaluation_id: 1 })))
            .await
            .expect("run should start");
        let errorable_uuid = result.errorable_uuid;

        assert!(result.error.wait().await.is_none());
        let response = result.last_response.wait().await.expect("response");
        assert_eq!(response.text, "done");
        assert_eq!(result.messages.wait().await.expect("messages").len(), 1);
        assert_eq!(result.tool_calls.wait().await.expect("tool calls")[0].name, "search");

        assert_eq!(*runner.calls.lock().expect("lock"), 1);
        let created = logs.created.lock().expect("lock");
        assert_eq!(created[0].errorable_uuid, errorable_uuid);
        assert_eq!(created[0].source, LogSource::Evaluation);
        assert_eq!(
            logs.tool_calls.lock().expect("lock")[0],
            (errorable_uuid, "search".to_string())
        );
        // The log is finished before any slot resolves.
        let finished = logs.finished.lock().expect("lock");
        assert!(matches!(finished[0].1, RunLogOutcome::Succeeded { tool_call_count: 1, .. }));
    }

    #[tokio::test]
    async fn test_failed_run_resolves_error_slot_only() {
        let runner = Arc::new(ScriptedRunner::new(Err(RunError::rate_limited(
            "Rate limit error",
        ))));
        let logs = Arc::new(RecordingLogs::default());
        let executor = executor(false, Arc::clone(&runner), Arc::clone(&logs));

        let result = executor.run(&task(None)).await.expect("run should start");

        let error = result.error.wait().await.expect("error slot resolves");
        assert!(error.is_rate_limit());
        assert!(result.last_response.wait().await.is_err());

        assert_eq!(*runner.calls.lock().expect("lock"), 1, "no internal retry");
        assert_eq!(logs.created.lock().expect("lock")[0].source, LogSource::BatchRun);
        assert!(matches!(
            logs.finished.lock().expect("lock")[0].1,
            RunLogOutcome::Failed { .. }
        ));
    }

    #[tokio::test]
    async fn test_unresolved_document_fails_synchronously() {
        let runner = Arc::new(ScriptedRunner::new(Ok(ChainResponse::text("done"))));
        let logs = Arc::new(RecordingLogs::default());
        let executor = executor(true, Arc::clone(&runner), Arc::clone(&logs));

        let err = executor.run(&task(None)).await.unwrap_err();
        assert!(matches!(err, TaskError::DocumentNotFound { .. }));
        assert_eq!(*runner.calls.lock().expect("lock"), 0);
        assert!(logs.created.lock().expect("lock").is_empty());
    }

    #[tokio::test]
    async fn test_log_persistence_failure_surfaces_as_run_error() {
        let runner = Arc::new(ScriptedRunner::new(Ok(ChainResponse::text("done"))));
        let logs = Arc::new(RecordingLogs {
            fail_finish: true,
            ..Default::default()
        });
        let executor = executor(false, runner, logs);

        let result = executor.run(&task(None)).await.expect("run should start");
        let error = result.error.wait().await.expect("error slot resolves");
        assert_eq!(error.code, RunErrorCode::Unknown);
        assert!(error.message.contains("disk full"));
    }

    #[tokio::test]
    async fn test_prebuilt_results() {
        let uuid = Uuid::new_v4();
        let ok = ExecutionResult::completed(uuid, ChainResponse::text("hi"));
        assert!(ok.error.wait().await.is_none());
        assert_eq!(ok.last_response.wait().await.expect("response").text, "hi");

        let failed = ExecutionResult::failed(uuid, RunError::new(RunErrorCode::AiRun, "boom"));
        assert_eq!(failed.error.wait().await.map(|e| e.code), Some(RunErrorCode::AiRun));
        assert!(failed.messages.wait().await.is_err());
    }
}
