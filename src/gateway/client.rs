//! HTTP client for the document gateway.
//!
//! The gateway owns documents, commits, experiments and the provider call
//! chain. This client implements the collaborator traits the batch
//! components are written against, so a worker needs nothing but a base URL
//! and an API key.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::batch::executor::{
    ChainEvent, ChainResponse, ChainRun, ChainRunner, DocumentResolver, Message, ResolvedDocument,
    ToolCall,
};
use crate::batch::finalizer::ExperimentStore;
use crate::batch::types::{Experiment, Parameters, RunEvaluationJob};
use crate::error::{RunError, RunErrorCode, TaskError};
use crate::scheduler::router::EvaluationHandler;

/// Errors raised by gateway calls that have no run-level meaning.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Gateway returned {status}: {body}")]
    Status { status: u16, body: String },
}

/// Structured error body returned by the gateway.
///
/// Accepts both `{"error": {...}}` and a bare `{...}`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ErrorBody {
    Wrapped { error: ErrorDetail },
    Bare(ErrorDetail),
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    code: Option<RunErrorCode>,
    message: String,
    #[serde(default)]
    details: Option<serde_json::Value>,
}

impl ErrorBody {
    fn parse(body: &str) -> Option<ErrorDetail> {
        match serde_json::from_str::<ErrorBody>(body).ok()? {
            ErrorBody::Wrapped { error } => Some(error),
            ErrorBody::Bare(detail) => Some(detail),
        }
    }
}

/// Maps a failed chain call to the run error it represents.
///
/// 429 is always a rate limit. Structured bodies keep their code; anything
/// else becomes `Unknown`.
pub fn run_error_from_response(status: u16, body: &str) -> RunError {
    let detail = ErrorBody::parse(body);

    if status == StatusCode::TOO_MANY_REQUESTS.as_u16() {
        let message = detail
            .map(|d| d.message)
            .unwrap_or_else(|| "Rate limit exceeded".to_string());
        return RunError::rate_limited(message);
    }

    match detail {
        Some(detail) => {
            let error = RunError::new(detail.code.unwrap_or(RunErrorCode::Unknown), detail.message);
            match detail.details {
                Some(details) => error.with_details(details),
                None => error,
            }
        }
        None => RunError::new(
            RunErrorCode::Unknown,
            format!("Gateway returned {}: {}", status, body),
        ),
    }
}

/// Maps a failed document lookup to a task error.
pub fn resolve_error_from_response(
    status: u16,
    body: &str,
    workspace_id: i64,
    document_uuid: Uuid,
    commit_uuid: Uuid,
) -> TaskError {
    match status {
        404 => TaskError::DocumentNotFound {
            document_uuid,
            commit_uuid,
        },
        401 | 403 => TaskError::PermissionDenied {
            workspace_id,
            reason: ErrorBody::parse(body)
                .map(|d| d.message)
                .unwrap_or_else(|| body.to_string()),
        },
        429 => TaskError::Run(run_error_from_response(status, body)),
        _ => TaskError::Unexpected(
            GatewayError::Status {
                status,
                body: body.to_string(),
            }
            .into(),
        ),
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RunRequest<'a> {
    errorable_uuid: Uuid,
    project_id: i64,
    document_uuid: Uuid,
    commit_uuid: Uuid,
    parameters: &'a Parameters,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunResponse {
    response: ChainResponse,
    #[serde(default)]
    messages: Vec<Message>,
    #[serde(default)]
    tool_calls: Vec<ToolCall>,
}

/// Client for the document gateway API.
pub struct GatewayClient {
    base_url: String,
    api_key: Option<String>,
    http_client: Client,
}

impl GatewayClient {
    /// Creates a client for `base_url` (e.g. "http://gateway:8787").
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::Http` if the HTTP client cannot be built.
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, GatewayError> {
        let http_client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            http_client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    fn workspace_url(&self, workspace_id: i64, path: &str) -> String {
        format!(
            "{}/api/v1/workspaces/{}/{}",
            self.base_url, workspace_id, path
        )
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(api_key) => request.header("Authorization", format!("Bearer {}", api_key)),
            None => request,
        }
    }

    /// Reads the body of a failed response; unreadable bodies become a
    /// placeholder.
    async fn error_body(response: reqwest::Response) -> String {
        response
            .text()
            .await
            .unwrap_or_else(|_| "Failed to read error response".to_string())
    }
}

#[async_trait]
impl DocumentResolver for GatewayClient {
    async fn resolve(
        &self,
        workspace_id: i64,
        document_uuid: Uuid,
        commit_uuid: Uuid,
    ) -> Result<ResolvedDocument, TaskError> {
        let url = self.workspace_url(
            workspace_id,
            &format!("commits/{}/documents/{}", commit_uuid, document_uuid),
        );

        let response = self
            .authorized(self.http_client.get(&url))
            .send()
            .await
            .map_err(|e| TaskError::Unexpected(GatewayError::Http(e).into()))?;

        let status = response.status();
        if !status.is_success() {
            let body = Self::error_body(response).await;
            return Err(resolve_error_from_response(
                status.as_u16(),
                &body,
                workspace_id,
                document_uuid,
                commit_uuid,
            ));
        }

        response
            .json::<ResolvedDocument>()
            .await
            .map_err(|e| TaskError::InvalidPayload(format!("Malformed document response: {}", e)))
    }
}

#[async_trait]
impl ChainRunner for GatewayClient {
    async fn run_chain(
        &self,
        run: ChainRun,
        events: mpsc::Sender<ChainEvent>,
    ) -> Result<ChainResponse, RunError> {
        let url = self.workspace_url(run.workspace_id, "documents/run");
        let request = RunRequest {
            errorable_uuid: run.errorable_uuid,
            project_id: run.project_id,
            document_uuid: run.document.document_uuid,
            commit_uuid: run.document.commit_uuid,
            parameters: &run.parameters,
        };

        let response = self
            .authorized(self.http_client.post(&url))
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                RunError::new(RunErrorCode::Unknown, format!("Gateway request failed: {}", e))
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = Self::error_body(response).await;
            return Err(run_error_from_response(status.as_u16(), &body));
        }

        let run_response: RunResponse = response.json().await.map_err(|e| {
            RunError::new(
                RunErrorCode::UnsupportedProviderResponse,
                format!("Failed to parse run response: {}", e),
            )
        })?;

        debug!(
            errorable_uuid = %run.errorable_uuid,
            messages = run_response.messages.len(),
            tool_calls = run_response.tool_calls.len(),
            "Chain finished"
        );

        // A dropped receiver only means nobody collects events.
        for message in run_response.messages {
            if events.send(ChainEvent::Message(message)).await.is_err() {
                break;
            }
        }
        for call in run_response.tool_calls {
            if events.send(ChainEvent::ToolCall(call)).await.is_err() {
                break;
            }
        }

        Ok(run_response.response)
    }
}

#[async_trait]
impl ExperimentStore for GatewayClient {
    async fn complete(&self, workspace_id: i64, experiment_uuid: Uuid) -> anyhow::Result<Experiment> {
        let url = self.workspace_url(
            workspace_id,
            &format!("experiments/{}/complete", experiment_uuid),
        );

        let response = self
            .authorized(self.http_client.post(&url))
            .send()
            .await
            .map_err(GatewayError::Http)?;

        let status = response.status();
        if !status.is_success() {
            let body = Self::error_body(response).await;
            return Err(GatewayError::Status {
                status: status.as_u16(),
                body,
            }
            .into());
        }

        Ok(response.json::<Experiment>().await.map_err(GatewayError::Http)?)
    }
}

#[async_trait]
impl EvaluationHandler for GatewayClient {
    async fn run_evaluation(&self, job: &RunEvaluationJob) -> Result<(), TaskError> {
        let url = self.workspace_url(job.workspace_id, "evaluations/run");

        let response = self
            .authorized(self.http_client.post(&url))
            .json(job)
            .send()
            .await
            .map_err(|e| TaskError::Unexpected(GatewayError::Http(e).into()))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let body = Self::error_body(response).await;
            return Err(TaskError::Run(run_error_from_response(status.as_u16(), &body)));
        }
        if !status.is_success() {
            let body = Self::error_body(response).await;
            return Err(TaskError::Unexpected(
                GatewayError::Status {
                    status: status.as_u16(),
                    body,
                }
                .into(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::classifier::{classify, ErrorClassification};

    #[test]
    fn test_429_is_rate_limit() {
        let error = run_error_from_response(429, r#"{"error": {"message": "Rate limit error"}}"#);
        assert_eq!(error.code, RunErrorCode::RateLimit);
        assert_eq!(error.message, "Rate limit error");

        let error = run_error_from_response(429, "");
        assert!(error.is_rate_limit());
        assert_eq!(error.message, "Rate limit exceeded");
    }

    #[test]
    fn test_structured_error_keeps_code() {
        let body = r#"{"code": "chain_compile_error", "message": "Unexpected token", "details": {"line": 3}}"#;
        let error = run_error_from_response(422, body);

        assert_eq!(error.code, RunErrorCode::ChainCompile);
        assert_eq!(error.message, "Unexpected token");
        assert_eq!(error.details, Some(serde_json::json!({"line": 3})));
    }

    #[test]
    fn test_unstructured_error_is_unknown() {
        let error = run_error_from_response(502, "bad gateway");
        assert_eq!(error.code, RunErrorCode::Unknown);
        assert!(error.message.contains("502"));
        assert!(error.message.contains("bad gateway"));
    }

    #[test]
    fn test_resolve_errors_classify() {
        let document_uuid = Uuid::new_v4();
        let commit_uuid = Uuid::new_v4();

        let not_found = resolve_error_from_response(404, "", 1, document_uuid, commit_uuid);
        assert!(matches!(
            not_found,
            TaskError::DocumentNotFound { document_uuid: d, .. } if d == document_uuid
        ));
        assert_eq!(classify(&not_found), ErrorClassification::Fatal);

        let denied = resolve_error_from_response(
            403,
            r#"{"message": "not a member"}"#,
            1,
            document_uuid,
            commit_uuid,
        );
        match &denied {
            TaskError::PermissionDenied { reason, .. } => assert_eq!(reason, "not a member"),
            other => panic!("expected permission denied, got {:?}", other),
        }
        assert_eq!(classify(&denied), ErrorClassification::Fatal);

        let throttled = resolve_error_from_response(429, "", 1, document_uuid, commit_uuid);
        assert_eq!(classify(&throttled), ErrorClassification::RateLimit);

        let broken = resolve_error_from_response(500, "boom", 1, document_uuid, commit_uuid);
        assert_eq!(classify(&broken), ErrorClassification::Recoverable);
    }

    #[test]
    fn test_client_normalizes_base_url() {
        let client = GatewayClient::new("http://gateway:8787/", None, Duration::from_secs(5))
            .expect("client should build");
        assert_eq!(client.base_url(), "http://gateway:8787");
        assert!(!client.has_api_key());
        assert_eq!(
            client.workspace_url(3, "documents/run"),
            "http://gateway:8787/api/v1/workspaces/3/documents/run"
        );
    }
}
