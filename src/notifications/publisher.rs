//! Publishing workspace events.
//!
//! [`NotificationPublisher`] is the transport. [`Notifier`] is what batch
//! components hold: it bounds each publish with a timeout and never returns
//! a failure, since a lost progress update is acceptable and a lost task
//! result is not.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::events::{EventEnvelope, WorkspaceEvent};
use crate::metrics::MetricsCollector;

/// Errors raised by publishers.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Failed to serialize event: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Redis connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Redis publish failed: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Publish timed out after {0:?}")]
    TimedOut(Duration),
}

/// Pushes events to workspace-scoped channels.
#[async_trait]
pub trait NotificationPublisher: Send + Sync {
    async fn publish(&self, workspace_id: i64, event: &WorkspaceEvent) -> Result<(), PublishError>;
}

/// Channel name for a workspace.
pub fn workspace_channel(prefix: &str, workspace_id: i64) -> String {
    format!("{}:workspace:{}", prefix, workspace_id)
}

/// Publishes JSON envelopes with Redis `PUBLISH`.
pub struct RedisPublisher {
    redis: ConnectionManager,
    key_prefix: String,
}

impl RedisPublisher {
    pub async fn connect(redis_url: &str, key_prefix: &str) -> Result<Self, PublishError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| PublishError::ConnectionFailed(e.to_string()))?;
        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| PublishError::ConnectionFailed(e.to_string()))?;
        Ok(Self::from_connection(redis, key_prefix))
    }

    pub fn from_connection(redis: ConnectionManager, key_prefix: &str) -> Self {
        Self {
            redis,
            key_prefix: key_prefix.to_string(),
        }
    }
}

#[async_trait]
impl NotificationPublisher for RedisPublisher {
    async fn publish(&self, workspace_id: i64, event: &WorkspaceEvent) -> Result<(), PublishError> {
        let envelope = EventEnvelope {
            workspace_id,
            event: event.clone(),
        };
        let payload = serde_json::to_string(&envelope)?;

        let mut conn = self.redis.clone();
        let receivers: i64 = redis::cmd("PUBLISH")
            .arg(workspace_channel(&self.key_prefix, workspace_id))
            .arg(payload)
            .query_async(&mut conn)
            .await?;

        debug!(
            workspace_id = workspace_id,
            event = event.name(),
            receivers = receivers,
            "Published workspace event"
        );
        Ok(())
    }
}

/// In-process publisher over a `tokio` broadcast channel.
///
/// Publishing with no subscribers succeeds, matching pub/sub semantics.
#[derive(Clone)]
pub struct BroadcastPublisher {
    tx: broadcast::Sender<EventEnvelope>,
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastPublisher {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl NotificationPublisher for BroadcastPublisher {
    async fn publish(&self, workspace_id: i64, event: &WorkspaceEvent) -> Result<(), PublishError> {
        let _ = self.tx.send(EventEnvelope {
            workspace_id,
            event: event.clone(),
        });
        Ok(())
    }
}

/// Fire-and-forget wrapper used by the batch components.
#[derive(Clone)]
pub struct Notifier {
    publisher: Arc<dyn NotificationPublisher>,
    timeout: Duration,
    metrics: MetricsCollector,
}

impl Notifier {
    pub fn new(publisher: Arc<dyn NotificationPublisher>, timeout: Duration) -> Self {
        Self {
            publisher,
            timeout,
            metrics: MetricsCollector::new(),
        }
    }

    /// Publishes `event`. Failures and timeouts are logged and dropped.
    ///
    /// Returns whether the event was handed to the transport.
    pub async fn notify(&self, workspace_id: i64, event: WorkspaceEvent) -> bool {
        let result = match tokio::time::timeout(
            self.timeout,
            self.publisher.publish(workspace_id, &event),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(PublishError::TimedOut(self.timeout)),
        };

        let published = match result {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    workspace_id = workspace_id,
                    event = event.name(),
                    error = %e,
                    "Dropping workspace event"
                );
                false
            }
        };

        self.metrics.record_notification(event.name(), published);
        published
    }
}
