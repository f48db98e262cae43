//! Workspace notifications.
//!
//! Progress and status events are pushed to a channel per workspace. Delivery
//! is best effort: components publish through [`Notifier`], which never fails.

pub mod events;
pub mod publisher;

pub use events::{
    DatasetRowsCreated, DocumentBatchRunStatus, EvaluationResultCreated, EvaluationStatus,
    EvaluationTarget, EventEnvelope, ExperimentStatus, WorkspaceEvent,
};
pub use publisher::{
    workspace_channel, BroadcastPublisher, NotificationPublisher, Notifier, PublishError,
    RedisPublisher,
};
