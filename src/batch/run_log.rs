//! Redis-backed run log store.
//!
//! A run log is a hash at `{prefix}:run_log:{errorable_uuid}` holding the
//! JSON record and outcome, plus a list `{prefix}:run_log:{uuid}:tool_calls`
//! with one JSON entry per tool invocation.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use uuid::Uuid;

use super::executor::{RunLogOutcome, RunLogRecord, RunLogStore, ToolCall};

pub struct RedisRunLogStore {
    redis: ConnectionManager,
    key_prefix: String,
    ttl: Duration,
}

impl RedisRunLogStore {
    pub fn from_connection(redis: ConnectionManager, key_prefix: &str) -> Self {
        Self {
            redis,
            key_prefix: key_prefix.to_string(),
            ttl: Duration::from_secs(7 * 24 * 3600),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    fn key(&self, errorable_uuid: Uuid) -> String {
        format!("{}:run_log:{}", self.key_prefix, errorable_uuid)
    }

    fn tool_calls_key(&self, errorable_uuid: Uuid) -> String {
        format!("{}:tool_calls", self.key(errorable_uuid))
    }

    fn expire(&self, pipe: &mut redis::Pipeline, key: &str) {
        if !self.ttl.is_zero() {
            pipe.cmd("EXPIRE").arg(key).arg(self.ttl.as_secs()).ignore();
        }
    }

    /// Reads a stored record, mostly for inspection tools.
    pub async fn get(&self, errorable_uuid: Uuid) -> anyhow::Result<Option<RunLogRecord>> {
        let mut conn = self.redis.clone();
        let raw: Option<String> = redis::cmd("HGET")
            .arg(self.key(errorable_uuid))
            .arg("record")
            .query_async(&mut conn)
            .await?;

        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl RunLogStore for RedisRunLogStore {
    async fn create(&self, record: &RunLogRecord) -> anyhow::Result<()> {
        let key = self.key(record.errorable_uuid);
        let json = serde_json::to_string(record)?;

        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("HSET")
            .arg(&key)
            .arg("record")
            .arg(json)
            .arg("status")
            .arg("running")
            .ignore();
        self.expire(&mut pipe, &key);

        let mut conn = self.redis.clone();
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn record_tool_call(&self, errorable_uuid: Uuid, call: &ToolCall) -> anyhow::Result<()> {
        let key = self.tool_calls_key(errorable_uuid);
        let json = serde_json::to_string(call)?;

        let mut pipe = redis::pipe();
        pipe.atomic().cmd("RPUSH").arg(&key).arg(json).ignore();
        self.expire(&mut pipe, &key);

        let mut conn = self.redis.clone();
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn finish(&self, errorable_uuid: Uuid, outcome: &RunLogOutcome) -> anyhow::Result<()> {
        let status = match outcome {
            RunLogOutcome::Succeeded { .. } => "succeeded",
            RunLogOutcome::Failed { .. } => "failed",
        };
        let json = serde_json::to_string(outcome)?;

        let mut conn = self.redis.clone();
        redis::cmd("HSET")
            .arg(self.key(errorable_uuid))
            .arg("outcome")
            .arg(json)
            .arg("status")
            .arg(status)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }
}
