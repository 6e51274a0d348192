//! # Messaging
//!
//! Visibility-timeout message queues connecting the orchestrator and the
//! workers, backed by pgmq in production and an in-memory double in tests.
//!
//! Two queues exist:
//!
//! - the **task queue** carries [`WorkItemMessage`]s to workers;
//! - the **reconcile queue** carries [`ReconcileMessage`] nudges back to the
//!   dispatcher whenever a job's state may have advanced.
//!
//! Delivery is at-least-once. A received message becomes invisible for the
//! requested window and reappears unless deleted, so every consumer must be
//! idempotent. `read_count` is the cumulative delivery count and drives
//! dead-lettering.

pub mod memory;
pub mod pgmq_queue;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::models::TaskDefinition;

pub use memory::InMemoryWorkQueue;
pub use pgmq_queue::PgmqWorkQueue;

/// A delivered message. `read_count` includes this delivery.
#[derive(Debug, Clone)]
pub struct QueueMessage {
    pub msg_id: i64,
    pub read_count: i32,
    pub enqueued_at: DateTime<Utc>,
    pub body: serde_json::Value,
}

impl QueueMessage {
    /// Deserialize the body into a typed wire message.
    pub fn parse<T: serde::de::DeserializeOwned>(&self) -> std::result::Result<T, serde_json::Error> {
        serde_json::from_value(self.body.clone())
    }
}

/// Everything a worker needs to execute one task dispatch, carried in the
/// message so execution never reads back through the event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkItemMessage {
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    pub iteration: u32,
    pub task: TaskDefinition,
    #[serde(default)]
    pub dependency_outputs: BTreeMap<String, serde_json::Value>,
}

/// Nudge asking the dispatcher to re-evaluate one job's frontier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileMessage {
    pub job_id: String,
}

/// Visibility-timeout queue operations used by the dispatcher and workers.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Append a message, returning its id.
    async fn send(&self, queue: &str, body: &serde_json::Value) -> Result<i64>;

    /// Receive at most one message, making it invisible for
    /// `visibility_seconds`.
    async fn receive(&self, queue: &str, visibility_seconds: u32) -> Result<Option<QueueMessage>>;

    /// Acknowledge a message, removing it permanently.
    async fn delete(&self, queue: &str, msg_id: i64) -> Result<()>;

    /// Move a message to the queue's archive (dead-letter store).
    async fn archive(&self, queue: &str, msg_id: i64) -> Result<()>;

    /// Reset the message's invisibility window to `visibility_seconds` from
    /// now.
    async fn extend_visibility(&self, queue: &str, msg_id: i64, visibility_seconds: u32)
        -> Result<()>;
}

/// Serialize a typed wire message and send it.
pub async fn send_message<Q, T>(queue: &Q, queue_name: &str, message: &T) -> Result<i64>
where
    Q: WorkQueue + ?Sized,
    T: Serialize + Sync,
{
    let body = serde_json::to_value(message).map_err(|e| {
        crate::error::JobflowError::QueueError(format!("failed to serialize message: {e}"))
    })?;
    queue.send(queue_name, &body).await
}
