//! In-memory work queue with real visibility-timeout semantics, used by
//! integration tests to exercise redelivery and dead-lettering without
//! Postgres.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

use crate::error::{JobflowError, Result};

use super::{QueueMessage, WorkQueue};

#[derive(Debug, Clone)]
struct StoredMessage {
    msg_id: i64,
    read_count: i32,
    enqueued_at: DateTime<Utc>,
    visible_at: DateTime<Utc>,
    body: serde_json::Value,
}

#[derive(Debug, Default)]
struct QueueState {
    next_id: i64,
    messages: Vec<StoredMessage>,
    archived: Vec<StoredMessage>,
}

#[derive(Debug, Default)]
pub struct InMemoryWorkQueue {
    queues: Mutex<HashMap<String, QueueState>>,
}

impl InMemoryWorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Visible + in-flight messages on a queue. Test helper.
    pub fn pending_len(&self, queue: &str) -> usize {
        self.queues
            .lock()
            .get(queue)
            .map(|q| q.messages.len())
            .unwrap_or(0)
    }

    /// Archived (dead-lettered) messages on a queue. Test helper.
    pub fn archived_len(&self, queue: &str) -> usize {
        self.queues
            .lock()
            .get(queue)
            .map(|q| q.archived.len())
            .unwrap_or(0)
    }

    /// Make every in-flight message on a queue immediately visible again,
    /// simulating visibility-timeout expiry without waiting.
    pub fn expire_visibility(&self, queue: &str) {
        let now = Utc::now();
        if let Some(state) = self.queues.lock().get_mut(queue) {
            for message in &mut state.messages {
                message.visible_at = now;
            }
        }
    }
}

#[async_trait]
impl WorkQueue for InMemoryWorkQueue {
    async fn send(&self, queue: &str, body: &serde_json::Value) -> Result<i64> {
        let mut queues = self.queues.lock();
        let state = queues.entry(queue.to_string()).or_default();
        state.next_id += 1;
        let msg_id = state.next_id;
        state.messages.push(StoredMessage {
            msg_id,
            read_count: 0,
            enqueued_at: Utc::now(),
            visible_at: Utc::now(),
            body: body.clone(),
        });
        Ok(msg_id)
    }

    async fn receive(&self, queue: &str, visibility_seconds: u32) -> Result<Option<QueueMessage>> {
        let now = Utc::now();
        let mut queues = self.queues.lock();
        let Some(state) = queues.get_mut(queue) else {
            return Ok(None);
        };

        let Some(message) = state
            .messages
            .iter_mut()
            .filter(|m| m.visible_at <= now)
            .min_by_key(|m| m.msg_id)
        else {
            return Ok(None);
        };

        message.read_count += 1;
        message.visible_at = now + Duration::seconds(visibility_seconds as i64);

        Ok(Some(QueueMessage {
            msg_id: message.msg_id,
            read_count: message.read_count,
            enqueued_at: message.enqueued_at,
            body: message.body.clone(),
        }))
    }

    async fn delete(&self, queue: &str, msg_id: i64) -> Result<()> {
        let mut queues = self.queues.lock();
        if let Some(state) = queues.get_mut(queue) {
            state.messages.retain(|m| m.msg_id != msg_id);
        }
        Ok(())
    }

    async fn archive(&self, queue: &str, msg_id: i64) -> Result<()> {
        let mut queues = self.queues.lock();
        let state = queues
            .get_mut(queue)
            .ok_or_else(|| JobflowError::QueueError(format!("unknown queue: {queue}")))?;
        let Some(index) = state.messages.iter().position(|m| m.msg_id == msg_id) else {
            return Err(JobflowError::QueueError(format!(
                "message {msg_id} not found on {queue}"
            )));
        };
        let message = state.messages.remove(index);
        state.archived.push(message);
        Ok(())
    }

    async fn extend_visibility(
        &self,
        queue: &str,
        msg_id: i64,
        visibility_seconds: u32,
    ) -> Result<()> {
        let mut queues = self.queues.lock();
        if let Some(state) = queues.get_mut(queue) {
            if let Some(message) = state.messages.iter_mut().find(|m| m.msg_id == msg_id) {
                message.visible_at = Utc::now() + Duration::seconds(visibility_seconds as i64);
            }
        }
        Ok(())
    }
}
