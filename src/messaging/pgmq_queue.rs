//! pgmq-backed work queue.
//!
//! Wraps the pgmq client for send/read/delete/archive and goes through the
//! shared pool with raw SQL for `pgmq.set_vt`, which the client does not
//! expose.

use async_trait::async_trait;
use pgmq::PGMQueue;
use sqlx::PgPool;
use tracing::{debug, instrument};

use crate::error::{JobflowError, Result};

use super::{QueueMessage, WorkQueue};

#[derive(Debug, Clone)]
pub struct PgmqWorkQueue {
    pgmq: PGMQueue,
    pool: PgPool,
}

impl PgmqWorkQueue {
    /// Build on an existing connection pool (shared with the event store).
    pub async fn new_with_pool(pool: PgPool) -> Self {
        let pgmq = PGMQueue::new_with_pool(pool.clone()).await;
        Self { pgmq, pool }
    }

    /// Create a queue if it does not exist. Called once at startup for the
    /// task and reconcile queues.
    #[instrument(skip(self), fields(queue = %queue_name))]
    pub async fn create_queue(&self, queue_name: &str) -> Result<()> {
        self.pgmq
            .create(queue_name)
            .await
            .map_err(|e| JobflowError::QueueError(format!("create queue {queue_name}: {e}")))?;
        debug!("Queue ready");
        Ok(())
    }
}

#[async_trait]
impl WorkQueue for PgmqWorkQueue {
    async fn send(&self, queue: &str, body: &serde_json::Value) -> Result<i64> {
        let msg_id = self
            .pgmq
            .send(queue, body)
            .await
            .map_err(|e| JobflowError::QueueError(format!("send to {queue}: {e}")))?;
        debug!(queue = queue, msg_id = msg_id, "Message sent");
        Ok(msg_id)
    }

    async fn receive(&self, queue: &str, visibility_seconds: u32) -> Result<Option<QueueMessage>> {
        let message = self
            .pgmq
            .read::<serde_json::Value>(queue, Some(visibility_seconds as i32))
            .await
            .map_err(|e| JobflowError::QueueError(format!("receive from {queue}: {e}")))?;

        Ok(message.map(|m| QueueMessage {
            msg_id: m.msg_id,
            read_count: m.read_ct,
            enqueued_at: m.enqueued_at,
            body: m.message,
        }))
    }

    async fn delete(&self, queue: &str, msg_id: i64) -> Result<()> {
        self.pgmq
            .delete(queue, msg_id)
            .await
            .map_err(|e| JobflowError::QueueError(format!("delete {msg_id} from {queue}: {e}")))?;
        Ok(())
    }

    async fn archive(&self, queue: &str, msg_id: i64) -> Result<()> {
        self.pgmq
            .archive(queue, msg_id)
            .await
            .map_err(|e| JobflowError::QueueError(format!("archive {msg_id} from {queue}: {e}")))?;
        Ok(())
    }

    async fn extend_visibility(
        &self,
        queue: &str,
        msg_id: i64,
        visibility_seconds: u32,
    ) -> Result<()> {
        sqlx::query("SELECT msg_id FROM pgmq.set_vt($1, $2, $3)")
            .bind(queue)
            .bind(msg_id)
            .bind(visibility_seconds as i32)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                JobflowError::QueueError(format!("set_vt for {msg_id} on {queue}: {e}"))
            })?;
        Ok(())
    }
}
