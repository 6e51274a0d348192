//! Bridges dispatch decisions onto the queues: work items toward workers
//! and reconcile nudges back toward the dispatcher.

use std::sync::Arc;

use tracing::{debug, instrument};

use crate::error::Result;
use crate::messaging::{send_message, ReconcileMessage, WorkItemMessage, WorkQueue};

/// Queue-facing side of dispatch. Shared by the dispatcher (work items)
/// and the worker runtime (reconcile nudges after outcome events).
#[derive(Clone)]
pub struct TaskEnqueuer {
    queue: Arc<dyn WorkQueue>,
    task_queue: String,
    reconcile_queue: String,
}

impl TaskEnqueuer {
    pub fn new(
        queue: Arc<dyn WorkQueue>,
        task_queue: impl Into<String>,
        reconcile_queue: impl Into<String>,
    ) -> Self {
        Self {
            queue,
            task_queue: task_queue.into(),
            reconcile_queue: reconcile_queue.into(),
        }
    }

    /// Send one work item to the task queue.
    #[instrument(skip(self, item), fields(request_id = %item.request_id, iteration = item.iteration))]
    pub async fn enqueue_work_item(&self, item: &WorkItemMessage) -> Result<i64> {
        let msg_id = send_message(self.queue.as_ref(), &self.task_queue, item).await?;
        debug!(msg_id = msg_id, "Work item enqueued");
        Ok(msg_id)
    }

    /// Ask the dispatcher to re-reconcile a job.
    #[instrument(skip(self), fields(job_id = %job_id))]
    pub async fn nudge_reconcile(&self, job_id: &str) -> Result<i64> {
        let message = ReconcileMessage {
            job_id: job_id.to_string(),
        };
        let msg_id = send_message(self.queue.as_ref(), &self.reconcile_queue, &message).await?;
        debug!(msg_id = msg_id, "Reconcile nudge sent");
        Ok(msg_id)
    }
}
