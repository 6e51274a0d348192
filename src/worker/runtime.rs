//! # Worker Runtime
//!
//! Lease-based consumption of the task queue. Per claimed message:
//! validate, enforce delivery and iteration caps, re-check idempotency
//! against the event store, acquire a lease, keep it renewed while the
//! payload runs, then map the outcome to exactly one event.
//!
//! The lease is soft mutual exclusion only. Two workers may briefly both
//! believe they hold one near expiry; the idempotency re-check and the
//! guarded event emission are the real safety net.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::config::JobflowConfig;
use crate::constants::request_id_pattern;
use crate::error::{JobflowError, Result};
use crate::event_store::EventStore;
use crate::events::{EntityType, EventBuilder, EventPayload};
use crate::messaging::{QueueMessage, WorkItemMessage, WorkQueue};
use crate::orchestration::enqueuer::TaskEnqueuer;
use crate::orchestration::projection::{task_status, TaskStatus};

use super::error_classifier::{classify, ErrorCategory};
use super::executor::{ExecutionOutcome, TaskExecutor};
use super::retry::{with_retry, RetryPolicy};

const SOURCE: &str = "worker";
const MAX_ERROR_LEN: usize = 500;
const MAX_SUMMARY_LEN: usize = 200;
const MAX_RENEWAL_FAILURES: u32 = 3;

pub struct WorkerRuntime {
    store: Arc<dyn EventStore>,
    queue: Arc<dyn WorkQueue>,
    executor: Arc<dyn TaskExecutor>,
    enqueuer: TaskEnqueuer,
    events: EventBuilder,
    config: JobflowConfig,
    retry_policy: RetryPolicy,
    worker_id: String,
    slots: Arc<Semaphore>,
}

impl WorkerRuntime {
    pub fn new(
        store: Arc<dyn EventStore>,
        queue: Arc<dyn WorkQueue>,
        executor: Arc<dyn TaskExecutor>,
        enqueuer: TaskEnqueuer,
        events: EventBuilder,
        config: JobflowConfig,
    ) -> Self {
        let slots = Arc::new(Semaphore::new(config.worker.max_concurrent_executions));
        Self {
            store,
            queue,
            executor,
            enqueuer,
            events,
            config,
            retry_policy: RetryPolicy::default(),
            worker_id: format!("worker-{}", std::process::id()),
            slots,
        }
    }

    /// Override the in-process retry policy for payload invocation errors.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Claim and process at most one message. Blocks while all execution
    /// slots are busy; returns `false` when the queue was empty.
    pub async fn poll_once(self: &Arc<Self>) -> Result<bool> {
        let permit = self
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| JobflowError::ExecutionError(format!("slot pool closed: {e}")))?;

        let Some(message) = self
            .queue
            .receive(
                &self.config.queues.task_queue,
                self.config.queues.visibility_extension_seconds,
            )
            .await?
        else {
            drop(permit);
            return Ok(false);
        };

        let runtime = Arc::clone(self);
        tokio::spawn(async move {
            let _slot = permit;
            runtime.process_message(message).await;
        });
        Ok(true)
    }

    /// Full state machine for one claimed message.
    #[instrument(skip(self, message), fields(msg_id = message.msg_id, worker_id = %self.worker_id))]
    pub async fn process_message(&self, message: QueueMessage) {
        let item: WorkItemMessage = match message.parse() {
            Ok(item) => item,
            Err(e) => {
                warn!(error = %e, "Dead-lettering unparseable work item");
                self.dead_letter(message.msg_id).await;
                return;
            }
        };
        let request_id = item.request_id.clone();
        let job_id = item.job_id.clone();

        // Malformed identifiers are never retried.
        if !request_id_pattern().is_match(&request_id) {
            warn!(request_id = %request_id, "Invalid request id on claimed work item");
            self.emit_task_failed(
                &item,
                "requestId does not match the identifier pattern",
                ErrorCategory::Validation,
                message.read_count,
            )
            .await;
            self.ack(message.msg_id).await;
            self.nudge(job_id.as_deref()).await;
            return;
        }

        // Delivery cap: park the message and fail the task terminally.
        if message.read_count > self.config.worker.max_message_retries {
            warn!(
                request_id = %request_id,
                read_count = message.read_count,
                "Delivery count exceeded, dead-lettering"
            );
            self.emit_task_failed(
                &item,
                &format!("delivery count {} exceeded the retry cap", message.read_count),
                ErrorCategory::Unknown,
                message.read_count,
            )
            .await;
            self.dead_letter(message.msg_id).await;
            self.nudge(job_id.as_deref()).await;
            return;
        }

        // Iteration cap: a task cannot loop through review forever.
        if item.iteration > self.config.worker.max_task_iterations {
            warn!(
                request_id = %request_id,
                iteration = item.iteration,
                "Iteration cap exceeded"
            );
            self.emit_task_failed(
                &item,
                &format!(
                    "iteration {} exceeded the cap of {}",
                    item.iteration, self.config.worker.max_task_iterations
                ),
                ErrorCategory::Validation,
                message.read_count,
            )
            .await;
            self.ack(message.msg_id).await;
            self.nudge(job_id.as_deref()).await;
            return;
        }

        // Idempotency re-check against the store.
        let latest = match self
            .store
            .latest_event_for_entity(EntityType::Task, &request_id)
            .await
        {
            Ok(latest) => latest,
            Err(e) => {
                // Leave the message; visibility expiry retries the claim.
                warn!(request_id = %request_id, error = %e, "Idempotency check failed");
                return;
            }
        };
        let status = task_status(latest.as_ref());
        if status.is_terminal() {
            debug!(request_id = %request_id, status = %status, "Task already terminal, skipping");
            self.ack(message.msg_id).await;
            return;
        }
        if status == TaskStatus::Processing {
            let lease = latest.as_ref().and_then(|e| e.payload.effective_until());
            if let Some(effective_until) = lease {
                if effective_until > Utc::now().timestamp() {
                    // Another worker holds a live lease. Do not ack: the
                    // queue's visibility timeout governs redelivery.
                    debug!(request_id = %request_id, "Live lease held elsewhere, skipping");
                    return;
                }
                info!(request_id = %request_id, "Reclaiming expired lease");
            }
        }

        // Acquire the lease.
        let effective_until = Utc::now().timestamp() + self.config.lease_duration_seconds();
        let started = self.events.task_event(
            &request_id,
            SOURCE,
            EventPayload::TaskProcessingStarted {
                request_id: request_id.clone(),
                job_id: job_id.clone(),
                effective_until,
                worker_id: self.worker_id.clone(),
            },
        );
        if let Err(e) = self.store.append(started).await {
            warn!(request_id = %request_id, error = %e, "Failed to acquire lease");
            return;
        }
        info!(request_id = %request_id, iteration = item.iteration, "Lease acquired");

        // The renewal loop keeps the lease alive across in-process retries
        // of transient invocation errors (spawn, IO). A payload's own
        // failure is not retried here; the queue's redelivery handles that.
        let renewal = self.spawn_renewal_loop(message.msg_id, request_id.clone(), job_id.clone());
        let invocation = with_retry(self.retry_policy, "payload invocation", || {
            self.executor.execute(&item)
        })
        .await;
        renewal.abort();

        let outcome = match invocation {
            Ok(outcome) => outcome,
            Err(error) => ExecutionOutcome::Failure {
                message: error.to_string(),
                code: None,
            },
        };
        self.handle_outcome(&item, &message, outcome).await;
    }

    async fn handle_outcome(
        &self,
        item: &WorkItemMessage,
        message: &QueueMessage,
        outcome: ExecutionOutcome,
    ) {
        let request_id = &item.request_id;
        match outcome {
            ExecutionOutcome::Success(result) => {
                let payload = if item.task.requires_review {
                    EventPayload::TaskSubmittedForReview {
                        request_id: request_id.clone(),
                        job_id: item.job_id.clone(),
                        iteration: item.iteration,
                        output: result.output.clone(),
                        summary: truncate(&result.output.to_string(), MAX_SUMMARY_LEN),
                        repo: item.task.repo.clone(),
                        duration_ms: result.duration_ms,
                        usage: result.usage,
                    }
                } else {
                    EventPayload::TaskCompleted {
                        request_id: request_id.clone(),
                        job_id: item.job_id.clone(),
                        iteration: item.iteration,
                        output: result.output,
                        duration_ms: result.duration_ms,
                        exit_code: 0,
                        usage: result.usage,
                    }
                };
                let event_type = payload.event_type();
                let event = self.events.task_event(request_id, SOURCE, payload);
                if let Err(e) = self.store.append(event).await {
                    // Leave the message so redelivery retries; the
                    // idempotency check will skip if a later attempt won.
                    warn!(request_id = %request_id, error = %e, "Failed to record outcome");
                    return;
                }
                info!(request_id = %request_id, event_type = %event_type, "Task succeeded");
                self.ack(message.msg_id).await;
            }
            ExecutionOutcome::Timeout {
                timeout_ms,
                elapsed_ms,
                signal,
            } => {
                let event = self.events.task_event(
                    request_id,
                    SOURCE,
                    EventPayload::TaskTimeout {
                        request_id: request_id.clone(),
                        job_id: item.job_id.clone(),
                        timeout_ms,
                        elapsed_ms,
                        signal,
                    },
                );
                if let Err(e) = self.store.append(event).await {
                    warn!(request_id = %request_id, error = %e, "Failed to record timeout");
                    return;
                }
                self.ack(message.msg_id).await;
            }
            ExecutionOutcome::Failure {
                message: error_message,
                code,
            } => {
                let classification = classify(&error_message, code.as_deref(), None);
                if classification.retryable {
                    let event = self.events.task_event(
                        request_id,
                        SOURCE,
                        EventPayload::TaskProcessingFailed {
                            request_id: request_id.clone(),
                            job_id: item.job_id.clone(),
                            attempt_number: message.read_count,
                            error: truncate(&error_message, MAX_ERROR_LEN),
                            error_category: classification.category.as_str().to_string(),
                        },
                    );
                    if let Err(e) = self.store.append(event).await {
                        warn!(request_id = %request_id, error = %e, "Failed to record transient failure");
                    }
                    info!(
                        request_id = %request_id,
                        category = %classification.category,
                        "Transient failure, leaving message for redelivery"
                    );
                    // No ack: the queue redelivers after visibility expiry.
                } else {
                    self.emit_task_failed(
                        item,
                        &error_message,
                        classification.category,
                        message.read_count,
                    )
                    .await;
                    self.ack(message.msg_id).await;
                }
            }
        }
        self.nudge(item.job_id.as_deref()).await;
    }

    /// Renew the message's visibility and the lease on a fixed interval
    /// until aborted. Three consecutive failures abandon the loop; the
    /// lease then expires naturally and another worker may reclaim.
    fn spawn_renewal_loop(
        &self,
        msg_id: i64,
        request_id: String,
        job_id: Option<String>,
    ) -> JoinHandle<()> {
        let queue = Arc::clone(&self.queue);
        let store = Arc::clone(&self.store);
        let events = self.events.clone();
        let worker_id = self.worker_id.clone();
        let task_queue = self.config.queues.task_queue.clone();
        let extension_seconds = self.config.queues.visibility_extension_seconds;
        let lease_seconds = self.config.lease_duration_seconds();
        let interval = self.config.renewal_interval();

        tokio::spawn(async move {
            let started = Instant::now();
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // immediate first tick

            let mut heartbeat_number = 0u32;
            let mut consecutive_failures = 0u32;
            loop {
                ticker.tick().await;
                heartbeat_number += 1;

                let renewal = async {
                    queue
                        .extend_visibility(&task_queue, msg_id, extension_seconds)
                        .await?;
                    let heartbeat = events.task_event(
                        &request_id,
                        SOURCE,
                        EventPayload::TaskHeartbeat {
                            request_id: request_id.clone(),
                            job_id: job_id.clone(),
                            effective_until: Utc::now().timestamp() + lease_seconds,
                            heartbeat_number,
                            elapsed_ms: started.elapsed().as_millis() as u64,
                            worker_id: worker_id.clone(),
                            last_activity: None,
                        },
                    );
                    store.append(heartbeat).await
                };

                match renewal.await {
                    Ok(()) => {
                        consecutive_failures = 0;
                        debug!(request_id = %request_id, heartbeat_number, "Lease renewed");
                    }
                    Err(e) => {
                        consecutive_failures += 1;
                        warn!(
                            request_id = %request_id,
                            consecutive_failures,
                            error = %e,
                            "Lease renewal failed"
                        );
                        if consecutive_failures >= MAX_RENEWAL_FAILURES {
                            warn!(request_id = %request_id, "Abandoning renewal loop");
                            break;
                        }
                    }
                }
            }
        })
    }

    async fn emit_task_failed(
        &self,
        item: &WorkItemMessage,
        error: &str,
        category: ErrorCategory,
        retry_count: i32,
    ) {
        let event = self.events.task_event(
            &item.request_id,
            SOURCE,
            EventPayload::TaskFailed {
                request_id: item.request_id.clone(),
                job_id: item.job_id.clone(),
                error: truncate(error, MAX_ERROR_LEN),
                error_category: category.as_str().to_string(),
                retry_count,
                source: SOURCE.to_string(),
            },
        );
        if let Err(e) = self.store.append(event).await {
            warn!(request_id = %item.request_id, error = %e, "Failed to record terminal failure");
        }
    }

    async fn ack(&self, msg_id: i64) {
        if let Err(e) = self
            .queue
            .delete(&self.config.queues.task_queue, msg_id)
            .await
        {
            warn!(msg_id = msg_id, error = %e, "Failed to ack message");
        }
    }

    async fn dead_letter(&self, msg_id: i64) {
        if let Err(e) = self
            .queue
            .archive(&self.config.queues.task_queue, msg_id)
            .await
        {
            warn!(msg_id = msg_id, error = %e, "Failed to dead-letter message");
        }
    }

    async fn nudge(&self, job_id: Option<&str>) {
        if let Some(job_id) = job_id {
            if let Err(e) = self.enqueuer.nudge_reconcile(job_id).await {
                warn!(job_id = %job_id, error = %e, "Failed to nudge reconcile queue");
            }
        }
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_store::InMemoryEventStore;
    use crate::events::EventType;
    use crate::messaging::{send_message, InMemoryWorkQueue};
    use crate::models::TaskDefinition;
    use crate::worker::executor::PayloadResult;
    use parking_lot::Mutex;

    struct StubExecutor {
        outcome: Mutex<ExecutionOutcome>,
    }

    impl StubExecutor {
        fn new(outcome: ExecutionOutcome) -> Arc<Self> {
            Arc::new(Self {
                outcome: Mutex::new(outcome),
            })
        }

        fn success() -> Arc<Self> {
            Self::new(ExecutionOutcome::Success(PayloadResult {
                output: serde_json::json!({"answer": 42}),
                usage: serde_json::Value::Null,
                duration_ms: 10,
            }))
        }
    }

    #[async_trait::async_trait]
    impl TaskExecutor for StubExecutor {
        async fn execute(&self, _item: &WorkItemMessage) -> Result<ExecutionOutcome> {
            Ok(self.outcome.lock().clone())
        }
    }

    /// Errors a fixed number of invocations, then succeeds.
    struct FlakyExecutor {
        failures_left: Mutex<u32>,
        calls: Mutex<u32>,
    }

    impl FlakyExecutor {
        fn new(failures: u32) -> Arc<Self> {
            Arc::new(Self {
                failures_left: Mutex::new(failures),
                calls: Mutex::new(0),
            })
        }
    }

    #[async_trait::async_trait]
    impl TaskExecutor for FlakyExecutor {
        async fn execute(&self, _item: &WorkItemMessage) -> Result<ExecutionOutcome> {
            *self.calls.lock() += 1;
            let mut left = self.failures_left.lock();
            if *left > 0 {
                *left -= 1;
                return Err(JobflowError::ExecutionError(
                    "connection timed out".to_string(),
                ));
            }
            Ok(ExecutionOutcome::Success(PayloadResult {
                output: serde_json::json!({"answer": 42}),
                usage: serde_json::Value::Null,
                duration_ms: 10,
            }))
        }
    }

    struct Harness {
        store: Arc<InMemoryEventStore>,
        queue: Arc<InMemoryWorkQueue>,
        runtime: Arc<WorkerRuntime>,
        events: EventBuilder,
        task_queue: String,
    }

    fn harness(executor: Arc<dyn TaskExecutor>) -> Harness {
        let config = JobflowConfig::default();
        let store = Arc::new(InMemoryEventStore::new());
        let queue = Arc::new(InMemoryWorkQueue::new());
        let events = EventBuilder::new("acme", "jobflow", "test");
        let enqueuer = TaskEnqueuer::new(
            queue.clone(),
            config.queues.task_queue.clone(),
            config.queues.reconcile_queue.clone(),
        );
        let task_queue = config.queues.task_queue.clone();
        let runtime = Arc::new(
            WorkerRuntime::new(
                store.clone(),
                queue.clone(),
                executor,
                enqueuer,
                events.clone(),
                config,
            )
            .with_retry_policy(RetryPolicy {
                max_attempts: 3,
                base_delay: std::time::Duration::from_millis(1),
                max_delay: std::time::Duration::from_millis(5),
            }),
        );
        Harness {
            store,
            queue,
            runtime,
            events,
            task_queue,
        }
    }

    fn work_item(requires_review: bool) -> WorkItemMessage {
        WorkItemMessage {
            request_id: "job-1_a".to_string(),
            job_id: Some("job-1".to_string()),
            iteration: 1,
            task: TaskDefinition {
                task_id: "a".to_string(),
                name: "task a".to_string(),
                description: "does something".to_string(),
                tag: "builder".to_string(),
                depends_on: Vec::new(),
                requires_review,
                repo: None,
                allowed_tools: None,
                max_turns: None,
                feedback_commands: None,
                input: serde_json::Value::Null,
            },
            dependency_outputs: Default::default(),
        }
    }

    async fn enqueue_and_claim(h: &Harness, item: &WorkItemMessage) -> QueueMessage {
        send_message(h.queue.as_ref(), &h.task_queue, item)
            .await
            .unwrap();
        h.queue.receive(&h.task_queue, 30).await.unwrap().unwrap()
    }

    async fn latest_type(h: &Harness, request_id: &str) -> Option<EventType> {
        h.store
            .latest_event_for_entity(EntityType::Task, request_id)
            .await
            .unwrap()
            .map(|e| e.event_type())
    }

    #[tokio::test]
    async fn test_success_emits_completed_and_acks() {
        let h = harness(StubExecutor::success());
        let message = enqueue_and_claim(&h, &work_item(false)).await;

        h.runtime.process_message(message).await;

        assert_eq!(
            latest_type(&h, "job-1_a").await,
            Some(EventType::TaskCompleted)
        );
        assert_eq!(h.queue.pending_len(&h.task_queue), 0);
        // Outcome nudges the reconcile queue.
        assert_eq!(h.queue.pending_len("jobflow_reconcile"), 1);
    }

    #[tokio::test]
    async fn test_review_task_parks_in_review() {
        let h = harness(StubExecutor::success());
        let message = enqueue_and_claim(&h, &work_item(true)).await;

        h.runtime.process_message(message).await;

        assert_eq!(
            latest_type(&h, "job-1_a").await,
            Some(EventType::TaskSubmittedForReview)
        );
        assert_eq!(h.queue.pending_len(&h.task_queue), 0);
    }

    #[tokio::test]
    async fn test_retryable_failure_leaves_message() {
        let h = harness(StubExecutor::new(ExecutionOutcome::Failure {
            message: "ECONNREFUSED upstream".to_string(),
            code: None,
        }));
        let message = enqueue_and_claim(&h, &work_item(false)).await;

        h.runtime.process_message(message).await;

        assert_eq!(
            latest_type(&h, "job-1_a").await,
            Some(EventType::TaskProcessingFailed)
        );
        assert_eq!(h.queue.pending_len(&h.task_queue), 1, "message kept");
    }

    #[tokio::test]
    async fn test_fatal_failure_is_terminal() {
        let h = harness(StubExecutor::new(ExecutionOutcome::Failure {
            message: "AccessDenied".to_string(),
            code: None,
        }));
        let message = enqueue_and_claim(&h, &work_item(false)).await;

        h.runtime.process_message(message).await;

        assert_eq!(latest_type(&h, "job-1_a").await, Some(EventType::TaskFailed));
        assert_eq!(h.queue.pending_len(&h.task_queue), 0);
    }

    #[tokio::test]
    async fn test_transient_invocation_errors_are_retried_in_process() {
        let executor = FlakyExecutor::new(2);
        let h = harness(executor.clone());
        let message = enqueue_and_claim(&h, &work_item(false)).await;

        h.runtime.process_message(message).await;

        assert_eq!(*executor.calls.lock(), 3);
        assert_eq!(
            latest_type(&h, "job-1_a").await,
            Some(EventType::TaskCompleted)
        );
        assert_eq!(h.queue.pending_len(&h.task_queue), 0);
    }

    #[tokio::test]
    async fn test_exhausted_invocation_retries_leave_message() {
        let executor = FlakyExecutor::new(10);
        let h = harness(executor.clone());
        let message = enqueue_and_claim(&h, &work_item(false)).await;

        h.runtime.process_message(message).await;

        assert_eq!(*executor.calls.lock(), 3, "attempt budget respected");
        // The exhausted error is still classified transient, so the message
        // stays for queue-level redelivery.
        assert_eq!(
            latest_type(&h, "job-1_a").await,
            Some(EventType::TaskProcessingFailed)
        );
        assert_eq!(h.queue.pending_len(&h.task_queue), 1);
    }

    #[tokio::test]
    async fn test_timeout_is_terminal() {
        let h = harness(StubExecutor::new(ExecutionOutcome::Timeout {
            timeout_ms: 5_000,
            elapsed_ms: 5_100,
            signal: "SIGKILL".to_string(),
        }));
        let message = enqueue_and_claim(&h, &work_item(false)).await;

        h.runtime.process_message(message).await;

        assert_eq!(
            latest_type(&h, "job-1_a").await,
            Some(EventType::TaskTimeout)
        );
        assert_eq!(h.queue.pending_len(&h.task_queue), 0);
    }

    #[tokio::test]
    async fn test_terminal_task_is_skipped_and_acked() {
        let h = harness(StubExecutor::success());
        let item = work_item(false);
        let completed = h.events.task_event(
            &item.request_id,
            "worker-other",
            EventPayload::TaskCompleted {
                request_id: item.request_id.clone(),
                job_id: item.job_id.clone(),
                iteration: 1,
                output: serde_json::Value::Null,
                duration_ms: 1,
                exit_code: 0,
                usage: serde_json::Value::Null,
            },
        );
        h.store.append(completed).await.unwrap();
        let events_before = h.store.len();

        let message = enqueue_and_claim(&h, &item).await;
        h.runtime.process_message(message).await;

        assert_eq!(h.store.len(), events_before, "no reprocessing");
        assert_eq!(h.queue.pending_len(&h.task_queue), 0, "message acked");
    }

    #[tokio::test]
    async fn test_live_lease_defers_without_ack() {
        let h = harness(StubExecutor::success());
        let item = work_item(false);
        let lease = h.events.task_event(
            &item.request_id,
            "worker-other",
            EventPayload::TaskProcessingStarted {
                request_id: item.request_id.clone(),
                job_id: item.job_id.clone(),
                effective_until: Utc::now().timestamp() + 60,
                worker_id: "worker-other".to_string(),
            },
        );
        h.store.append(lease).await.unwrap();
        let events_before = h.store.len();

        let message = enqueue_and_claim(&h, &item).await;
        h.runtime.process_message(message).await;

        assert_eq!(h.store.len(), events_before);
        assert_eq!(h.queue.pending_len(&h.task_queue), 1, "message left to visibility");
    }

    #[tokio::test]
    async fn test_expired_lease_is_reclaimed() {
        let h = harness(StubExecutor::success());
        let item = work_item(false);
        let stale = h.events.task_event(
            &item.request_id,
            "worker-other",
            EventPayload::TaskProcessingStarted {
                request_id: item.request_id.clone(),
                job_id: item.job_id.clone(),
                effective_until: Utc::now().timestamp() - 60,
                worker_id: "worker-other".to_string(),
            },
        );
        h.store.append(stale).await.unwrap();

        let message = enqueue_and_claim(&h, &item).await;
        h.runtime.process_message(message).await;

        assert_eq!(
            latest_type(&h, &item.request_id).await,
            Some(EventType::TaskCompleted)
        );
    }

    #[tokio::test]
    async fn test_invalid_request_id_fails_fatally() {
        let h = harness(StubExecutor::success());
        let mut item = work_item(false);
        item.request_id = "not a valid id!".to_string();

        let message = enqueue_and_claim(&h, &item).await;
        h.runtime.process_message(message).await;

        assert_eq!(
            latest_type(&h, "not a valid id!").await,
            Some(EventType::TaskFailed)
        );
        assert_eq!(h.queue.pending_len(&h.task_queue), 0);
    }

    #[tokio::test]
    async fn test_delivery_cap_dead_letters() {
        let h = harness(StubExecutor::success());
        let item = work_item(false);
        send_message(h.queue.as_ref(), &h.task_queue, &item)
            .await
            .unwrap();

        // Redeliver past the cap.
        let mut message = h.queue.receive(&h.task_queue, 30).await.unwrap().unwrap();
        for _ in 0..3 {
            h.queue.expire_visibility(&h.task_queue);
            message = h.queue.receive(&h.task_queue, 30).await.unwrap().unwrap();
        }
        assert!(message.read_count > 3);

        h.runtime.process_message(message).await;

        assert_eq!(
            latest_type(&h, &item.request_id).await,
            Some(EventType::TaskFailed)
        );
        assert_eq!(h.queue.archived_len(&h.task_queue), 1);
        assert_eq!(h.queue.pending_len(&h.task_queue), 0);
    }

    #[tokio::test]
    async fn test_iteration_cap_fails_fatally() {
        let h = harness(StubExecutor::success());
        let mut item = work_item(false);
        item.iteration = 6;

        let message = enqueue_and_claim(&h, &item).await;
        h.runtime.process_message(message).await;

        assert_eq!(
            latest_type(&h, &item.request_id).await,
            Some(EventType::TaskFailed)
        );
        assert_eq!(h.queue.pending_len(&h.task_queue), 0);
    }

    #[tokio::test]
    async fn test_lease_event_written_before_execution() {
        let h = harness(StubExecutor::success());
        let item = work_item(false);
        let message = enqueue_and_claim(&h, &item).await;
        h.runtime.process_message(message).await;

        let history = h
            .store
            .events_for_entity(EntityType::Task, &item.request_id)
            .await
            .unwrap();
        let types: Vec<EventType> = history.iter().map(|e| e.event_type()).collect();
        assert_eq!(
            types,
            vec![EventType::TaskProcessingStarted, EventType::TaskCompleted]
        );
        let EventPayload::TaskProcessingStarted {
            effective_until, ..
        } = &history[0].payload
        else {
            panic!("expected lease event");
        };
        assert!(*effective_until > Utc::now().timestamp());
    }
}
