//! # Dispatcher
//!
//! Stateless reconciliation of one job's frontier. Triggered by nudges on
//! the reconcile queue (sent by the API after creation/append and by
//! workers after every outcome event), and safe to re-run any number of
//! times on an unchanged log: the `waiting`-only dispatch filter plus
//! read-after-write consistency on each task's partition make emission
//! idempotent.
//!
//! A failed pass is not repaired; the nudge stays on the queue and the
//! whole computation re-runs on redelivery.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::error::{JobflowError, Result};
use crate::event_store::EventStore;
use crate::events::{EntityType, Event, EventBuilder, EventPayload, EventType};
use crate::messaging::{QueueMessage, ReconcileMessage, WorkItemMessage, WorkQueue};
use crate::models::TaskDefinition;

use super::enqueuer::TaskEnqueuer;
use super::projection::{task_status, JobStatus, TaskStatus};

const SOURCE: &str = "dispatcher";

/// Event-store entity id for one task of one job. Task ids are only unique
/// within their job, so the queue correlation id namespaces them.
pub fn request_id_for(job_id: &str, task_id: &str) -> String {
    format!("{job_id}_{task_id}")
}

/// What one reconciliation pass did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileSummary {
    /// Task ids dispatched (or re-dispatched after a revision request).
    pub dispatched: Vec<String>,
    pub job_completed: bool,
    pub failure_detected: bool,
}

pub struct Dispatcher {
    store: Arc<dyn EventStore>,
    queue: Arc<dyn WorkQueue>,
    enqueuer: TaskEnqueuer,
    events: EventBuilder,
    reconcile_queue: String,
    reconcile_visibility_seconds: u32,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn EventStore>,
        queue: Arc<dyn WorkQueue>,
        enqueuer: TaskEnqueuer,
        events: EventBuilder,
        reconcile_queue: impl Into<String>,
        reconcile_visibility_seconds: u32,
    ) -> Self {
        Self {
            store,
            queue,
            enqueuer,
            events,
            reconcile_queue: reconcile_queue.into(),
            reconcile_visibility_seconds,
        }
    }

    /// Receive and process one reconcile nudge. Returns `false` when the
    /// queue was empty. A failed pass leaves the nudge for redelivery.
    pub async fn run_once(&self) -> Result<bool> {
        let Some(message) = self
            .queue
            .receive(&self.reconcile_queue, self.reconcile_visibility_seconds)
            .await?
        else {
            return Ok(false);
        };
        self.process_nudge(message).await;
        Ok(true)
    }

    async fn process_nudge(&self, message: QueueMessage) {
        let nudge: ReconcileMessage = match message.parse() {
            Ok(nudge) => nudge,
            Err(e) => {
                warn!(msg_id = message.msg_id, error = %e, "Dropping malformed reconcile nudge");
                if let Err(e) = self.queue.delete(&self.reconcile_queue, message.msg_id).await {
                    warn!(msg_id = message.msg_id, error = %e, "Failed to delete malformed nudge");
                }
                return;
            }
        };

        match self.reconcile(&nudge.job_id).await {
            Ok(_) => {
                if let Err(e) = self.queue.delete(&self.reconcile_queue, message.msg_id).await {
                    warn!(msg_id = message.msg_id, error = %e, "Failed to ack reconcile nudge");
                }
            }
            Err(e) => {
                // Leave the nudge; visibility expiry redelivers it and the
                // whole pass re-runs.
                warn!(job_id = %nudge.job_id, error = %e, "Reconciliation pass failed");
            }
        }
    }

    /// One full reconciliation pass over a job.
    #[instrument(skip(self), fields(job_id = %job_id))]
    pub async fn reconcile(&self, job_id: &str) -> Result<ReconcileSummary> {
        let mut summary = ReconcileSummary::default();

        let Some(snapshot) = self
            .store
            .latest_event_of_type_for_entity(EntityType::Job, job_id, EventType::JobSaved)
            .await?
        else {
            warn!("Reconcile nudge for unknown job");
            return Ok(summary);
        };
        let EventPayload::JobSaved { tasks, .. } = &snapshot.payload else {
            return Err(JobflowError::EventStoreError(format!(
                "job {job_id} snapshot carries a non-snapshot payload"
            )));
        };

        // Latest event per task drives everything below.
        let mut latest_events: BTreeMap<String, Option<Event>> = BTreeMap::new();
        for task in tasks {
            let latest = self
                .store
                .latest_event_for_entity(EntityType::Task, &request_id_for(job_id, &task.task_id))
                .await?;
            latest_events.insert(task.task_id.clone(), latest);
        }
        let statuses: BTreeMap<String, TaskStatus> = latest_events
            .iter()
            .map(|(id, latest)| (id.clone(), task_status(latest.as_ref())))
            .collect();

        summary.failure_detected = self
            .detect_failure(job_id, tasks, &statuses)
            .await?;

        for task in tasks {
            let dispatch = self.dispatch_plan(task, &statuses, &latest_events);
            if let Some(iteration) = dispatch {
                self.dispatch_task(job_id, task, iteration).await?;
                summary.dispatched.push(task.task_id.clone());
            }
        }

        summary.job_completed = self.complete_if_done(job_id, tasks, &statuses).await?;

        debug!(
            dispatched = summary.dispatched.len(),
            job_completed = summary.job_completed,
            "Reconciliation pass finished"
        );
        Ok(summary)
    }

    /// Emit `Job Failure Detected` once per job, naming the first failed
    /// task. Dispatch of independent branches continues regardless.
    async fn detect_failure(
        &self,
        job_id: &str,
        tasks: &[TaskDefinition],
        statuses: &BTreeMap<String, TaskStatus>,
    ) -> Result<bool> {
        let first_failed = tasks
            .iter()
            .find(|t| statuses[&t.task_id] == TaskStatus::Failed);
        let Some(failed) = first_failed else {
            return Ok(false);
        };

        let already_detected = self
            .store
            .latest_event_of_type_for_entity(EntityType::Job, job_id, EventType::JobFailureDetected)
            .await?
            .is_some();
        if already_detected {
            return Ok(true);
        }

        info!(failed_task_id = %failed.task_id, "Job failure detected");
        let event = self.events.job_event(
            job_id,
            SOURCE,
            EventPayload::JobFailureDetected {
                job_id: job_id.to_string(),
                failed_task_id: failed.task_id.clone(),
                task_statuses: status_snapshot(statuses),
            },
        );
        self.store.append(event).await?;
        Ok(true)
    }

    /// Decide whether a task gets dispatched this pass, and at which
    /// iteration. `waiting` tasks with fully completed dependencies start
    /// at iteration 1; tasks sent back by a reviewer re-dispatch at the
    /// next iteration (the reviewer's event already projects to `pending`,
    /// so this fires at most once per revision request).
    fn dispatch_plan(
        &self,
        task: &TaskDefinition,
        statuses: &BTreeMap<String, TaskStatus>,
        latest_events: &BTreeMap<String, Option<Event>>,
    ) -> Option<u32> {
        match statuses[&task.task_id] {
            TaskStatus::Waiting => {
                let ready = task
                    .depends_on
                    .iter()
                    .all(|dep| statuses.get(dep) == Some(&TaskStatus::Completed));
                ready.then_some(1)
            }
            TaskStatus::Pending => match latest_events[&task.task_id].as_ref()?.payload {
                EventPayload::TaskRevisionRequested { iteration, .. } => Some(iteration + 1),
                _ => None,
            },
            _ => None,
        }
    }

    /// Append the `Task Pending` event and forward the work item to the
    /// task queue.
    async fn dispatch_task(
        &self,
        job_id: &str,
        task: &TaskDefinition,
        iteration: u32,
    ) -> Result<()> {
        let request_id = request_id_for(job_id, &task.task_id);
        let dependency_outputs = self.collect_dependency_outputs(job_id, task).await?;

        info!(task_id = %task.task_id, iteration = iteration, "Dispatching task");
        let event = self.events.task_event(
            &request_id,
            SOURCE,
            EventPayload::TaskPending {
                request_id: request_id.clone(),
                job_id: Some(job_id.to_string()),
                iteration,
                task: task.clone(),
                dependency_outputs: dependency_outputs.clone(),
            },
        );
        self.store.append(event).await?;

        self.enqueuer
            .enqueue_work_item(&WorkItemMessage {
                request_id,
                job_id: Some(job_id.to_string()),
                iteration,
                task: task.clone(),
                dependency_outputs,
            })
            .await?;
        Ok(())
    }

    /// For each dependency, the output of its last review submission if it
    /// was ever reviewed, else of its completion event.
    async fn collect_dependency_outputs(
        &self,
        job_id: &str,
        task: &TaskDefinition,
    ) -> Result<BTreeMap<String, serde_json::Value>> {
        let mut outputs = BTreeMap::new();
        for dep in &task.depends_on {
            let dep_request_id = request_id_for(job_id, dep);
            let mut bearing = self
                .store
                .latest_event_of_type_for_entity(
                    EntityType::Task,
                    &dep_request_id,
                    EventType::TaskSubmittedForReview,
                )
                .await?;
            if bearing.is_none() {
                bearing = self
                    .store
                    .latest_event_of_type_for_entity(
                        EntityType::Task,
                        &dep_request_id,
                        EventType::TaskCompleted,
                    )
                    .await?;
            }
            if let Some(output) = bearing.as_ref().and_then(|e| e.payload.output()) {
                outputs.insert(dep.clone(), output.clone());
            }
        }
        Ok(outputs)
    }

    /// Emit `Job Completed` once when every task has completed.
    async fn complete_if_done(
        &self,
        job_id: &str,
        tasks: &[TaskDefinition],
        statuses: &BTreeMap<String, TaskStatus>,
    ) -> Result<bool> {
        let all_completed = statuses.values().all(|s| *s == TaskStatus::Completed);
        if !all_completed {
            return Ok(false);
        }

        let already_completed = self
            .store
            .latest_event_of_type_for_entity(EntityType::Job, job_id, EventType::JobCompleted)
            .await?
            .is_some();
        if already_completed {
            return Ok(true);
        }

        info!(total_tasks = tasks.len(), "Job completed");
        let event = self.events.job_event(
            job_id,
            SOURCE,
            EventPayload::JobCompleted {
                job_id: job_id.to_string(),
                total_tasks: tasks.len(),
                task_statuses: status_snapshot(statuses),
            },
        );
        self.store.append(event).await?;
        Ok(true)
    }

    /// Derived job status from the guards already evaluated in a pass.
    pub async fn job_status(&self, job_id: &str) -> Result<JobStatus> {
        let completed = self
            .store
            .latest_event_of_type_for_entity(EntityType::Job, job_id, EventType::JobCompleted)
            .await?
            .is_some();
        let failure = self
            .store
            .latest_event_of_type_for_entity(EntityType::Job, job_id, EventType::JobFailureDetected)
            .await?
            .is_some();
        Ok(JobStatus::derive(completed, failure))
    }
}

fn status_snapshot(statuses: &BTreeMap<String, TaskStatus>) -> BTreeMap<String, String> {
    statuses
        .iter()
        .map(|(id, status)| (id.clone(), status.as_str().to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_store::InMemoryEventStore;
    use crate::messaging::InMemoryWorkQueue;

    const TASK_QUEUE: &str = "tasks";
    const RECONCILE_QUEUE: &str = "reconcile";

    struct Harness {
        store: Arc<InMemoryEventStore>,
        queue: Arc<InMemoryWorkQueue>,
        dispatcher: Dispatcher,
        events: EventBuilder,
    }

    fn harness() -> Harness {
        let store = Arc::new(InMemoryEventStore::new());
        let queue = Arc::new(InMemoryWorkQueue::new());
        let events = EventBuilder::new("acme", "jobflow", "test");
        let enqueuer = TaskEnqueuer::new(queue.clone(), TASK_QUEUE, RECONCILE_QUEUE);
        let dispatcher = Dispatcher::new(
            store.clone() as Arc<dyn EventStore>,
            queue.clone() as Arc<dyn WorkQueue>,
            enqueuer,
            events.clone(),
            RECONCILE_QUEUE,
            30,
        );
        Harness {
            store,
            queue,
            dispatcher,
            events,
        }
    }

    fn task(id: &str, deps: &[&str]) -> TaskDefinition {
        TaskDefinition {
            task_id: id.to_string(),
            name: format!("task {id}"),
            description: "does something".to_string(),
            tag: "builder".to_string(),
            depends_on: deps.iter().map(|s| s.to_string()).collect(),
            requires_review: false,
            repo: None,
            allowed_tools: None,
            max_turns: None,
            feedback_commands: None,
            input: serde_json::Value::Null,
        }
    }

    async fn save_job(h: &Harness, job_id: &str, tasks: Vec<TaskDefinition>) {
        let total = tasks.len();
        let event = h.events.job_event(
            job_id,
            "api",
            EventPayload::JobSaved {
                job_id: job_id.to_string(),
                tasks,
                total_tasks: total,
            },
        );
        h.store.append(event).await.unwrap();
    }

    async fn complete_task(h: &Harness, job_id: &str, task_id: &str, output: serde_json::Value) {
        let request_id = request_id_for(job_id, task_id);
        let event = h.events.task_event(
            &request_id,
            "worker-1",
            EventPayload::TaskCompleted {
                request_id: request_id.clone(),
                job_id: Some(job_id.to_string()),
                iteration: 1,
                output,
                duration_ms: 10,
                exit_code: 0,
                usage: serde_json::Value::Null,
            },
        );
        h.store.append(event).await.unwrap();
    }

    async fn fail_task(h: &Harness, job_id: &str, task_id: &str) {
        let request_id = request_id_for(job_id, task_id);
        let event = h.events.task_event(
            &request_id,
            "worker-1",
            EventPayload::TaskFailed {
                request_id: request_id.clone(),
                job_id: Some(job_id.to_string()),
                error: "boom".to_string(),
                error_category: "unknown".to_string(),
                retry_count: 0,
                source: "worker".to_string(),
            },
        );
        h.store.append(event).await.unwrap();
    }

    #[tokio::test]
    async fn test_roots_dispatch_then_dependents_then_completion() {
        let h = harness();
        save_job(&h, "job-1", vec![task("a", &[]), task("b", &["a"])]).await;

        let pass = h.dispatcher.reconcile("job-1").await.unwrap();
        assert_eq!(pass.dispatched, vec!["a"]);
        assert_eq!(h.queue.pending_len(TASK_QUEUE), 1);

        complete_task(&h, "job-1", "a", serde_json::json!({"artifact": "a.out"})).await;
        let pass = h.dispatcher.reconcile("job-1").await.unwrap();
        assert_eq!(pass.dispatched, vec!["b"]);
        assert!(!pass.job_completed);

        // b's work item carries a's output keyed by dependency id.
        let message = h.queue.receive(TASK_QUEUE, 30).await.unwrap().unwrap();
        let _ = h.queue.receive(TASK_QUEUE, 30).await.unwrap().unwrap();
        let item: WorkItemMessage = message.parse().unwrap();
        assert_eq!(item.task.task_id, "a");

        complete_task(&h, "job-1", "b", serde_json::Value::Null).await;
        let pass = h.dispatcher.reconcile("job-1").await.unwrap();
        assert!(pass.job_completed);
        assert_eq!(
            h.dispatcher.job_status("job-1").await.unwrap(),
            JobStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_dependency_outputs_assembled_for_ready_task() {
        let h = harness();
        save_job(&h, "job-1", vec![task("a", &[]), task("b", &["a"])]).await;
        h.dispatcher.reconcile("job-1").await.unwrap();
        complete_task(&h, "job-1", "a", serde_json::json!({"artifact": "a.out"})).await;
        h.dispatcher.reconcile("job-1").await.unwrap();

        let pending = h
            .store
            .latest_event_for_entity(EntityType::Task, &request_id_for("job-1", "b"))
            .await
            .unwrap()
            .unwrap();
        let EventPayload::TaskPending {
            dependency_outputs, ..
        } = &pending.payload
        else {
            panic!("expected a dispatch event, got {:?}", pending.event_type());
        };
        assert_eq!(
            dependency_outputs["a"],
            serde_json::json!({"artifact": "a.out"})
        );
    }

    #[tokio::test]
    async fn test_reconcile_is_idempotent_on_unchanged_log() {
        let h = harness();
        save_job(&h, "job-1", vec![task("a", &[]), task("b", &["a"])]).await;

        h.dispatcher.reconcile("job-1").await.unwrap();
        let events_after_first = h.store.len();

        let pass = h.dispatcher.reconcile("job-1").await.unwrap();
        assert!(pass.dispatched.is_empty());
        assert_eq!(h.store.len(), events_after_first);
    }

    #[tokio::test]
    async fn test_failure_detected_once_and_branches_continue() {
        let h = harness();
        save_job(
            &h,
            "job-1",
            vec![task("a", &[]), task("b", &[]), task("c", &["b"])],
        )
        .await;
        h.dispatcher.reconcile("job-1").await.unwrap();

        fail_task(&h, "job-1", "a").await;
        complete_task(&h, "job-1", "b", serde_json::Value::Null).await;

        let pass = h.dispatcher.reconcile("job-1").await.unwrap();
        assert!(pass.failure_detected);
        // The independent branch keeps flowing.
        assert_eq!(pass.dispatched, vec!["c"]);

        let events_before = h.store.len();
        let pass = h.dispatcher.reconcile("job-1").await.unwrap();
        assert!(pass.failure_detected);
        assert_eq!(h.store.len(), events_before, "failure event emitted once");
        assert_eq!(
            h.dispatcher.job_status("job-1").await.unwrap(),
            JobStatus::PartialFailure
        );
    }

    #[tokio::test]
    async fn test_revision_requested_redispatches_next_iteration() {
        let h = harness();
        save_job(&h, "job-1", vec![task("a", &[])]).await;
        h.dispatcher.reconcile("job-1").await.unwrap();

        let request_id = request_id_for("job-1", "a");
        let event = h.events.task_event(
            &request_id,
            "reviewer",
            EventPayload::TaskRevisionRequested {
                request_id: request_id.clone(),
                job_id: Some("job-1".to_string()),
                iteration: 1,
                feedback: "tighten the output".to_string(),
            },
        );
        h.store.append(event).await.unwrap();

        let pass = h.dispatcher.reconcile("job-1").await.unwrap();
        assert_eq!(pass.dispatched, vec!["a"]);

        let latest = h
            .store
            .latest_event_for_entity(EntityType::Task, &request_id)
            .await
            .unwrap()
            .unwrap();
        let EventPayload::TaskPending { iteration, .. } = latest.payload else {
            panic!("expected redispatch");
        };
        assert_eq!(iteration, 2);

        // The fresh dispatch event guards against a second redispatch.
        let events_before = h.store.len();
        let pass = h.dispatcher.reconcile("job-1").await.unwrap();
        assert!(pass.dispatched.is_empty());
        assert_eq!(h.store.len(), events_before);
    }

    #[tokio::test]
    async fn test_unknown_job_nudge_is_a_noop() {
        let h = harness();
        let pass = h.dispatcher.reconcile("job-ghost").await.unwrap();
        assert_eq!(pass, ReconcileSummary::default());
    }

    #[tokio::test]
    async fn test_run_once_acks_nudge_on_success() {
        let h = harness();
        save_job(&h, "job-1", vec![task("a", &[])]).await;
        h.dispatcher
            .enqueuer
            .nudge_reconcile("job-1")
            .await
            .unwrap();

        assert!(h.dispatcher.run_once().await.unwrap());
        assert_eq!(h.queue.pending_len(RECONCILE_QUEUE), 0);
        assert!(!h.dispatcher.run_once().await.unwrap());
    }
}
