//! # Domain Events
//!
//! Immutable, append-only events are the single source of truth: every piece
//! of runtime state (task status, job status, leases) is derived from them.
//!
//! The event payload is a tagged union keyed by the event type, one shape per
//! type. That gives the status-derivation table in
//! [`crate::orchestration::projection`] compile-time coverage: adding an
//! event type without deciding its derived status is a compile error.
//!
//! Wire names ("Task Pending", "Job Saved", ...) are part of the stored
//! format and must not change.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::TaskDefinition;

/// Kind of entity an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityType {
    #[serde(rename = "TASK")]
    Task,
    #[serde(rename = "JOB")]
    Job,
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Task => write!(f, "TASK"),
            Self::Job => write!(f, "JOB"),
        }
    }
}

impl std::str::FromStr for EntityType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TASK" => Ok(Self::Task),
            "JOB" => Ok(Self::Job),
            _ => Err(format!("Invalid entity type: {s}")),
        }
    }
}

/// Every event type the system emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "Job Saved")]
    JobSaved,
    #[serde(rename = "Job Completed")]
    JobCompleted,
    #[serde(rename = "Job Failure Detected")]
    JobFailureDetected,
    #[serde(rename = "Task Saved")]
    TaskSaved,
    #[serde(rename = "Task Pending")]
    TaskPending,
    #[serde(rename = "Task Processing Started")]
    TaskProcessingStarted,
    #[serde(rename = "Task Processing Failed")]
    TaskProcessingFailed,
    #[serde(rename = "Task Updated")]
    TaskUpdated,
    #[serde(rename = "Task Heartbeat")]
    TaskHeartbeat,
    #[serde(rename = "Task Submitted For Review")]
    TaskSubmittedForReview,
    #[serde(rename = "Task Revision Requested")]
    TaskRevisionRequested,
    #[serde(rename = "Task Approved")]
    TaskApproved,
    #[serde(rename = "Task Completed")]
    TaskCompleted,
    #[serde(rename = "Task Failed")]
    TaskFailed,
    #[serde(rename = "Task Timeout")]
    TaskTimeout,
}

impl EventType {
    /// Stored wire name of this event type.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::JobSaved => "Job Saved",
            Self::JobCompleted => "Job Completed",
            Self::JobFailureDetected => "Job Failure Detected",
            Self::TaskSaved => "Task Saved",
            Self::TaskPending => "Task Pending",
            Self::TaskProcessingStarted => "Task Processing Started",
            Self::TaskProcessingFailed => "Task Processing Failed",
            Self::TaskUpdated => "Task Updated",
            Self::TaskHeartbeat => "Task Heartbeat",
            Self::TaskSubmittedForReview => "Task Submitted For Review",
            Self::TaskRevisionRequested => "Task Revision Requested",
            Self::TaskApproved => "Task Approved",
            Self::TaskCompleted => "Task Completed",
            Self::TaskFailed => "Task Failed",
            Self::TaskTimeout => "Task Timeout",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Job Saved" => Ok(Self::JobSaved),
            "Job Completed" => Ok(Self::JobCompleted),
            "Job Failure Detected" => Ok(Self::JobFailureDetected),
            "Task Saved" => Ok(Self::TaskSaved),
            "Task Pending" => Ok(Self::TaskPending),
            "Task Processing Started" => Ok(Self::TaskProcessingStarted),
            "Task Processing Failed" => Ok(Self::TaskProcessingFailed),
            "Task Updated" => Ok(Self::TaskUpdated),
            "Task Heartbeat" => Ok(Self::TaskHeartbeat),
            "Task Submitted For Review" => Ok(Self::TaskSubmittedForReview),
            "Task Revision Requested" => Ok(Self::TaskRevisionRequested),
            "Task Approved" => Ok(Self::TaskApproved),
            "Task Completed" => Ok(Self::TaskCompleted),
            "Task Failed" => Ok(Self::TaskFailed),
            "Task Timeout" => Ok(Self::TaskTimeout),
            _ => Err(format!("Invalid event type: {s}")),
        }
    }
}

/// Event-type-specific payload, serialized as
/// `{"eventType": "...", "properties": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "eventType", content = "properties")]
pub enum EventPayload {
    /// Full DAG snapshot for a job. Rewritten (old + new tasks) on append.
    #[serde(rename = "Job Saved", rename_all = "camelCase")]
    JobSaved {
        job_id: String,
        tasks: Vec<TaskDefinition>,
        total_tasks: usize,
    },

    #[serde(rename = "Job Completed", rename_all = "camelCase")]
    JobCompleted {
        job_id: String,
        total_tasks: usize,
        task_statuses: BTreeMap<String, String>,
    },

    /// Emitted once per job when the first task failure is observed.
    /// Dispatch of independent branches continues afterwards.
    #[serde(rename = "Job Failure Detected", rename_all = "camelCase")]
    JobFailureDetected {
        job_id: String,
        failed_task_id: String,
        task_statuses: BTreeMap<String, String>,
    },

    /// Definition snapshot per task, written at creation/append time.
    /// History-only: never consulted for status.
    #[serde(rename = "Task Saved", rename_all = "camelCase")]
    TaskSaved {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        job_id: Option<String>,
        task: TaskDefinition,
    },

    /// The dispatch event: the task leaves `waiting` and becomes eligible
    /// for worker consumption, carrying its assembled dependency context.
    #[serde(rename = "Task Pending", rename_all = "camelCase")]
    TaskPending {
        request_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        job_id: Option<String>,
        iteration: u32,
        task: TaskDefinition,
        dependency_outputs: BTreeMap<String, serde_json::Value>,
    },

    /// Lease acquisition: `effective_until` is the lease expiry in epoch
    /// seconds.
    #[serde(rename = "Task Processing Started", rename_all = "camelCase")]
    TaskProcessingStarted {
        request_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        job_id: Option<String>,
        effective_until: i64,
        worker_id: String,
    },

    /// Transient failure; the message stays on the queue for redelivery.
    #[serde(rename = "Task Processing Failed", rename_all = "camelCase")]
    TaskProcessingFailed {
        request_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        job_id: Option<String>,
        attempt_number: i32,
        error: String,
        error_category: String,
    },

    /// History-only progress note from the payload runtime.
    #[serde(rename = "Task Updated", rename_all = "camelCase")]
    TaskUpdated {
        request_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        job_id: Option<String>,
        detail: serde_json::Value,
    },

    /// Lease renewal: refreshed `effective_until` plus liveness telemetry.
    #[serde(rename = "Task Heartbeat", rename_all = "camelCase")]
    TaskHeartbeat {
        request_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        job_id: Option<String>,
        effective_until: i64,
        heartbeat_number: u32,
        elapsed_ms: u64,
        worker_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_activity: Option<String>,
    },

    #[serde(rename = "Task Submitted For Review", rename_all = "camelCase")]
    TaskSubmittedForReview {
        request_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        job_id: Option<String>,
        iteration: u32,
        output: serde_json::Value,
        summary: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        repo: Option<String>,
        duration_ms: u64,
        usage: serde_json::Value,
    },

    /// Reviewer sends the task back for another iteration.
    #[serde(rename = "Task Revision Requested", rename_all = "camelCase")]
    TaskRevisionRequested {
        request_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        job_id: Option<String>,
        iteration: u32,
        feedback: String,
    },

    #[serde(rename = "Task Approved", rename_all = "camelCase")]
    TaskApproved {
        request_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        job_id: Option<String>,
    },

    #[serde(rename = "Task Completed", rename_all = "camelCase")]
    TaskCompleted {
        request_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        job_id: Option<String>,
        iteration: u32,
        output: serde_json::Value,
        duration_ms: u64,
        exit_code: i32,
        usage: serde_json::Value,
    },

    #[serde(rename = "Task Failed", rename_all = "camelCase")]
    TaskFailed {
        request_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        job_id: Option<String>,
        error: String,
        error_category: String,
        retry_count: i32,
        source: String,
    },

    #[serde(rename = "Task Timeout", rename_all = "camelCase")]
    TaskTimeout {
        request_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        job_id: Option<String>,
        timeout_ms: u64,
        elapsed_ms: u64,
        signal: String,
    },
}

impl EventPayload {
    /// Event type tag for this payload.
    pub fn event_type(&self) -> EventType {
        match self {
            Self::JobSaved { .. } => EventType::JobSaved,
            Self::JobCompleted { .. } => EventType::JobCompleted,
            Self::JobFailureDetected { .. } => EventType::JobFailureDetected,
            Self::TaskSaved { .. } => EventType::TaskSaved,
            Self::TaskPending { .. } => EventType::TaskPending,
            Self::TaskProcessingStarted { .. } => EventType::TaskProcessingStarted,
            Self::TaskProcessingFailed { .. } => EventType::TaskProcessingFailed,
            Self::TaskUpdated { .. } => EventType::TaskUpdated,
            Self::TaskHeartbeat { .. } => EventType::TaskHeartbeat,
            Self::TaskSubmittedForReview { .. } => EventType::TaskSubmittedForReview,
            Self::TaskRevisionRequested { .. } => EventType::TaskRevisionRequested,
            Self::TaskApproved { .. } => EventType::TaskApproved,
            Self::TaskCompleted { .. } => EventType::TaskCompleted,
            Self::TaskFailed { .. } => EventType::TaskFailed,
            Self::TaskTimeout { .. } => EventType::TaskTimeout,
        }
    }

    /// Job this event belongs to, when it names one. Standalone tasks have
    /// no orchestration and no job id.
    pub fn job_id(&self) -> Option<&str> {
        match self {
            Self::JobSaved { job_id, .. }
            | Self::JobCompleted { job_id, .. }
            | Self::JobFailureDetected { job_id, .. } => Some(job_id.as_str()),
            Self::TaskSaved { job_id, .. }
            | Self::TaskPending { job_id, .. }
            | Self::TaskProcessingStarted { job_id, .. }
            | Self::TaskProcessingFailed { job_id, .. }
            | Self::TaskUpdated { job_id, .. }
            | Self::TaskHeartbeat { job_id, .. }
            | Self::TaskSubmittedForReview { job_id, .. }
            | Self::TaskRevisionRequested { job_id, .. }
            | Self::TaskApproved { job_id, .. }
            | Self::TaskCompleted { job_id, .. }
            | Self::TaskFailed { job_id, .. }
            | Self::TaskTimeout { job_id, .. } => job_id.as_deref(),
        }
    }

    /// Lease expiry embedded in this event, if it carries one.
    pub fn effective_until(&self) -> Option<i64> {
        match self {
            Self::TaskProcessingStarted {
                effective_until, ..
            }
            | Self::TaskHeartbeat {
                effective_until, ..
            } => Some(*effective_until),
            _ => None,
        }
    }

    /// Structured output for dependency context assembly. Only review
    /// submissions and completions bear output.
    pub fn output(&self) -> Option<&serde_json::Value> {
        match self {
            Self::TaskSubmittedForReview { output, .. } | Self::TaskCompleted { output, .. } => {
                Some(output)
            }
            _ => None,
        }
    }
}

/// Provenance recorded on every event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventContext {
    /// Component that emitted the event ("api", "dispatcher", worker id...).
    pub source: String,
    pub environment: String,
    pub origin: String,
}

/// An immutable domain event. Never mutated or deleted after append.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub event_id: Uuid,
    pub tenant_id: String,
    pub entity_type: EntityType,
    pub entity_id: String,
    /// Ordering key. The store breaks ties by insertion order.
    pub timestamp: DateTime<Utc>,
    pub context: EventContext,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl Event {
    pub fn event_type(&self) -> EventType {
        self.payload.event_type()
    }
}

/// Stamps events with tenant/app provenance. One per process, injected into
/// every component that emits.
#[derive(Debug, Clone)]
pub struct EventBuilder {
    tenant_id: String,
    app_name: String,
    environment: String,
}

impl EventBuilder {
    pub fn new(
        tenant_id: impl Into<String>,
        app_name: impl Into<String>,
        environment: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            app_name: app_name.into(),
            environment: environment.into(),
        }
    }

    /// Build an event from a payload, stamping tenant, timestamp, and
    /// provenance. `source` names the emitting component.
    pub fn build(
        &self,
        entity_type: EntityType,
        entity_id: impl Into<String>,
        source: impl Into<String>,
        payload: EventPayload,
    ) -> Event {
        Event {
            event_id: Uuid::new_v4(),
            tenant_id: self.tenant_id.clone(),
            entity_type,
            entity_id: entity_id.into(),
            timestamp: Utc::now(),
            context: EventContext {
                source: source.into(),
                environment: self.environment.clone(),
                origin: self.app_name.clone(),
            },
            payload,
        }
    }

    pub fn task_event(
        &self,
        task_id: impl Into<String>,
        source: impl Into<String>,
        payload: EventPayload,
    ) -> Event {
        self.build(EntityType::Task, task_id, source, payload)
    }

    pub fn job_event(
        &self,
        job_id: impl Into<String>,
        source: impl Into<String>,
        payload: EventPayload,
    ) -> Event {
        self.build(EntityType::Job, job_id, source, payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder() -> EventBuilder {
        EventBuilder::new("acme", "jobflow", "test")
    }

    #[test]
    fn test_payload_wire_format() {
        let payload = EventPayload::TaskProcessingStarted {
            request_id: "t1".to_string(),
            job_id: Some("job-1".to_string()),
            effective_until: 1_700_000_045,
            worker_id: "worker-42".to_string(),
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["eventType"], "Task Processing Started");
        assert_eq!(json["properties"]["effectiveUntil"], 1_700_000_045i64);
        assert_eq!(json["properties"]["workerId"], "worker-42");
    }

    #[test]
    fn test_event_round_trip() {
        let event = builder().task_event(
            "t1",
            "worker-42",
            EventPayload::TaskCompleted {
                request_id: "t1".to_string(),
                job_id: None,
                iteration: 1,
                output: serde_json::json!({"answer": 42}),
                duration_ms: 1200,
                exit_code: 0,
                usage: serde_json::Value::Null,
            },
        );

        let json = serde_json::to_string(&event).unwrap();
        let parsed: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, event);
        assert_eq!(parsed.event_type(), EventType::TaskCompleted);
        assert_eq!(parsed.entity_type, EntityType::Task);
    }

    #[test]
    fn test_event_type_string_round_trip() {
        let all = [
            EventType::JobSaved,
            EventType::JobCompleted,
            EventType::JobFailureDetected,
            EventType::TaskSaved,
            EventType::TaskPending,
            EventType::TaskProcessingStarted,
            EventType::TaskProcessingFailed,
            EventType::TaskUpdated,
            EventType::TaskHeartbeat,
            EventType::TaskSubmittedForReview,
            EventType::TaskRevisionRequested,
            EventType::TaskApproved,
            EventType::TaskCompleted,
            EventType::TaskFailed,
            EventType::TaskTimeout,
        ];
        for event_type in all {
            assert_eq!(
                event_type.as_str().parse::<EventType>().unwrap(),
                event_type
            );
        }
        assert!("Task Exploded".parse::<EventType>().is_err());
    }

    #[test]
    fn test_output_bearing_events() {
        let completed = EventPayload::TaskCompleted {
            request_id: "t1".to_string(),
            job_id: None,
            iteration: 1,
            output: serde_json::json!({"k": "v"}),
            duration_ms: 10,
            exit_code: 0,
            usage: serde_json::Value::Null,
        };
        assert!(completed.output().is_some());

        let heartbeat = EventPayload::TaskHeartbeat {
            request_id: "t1".to_string(),
            job_id: None,
            effective_until: 0,
            heartbeat_number: 1,
            elapsed_ms: 5,
            worker_id: "w".to_string(),
            last_activity: None,
        };
        assert!(heartbeat.output().is_none());
        assert_eq!(heartbeat.effective_until(), Some(0));
    }

    #[test]
    fn test_job_id_extraction() {
        let payload = EventPayload::TaskFailed {
            request_id: "t1".to_string(),
            job_id: Some("job-9".to_string()),
            error: "boom".to_string(),
            error_category: "unknown".to_string(),
            retry_count: 1,
            source: "worker".to_string(),
        };
        assert_eq!(payload.job_id(), Some("job-9"));
    }
}
