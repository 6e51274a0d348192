//! # State Projector
//!
//! Task and job status are pure functions of the event log. For tasks the
//! mapping consults the single latest event only: the event vocabulary is
//! designed so the most recent event always determines status, trading
//! auditability of intermediate states for O(1) reads. Full history stays
//! available for timelines.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::events::{Event, EventType};

/// Derived runtime status of one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// No dispatch yet; either no events at all or only the definition
    /// snapshot.
    Waiting,
    Pending,
    Processing,
    InReview,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::InReview => "in_review",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Terminal statuses never transition again; the worker's idempotency
    /// check acks and skips on these.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Status a task holds when the given event type is its latest.
    /// Returns `None` for job-scoped events, which never appear in a task's
    /// history.
    pub fn from_event_type(event_type: EventType) -> Option<Self> {
        match event_type {
            EventType::TaskSaved => Some(Self::Waiting),
            EventType::TaskPending | EventType::TaskRevisionRequested => Some(Self::Pending),
            EventType::TaskProcessingStarted
            | EventType::TaskProcessingFailed
            | EventType::TaskUpdated
            | EventType::TaskHeartbeat => Some(Self::Processing),
            EventType::TaskSubmittedForReview => Some(Self::InReview),
            EventType::TaskCompleted | EventType::TaskApproved => Some(Self::Completed),
            EventType::TaskFailed | EventType::TaskTimeout => Some(Self::Failed),
            EventType::JobSaved | EventType::JobCompleted | EventType::JobFailureDetected => None,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Project a task's status from its latest event.
pub fn task_status(latest: Option<&Event>) -> TaskStatus {
    latest
        .and_then(|e| TaskStatus::from_event_type(e.event_type()))
        .unwrap_or(TaskStatus::Waiting)
}

/// Derived runtime status of one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Processing,
    Completed,
    PartialFailure,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::PartialFailure => "partial_failure",
        }
    }

    /// `Job Completed` wins over `Job Failure Detected`: a job whose failed
    /// branches were all retried to completion still ends `completed`.
    pub fn derive(completed_event_exists: bool, failure_event_exists: bool) -> Self {
        if completed_event_exists {
            Self::Completed
        } else if failure_event_exists {
            Self::PartialFailure
        } else {
            Self::Processing
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
