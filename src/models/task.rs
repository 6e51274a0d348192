//! # Task Definition
//!
//! The immutable description of one unit of work inside a job's DAG.
//! Supplied at job creation (or append) and never mutated afterwards; all
//! runtime state is derived from the event log, not stored here.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One node of a job's DAG.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDefinition {
    /// Unique within the job; matches the task id pattern.
    pub task_id: String,
    pub name: String,
    pub description: String,
    /// Role/capability label routing the task to an agent profile.
    pub tag: String,
    /// Task ids this task waits on. Empty means root.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Whether a successful run parks in `in_review` instead of completing.
    #[serde(default)]
    pub requires_review: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_tools: Option<Vec<String>>,
    /// Agent turn budget, 1..=200 when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_turns: Option<u32>,
    /// Key restriction is enforced by the validator, not the wire format;
    /// unknown keys deserialize and are rejected with a structured error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback_commands: Option<BTreeMap<String, String>>,
    /// Opaque payload handed to the agent runtime.
    #[serde(default)]
    pub input: serde_json::Value,
}

impl TaskDefinition {
    /// True when the task has no dependencies.
    pub fn is_root(&self) -> bool {
        self.depends_on.is_empty()
    }
}
