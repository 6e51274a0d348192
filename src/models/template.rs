//! Reusable task templates, upserted through the write API and kept outside
//! the event log (they are configuration, not history).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A named, reusable description clients can reference when composing jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskTemplate {
    pub name: String,
    pub description: String,
    pub tag: String,
    #[serde(default)]
    pub requires_review: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
