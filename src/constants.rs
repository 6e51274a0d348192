//! # System Constants
//!
//! Central definitions for identifier patterns, validation caps, queue names,
//! and the subprocess environment allow-list. Keeping these in one module
//! mirrors the limits enforced at every boundary (API validation, worker
//! claim validation, dispatch).

use regex::Regex;
use std::sync::OnceLock;

/// Maximum number of task definitions accepted in a single batch
/// (job creation or append). Bounds validation cost.
pub const MAX_TASKS_PER_BATCH: usize = 50;

/// Valid range for a task's `max_turns` setting.
pub const MAX_TURNS_RANGE: std::ops::RangeInclusive<u32> = 1..=200;

/// Allowed keys for per-task feedback commands.
pub const FEEDBACK_COMMAND_KEYS: [&str; 3] = ["lint", "typecheck", "test"];

/// Default queue carrying work items to workers.
pub const DEFAULT_TASK_QUEUE: &str = "jobflow_tasks";

/// Default queue carrying reconciliation nudges to the dispatcher.
pub const DEFAULT_RECONCILE_QUEUE: &str = "jobflow_reconcile";

/// Environment variables forwarded into task subprocesses. Anything not on
/// this list is withheld.
pub const SUBPROCESS_ENV_ALLOWLIST: [&str; 18] = [
    "PATH",
    "HOME",
    "USER",
    "SHELL",
    "TMPDIR",
    "PWD",
    "LANG",
    "LC_ALL",
    "LC_CTYPE",
    "LC_MESSAGES",
    "LC_COLLATE",
    "TERM",
    "COLORTERM",
    "FORCE_COLOR",
    "JOBFLOW_ENV",
    "JOBFLOW_TENANT_ID",
    "JOBFLOW_APP_NAME",
    "DEFAULT_TIMEOUT",
];

static TASK_ID_PATTERN: OnceLock<Regex> = OnceLock::new();
static REQUEST_ID_PATTERN: OnceLock<Regex> = OnceLock::new();
static TEMPLATE_NAME_PATTERN: OnceLock<Regex> = OnceLock::new();

/// Pattern a `task_id` must match (unique within a job).
pub fn task_id_pattern() -> &'static Regex {
    TASK_ID_PATTERN.get_or_init(|| Regex::new(r"^[a-zA-Z0-9\-_]{1,128}$").unwrap())
}

/// Pattern a claimed work item's `request_id` must match.
pub fn request_id_pattern() -> &'static Regex {
    REQUEST_ID_PATTERN.get_or_init(|| Regex::new(r"^[a-zA-Z0-9\-_]{1,256}$").unwrap())
}

/// Pattern a reusable task template name must match.
pub fn template_name_pattern() -> &'static Regex {
    TEMPLATE_NAME_PATTERN.get_or_init(|| Regex::new(r"^[a-zA-Z0-9\-_]{1,64}$").unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_id_pattern() {
        assert!(task_id_pattern().is_match("build-api_v2"));
        assert!(task_id_pattern().is_match("A"));
        assert!(!task_id_pattern().is_match(""));
        assert!(!task_id_pattern().is_match("has space"));
        assert!(!task_id_pattern().is_match(&"x".repeat(129)));
    }

    #[test]
    fn test_request_id_pattern_longer_cap() {
        assert!(request_id_pattern().is_match(&"x".repeat(256)));
        assert!(!request_id_pattern().is_match(&"x".repeat(257)));
    }

    #[test]
    fn test_template_name_pattern() {
        assert!(template_name_pattern().is_match("code-review"));
        assert!(!template_name_pattern().is_match(&"x".repeat(65)));
    }
}
