//! # DAG Validator
//!
//! Pure validation of a proposed task batch, used identically at job
//! creation (empty `existing_ids`) and at append time. Checks run in
//! stages and short-circuit between stages: all errors within a stage are
//! collected before returning, but a failed stage stops the later, more
//! expensive ones.
//!
//! Never panics and never returns through `Result`; callers always get a
//! structured verdict.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::constants::{
    task_id_pattern, FEEDBACK_COMMAND_KEYS, MAX_TASKS_PER_BATCH, MAX_TURNS_RANGE,
};
use crate::models::TaskDefinition;

/// Outcome of validating one task batch.
#[derive(Debug, Clone, PartialEq)]
pub enum DagValidation {
    /// Batch accepted; `order` is a topological order of the batch's tasks.
    Valid { order: Vec<String> },
    Invalid { errors: Vec<String> },
}

impl DagValidation {
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid { .. })
    }

    /// Validation errors, empty when valid.
    pub fn errors(&self) -> &[String] {
        match self {
            Self::Valid { .. } => &[],
            Self::Invalid { errors } => errors,
        }
    }
}

/// Validate a candidate batch against the ids a job already owns.
///
/// Stages: batch bounds, per-task fields, dependency resolution, cycle
/// detection (Kahn), root requirement. The root requirement is waived when
/// appending to a job that already has tasks.
pub fn validate_dag(tasks: &[TaskDefinition], existing_ids: &HashSet<String>) -> DagValidation {
    // Stage 1: batch bounds.
    if tasks.is_empty() {
        return DagValidation::Invalid {
            errors: vec!["tasks must be a non-empty array".to_string()],
        };
    }
    if tasks.len() > MAX_TASKS_PER_BATCH {
        return DagValidation::Invalid {
            errors: vec![format!(
                "too many tasks: {} exceeds the limit of {MAX_TASKS_PER_BATCH}",
                tasks.len()
            )],
        };
    }

    // Stage 2: per-task field checks.
    let mut errors = Vec::new();
    let mut seen_ids: HashSet<&str> = HashSet::new();
    for task in tasks {
        let id = task.task_id.as_str();
        if !task_id_pattern().is_match(id) {
            errors.push(format!("invalid taskId: '{id}'"));
        }
        if !seen_ids.insert(id) {
            errors.push(format!("duplicate taskId in batch: '{id}'"));
        }
        if existing_ids.contains(id) {
            errors.push(format!("taskId already exists in job: '{id}'"));
        }
        if task.name.trim().is_empty() {
            errors.push(format!("task '{id}': name is required"));
        }
        if task.description.trim().is_empty() {
            errors.push(format!("task '{id}': description is required"));
        }
        if task.tag.trim().is_empty() {
            errors.push(format!("task '{id}': tag is required"));
        }
        if let Some(tools) = &task.allowed_tools {
            if tools.iter().any(|t| t.trim().is_empty()) {
                errors.push(format!("task '{id}': allowedTools entries must be non-empty"));
            }
        }
        if let Some(turns) = task.max_turns {
            if !MAX_TURNS_RANGE.contains(&turns) {
                errors.push(format!(
                    "task '{id}': maxTurns must be between {} and {}",
                    MAX_TURNS_RANGE.start(),
                    MAX_TURNS_RANGE.end()
                ));
            }
        }
        if let Some(commands) = &task.feedback_commands {
            for (key, command) in commands {
                if !FEEDBACK_COMMAND_KEYS.contains(&key.as_str()) {
                    errors.push(format!(
                        "task '{id}': unknown feedbackCommands key '{key}'"
                    ));
                }
                if command.trim().is_empty() {
                    errors.push(format!(
                        "task '{id}': feedbackCommands.{key} must be non-empty"
                    ));
                }
            }
        }
    }
    if !errors.is_empty() {
        return DagValidation::Invalid { errors };
    }

    // Stage 3: every dependency resolves within the batch or the job.
    let batch_ids: HashSet<&str> = tasks.iter().map(|t| t.task_id.as_str()).collect();
    for task in tasks {
        for dep in &task.depends_on {
            if !batch_ids.contains(dep.as_str()) && !existing_ids.contains(dep) {
                errors.push(format!(
                    "task '{}': unknown dependency '{dep}'",
                    task.task_id
                ));
            }
        }
    }
    if !errors.is_empty() {
        return DagValidation::Invalid { errors };
    }

    // Stage 4: Kahn's algorithm over batch-internal edges. Edges into
    // pre-existing ids cannot create an in-batch cycle, so they are
    // excluded from the in-degree counts.
    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for task in tasks {
        in_degree.entry(task.task_id.as_str()).or_insert(0);
        for dep in &task.depends_on {
            if batch_ids.contains(dep.as_str()) {
                *in_degree.entry(task.task_id.as_str()).or_insert(0) += 1;
                dependents
                    .entry(dep.as_str())
                    .or_default()
                    .push(task.task_id.as_str());
            }
        }
    }

    // Seed in batch order so the returned topological order is stable.
    let mut queue: VecDeque<&str> = tasks
        .iter()
        .map(|t| t.task_id.as_str())
        .filter(|id| in_degree[id] == 0)
        .collect();

    let mut order: Vec<String> = Vec::with_capacity(tasks.len());
    while let Some(id) = queue.pop_front() {
        order.push(id.to_string());
        for dependent in dependents.get(id).map(Vec::as_slice).unwrap_or(&[]) {
            if let Some(degree) = in_degree.get_mut(dependent) {
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(dependent);
                }
            }
        }
    }

    if order.len() < tasks.len() {
        let removed: HashSet<&str> = order.iter().map(String::as_str).collect();
        for task in tasks {
            if !removed.contains(task.task_id.as_str()) {
                errors.push(format!(
                    "task '{}' is part of a dependency cycle",
                    task.task_id
                ));
            }
        }
        return DagValidation::Invalid { errors };
    }

    // Stage 5: creation requires at least one root. Appends inherit the
    // job's established roots.
    if existing_ids.is_empty() && !tasks.iter().any(TaskDefinition::is_root) {
        return DagValidation::Invalid {
            errors: vec!["at least one task must have no dependencies".to_string()],
        };
    }

    DagValidation::Valid { order }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

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

    fn no_existing() -> HashSet<String> {
        HashSet::new()
    }

    #[test]
    fn test_linear_chain_is_valid_in_topological_order() {
        let result = validate_dag(
            &[task("c", &["b"]), task("a", &[]), task("b", &["a"])],
            &no_existing(),
        );
        match result {
            DagValidation::Valid { order } => {
                assert_eq!(order, vec!["a", "b", "c"]);
            }
            DagValidation::Invalid { errors } => panic!("unexpected errors: {errors:?}"),
        }
    }

    #[test]
    fn test_two_task_cycle_names_both_tasks() {
        let result = validate_dag(&[task("a", &["b"]), task("b", &["a"])], &no_existing());
        let errors = result.errors();
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().any(|e| e.contains("'a'")));
        assert!(errors.iter().any(|e| e.contains("'b'")));
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let result = validate_dag(&[task("a", &["a"]), task("b", &[])], &no_existing());
        assert!(!result.is_valid());
        assert!(result.errors()[0].contains("'a'"));
    }

    #[test]
    fn test_empty_batch_rejected() {
        let result = validate_dag(&[], &no_existing());
        assert_eq!(result.errors().len(), 1);
    }

    #[test]
    fn test_oversized_batch_rejected() {
        let tasks: Vec<TaskDefinition> = (0..=MAX_TASKS_PER_BATCH)
            .map(|i| task(&format!("t{i}"), &[]))
            .collect();
        let result = validate_dag(&tasks, &no_existing());
        assert!(result.errors()[0].contains("too many tasks"));
    }

    #[test]
    fn test_field_errors_collected_within_stage() {
        let mut bad = task("ok id?", &[]);
        bad.name = String::new();
        bad.max_turns = Some(500);
        let result = validate_dag(&[bad], &no_existing());
        let errors = result.errors();
        assert!(errors.iter().any(|e| e.contains("invalid taskId")));
        assert!(errors.iter().any(|e| e.contains("name is required")));
        assert!(errors.iter().any(|e| e.contains("maxTurns")));
    }

    #[test]
    fn test_duplicate_and_colliding_ids_rejected() {
        let existing: HashSet<String> = ["old".to_string()].into();
        let result = validate_dag(&[task("a", &[]), task("a", &[]), task("old", &[])], &existing);
        let errors = result.errors();
        assert!(errors.iter().any(|e| e.contains("duplicate taskId")));
        assert!(errors.iter().any(|e| e.contains("already exists")));
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let result = validate_dag(&[task("a", &["ghost"])], &no_existing());
        assert!(result.errors()[0].contains("unknown dependency 'ghost'"));
    }

    #[test]
    fn test_feedback_command_keys_restricted() {
        let mut t = task("a", &[]);
        let mut commands = BTreeMap::new();
        commands.insert("lint".to_string(), "cargo clippy".to_string());
        commands.insert("deploy".to_string(), "make deploy".to_string());
        commands.insert("test".to_string(), "  ".to_string());
        t.feedback_commands = Some(commands);

        let result = validate_dag(&[t], &no_existing());
        let errors = result.errors();
        assert!(errors.iter().any(|e| e.contains("unknown feedbackCommands key 'deploy'")));
        assert!(errors.iter().any(|e| e.contains("feedbackCommands.test")));
    }

    #[test]
    fn test_append_may_depend_only_on_existing_tasks() {
        let existing: HashSet<String> = ["root".to_string()].into();
        let result = validate_dag(&[task("next", &["root"])], &existing);
        assert!(result.is_valid());
    }

    #[test]
    fn test_creation_requires_a_root() {
        // Acyclic is impossible without a root inside one batch, so the
        // cycle stage reports first; the root stage guards batches whose
        // only roots point at (nonexistent) existing ids.
        let result = validate_dag(&[task("a", &["b"]), task("b", &["a"])], &no_existing());
        assert!(!result.is_valid());
    }

    #[test]
    fn test_dependency_errors_reported_before_cycle_check() {
        let result = validate_dag(
            &[task("a", &["missing"]), task("b", &["a"])],
            &no_existing(),
        );
        let errors = result.errors();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("unknown dependency"));
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        /// Random DAGs built with edges only from earlier to later indices
        /// are acyclic by construction and must always validate.
        fn arb_acyclic_batch() -> impl Strategy<Value = Vec<TaskDefinition>> {
            (2usize..12).prop_flat_map(|n| {
                proptest::collection::vec(proptest::collection::vec(any::<bool>(), n), n)
                    .prop_map(move |adjacency| {
                        (0..n)
                            .map(|i| {
                                let deps: Vec<&str> = Vec::new();
                                let mut t = task(&format!("t{i}"), &deps);
                                t.depends_on = (0..i)
                                    .filter(|j| adjacency[i][*j])
                                    .map(|j| format!("t{j}"))
                                    .collect();
                                t
                            })
                            .collect()
                    })
            })
        }

        proptest! {
            #[test]
            fn acyclic_batches_validate_with_edge_respecting_order(tasks in arb_acyclic_batch()) {
                let result = validate_dag(&tasks, &HashSet::new());
                let DagValidation::Valid { order } = result else {
                    return Err(TestCaseError::fail("acyclic batch rejected"));
                };
                let position: std::collections::HashMap<&str, usize> = order
                    .iter()
                    .enumerate()
                    .map(|(i, id)| (id.as_str(), i))
                    .collect();
                for task in &tasks {
                    for dep in &task.depends_on {
                        prop_assert!(position[dep.as_str()] < position[task.task_id.as_str()]);
                    }
                }
            }
        }
    }
}
