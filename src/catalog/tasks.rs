//! Task specifications and the validation of a project's task list.

use serde_json::{Map, Value};

use crate::error::{CoordinationError, CoordinationResult};

/// One configured ML operation within a project's ordered task list.
///
/// The Router never interprets `model` or `config`; they are handed verbatim to the
/// participants when the round that executes the task starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// The position of the task in the project, starting at `1`.
    pub seq: u32,
    /// The kind of model the task trains, e.g. `LogisticRegression`.
    pub model: String,
    /// Free-form configuration of the task.
    pub config: Map<String, Value>,
}

/// Checks a task list before it is attached to a project.
///
/// A valid list is non-empty, its sequence numbers start at `1` and are consecutive, every model
/// kind is non-empty (and part of `allowed_models` unless that list is empty) and every
/// configuration holds at least one entry.
pub fn validate_tasks(tasks: &[TaskSpec], allowed_models: &[String]) -> CoordinationResult<()> {
    if tasks.is_empty() {
        return Err(CoordinationError::validation(
            "at least one task must be provided",
        ));
    }

    for (expected, task) in (1..).zip(tasks) {
        if task.seq != expected {
            return Err(CoordinationError::validation(if expected == 1 {
                "task seq should start with 1".to_string()
            } else {
                format!(
                    "task seq is not consecutive: expected {}, got {}",
                    expected, task.seq
                )
            }));
        }
        validate_task(task, allowed_models)?;
    }
    Ok(())
}

/// Trims the model kind of every task.
pub fn normalize_tasks(mut tasks: Vec<TaskSpec>) -> Vec<TaskSpec> {
    for task in tasks.iter_mut() {
        let model = task.model.trim();
        if model.len() != task.model.len() {
            task.model = model.to_string();
        }
    }
    tasks
}

fn validate_task(task: &TaskSpec, allowed_models: &[String]) -> CoordinationResult<()> {
    let model = task.model.trim();
    if model.is_empty() {
        return Err(CoordinationError::validation(format!(
            "task {} has no model",
            task.seq
        )));
    }
    if !allowed_models.is_empty() && !allowed_models.iter().any(|allowed| allowed == model) {
        return Err(CoordinationError::validation(format!(
            "task {}: unsupported model {}",
            task.seq, model
        )));
    }
    if task.config.is_empty() {
        return Err(CoordinationError::validation(format!(
            "task {}: config must be a key-value map and could not be empty",
            task.seq
        )));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use serde_json::json;

    use super::*;

    pub fn task(seq: u32) -> TaskSpec {
        TaskSpec {
            seq,
            model: "LogisticRegression".to_string(),
            config: json!({ "total_round": 5, "current_round": 1 })
                .as_object()
                .cloned()
                .unwrap(),
        }
    }

    pub fn tasks(count: u32) -> Vec<TaskSpec> {
        (1..=count).map(task).collect()
    }

    #[test]
    fn test_valid_tasks() {
        assert!(validate_tasks(&tasks(1), &[]).is_ok());
        assert!(validate_tasks(&tasks(3), &[]).is_ok());
    }

    #[test]
    fn test_empty_task_list() {
        assert!(matches!(
            validate_tasks(&[], &[]),
            Err(CoordinationError::Validation(_))
        ));
    }

    #[test]
    fn test_seq_must_start_at_one() {
        assert!(validate_tasks(&[task(0)], &[]).is_err());
        assert!(validate_tasks(&[task(2)], &[]).is_err());
    }

    #[test]
    fn test_seq_must_be_dense() {
        assert!(validate_tasks(&[task(1), task(3)], &[]).is_err());
        assert!(validate_tasks(&[task(1), task(1)], &[]).is_err());
        assert!(validate_tasks(&[task(2), task(1)], &[]).is_err());
    }

    #[test]
    fn test_model_and_config() {
        let mut blank_model = task(1);
        blank_model.model = "  ".to_string();
        assert!(validate_tasks(&[blank_model], &[]).is_err());

        let mut empty_config = task(1);
        empty_config.config.clear();
        assert!(validate_tasks(&[empty_config], &[]).is_err());
    }

    #[test]
    fn test_normalize_trims_models() {
        let mut padded = task(1);
        padded.model = " LogisticRegression\n".to_string();
        let tasks = normalize_tasks(vec![padded, task(2)]);
        assert!(tasks.iter().all(|task| task.model == "LogisticRegression"));
    }

    #[test]
    fn test_allowed_models() {
        let allowed = vec!["LinearRegression".to_string()];
        assert!(validate_tasks(&tasks(1), &allowed).is_err());

        let allowed = vec!["LinearRegression".to_string(), "LogisticRegression".to_string()];
        assert!(validate_tasks(&tasks(2), &allowed).is_ok());
    }

    #[test]
    fn test_deserialize_task() {
        let task: TaskSpec = serde_json::from_value(json!({
            "seq": 1,
            "model": "LogisticRegression",
            "config": { "total_round": 5 }
        }))
        .unwrap();
        assert_eq!(task.seq, 1);

        // a negative seq or a non-map config is malformed
        assert!(serde_json::from_value::<TaskSpec>(json!({
            "seq": -1, "model": "M", "config": { "a": 1 }
        }))
        .is_err());
        assert!(serde_json::from_value::<TaskSpec>(json!({
            "seq": 1, "model": "M", "config": [1, 2]
        }))
        .is_err());
    }
}
