//! Decomposition router: task in, subtask DAG out
//!
//! A [`Planner`] produces raw JSON (LLM-backed planners live behind this
//! trait as external collaborators; [`HeuristicPlanner`] is the deterministic
//! built-in). Raw output then passes [`sanitize_plan`]:
//!
//! - structural problems (missing `agent_kind`, non-array `subtasks`) fail
//!   the decomposition with a validation error;
//! - dependency entries that are not non-negative integers smaller than the
//!   referrer's index are **dropped with a warning**, never a failure -
//!   planner output is noisy by nature and one bad index must not sink the
//!   whole plan.
//!
//! The sanitized plan is always a DAG: every kept dependency references an
//! earlier index.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::{OrchestratorError, Result};
use crate::metrics::Metrics;
use crate::models::{RiskLevel, Subtask, SubtaskState, Task};

/// Produces a raw decomposition for a task
#[async_trait]
pub trait Planner: Send + Sync {
    /// Emit raw plan JSON: `{"subtasks": [{agent_kind, description,
    /// dependencies, action_type?}, ...]}`
    async fn plan(&self, task: &Task) -> Result<Value>;
}

/// Risk classification of an action type
///
/// The requesting side computes risk; the approval gate only records it.
/// Destructive, production-facing, and secret-touching actions rank high.
pub fn classify_risk(action_type: &str) -> RiskLevel {
    let action = action_type.to_ascii_lowercase();
    if ["secret", "credential", "token", "key_rotation"]
        .iter()
        .any(|k| action.contains(k))
    {
        return RiskLevel::Critical;
    }
    if ["delete", "drop", "destroy", "wipe", "truncate"]
        .iter()
        .any(|k| action.contains(k))
    {
        return RiskLevel::Critical;
    }
    if action.contains("production") || action.contains("prod_") || action.contains("deploy") {
        return RiskLevel::High;
    }
    if action.contains("migrate") || action.contains("rollback") {
        return RiskLevel::Medium;
    }
    RiskLevel::Low
}

/// Whether a risk level requires a human approval gate
pub fn requires_approval(risk: RiskLevel) -> bool {
    risk >= RiskLevel::High
}

/// Deterministic keyword-routing planner
///
/// Every plan carries a `feature-dev` implementation step and a
/// `code-review` step depending on it; deploy/release/migration phrasing
/// adds a `devops` step, and test-heavy phrasing adds a `qa` step. The
/// task's `metadata.action_type` flows onto the step that executes it.
pub struct HeuristicPlanner;

#[async_trait]
impl Planner for HeuristicPlanner {
    async fn plan(&self, task: &Task) -> Result<Value> {
        let text = format!("{} {}", task.title, task.description).to_lowercase();
        let action_type = task
            .metadata
            .get("action_type")
            .and_then(Value::as_str)
            .map(str::to_string);

        let mut subtasks = vec![json!({
            "agent_kind": "feature-dev",
            "description": format!("Implement: {}", task.title),
            "dependencies": [],
        })];

        if ["test", "verify", "regression", "coverage"]
            .iter()
            .any(|k| text.contains(k))
        {
            subtasks.push(json!({
                "agent_kind": "qa",
                "description": format!("Exercise the change for: {}", task.title),
                "dependencies": [subtasks.len() - 1],
            }));
        }

        subtasks.push(json!({
            "agent_kind": "code-review",
            "description": format!("Review the implementation of: {}", task.title),
            "dependencies": [subtasks.len() - 1],
        }));

        if ["deploy", "release", "rollout", "migrate", "rollback"]
            .iter()
            .any(|k| text.contains(k))
            || action_type.is_some()
        {
            let mut step = json!({
                "agent_kind": "devops",
                "description": format!("Operate the rollout for: {}", task.title),
                "dependencies": [subtasks.len() - 1],
            });
            if let Some(action) = &action_type {
                step["action_type"] = json!(action);
            }
            subtasks.push(step);
        }

        Ok(json!({ "subtasks": subtasks }))
    }
}

/// Schema-check raw planner output and build the typed subtask list
///
/// Invalid dependency entries are dropped with a warning (counted in
/// `planner_dependencies_dropped_total`); structural violations fail with a
/// validation error.
pub fn sanitize_plan(raw: &Value, metrics: &Metrics) -> Result<Vec<Subtask>> {
    let raw_subtasks = raw
        .get("subtasks")
        .and_then(Value::as_array)
        .ok_or_else(|| {
            OrchestratorError::Validation("planner output is missing a 'subtasks' array".into())
        })?;
    if raw_subtasks.is_empty() {
        return Err(OrchestratorError::Validation(
            "planner produced an empty decomposition".into(),
        ));
    }

    let mut subtasks = Vec::with_capacity(raw_subtasks.len());
    for (index, raw_subtask) in raw_subtasks.iter().enumerate() {
        let agent_kind = raw_subtask
            .get("agent_kind")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                OrchestratorError::Validation(format!(
                    "subtask {index} is missing a string 'agent_kind'"
                ))
            })?;
        let description = raw_subtask
            .get("description")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                OrchestratorError::Validation(format!(
                    "subtask {index} is missing a string 'description'"
                ))
            })?;

        let depends_on = sanitize_dependencies(raw_subtask.get("dependencies"), index, metrics);

        let action_type = raw_subtask
            .get("action_type")
            .and_then(Value::as_str)
            .map(str::to_string);
        let risk_level = action_type.as_deref().map(classify_risk).unwrap_or(RiskLevel::Low);

        subtasks.push(Subtask {
            index,
            agent_kind: agent_kind.to_string(),
            description: description.to_string(),
            depends_on,
            state: SubtaskState::Planned,
            outputs: Value::Null,
            attempts: 0,
            action_type,
            risk_level,
            requires_approval: requires_approval(risk_level),
        });
    }
    Ok(subtasks)
}

/// Keep only dependency entries that are non-negative integers referencing
/// an earlier subtask; drop everything else with a warning
fn sanitize_dependencies(raw: Option<&Value>, index: usize, metrics: &Metrics) -> Vec<usize> {
    let Some(entries) = raw.and_then(Value::as_array) else {
        if let Some(other) = raw {
            if !other.is_null() {
                tracing::warn!(
                    subtask = index,
                    "planner emitted non-array dependencies {other}; dropping"
                );
                metrics.inc("planner_dependencies_dropped_total");
            }
        }
        return Vec::new();
    };

    let mut deps = Vec::new();
    for entry in entries {
        match entry.as_u64() {
            Some(dep) if (dep as usize) < index => deps.push(dep as usize),
            Some(dep) => {
                tracing::warn!(
                    subtask = index,
                    dependency = dep,
                    "planner referenced a non-earlier subtask; dropping"
                );
                metrics.inc("planner_dependencies_dropped_total");
            }
            None => {
                tracing::warn!(
                    subtask = index,
                    "planner emitted malformed dependency {entry}; dropping"
                );
                metrics.inc("planner_dependencies_dropped_total");
            }
        }
    }
    deps.sort_unstable();
    deps.dedup();
    deps
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TaskPriority;
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn task(title: &str, description: &str, action_type: Option<&str>) -> Task {
        let mut metadata = BTreeMap::new();
        if let Some(action) = action_type {
            metadata.insert("action_type".to_string(), json!(action));
        }
        Task {
            task_id: "T1".into(),
            title: title.into(),
            description: description.into(),
            priority: TaskPriority::High,
            requester: None,
            created_at: Utc::now(),
            parent_task_id: None,
            metadata,
        }
    }

    #[tokio::test]
    async fn test_heuristic_plan_has_dev_then_review() {
        let raw = HeuristicPlanner
            .plan(&task("Add JWT auth", "Support token-based login", None))
            .await
            .unwrap();
        let subtasks = sanitize_plan(&raw, &Metrics::new()).unwrap();

        assert_eq!(subtasks[0].agent_kind, "feature-dev");
        assert_eq!(subtasks[1].agent_kind, "code-review");
        assert_eq!(subtasks[1].depends_on, vec![0]);
        assert!(subtasks.iter().all(|s| !s.requires_approval));
    }

    #[tokio::test]
    async fn test_production_action_requires_approval() {
        let raw = HeuristicPlanner
            .plan(&task("Ship it", "Deploy the new gateway", Some("deploy_production")))
            .await
            .unwrap();
        let subtasks = sanitize_plan(&raw, &Metrics::new()).unwrap();

        let devops = subtasks.iter().find(|s| s.agent_kind == "devops").unwrap();
        assert_eq!(devops.risk_level, RiskLevel::High);
        assert!(devops.requires_approval);
    }

    #[test]
    fn test_malformed_dependency_objects_are_dropped() {
        let metrics = Metrics::new();
        let raw = json!({
            "subtasks": [
                { "agent_kind": "feature-dev", "description": "build", "dependencies": [] },
                {
                    "agent_kind": "code-review",
                    "description": "review",
                    // The classic noisy-planner shape: an object instead of
                    // an integer, plus a negative and a forward reference.
                    "dependencies": [{"task_id": 1}, -1, 5, 0]
                },
            ]
        });

        let subtasks = sanitize_plan(&raw, &metrics).unwrap();
        assert_eq!(subtasks[1].depends_on, vec![0]);
        assert_eq!(metrics.get("planner_dependencies_dropped_total"), 3);
    }

    #[test]
    fn test_sanitized_plan_is_a_dag() {
        let raw = json!({
            "subtasks": [
                { "agent_kind": "a", "description": "d", "dependencies": [0, 1, 2] },
                { "agent_kind": "b", "description": "d", "dependencies": [0] },
                { "agent_kind": "c", "description": "d", "dependencies": [1, 0] },
            ]
        });
        let subtasks = sanitize_plan(&raw, &Metrics::new()).unwrap();
        for subtask in &subtasks {
            for dep in &subtask.depends_on {
                assert!(*dep < subtask.index);
            }
        }
        // Self-reference on index 0 was dropped entirely.
        assert!(subtasks[0].depends_on.is_empty());
    }

    #[test]
    fn test_missing_agent_kind_fails_schema_check() {
        let raw = json!({ "subtasks": [{ "description": "d" }] });
        assert!(matches!(
            sanitize_plan(&raw, &Metrics::new()),
            Err(OrchestratorError::Validation(_))
        ));
    }

    #[test]
    fn test_risk_classification() {
        assert_eq!(classify_risk("deploy_production"), RiskLevel::High);
        assert_eq!(classify_risk("drop_database"), RiskLevel::Critical);
        assert_eq!(classify_risk("rotate_secret"), RiskLevel::Critical);
        assert_eq!(classify_risk("migrate_schema"), RiskLevel::Medium);
        assert_eq!(classify_risk("update_docs"), RiskLevel::Low);
    }
}
