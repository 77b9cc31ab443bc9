//! Request and response bodies of the HTTP surface

use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{OrchestratorError, Result};
use crate::models::{AgentStatus, Subtask, Task, TaskPriority, TaskRecord, TaskStatus};

/// `POST /orchestrate` body
#[derive(Debug, Clone, Deserialize)]
pub struct OrchestrateRequest {
    pub task_id: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    #[serde(default)]
    pub priority: Option<TaskPriority>,
    #[serde(default)]
    pub requester: Option<String>,
    #[serde(default)]
    pub parent_task_id: Option<String>,
    #[serde(default)]
    pub metadata: Option<BTreeMap<String, Value>>,
}

impl OrchestrateRequest {
    /// Validate required fields and build the domain task
    pub fn into_task(self) -> Result<Task> {
        let task_id = required("task_id", self.task_id)?;
        if !task_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return Err(OrchestratorError::Validation(
                "task_id may only contain alphanumerics, '-', '_', '.'".into(),
            ));
        }
        Ok(Task {
            task_id,
            title: required("title", self.title)?,
            description: required("description", self.description)?,
            priority: self.priority.unwrap_or(TaskPriority::Medium),
            requester: self.requester,
            created_at: Utc::now(),
            parent_task_id: self.parent_task_id,
            metadata: self.metadata.unwrap_or_default(),
        })
    }
}

fn required(field: &str, value: Option<String>) -> Result<String> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(OrchestratorError::Validation(format!(
            "missing required field '{field}'"
        ))),
    }
}

/// Snapshot metrics block of a task response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMetrics {
    pub elapsed_seconds: i64,
    pub on_time: bool,
}

/// Task status/plan response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResponse {
    pub task_id: String,
    pub title: String,
    pub status: TaskStatus,
    pub priority: TaskPriority,
    pub subtasks: Vec<Subtask>,
    pub metrics: TaskMetrics,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval_request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl TaskResponse {
    /// Project a stored record into the wire shape
    pub fn from_record(record: TaskRecord) -> Self {
        let now = Utc::now();
        Self {
            metrics: TaskMetrics {
                elapsed_seconds: record.elapsed_seconds(now),
                on_time: record.on_time(now),
            },
            task_id: record.task.task_id,
            title: record.task.title,
            status: record.status,
            priority: record.task.priority,
            subtasks: record.subtasks,
            approval_request_id: record.approval_request_id,
            failure_reason: record.failure_reason,
        }
    }
}

/// `GET /agents` query string
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentsQuery {
    /// Filter by capability tag
    pub capability: Option<String>,
    /// Filter by health status
    pub status: Option<AgentStatus>,
}

/// `POST /agents` body
#[derive(Debug, Clone, Deserialize)]
pub struct RegisterAgentRequest {
    pub agent_id: String,
    pub display_name: Option<String>,
    pub base_url: String,
    #[serde(default)]
    pub capability_tags: Vec<String>,
}

/// `POST /agents/{id}/heartbeat` body
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HeartbeatRequest {
    #[serde(default)]
    pub status: Option<AgentStatus>,
}

/// `POST /approvals/{id}/approve` / `reject` body
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DecisionRequest {
    #[serde(default)]
    pub actor_id: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}
