//! Persisted domain models: tasks, subtasks, approvals, agents
//!
//! Ownership: task and subtask rows are mutated only by the workflow service
//! in response to engine-emitted events; approval records belong to the
//! approval gate; agent rows to the registry.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Task priority, as supplied by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    #[serde(alias = "med")]
    Medium,
    High,
    Critical,
}

impl TaskPriority {
    /// Completion target used for the `on_time` snapshot metric, in hours
    pub fn sla_hours(&self) -> i64 {
        match self {
            TaskPriority::Critical => 1,
            TaskPriority::High => 4,
            TaskPriority::Medium => 24,
            TaskPriority::Low => 72,
        }
    }
}

/// Overall task lifecycle as exposed by the API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Planned,
    ApprovalPending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Expired,
}

impl TaskStatus {
    /// Whether no further transitions are possible
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled | TaskStatus::Expired
        )
    }
}

/// A caller-submitted unit of work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub title: String,
    pub description: String,
    pub priority: TaskPriority,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requester: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_task_id: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

/// State of a planned subtask
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubtaskState {
    Planned,
    Running,
    Completed,
    Failed,
    Blocked,
}

/// One unit of the decomposition, executed by a specialist
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subtask {
    /// Position in the plan; the identity key together with the task id
    pub index: usize,
    /// Specialist kind (`feature-dev`, `code-review`, ...)
    pub agent_kind: String,
    pub description: String,
    /// Indices of earlier subtasks this one waits on (always a DAG)
    #[serde(default)]
    pub depends_on: Vec<usize>,
    pub state: SubtaskState,
    #[serde(default)]
    pub outputs: Value,
    /// Node attempts consumed so far
    #[serde(default)]
    pub attempts: u32,
    /// Action classification driving the approval gate
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_type: Option<String>,
    /// Risk class computed at decomposition time
    pub risk_level: RiskLevel,
    /// Whether execution must pass the approval gate first
    #[serde(default)]
    pub requires_approval: bool,
}

/// Risk classification of a subtask's action
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

/// The persisted task row: caller task + plan + rollup status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task: Task,
    pub subtasks: Vec<Subtask>,
    pub status: TaskStatus,
    /// Pending approval gating this task, when `status = approval_pending`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval_request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl TaskRecord {
    /// Snapshot metric: seconds since work started (or submission)
    pub fn elapsed_seconds(&self, now: DateTime<Utc>) -> i64 {
        let from = self.started_at.unwrap_or(self.task.created_at);
        let until = self.finished_at.unwrap_or(now);
        (until - from).num_seconds().max(0)
    }

    /// Snapshot metric: whether the task is inside its priority SLA
    pub fn on_time(&self, now: DateTime<Utc>) -> bool {
        self.elapsed_seconds(now) <= self.task.priority.sla_hours() * 3_600
    }
}

/// Approval request lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalState {
    Pending,
    Approved,
    Rejected,
    Expired,
}

impl ApprovalState {
    /// Terminal states are immutable
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ApprovalState::Pending)
    }
}

/// A persisted approval request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRecord {
    pub approval_id: String,
    pub workflow_id: String,
    pub risk_level: RiskLevel,
    pub action_type: String,
    pub description: String,
    pub state: ApprovalState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decided_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Health of a registered specialist endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Active,
    Busy,
    Offline,
}

/// A registered specialist agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub agent_id: String,
    pub display_name: String,
    pub base_url: String,
    #[serde(default)]
    pub capability_tags: Vec<String>,
    pub status: AgentStatus,
    pub last_heartbeat: DateTime<Utc>,
}

impl AgentRecord {
    /// Whether the agent can take work given the heartbeat TTL
    pub fn is_healthy(&self, now: DateTime<Utc>, heartbeat_ttl: chrono::Duration) -> bool {
        self.status == AgentStatus::Active && now - self.last_heartbeat <= heartbeat_ttl
    }
}

/// Key of a task record: `tasks/{task_id}`
pub fn task_key(task_id: &str) -> String {
    format!("tasks/{task_id}")
}

/// Key of an approval record: `approvals/{approval_id}`
pub fn approval_key(approval_id: &str) -> String {
    format!("approvals/{approval_id}")
}

/// Prefix for all approval records
pub const APPROVAL_PREFIX: &str = "approvals/";

/// Secondary index key: `approval_index/{workflow_id}/{approval_id}`
pub fn approval_index_key(workflow_id: &str, approval_id: &str) -> String {
    format!("approval_index/{workflow_id}/{approval_id}")
}

/// Prefix of one workflow's approval index entries
pub fn approval_index_prefix(workflow_id: &str) -> String {
    format!("approval_index/{workflow_id}/")
}

/// Key of an agent row: `agents/{agent_id}`
pub fn agent_key(agent_id: &str) -> String {
    format!("agents/{agent_id}")
}

/// Prefix for all agent rows
pub const AGENT_PREFIX: &str = "agents/";

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_priority_accepts_med_alias() {
        let p: TaskPriority = serde_json::from_value(json!("med")).unwrap();
        assert_eq!(p, TaskPriority::Medium);
        let p: TaskPriority = serde_json::from_value(json!("medium")).unwrap();
        assert_eq!(p, TaskPriority::Medium);
    }

    #[test]
    fn test_elapsed_and_on_time() {
        let created = Utc::now() - chrono::Duration::hours(2);
        let record = TaskRecord {
            task: Task {
                task_id: "T1".into(),
                title: "t".into(),
                description: "d".into(),
                priority: TaskPriority::High,
                requester: None,
                created_at: created,
                parent_task_id: None,
                metadata: BTreeMap::new(),
            },
            subtasks: vec![],
            status: TaskStatus::Running,
            approval_request_id: None,
            started_at: Some(created),
            finished_at: None,
            failure_reason: None,
        };
        let now = Utc::now();
        assert!(record.elapsed_seconds(now) >= 7_000);
        // High priority gives 4h; 2h elapsed is still on time.
        assert!(record.on_time(now));
    }

    #[test]
    fn test_agent_health_requires_fresh_heartbeat() {
        let now = Utc::now();
        let agent = AgentRecord {
            agent_id: "a1".into(),
            display_name: "Feature Dev".into(),
            base_url: "http://localhost:9000".into(),
            capability_tags: vec!["feature-dev".into()],
            status: AgentStatus::Active,
            last_heartbeat: now - chrono::Duration::seconds(120),
        };
        assert!(!agent.is_healthy(now, chrono::Duration::seconds(60)));
        assert!(agent.is_healthy(now, chrono::Duration::seconds(300)));
    }
}
