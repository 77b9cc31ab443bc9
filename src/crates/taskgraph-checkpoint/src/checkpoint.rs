//! Checkpoint and workflow-row data structures
//!
//! A [`Checkpoint`] is a complete snapshot of workflow state at a node
//! boundary, sufficient to resume execution deterministically. Checkpoints are
//! append-only per workflow with strictly increasing `step_id`s; the latest
//! one is the resumption point.
//!
//! A [`WorkflowRow`] is the mutable head record for a workflow instance:
//! current node, status, latest step, TTL, and parent link. Rows are only ever
//! mutated through compare-and-swap on their KV version, which is what gives
//! the engine its single-runner guarantee.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle states of a workflow instance
///
/// `created → running ⇄ waiting_approval → running → {completed, failed,
/// cancelled, expired}`. Terminal states persist until TTL expiry removes the
/// instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Instance exists but execution has not started
    Created,
    /// A runner currently owns the instance
    Running,
    /// Suspended on an approval gate
    WaitingApproval,
    /// All nodes ran to `END`
    Completed,
    /// A node failed fatally or a rejection had no recovery edge
    Failed,
    /// Caller cancelled; last checkpoint carries this status
    Cancelled,
    /// TTL sweeper reaped the instance
    Expired,
}

impl WorkflowStatus {
    /// Whether no further transitions are possible
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed
                | WorkflowStatus::Failed
                | WorkflowStatus::Cancelled
                | WorkflowStatus::Expired
        )
    }
}

/// State snapshot persisted after every node completion
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Owning workflow (equals the task id)
    pub workflow_id: String,
    /// Strictly increasing per workflow; assigned by the engine
    pub step_id: u64,
    /// Step this checkpoint descends from (`None` for the input checkpoint)
    pub parent_step_id: Option<u64>,
    /// Node whose completion produced this snapshot
    pub node: String,
    /// Workflow status at snapshot time
    pub status: WorkflowStatus,
    /// Full reduced state
    pub state: Value,
    /// Snapshot timestamp
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Create a snapshot for `node` at `step_id`
    pub fn new(
        workflow_id: impl Into<String>,
        step_id: u64,
        parent_step_id: Option<u64>,
        node: impl Into<String>,
        status: WorkflowStatus,
        state: Value,
    ) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            step_id,
            parent_step_id,
            node: node.into(),
            status,
            state,
            created_at: Utc::now(),
        }
    }
}

/// Mutable head record for a workflow instance
///
/// The KV version of this row doubles as the CAS token for every engine
/// mutation; it is carried alongside the row, never inside it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRow {
    /// Instance id (= task id)
    pub workflow_id: String,
    /// Compiled graph this instance executes
    pub graph_name: String,
    /// Node the instance is at (or will resume from)
    pub current_node: String,
    /// Current lifecycle status
    pub status: WorkflowStatus,
    /// Highest persisted checkpoint step
    pub latest_step: u64,
    /// Instance is eligible for the sweeper strictly after this instant
    pub expires_at: DateTime<Utc>,
    /// Audit-chain parent, if this workflow was spawned by another
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_workflow_id: Option<String>,
    /// Live references from composed context windows
    pub refcount: u32,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last mutation timestamp
    pub updated_at: DateTime<Utc>,
}

impl WorkflowRow {
    /// Create a fresh row in [`WorkflowStatus::Created`]
    pub fn new(
        workflow_id: impl Into<String>,
        graph_name: impl Into<String>,
        entry_node: impl Into<String>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        let now = Utc::now();
        Self {
            workflow_id: workflow_id.into(),
            graph_name: graph_name.into(),
            current_node: entry_node.into(),
            status: WorkflowStatus::Created,
            latest_step: 0,
            expires_at,
            parent_workflow_id: None,
            refcount: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Set the audit-chain parent
    pub fn with_parent(mut self, parent_workflow_id: impl Into<String>) -> Self {
        self.parent_workflow_id = Some(parent_workflow_id.into());
        self
    }
}

/// Key of a workflow row: `workflows/{workflow_id}`
pub fn workflow_key(workflow_id: &str) -> String {
    format!("workflows/{workflow_id}")
}

/// Key of a checkpoint: `checkpoints/{workflow_id}/{step_id:020}`
///
/// Steps are zero-padded so prefix scans return them in execution order.
pub fn checkpoint_key(workflow_id: &str, step_id: u64) -> String {
    format!("checkpoints/{workflow_id}/{step_id:020}")
}

/// Scan prefix covering all checkpoints of one workflow
pub fn checkpoint_prefix(workflow_id: &str) -> String {
    format!("checkpoints/{workflow_id}/")
}

/// Key of a TTL index entry: `workflow_ttl/{expires_at}/{workflow_id}`
///
/// The timestamp is rendered fixed-width UTC so entries sort chronologically
/// under a prefix scan.
pub fn ttl_key(expires_at: DateTime<Utc>, workflow_id: &str) -> String {
    format!(
        "workflow_ttl/{}/{}",
        expires_at.format("%Y-%m-%dT%H:%M:%S%.3fZ"),
        workflow_id
    )
}

/// Scan prefix covering the whole TTL index
pub const TTL_PREFIX: &str = "workflow_ttl/";

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_terminal_statuses() {
        assert!(WorkflowStatus::Completed.is_terminal());
        assert!(WorkflowStatus::Failed.is_terminal());
        assert!(WorkflowStatus::Cancelled.is_terminal());
        assert!(WorkflowStatus::Expired.is_terminal());
        assert!(!WorkflowStatus::Running.is_terminal());
        assert!(!WorkflowStatus::WaitingApproval.is_terminal());
    }

    #[test]
    fn test_checkpoint_keys_sort_by_step() {
        let k1 = checkpoint_key("w", 9);
        let k2 = checkpoint_key("w", 10);
        let k3 = checkpoint_key("w", 100);
        assert!(k1 < k2);
        assert!(k2 < k3);
    }

    #[test]
    fn test_ttl_keys_sort_chronologically() {
        let early = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let late = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        assert!(ttl_key(early, "w") < ttl_key(late, "w"));
    }
}
