//! Domain error type for the control plane
//!
//! [`OrchestratorError`] covers every failure the orchestrator surfaces to
//! callers; the HTTP layer in `api::error` maps it onto status codes and the
//! `{error_kind, message, context, suggested_recovery}` wire shape.

use taskgraph_core::GraphError;
use thiserror::Error;

/// Convenience result type using [`OrchestratorError`]
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Failures surfaced by orchestrator components
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Malformed input; never retried, returned to the caller verbatim
    #[error("validation failed: {0}")]
    Validation(String),

    /// The referenced entity does not exist
    #[error("{kind} '{id}' not found")]
    NotFound {
        /// Entity kind (`task`, `approval`, `agent`, `workflow`)
        kind: &'static str,
        /// Missing id
        id: String,
    },

    /// Duplicate concurrent invocation or exhausted CAS budget
    #[error("concurrency conflict: {0}")]
    Concurrency(String),

    /// The entity is not in a state that permits the operation
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Resume was attempted on a rejected approval
    #[error("approval for task '{task_id}' was rejected{}", reason.as_ref().map(|r| format!(": {r}")).unwrap_or_default())]
    ApprovalRejected {
        /// Task whose resume was refused
        task_id: String,
        /// Reviewer-provided reason, if any
        reason: Option<String>,
    },

    /// Resume was attempted on an expired approval
    #[error("approval for task '{task_id}' has expired")]
    ApprovalExpired {
        /// Task whose resume was refused
        task_id: String,
    },

    /// Illegal approval state transition (e.g. deciding a decided request)
    #[error("illegal approval transition: {0}")]
    ApprovalState(String),

    /// Parent chain cycle or depth overflow
    #[error("workflow chain error: {0}")]
    Chain(String),

    /// The planner admission queue is at its high-water mark
    #[error("orchestrator overloaded: {0}")]
    Overloaded(String),

    /// Engine-level failure bubbled out of a workflow run
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// Persistence failure outside the engine
    #[error("storage error: {0}")]
    Store(#[from] taskgraph_checkpoint::StoreError),

    /// JSON (de)serialization failure
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Anything else that should read as a 500
    #[error("internal error: {0}")]
    Internal(String),
}

impl OrchestratorError {
    /// Stable machine-readable kind, serialized as `error_kind`
    pub fn kind(&self) -> &'static str {
        match self {
            OrchestratorError::Validation(_) => "validation_error",
            OrchestratorError::NotFound { .. } => "not_found",
            OrchestratorError::Concurrency(_) => "concurrency_error",
            OrchestratorError::InvalidState(_) => "invalid_state",
            OrchestratorError::ApprovalRejected { .. } => "approval_rejected",
            OrchestratorError::ApprovalExpired { .. } => "approval_expired",
            OrchestratorError::ApprovalState(_) => "approval_state_error",
            OrchestratorError::Chain(_) => "chain_error",
            OrchestratorError::Overloaded(_) => "overloaded",
            OrchestratorError::Graph(GraphError::Concurrency { .. }) => "concurrency_error",
            OrchestratorError::Graph(GraphError::NotFound { .. }) => "not_found",
            OrchestratorError::Graph(GraphError::InvalidState { .. }) => "invalid_state",
            OrchestratorError::Graph(_) => "engine_error",
            OrchestratorError::Store(_) => "storage_error",
            OrchestratorError::Serialization(_) => "serialization_error",
            OrchestratorError::Internal(_) => "internal_error",
        }
    }

    /// Optional hint serialized as `suggested_recovery`
    pub fn suggested_recovery(&self) -> Option<&'static str> {
        match self {
            OrchestratorError::Concurrency(_)
            | OrchestratorError::Graph(GraphError::Concurrency { .. }) => {
                Some("retry the request; another invocation holds this workflow")
            }
            OrchestratorError::Overloaded(_) => Some("back off and retry after the Retry-After interval"),
            OrchestratorError::Graph(GraphError::NodeFailed { .. } | GraphError::Engine(_)) => {
                Some("re-submit the work under a new task_id")
            }
            OrchestratorError::ApprovalExpired { .. } => {
                Some("re-submit the task to obtain a fresh approval request")
            }
            _ => None,
        }
    }
}
