//! Error types for graph construction and execution
//!
//! Two layers: [`NodeError`] is what a node's `run` returns and carries the
//! retry classification; [`GraphError`] is what the engine surfaces to
//! callers once retries and recovery edges are exhausted.

use taskgraph_checkpoint::StoreError;
use thiserror::Error;

/// Convenience result type using [`GraphError`]
pub type Result<T> = std::result::Result<T, GraphError>;

/// Failure of a single node attempt
///
/// The engine retries `Timeout` and `Upstream` per the configured policy;
/// `Internal` fails immediately.
#[derive(Debug, Clone, Error)]
pub enum NodeError {
    /// The node exceeded its configured timeout
    #[error("node timed out after {elapsed_ms}ms")]
    Timeout {
        /// Milliseconds elapsed before the deadline fired
        elapsed_ms: u64,
    },

    /// An external collaborator (LLM provider, specialist endpoint,
    /// persistence) failed transiently
    #[error("upstream failure: {message}")]
    Upstream {
        /// Collaborator error description
        message: String,
    },

    /// A bug or unrecoverable condition inside the node
    #[error("internal node error: {message}")]
    Internal {
        /// Error description
        message: String,
    },
}

impl NodeError {
    /// Shorthand for an upstream failure
    pub fn upstream(message: impl Into<String>) -> Self {
        NodeError::Upstream { message: message.into() }
    }

    /// Shorthand for an internal failure
    pub fn internal(message: impl Into<String>) -> Self {
        NodeError::Internal { message: message.into() }
    }

    /// Whether another attempt may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, NodeError::Timeout { .. } | NodeError::Upstream { .. })
    }
}

/// Errors surfaced by graph compilation and execution
#[derive(Debug, Error)]
pub enum GraphError {
    /// Graph structure is invalid (unknown edge target, missing entry, ...)
    #[error("graph validation failed: {0}")]
    Validation(String),

    /// A node failed after the retry budget was exhausted
    #[error("node '{node}' failed: {source}")]
    NodeFailed {
        /// Name of the failing node
        node: String,
        /// Final attempt's error
        #[source]
        source: NodeError,
    },

    /// Another runner owns this workflow, or a CAS retry budget ran out
    #[error("concurrent execution rejected for workflow '{workflow_id}': {reason}")]
    Concurrency {
        /// Contended workflow
        workflow_id: String,
        /// What the caller collided with
        reason: String,
    },

    /// The workflow is not in a state that permits the requested operation
    #[error("workflow '{workflow_id}' is {status} and cannot be {operation}")]
    InvalidState {
        /// Workflow in question
        workflow_id: String,
        /// Its current status, rendered
        status: String,
        /// The rejected operation (`invoked`, `resumed`, ...)
        operation: String,
    },

    /// No workflow instance exists for the given id
    #[error("workflow '{workflow_id}' not found")]
    NotFound {
        /// Unknown workflow id
        workflow_id: String,
    },

    /// Execution was cancelled by the caller
    #[error("workflow '{workflow_id}' cancelled")]
    Cancelled {
        /// Cancelled workflow
        workflow_id: String,
    },

    /// Fatal engine failure; the workflow is marked failed and the caller
    /// must re-submit under a new task id
    #[error("engine failure: {0}")]
    Engine(String),

    /// Checkpoint or row persistence failed; fatal so the caller never
    /// observes progress without durability
    #[error("checkpoint persistence failed: {0}")]
    Checkpoint(#[from] StoreError),

    /// State could not be (de)serialized
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
