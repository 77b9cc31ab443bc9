//! Error types for the persistence adapter and checkpoint store

use thiserror::Error;

/// Convenience result type using [`StoreError`]
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors surfaced by the key-value adapter and the checkpoint saver
#[derive(Debug, Error)]
pub enum StoreError {
    /// The requested key does not exist
    #[error("key not found: {0}")]
    NotFound(String),

    /// Compare-and-swap failed because another writer got there first
    ///
    /// Callers that can recompute their write should retry; the engine maps
    /// an exhausted retry budget to its concurrency error.
    #[error("version conflict on '{key}': expected {expected:?}, found {found:?}")]
    VersionConflict {
        /// Contended key
        key: String,
        /// Version the writer expected (`None` = expected absent)
        expected: Option<u64>,
        /// Version actually present (`None` = key absent)
        found: Option<u64>,
    },

    /// A checkpoint write would break the append-only, strictly increasing
    /// step sequence for its workflow
    #[error("non-monotonic checkpoint for workflow '{workflow_id}': step {step_id} already persisted")]
    DuplicateStep {
        /// Workflow whose sequence was violated
        workflow_id: String,
        /// Offending step id
        step_id: u64,
    },

    /// A persisted blob could not be (de)serialized
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Backend-specific failure (connection loss, I/O, ...)
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Whether a retry with the same inputs may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::VersionConflict { .. } | StoreError::Backend(_)
        )
    }
}
