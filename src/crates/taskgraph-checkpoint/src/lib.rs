//! # taskgraph-checkpoint - Durable State for Workflow Execution
//!
//! Persistence adapter and checkpoint store for the taskgraph engine. This
//! crate owns two abstractions:
//!
//! - **[`KvStore`]** - a typed key-value adapter with monotonic per-key
//!   versions, ordered prefix scans, and compare-and-swap. Everything durable
//!   in the control plane (workflow rows, checkpoints, approvals, agent
//!   registry rows, the TTL index) lives behind this trait.
//! - **[`CheckpointSaver`]** - the engine-facing seam for append-only
//!   checkpoints and CAS-guarded workflow head rows.
//!
//! ## Key layout
//!
//! ```text
//! workflows/{workflow_id}                      head row (CAS-versioned)
//! checkpoints/{workflow_id}/{step_id:020}      append-only step records
//! workflow_ttl/{expires_at}/{workflow_id}      sweeper index
//! ```
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use taskgraph_checkpoint::{
//!     Checkpoint, CheckpointSaver, KvCheckpointSaver, MemoryKvStore, WorkflowStatus,
//! };
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let saver = KvCheckpointSaver::new(Arc::new(MemoryKvStore::new()));
//!
//! let checkpoint = Checkpoint::new(
//!     "task-42",
//!     1,
//!     None,
//!     "router",
//!     WorkflowStatus::Running,
//!     serde_json::json!({ "messages": [] }),
//! );
//! saver.save(&checkpoint).await?;
//!
//! let resume_point = saver.latest("task-42").await?;
//! assert!(resume_point.is_some());
//! # Ok(())
//! # }
//! ```
//!
//! [`MemoryKvStore`] is the reference backend; production deployments
//! implement [`KvStore`] over their store of choice and nothing else changes.

pub mod checkpoint;
pub mod error;
pub mod kv;
pub mod saver;

pub use checkpoint::{
    checkpoint_key, checkpoint_prefix, ttl_key, workflow_key, Checkpoint, WorkflowRow,
    WorkflowStatus, TTL_PREFIX,
};
pub use error::{Result, StoreError};
pub use kv::{update_with_retry, KvStore, MemoryKvStore, VersionedRecord, CAS_MAX_ATTEMPTS};
pub use saver::{CheckpointSaver, KvCheckpointSaver};
