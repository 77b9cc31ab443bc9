//! Checkpoint saver trait and the KV-backed implementation
//!
//! [`CheckpointSaver`] is the seam between the graph engine and durable
//! storage. The engine calls `save` after every node completion and
//! `put_workflow` for every head-row transition; `latest` is the resumption
//! point after a restart or an approval pause.
//!
//! [`KvCheckpointSaver`] lays records out in the adapter-agnostic key scheme
//! (`workflows/{id}`, `checkpoints/{id}/{step}`, `workflow_ttl/{ts}/{id}`)
//! over any [`KvStore`].

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::checkpoint::{
    checkpoint_key, checkpoint_prefix, ttl_key, workflow_key, Checkpoint, WorkflowRow, TTL_PREFIX,
};
use crate::error::{Result, StoreError};
use crate::kv::KvStore;

/// Persistence seam used by the graph engine
#[async_trait]
pub trait CheckpointSaver: Send + Sync {
    /// Append a checkpoint; fails with [`StoreError::DuplicateStep`] when the
    /// step already exists (append-only guarantee)
    async fn save(&self, checkpoint: &Checkpoint) -> Result<()>;

    /// Latest checkpoint for a workflow, i.e. the resumption point
    async fn latest(&self, workflow_id: &str) -> Result<Option<Checkpoint>>;

    /// All checkpoints of a workflow in step order
    async fn list(&self, workflow_id: &str) -> Result<Vec<Checkpoint>>;

    /// Remove every checkpoint of a workflow (TTL reaping)
    async fn delete_all(&self, workflow_id: &str) -> Result<()>;

    /// Read a workflow head row together with its CAS version
    async fn get_workflow(&self, workflow_id: &str) -> Result<Option<(WorkflowRow, u64)>>;

    /// Write a workflow head row
    ///
    /// `expected_version = None` inserts a fresh row and fails when one
    /// already exists; `Some(v)` is a CAS update. Returns the new version.
    async fn put_workflow(&self, row: &WorkflowRow, expected_version: Option<u64>) -> Result<u64>;

    /// Add a TTL index entry for a workflow
    async fn index_ttl(&self, workflow_id: &str, expires_at: DateTime<Utc>) -> Result<()>;

    /// Remove a TTL index entry
    async fn clear_ttl(&self, workflow_id: &str, expires_at: DateTime<Utc>) -> Result<()>;

    /// `(index_key, workflow_id)` pairs whose indexed `expires_at` is
    /// strictly before `until`; the key lets sweepers drop stale entries
    async fn scan_due(&self, until: DateTime<Utc>) -> Result<Vec<(String, String)>>;
}

/// [`CheckpointSaver`] over any [`KvStore`]
pub struct KvCheckpointSaver {
    store: Arc<dyn KvStore>,
}

impl KvCheckpointSaver {
    /// Wrap a KV backend
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    /// The underlying adapter, for components sharing the same backend
    pub fn store(&self) -> Arc<dyn KvStore> {
        Arc::clone(&self.store)
    }
}

#[async_trait]
impl CheckpointSaver for KvCheckpointSaver {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let key = checkpoint_key(&checkpoint.workflow_id, checkpoint.step_id);
        let blob = serde_json::to_value(checkpoint)?;
        self.store
            .compare_and_swap(&key, None, blob)
            .await
            .map_err(|err| match err {
                StoreError::VersionConflict { .. } => StoreError::DuplicateStep {
                    workflow_id: checkpoint.workflow_id.clone(),
                    step_id: checkpoint.step_id,
                },
                other => other,
            })?;
        tracing::debug!(
            workflow_id = %checkpoint.workflow_id,
            step_id = checkpoint.step_id,
            node = %checkpoint.node,
            "checkpoint persisted"
        );
        Ok(())
    }

    async fn latest(&self, workflow_id: &str) -> Result<Option<Checkpoint>> {
        let hits = self.store.scan_prefix(&checkpoint_prefix(workflow_id)).await?;
        match hits.last() {
            Some((_, record)) => Ok(Some(record.decode()?)),
            None => Ok(None),
        }
    }

    async fn list(&self, workflow_id: &str) -> Result<Vec<Checkpoint>> {
        let hits = self.store.scan_prefix(&checkpoint_prefix(workflow_id)).await?;
        hits.iter().map(|(_, record)| record.decode()).collect()
    }

    async fn delete_all(&self, workflow_id: &str) -> Result<()> {
        let hits = self.store.scan_prefix(&checkpoint_prefix(workflow_id)).await?;
        for (key, _) in hits {
            self.store.delete(&key).await?;
        }
        Ok(())
    }

    async fn get_workflow(&self, workflow_id: &str) -> Result<Option<(WorkflowRow, u64)>> {
        match self.store.get(&workflow_key(workflow_id)).await? {
            Some(record) => {
                let row: WorkflowRow = record.decode()?;
                Ok(Some((row, record.version)))
            }
            None => Ok(None),
        }
    }

    async fn put_workflow(&self, row: &WorkflowRow, expected_version: Option<u64>) -> Result<u64> {
        let key = workflow_key(&row.workflow_id);
        let blob = serde_json::to_value(row)?;
        self.store.compare_and_swap(&key, expected_version, blob).await
    }

    async fn index_ttl(&self, workflow_id: &str, expires_at: DateTime<Utc>) -> Result<()> {
        let key = ttl_key(expires_at, workflow_id);
        self.store.put(&key, serde_json::json!(workflow_id)).await?;
        Ok(())
    }

    async fn clear_ttl(&self, workflow_id: &str, expires_at: DateTime<Utc>) -> Result<()> {
        self.store.delete(&ttl_key(expires_at, workflow_id)).await
    }

    async fn scan_due(&self, until: DateTime<Utc>) -> Result<Vec<(String, String)>> {
        let cutoff = ttl_key(until, "");
        let hits = self.store.scan_prefix(TTL_PREFIX).await?;
        let mut due = Vec::new();
        for (key, record) in hits {
            // Keys sort chronologically; everything at or past the cutoff is
            // not yet due (expires_at == now is not expired).
            if key >= cutoff {
                break;
            }
            let workflow_id: String = record.decode()?;
            due.push((key, workflow_id));
        }
        Ok(due)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::WorkflowStatus;
    use crate::kv::MemoryKvStore;
    use chrono::Duration;
    use serde_json::json;

    fn saver() -> KvCheckpointSaver {
        KvCheckpointSaver::new(Arc::new(MemoryKvStore::new()))
    }

    #[tokio::test]
    async fn test_checkpoints_are_append_only() {
        let saver = saver();
        let cp = Checkpoint::new("w1", 1, None, "router", WorkflowStatus::Running, json!({}));

        saver.save(&cp).await.unwrap();
        let err = saver.save(&cp).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateStep { step_id: 1, .. }));
    }

    #[tokio::test]
    async fn test_latest_returns_highest_step() {
        let saver = saver();
        for step in 1..=12u64 {
            let cp = Checkpoint::new(
                "w1",
                step,
                Some(step.saturating_sub(1)).filter(|s| *s > 0),
                "specialist",
                WorkflowStatus::Running,
                json!({ "step": step }),
            );
            saver.save(&cp).await.unwrap();
        }

        let latest = saver.latest("w1").await.unwrap().unwrap();
        assert_eq!(latest.step_id, 12);
        assert_eq!(saver.list("w1").await.unwrap().len(), 12);
    }

    #[tokio::test]
    async fn test_workflow_row_cas_roundtrip() {
        let saver = saver();
        let row = WorkflowRow::new("w1", "dev_tasks", "router", Utc::now() + Duration::hours(24));

        let v1 = saver.put_workflow(&row, None).await.unwrap();
        assert_eq!(v1, 1);

        // Second insert must fail: the row already exists.
        assert!(saver.put_workflow(&row, None).await.is_err());

        let (mut loaded, version) = saver.get_workflow("w1").await.unwrap().unwrap();
        loaded.status = WorkflowStatus::Running;
        let v2 = saver.put_workflow(&loaded, Some(version)).await.unwrap();
        assert_eq!(v2, 2);

        // Stale CAS loses.
        assert!(saver.put_workflow(&loaded, Some(version)).await.is_err());
    }

    #[tokio::test]
    async fn test_scan_due_uses_strict_cutoff() {
        let saver = saver();
        let now = Utc::now();

        saver.index_ttl("past", now - Duration::hours(1)).await.unwrap();
        saver.index_ttl("exact", now).await.unwrap();
        saver.index_ttl("future", now + Duration::hours(1)).await.unwrap();

        let due = saver.scan_due(now).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].1, "past");
    }
}
