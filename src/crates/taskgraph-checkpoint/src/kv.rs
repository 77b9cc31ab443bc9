//! Typed key-value adapter with versioned records and compare-and-swap
//!
//! This module defines the **[`KvStore`]** trait - the storage abstraction every
//! durable structure in the workspace sits on (workflow rows, checkpoints,
//! approvals, agent registry rows, TTL index entries). The trait is
//! deliberately small: `get`, `put`, `delete`, ordered `scan_prefix`, and
//! `compare_and_swap` over monotonic per-key versions.
//!
//! [`MemoryKvStore`] is the reference backend used by tests and single-node
//! deployments. Production backends (PostgreSQL, Redis, object stores)
//! implement the same trait downstream; the rest of the workspace never sees
//! anything but `Arc<dyn KvStore>`.
//!
//! # Versioning
//!
//! Every key carries a version counter starting at 1 and incremented on each
//! successful write. [`KvStore::compare_and_swap`] takes the version the
//! writer last observed (`None` for "create only if absent") and fails with
//! [`StoreError::VersionConflict`] when it no longer matches. Contended
//! writers use [`update_with_retry`] which re-reads and re-applies the
//! mutation up to a bounded number of attempts.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, StoreError};

/// A stored value together with its monotonic version
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VersionedRecord {
    /// Per-key write counter, starting at 1
    pub version: u64,
    /// The stored JSON blob
    pub value: Value,
}

impl VersionedRecord {
    /// Deserialize the stored blob into a typed value
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.value.clone())?)
    }
}

/// Durable key-value store with ordered prefix scans and CAS writes
///
/// Implementations must guarantee:
///
/// - `put` and `compare_and_swap` are atomic per key
/// - versions are strictly increasing per key and never reused
/// - `scan_prefix` returns entries in ascending key order
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Read a key, returning `None` when absent
    async fn get(&self, key: &str) -> Result<Option<VersionedRecord>>;

    /// Unconditionally write a key, returning the new version
    async fn put(&self, key: &str, value: Value) -> Result<u64>;

    /// Remove a key; removing an absent key is not an error
    async fn delete(&self, key: &str) -> Result<()>;

    /// All entries whose key starts with `prefix`, in ascending key order
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, VersionedRecord)>>;

    /// Write `value` only if the current version equals `expected`
    ///
    /// `expected = None` means the key must not exist (insert-if-absent).
    /// Returns the new version on success.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        value: Value,
    ) -> Result<u64>;
}

/// Default CAS retry budget for contended writers
pub const CAS_MAX_ATTEMPTS: u32 = 3;

/// Read-modify-write a key with bounded CAS retries
///
/// `mutate` receives the current record (if any) and returns the replacement
/// value. On [`StoreError::VersionConflict`] the record is re-read and
/// `mutate` re-applied, up to `max_attempts` total tries; the final conflict
/// is surfaced to the caller.
pub async fn update_with_retry<F>(
    store: &dyn KvStore,
    key: &str,
    max_attempts: u32,
    mut mutate: F,
) -> Result<u64>
where
    F: FnMut(Option<&VersionedRecord>) -> Result<Value> + Send,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let current = store.get(key).await?;
        let next = mutate(current.as_ref())?;
        let expected = current.as_ref().map(|r| r.version);
        match store.compare_and_swap(key, expected, next).await {
            Ok(version) => return Ok(version),
            Err(err @ StoreError::VersionConflict { .. }) if attempt < max_attempts => {
                tracing::debug!(key, attempt, "CAS conflict, retrying: {err}");
            }
            Err(err) => return Err(err),
        }
    }
}

/// In-memory reference backend
///
/// Backed by a `DashMap`; suitable for tests and single-process deployments.
/// All trait guarantees hold per key because `DashMap` entries are mutated
/// under their shard lock.
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    entries: DashMap<String, VersionedRecord>,
}

impl MemoryKvStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys (test helper)
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no keys
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<VersionedRecord>> {
        Ok(self.entries.get(key).map(|r| r.clone()))
    }

    async fn put(&self, key: &str, value: Value) -> Result<u64> {
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| VersionedRecord { version: 0, value: Value::Null });
        entry.version += 1;
        entry.value = value;
        Ok(entry.version)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, VersionedRecord)>> {
        let mut hits: Vec<(String, VersionedRecord)> = self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        hits.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(hits)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        value: Value,
    ) -> Result<u64> {
        match self.entries.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut occ) => {
                let found = occ.get().version;
                if expected != Some(found) {
                    return Err(StoreError::VersionConflict {
                        key: key.to_string(),
                        expected,
                        found: Some(found),
                    });
                }
                let next = found + 1;
                occ.insert(VersionedRecord { version: next, value });
                Ok(next)
            }
            dashmap::mapref::entry::Entry::Vacant(vac) => {
                if expected.is_some() {
                    return Err(StoreError::VersionConflict {
                        key: key.to_string(),
                        expected,
                        found: None,
                    });
                }
                vac.insert(VersionedRecord { version: 1, value });
                Ok(1)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_put_increments_version() {
        let store = MemoryKvStore::new();
        assert_eq!(store.put("k", json!(1)).await.unwrap(), 1);
        assert_eq!(store.put("k", json!(2)).await.unwrap(), 2);

        let rec = store.get("k").await.unwrap().unwrap();
        assert_eq!(rec.version, 2);
        assert_eq!(rec.value, json!(2));
    }

    #[tokio::test]
    async fn test_cas_insert_if_absent() {
        let store = MemoryKvStore::new();
        assert_eq!(store.compare_and_swap("k", None, json!("a")).await.unwrap(), 1);

        let err = store.compare_and_swap("k", None, json!("b")).await.unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict { found: Some(1), .. }));
    }

    #[tokio::test]
    async fn test_cas_stale_version_rejected() {
        let store = MemoryKvStore::new();
        store.put("k", json!("a")).await.unwrap();
        store.put("k", json!("b")).await.unwrap();

        let err = store
            .compare_and_swap("k", Some(1), json!("c"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::VersionConflict { expected: Some(1), found: Some(2), .. }
        ));
    }

    #[tokio::test]
    async fn test_scan_prefix_is_key_ordered() {
        let store = MemoryKvStore::new();
        store.put("checkpoints/w1/00000000000000000002", json!(2)).await.unwrap();
        store.put("checkpoints/w1/00000000000000000001", json!(1)).await.unwrap();
        store.put("checkpoints/w2/00000000000000000001", json!(9)).await.unwrap();

        let hits = store.scan_prefix("checkpoints/w1/").await.unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits[0].0 < hits[1].0);
        assert_eq!(hits[0].1.value, json!(1));
    }

    #[tokio::test]
    async fn test_update_with_retry_applies_mutation() {
        let store = MemoryKvStore::new();
        store.put("counter", json!(10)).await.unwrap();

        let version = update_with_retry(&store, "counter", CAS_MAX_ATTEMPTS, |current| {
            let n = current.map(|r| r.value.as_i64().unwrap_or(0)).unwrap_or(0);
            Ok(json!(n + 1))
        })
        .await
        .unwrap();

        assert_eq!(version, 2);
        let rec = store.get("counter").await.unwrap().unwrap();
        assert_eq!(rec.value, json!(11));
    }
}
