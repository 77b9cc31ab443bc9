//! Workflow lifecycle: TTL, parent chains, resource deduplication
//!
//! Three responsibilities:
//!
//! - **TTL** - every bus event carrying a `workflow_id` pushes that
//!   workflow's `expires_at` forward; a periodic sweeper reaps workflows
//!   whose `expires_at` is strictly in the past and whose status is terminal
//!   (or `waiting_approval` beyond a grace window), deleting their
//!   checkpoints and marking the instance `expired`.
//! - **Parent chains** - `get_chain` walks `parent_workflow_id` references
//!   with a visited set; cycles and chains beyond the depth cap raise a
//!   chain error. Used for audit trails.
//! - **Resource dedup** - context windows composed from workflow events keep
//!   only the newest entry per `resource_id`, newest first.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use taskgraph_checkpoint::{CheckpointSaver, StoreError, WorkflowStatus};

use crate::error::{OrchestratorError, Result};
use crate::events::{EventBus, EventKind};

/// One resource-bearing entry of a composed context window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceEvent {
    /// Identity used for deduplication (file path, artefact handle, ...)
    pub resource_id: String,
    /// Emission instant; the newest entry per id survives
    pub emitted_at: i64,
    /// Opaque content carried into the context window
    #[serde(default)]
    pub payload: Value,
}

/// Keep only the newest entry per `resource_id`, newest first
///
/// Output is a subset of the input; for each surviving id the entry has the
/// maximal `emitted_at` among entries with that id. Idempotent:
/// `dedup(dedup(xs)) == dedup(xs)`.
pub fn dedup_resources(events: &[ResourceEvent]) -> Vec<ResourceEvent> {
    let mut ordered: Vec<&ResourceEvent> = events.iter().collect();
    // Stable sort: equal timestamps keep input order, walk newest first.
    ordered.sort_by(|a, b| b.emitted_at.cmp(&a.emitted_at));

    let mut seen = HashSet::new();
    let mut kept = Vec::new();
    for event in ordered {
        if seen.insert(event.resource_id.as_str()) {
            kept.push(event.clone());
        }
    }
    kept
}

/// TTL and chain bookkeeping over the shared checkpoint saver
pub struct LifecycleManager {
    saver: Arc<dyn CheckpointSaver>,
    bus: Arc<EventBus>,
    ttl: chrono::Duration,
    approval_grace: chrono::Duration,
    max_chain_depth: usize,
}

impl LifecycleManager {
    /// Create a manager with the configured TTL and chain depth cap
    pub fn new(
        saver: Arc<dyn CheckpointSaver>,
        bus: Arc<EventBus>,
        ttl: chrono::Duration,
        approval_grace: chrono::Duration,
        max_chain_depth: usize,
    ) -> Self {
        Self { saver, bus, ttl, approval_grace, max_chain_depth }
    }

    /// Subscribe the TTL refresher to every event kind
    ///
    /// Any event referencing a workflow extends that workflow's lease.
    pub fn attach(self: &Arc<Self>) {
        let lifecycle = Arc::clone(self);
        self.bus.subscribe_all(Arc::new(move |event| {
            let lifecycle = lifecycle.clone();
            async move {
                if event.kind == EventKind::WorkflowExpired {
                    return; // reaping must not re-extend the lease
                }
                if let Some(workflow_id) = event.workflow_id() {
                    if let Err(err) = lifecycle.refresh(workflow_id).await {
                        tracing::debug!(%workflow_id, "TTL refresh skipped: {err}");
                    }
                }
            }
            .boxed()
        }));
    }

    /// Push a workflow's `expires_at` to `now + ttl`
    pub async fn refresh(&self, workflow_id: &str) -> Result<()> {
        let (mut row, version) = self
            .saver
            .get_workflow(workflow_id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound {
                kind: "workflow",
                id: workflow_id.to_string(),
            })?;

        let previous = row.expires_at;
        row.expires_at = Utc::now() + self.ttl;
        row.updated_at = Utc::now();
        match self.saver.put_workflow(&row, Some(version)).await {
            Ok(_) => {}
            Err(StoreError::VersionConflict { .. }) => {
                // The engine just checkpointed; its write carried the row
                // forward and the next event will refresh again.
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        }
        self.saver.clear_ttl(workflow_id, previous).await?;
        self.saver.index_ttl(workflow_id, row.expires_at).await?;
        tracing::trace!(%workflow_id, expires_at = %row.expires_at, "workflow TTL refreshed");
        Ok(())
    }

    /// Reap workflows whose lease ran out
    ///
    /// Eligible: status terminal, or `waiting_approval` past the grace
    /// window. Running workflows are left alone - their events keep the
    /// lease fresh. Returns the number of reaped workflows.
    pub async fn sweep(&self) -> Result<usize> {
        let now = Utc::now();
        let due = self.saver.scan_due(now).await?;
        let mut reaped = 0;

        for (index_key, workflow_id) in due {
            let Some((row, version)) = self.saver.get_workflow(&workflow_id).await? else {
                // Row already gone; drop the dangling index entry.
                self.saver.clear_ttl(&workflow_id, index_entry_time(&index_key)).await.ok();
                continue;
            };

            // Refreshes leave stale index entries behind; skip them.
            if row.expires_at >= now {
                self.saver.clear_ttl(&workflow_id, index_entry_time(&index_key)).await.ok();
                continue;
            }

            let eligible = row.status.is_terminal()
                || (row.status == WorkflowStatus::WaitingApproval
                    && row.expires_at + self.approval_grace < now);
            if !eligible {
                continue;
            }

            let mut expired = row.clone();
            expired.status = WorkflowStatus::Expired;
            expired.updated_at = now;
            match self.saver.put_workflow(&expired, Some(version)).await {
                Ok(_) => {}
                Err(StoreError::VersionConflict { .. }) => continue,
                Err(err) => return Err(err.into()),
            }

            self.saver.delete_all(&workflow_id).await?;
            self.saver.clear_ttl(&workflow_id, row.expires_at).await.ok();
            self.saver.clear_ttl(&workflow_id, index_entry_time(&index_key)).await.ok();
            reaped += 1;
            tracing::info!(%workflow_id, "workflow expired and checkpoints reaped");
            self.bus.emit(
                EventKind::WorkflowExpired,
                json!({ "workflow_id": workflow_id }),
                "lifecycle",
                workflow_id.clone(),
            );
        }
        Ok(reaped)
    }

    /// Walk the parent chain of a workflow, self first
    ///
    /// Fails with a chain error on cycles or when the chain exceeds the
    /// configured depth cap.
    pub async fn get_chain(&self, workflow_id: &str) -> Result<Vec<String>> {
        let mut chain = Vec::new();
        let mut visited: HashSet<String> = HashSet::new();
        let mut current = workflow_id.to_string();

        loop {
            if !visited.insert(current.clone()) {
                return Err(OrchestratorError::Chain(format!(
                    "cycle detected at workflow '{current}'"
                )));
            }
            if chain.len() >= self.max_chain_depth {
                return Err(OrchestratorError::Chain(format!(
                    "parent chain of '{workflow_id}' exceeds depth {}",
                    self.max_chain_depth
                )));
            }
            chain.push(current.clone());

            let Some((row, _)) = self.saver.get_workflow(&current).await? else {
                // A missing ancestor ends the walk; audit trails tolerate
                // reaped parents.
                break;
            };
            match row.parent_workflow_id {
                Some(parent) => current = parent,
                None => break,
            }
        }
        Ok(chain)
    }

    /// Spawn the periodic expiry sweeper
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let lifecycle = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match lifecycle.sweep().await {
                    Ok(0) => {}
                    Ok(reaped) => tracing::info!(reaped, "lifecycle sweep finished"),
                    Err(err) => tracing::error!("lifecycle sweep failed: {err}"),
                }
            }
        })
    }
}

/// Best-effort parse of the timestamp segment of a TTL index key
fn index_entry_time(index_key: &str) -> DateTime<Utc> {
    index_key
        .strip_prefix(taskgraph_checkpoint::TTL_PREFIX)
        .and_then(|rest| rest.split('/').next())
        .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskgraph_checkpoint::{KvCheckpointSaver, MemoryKvStore, WorkflowRow};

    fn manager(saver: Arc<KvCheckpointSaver>) -> Arc<LifecycleManager> {
        Arc::new(LifecycleManager::new(
            saver,
            Arc::new(EventBus::new()),
            chrono::Duration::hours(24),
            chrono::Duration::hours(6),
            20,
        ))
    }

    fn saver() -> Arc<KvCheckpointSaver> {
        Arc::new(KvCheckpointSaver::new(Arc::new(MemoryKvStore::new())))
    }

    async fn put_row(
        saver: &KvCheckpointSaver,
        id: &str,
        parent: Option<&str>,
        status: WorkflowStatus,
        expires_at: DateTime<Utc>,
    ) {
        let mut row = WorkflowRow::new(id, "dev_tasks", "router", expires_at);
        row.status = status;
        if let Some(parent) = parent {
            row.parent_workflow_id = Some(parent.to_string());
        }
        saver.put_workflow(&row, None).await.unwrap();
        saver.index_ttl(id, expires_at).await.unwrap();
    }

    #[test]
    fn test_dedup_keeps_newest_per_resource() {
        let events: Vec<ResourceEvent> = (1..=5)
            .map(|i| ResourceEvent {
                resource_id: "docker-compose.yml".into(),
                emitted_at: i,
                payload: json!({ "rev": i }),
            })
            .collect();

        let kept = dedup_resources(&events);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].emitted_at, 5);
    }

    #[test]
    fn test_dedup_preserves_newest_first_order() {
        let events = vec![
            ResourceEvent { resource_id: "a".into(), emitted_at: 3, payload: Value::Null },
            ResourceEvent { resource_id: "b".into(), emitted_at: 5, payload: Value::Null },
            ResourceEvent { resource_id: "a".into(), emitted_at: 1, payload: Value::Null },
            ResourceEvent { resource_id: "c".into(), emitted_at: 4, payload: Value::Null },
        ];
        let kept = dedup_resources(&events);
        let ids: Vec<&str> = kept.iter().map(|e| e.resource_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c", "a"]);
        assert_eq!(kept[2].emitted_at, 3);
    }

    #[test]
    fn test_dedup_is_idempotent() {
        let events = vec![
            ResourceEvent { resource_id: "a".into(), emitted_at: 2, payload: Value::Null },
            ResourceEvent { resource_id: "a".into(), emitted_at: 9, payload: Value::Null },
            ResourceEvent { resource_id: "b".into(), emitted_at: 4, payload: Value::Null },
        ];
        let once = dedup_resources(&events);
        let twice = dedup_resources(&once);
        assert_eq!(once, twice);
    }

    #[tokio::test]
    async fn test_chain_walk_terminates() {
        let saver = saver();
        let future = Utc::now() + chrono::Duration::hours(1);
        put_row(&saver, "deploy", None, WorkflowStatus::Completed, future).await;
        put_row(&saver, "hotfix", Some("deploy"), WorkflowStatus::Running, future).await;
        put_row(&saver, "followup", Some("hotfix"), WorkflowStatus::Running, future).await;

        let chain = manager(saver).get_chain("followup").await.unwrap();
        assert_eq!(chain, vec!["followup", "hotfix", "deploy"]);
    }

    #[tokio::test]
    async fn test_chain_cycle_is_detected() {
        let saver = saver();
        let future = Utc::now() + chrono::Duration::hours(1);
        put_row(&saver, "a", Some("b"), WorkflowStatus::Running, future).await;
        put_row(&saver, "b", Some("a"), WorkflowStatus::Running, future).await;

        let err = manager(saver).get_chain("a").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Chain(_)));
    }

    #[tokio::test]
    async fn test_chain_depth_boundary() {
        let saver = saver();
        let future = Utc::now() + chrono::Duration::hours(1);
        // Chain of 21 workflows: w0 <- w1 <- ... <- w20.
        put_row(&saver, "w0", None, WorkflowStatus::Completed, future).await;
        for i in 1..=20 {
            put_row(
                &saver,
                &format!("w{i}"),
                Some(&format!("w{}", i - 1)),
                WorkflowStatus::Completed,
                future,
            )
            .await;
        }

        let lifecycle = manager(saver);
        // Depth 20 (w19 down to w0) passes.
        let chain = lifecycle.get_chain("w19").await.unwrap();
        assert_eq!(chain.len(), 20);
        // Depth 21 fails.
        let err = lifecycle.get_chain("w20").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Chain(_)));
    }

    #[tokio::test]
    async fn test_sweep_reaps_only_eligible_workflows() {
        let saver = saver();
        let past = Utc::now() - chrono::Duration::hours(1);
        let future = Utc::now() + chrono::Duration::hours(1);

        put_row(&saver, "done-old", None, WorkflowStatus::Completed, past).await;
        put_row(&saver, "running-old", None, WorkflowStatus::Running, past).await;
        put_row(&saver, "done-fresh", None, WorkflowStatus::Completed, future).await;

        let lifecycle = manager(saver.clone());
        let reaped = lifecycle.sweep().await.unwrap();
        assert_eq!(reaped, 1);

        let (done_old, _) = saver.get_workflow("done-old").await.unwrap().unwrap();
        assert_eq!(done_old.status, WorkflowStatus::Expired);
        let (running_old, _) = saver.get_workflow("running-old").await.unwrap().unwrap();
        assert_eq!(running_old.status, WorkflowStatus::Running);
        let (done_fresh, _) = saver.get_workflow("done-fresh").await.unwrap().unwrap();
        assert_eq!(done_fresh.status, WorkflowStatus::Completed);
    }

    #[tokio::test]
    async fn test_waiting_approval_respects_grace_window() {
        let saver = saver();
        // Expired two hours ago, but grace is six hours.
        let recent = Utc::now() - chrono::Duration::hours(2);
        put_row(&saver, "waiting", None, WorkflowStatus::WaitingApproval, recent).await;

        let lifecycle = manager(saver.clone());
        assert_eq!(lifecycle.sweep().await.unwrap(), 0);

        // Past the grace window it is reaped.
        let old = Utc::now() - chrono::Duration::hours(12);
        let (mut row, version) = saver.get_workflow("waiting").await.unwrap().unwrap();
        row.expires_at = old;
        saver.put_workflow(&row, Some(version)).await.unwrap();
        saver.index_ttl("waiting", old).await.unwrap();

        assert_eq!(lifecycle.sweep().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_refresh_extends_lease() {
        let saver = saver();
        let soon = Utc::now() + chrono::Duration::minutes(5);
        put_row(&saver, "w1", None, WorkflowStatus::Running, soon).await;

        manager(saver.clone()).refresh("w1").await.unwrap();
        let (row, _) = saver.get_workflow("w1").await.unwrap().unwrap();
        assert!(row.expires_at > Utc::now() + chrono::Duration::hours(23));
    }
}
