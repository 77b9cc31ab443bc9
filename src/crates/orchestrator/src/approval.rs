//! Approval gate: pending → approved | rejected | expired
//!
//! Mediates every graph edge marked as requiring approval. Requests are
//! persisted, announced on the event bus, and decided through compare-and-
//! swap so an already-decided request can never be decided again. A
//! background sweeper expires pending requests past their window.
//!
//! Idempotency: while a `(workflow_id, action_type)` pair has a pending
//! record, `request` returns that record instead of creating a second one -
//! both the orchestrate-time synthesis and the in-graph gate node converge
//! on the same request.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use taskgraph_checkpoint::{KvStore, StoreError};

use crate::error::{OrchestratorError, Result};
use crate::events::{EventBus, EventKind};
use crate::models::{
    approval_index_key, approval_index_prefix, approval_key, ApprovalRecord, ApprovalState,
    RiskLevel, APPROVAL_PREFIX,
};

/// Decision verdict for a pending request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Approve,
    Reject,
}

/// The approval gate
pub struct ApprovalGate {
    store: Arc<dyn KvStore>,
    bus: Arc<EventBus>,
    expiry: chrono::Duration,
}

impl ApprovalGate {
    /// Create a gate with the configured expiry window
    pub fn new(store: Arc<dyn KvStore>, bus: Arc<EventBus>, expiry: chrono::Duration) -> Self {
        Self { store, bus, expiry }
    }

    /// Create (or return the existing) pending request for
    /// `(workflow_id, action_type)`
    pub async fn request(
        &self,
        workflow_id: &str,
        risk_level: RiskLevel,
        action_type: &str,
        description: &str,
    ) -> Result<ApprovalRecord> {
        if let Some(existing) = self.find_pending(workflow_id, action_type).await? {
            tracing::debug!(
                %workflow_id, action_type,
                approval_id = %existing.approval_id,
                "reusing pending approval request"
            );
            return Ok(existing);
        }

        let record = ApprovalRecord {
            approval_id: Uuid::new_v4().to_string(),
            workflow_id: workflow_id.to_string(),
            risk_level,
            action_type: action_type.to_string(),
            description: description.to_string(),
            state: ApprovalState::Pending,
            decided_by: None,
            reason: None,
            created_at: Utc::now(),
            expires_at: Utc::now() + self.expiry,
        };

        self.store
            .compare_and_swap(
                &approval_key(&record.approval_id),
                None,
                serde_json::to_value(&record)?,
            )
            .await?;
        self.store
            .put(
                &approval_index_key(workflow_id, &record.approval_id),
                json!(record.approval_id),
            )
            .await?;

        tracing::info!(
            %workflow_id, action_type, risk = ?risk_level,
            approval_id = %record.approval_id,
            "approval requested"
        );
        self.bus.emit(
            EventKind::ApprovalRequired,
            json!({
                "workflow_id": workflow_id,
                "approval_id": record.approval_id,
                "action_type": action_type,
                "risk_level": risk_level,
                "description": description,
                "expires_at": record.expires_at,
            }),
            "approval_gate",
            record.approval_id.clone(),
        );
        Ok(record)
    }

    /// Decide a pending request; illegal transitions fail
    pub async fn decide(
        &self,
        approval_id: &str,
        verdict: Verdict,
        actor_id: &str,
        reason: Option<String>,
    ) -> Result<ApprovalRecord> {
        let key = approval_key(approval_id);
        let record = self.store.get(&key).await?.ok_or_else(|| {
            OrchestratorError::NotFound { kind: "approval", id: approval_id.to_string() }
        })?;
        let mut approval: ApprovalRecord = record.decode()?;

        if approval.state.is_terminal() {
            return Err(OrchestratorError::ApprovalState(format!(
                "approval '{approval_id}' is already {:?}",
                approval.state
            )));
        }

        approval.state = match verdict {
            Verdict::Approve => ApprovalState::Approved,
            Verdict::Reject => ApprovalState::Rejected,
        };
        approval.decided_by = Some(actor_id.to_string());
        approval.reason = reason;

        match self
            .store
            .compare_and_swap(&key, Some(record.version), serde_json::to_value(&approval)?)
            .await
        {
            Ok(_) => {}
            Err(StoreError::VersionConflict { .. }) => {
                // Someone else decided (or the sweeper expired it) first.
                return Err(OrchestratorError::ApprovalState(format!(
                    "approval '{approval_id}' was decided concurrently"
                )));
            }
            Err(err) => return Err(err.into()),
        }

        let kind = match verdict {
            Verdict::Approve => EventKind::ApprovalApproved,
            Verdict::Reject => EventKind::ApprovalRejected,
        };
        tracing::info!(
            approval_id, workflow_id = %approval.workflow_id,
            verdict = ?verdict, actor = actor_id,
            "approval decided"
        );
        self.bus.emit(
            kind,
            json!({
                "workflow_id": approval.workflow_id,
                "approval_id": approval_id,
                "action_type": approval.action_type,
                "decided_by": actor_id,
                "reason": approval.reason,
            }),
            "approval_gate",
            approval_id.to_string(),
        );
        Ok(approval)
    }

    /// Fetch one request
    pub async fn get(&self, approval_id: &str) -> Result<ApprovalRecord> {
        let record = self
            .store
            .get(&approval_key(approval_id))
            .await?
            .ok_or_else(|| OrchestratorError::NotFound {
                kind: "approval",
                id: approval_id.to_string(),
            })?;
        Ok(record.decode()?)
    }

    /// All pending requests, optionally filtered by workflow
    pub async fn list_pending(&self, workflow_id: Option<&str>) -> Result<Vec<ApprovalRecord>> {
        let mut pending = Vec::new();
        for (_, record) in self.store.scan_prefix(APPROVAL_PREFIX).await? {
            let approval: ApprovalRecord = record.decode()?;
            if approval.state != ApprovalState::Pending {
                continue;
            }
            if let Some(filter) = workflow_id {
                if approval.workflow_id != filter {
                    continue;
                }
            }
            pending.push(approval);
        }
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(pending)
    }

    /// The non-terminal request for `(workflow_id, action_type)`, if any
    pub async fn find_pending(
        &self,
        workflow_id: &str,
        action_type: &str,
    ) -> Result<Option<ApprovalRecord>> {
        for (_, index_record) in self
            .store
            .scan_prefix(&approval_index_prefix(workflow_id))
            .await?
        {
            let approval_id: String = index_record.decode()?;
            if let Some(record) = self.store.get(&approval_key(&approval_id)).await? {
                let approval: ApprovalRecord = record.decode()?;
                if approval.state == ApprovalState::Pending && approval.action_type == action_type {
                    return Ok(Some(approval));
                }
            }
        }
        Ok(None)
    }

    /// Move pending requests past their expiry to `expired`
    pub async fn sweep_expired(&self) -> Result<usize> {
        let now = Utc::now();
        let mut expired = 0;
        for (key, record) in self.store.scan_prefix(APPROVAL_PREFIX).await? {
            let mut approval: ApprovalRecord = record.decode()?;
            // The boundary is strict: a request expiring exactly now lives on.
            if approval.state != ApprovalState::Pending || approval.expires_at >= now {
                continue;
            }
            approval.state = ApprovalState::Expired;
            match self
                .store
                .compare_and_swap(&key, Some(record.version), serde_json::to_value(&approval)?)
                .await
            {
                Ok(_) => {
                    expired += 1;
                    tracing::info!(
                        approval_id = %approval.approval_id,
                        workflow_id = %approval.workflow_id,
                        "approval expired"
                    );
                    self.bus.emit(
                        EventKind::ApprovalExpired,
                        json!({
                            "workflow_id": approval.workflow_id,
                            "approval_id": approval.approval_id,
                            "action_type": approval.action_type,
                        }),
                        "approval_gate",
                        approval.approval_id.clone(),
                    );
                }
                Err(StoreError::VersionConflict { .. }) => {
                    // Decided while we were sweeping; leave it alone.
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(expired)
    }

    /// Spawn the periodic expiry sweeper
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let gate = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(err) = gate.sweep_expired().await {
                    tracing::error!("approval expiry sweep failed: {err}");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskgraph_checkpoint::MemoryKvStore;

    fn gate() -> ApprovalGate {
        ApprovalGate::new(
            Arc::new(MemoryKvStore::new()),
            Arc::new(EventBus::new()),
            chrono::Duration::hours(24),
        )
    }

    #[tokio::test]
    async fn test_request_is_idempotent_per_workflow_action() {
        let gate = gate();
        let first = gate
            .request("T1", RiskLevel::High, "deploy_production", "ship the gateway")
            .await
            .unwrap();
        let second = gate
            .request("T1", RiskLevel::High, "deploy_production", "ship the gateway")
            .await
            .unwrap();
        assert_eq!(first.approval_id, second.approval_id);

        // A different action type gets its own request.
        let other = gate
            .request("T1", RiskLevel::Critical, "drop_database", "remove legacy data")
            .await
            .unwrap();
        assert_ne!(first.approval_id, other.approval_id);
        assert_eq!(gate.list_pending(Some("T1")).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_decide_transitions_once() {
        let gate = gate();
        let request = gate
            .request("T1", RiskLevel::High, "deploy_production", "ship")
            .await
            .unwrap();

        let approved = gate
            .decide(&request.approval_id, Verdict::Approve, "alice", None)
            .await
            .unwrap();
        assert_eq!(approved.state, ApprovalState::Approved);
        assert_eq!(approved.decided_by.as_deref(), Some("alice"));

        // Terminal states are immutable.
        let err = gate
            .decide(&request.approval_id, Verdict::Reject, "mallory", None)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::ApprovalState(_)));
    }

    #[tokio::test]
    async fn test_reject_preserves_reason() {
        let gate = gate();
        let request = gate
            .request("T2", RiskLevel::High, "deploy_production", "ship")
            .await
            .unwrap();
        let rejected = gate
            .decide(
                &request.approval_id,
                Verdict::Reject,
                "bob",
                Some("rollback unclear".into()),
            )
            .await
            .unwrap();
        assert_eq!(rejected.state, ApprovalState::Rejected);
        assert_eq!(rejected.reason.as_deref(), Some("rollback unclear"));
    }

    #[tokio::test]
    async fn test_decide_unknown_is_not_found() {
        let gate = gate();
        let err = gate.decide("ghost", Verdict::Approve, "alice", None).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::NotFound { kind: "approval", .. }));
    }

    #[tokio::test]
    async fn test_sweep_expires_only_overdue_pending() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let gate = ApprovalGate::new(store.clone(), Arc::new(EventBus::new()), chrono::Duration::hours(24));

        let overdue = gate
            .request("T1", RiskLevel::High, "deploy_production", "ship")
            .await
            .unwrap();
        let fresh = gate
            .request("T2", RiskLevel::High, "deploy_production", "ship")
            .await
            .unwrap();

        // Backdate the first request past its window.
        let key = approval_key(&overdue.approval_id);
        let record = store.get(&key).await.unwrap().unwrap();
        let mut backdated: ApprovalRecord = record.decode().unwrap();
        backdated.expires_at = Utc::now() - chrono::Duration::minutes(1);
        store
            .compare_and_swap(&key, Some(record.version), serde_json::to_value(&backdated).unwrap())
            .await
            .unwrap();

        assert_eq!(gate.sweep_expired().await.unwrap(), 1);
        assert_eq!(gate.get(&overdue.approval_id).await.unwrap().state, ApprovalState::Expired);
        assert_eq!(gate.get(&fresh.approval_id).await.unwrap().state, ApprovalState::Pending);

        // After expiry, a new request for the same pair may be created.
        let renewed = gate
            .request("T1", RiskLevel::High, "deploy_production", "ship")
            .await
            .unwrap();
        assert_ne!(renewed.approval_id, overdue.approval_id);
    }
}
