//! Approval decision handlers

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;

use crate::api::error::ApiResult;
use crate::api::routes::AppState;
use crate::api::types::DecisionRequest;
use crate::approval::Verdict;
use crate::models::ApprovalRecord;

/// `GET /approvals/pending` query string
#[derive(Debug, Default, Deserialize)]
pub struct PendingQuery {
    pub workflow_id: Option<String>,
}

/// `POST /approvals/{id}/approve`
pub async fn approve(
    State(state): State<AppState>,
    Path(approval_id): Path<String>,
    Json(request): Json<DecisionRequest>,
) -> ApiResult<Json<ApprovalRecord>> {
    let actor = request.actor_id.unwrap_or_else(|| "unknown".to_string());
    let record = state
        .runtime
        .gate
        .decide(&approval_id, Verdict::Approve, &actor, request.reason)
        .await?;
    state.runtime.metrics.inc("approvals_decided_total");
    Ok(Json(record))
}

/// `POST /approvals/{id}/reject`
pub async fn reject(
    State(state): State<AppState>,
    Path(approval_id): Path<String>,
    Json(request): Json<DecisionRequest>,
) -> ApiResult<Json<ApprovalRecord>> {
    let actor = request.actor_id.unwrap_or_else(|| "unknown".to_string());
    let record = state
        .runtime
        .gate
        .decide(&approval_id, Verdict::Reject, &actor, request.reason)
        .await?;
    state.runtime.metrics.inc("approvals_decided_total");
    Ok(Json(record))
}

/// `GET /approvals/pending` - the review queue
pub async fn pending_approvals(
    State(state): State<AppState>,
    Query(query): Query<PendingQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let pending = state
        .runtime
        .gate
        .list_pending(query.workflow_id.as_deref())
        .await?;
    Ok(Json(serde_json::json!({ "approvals": pending })))
}

/// `GET /approvals/{id}` - one record
pub async fn get_approval(
    State(state): State<AppState>,
    Path(approval_id): Path<String>,
) -> ApiResult<Json<ApprovalRecord>> {
    Ok(Json(state.runtime.gate.get(&approval_id).await?))
}
