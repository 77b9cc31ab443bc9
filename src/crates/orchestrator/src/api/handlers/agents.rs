//! Agent registry handlers

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;

use crate::api::error::ApiResult;
use crate::api::routes::AppState;
use crate::api::types::{AgentsQuery, HeartbeatRequest, RegisterAgentRequest};
use crate::error::OrchestratorError;
use crate::models::{AgentRecord, AgentStatus};

/// `GET /agents` - discover agents by capability and health
pub async fn list_agents(
    State(state): State<AppState>,
    Query(query): Query<AgentsQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let registry = &state.runtime.registry;
    let mut agents = match &query.capability {
        Some(tag) => registry.find_by_capability(tag),
        None => registry.list(),
    };
    if let Some(status) = query.status {
        agents.retain(|a| a.status == status);
    }
    Ok(Json(serde_json::json!({ "agents": agents })))
}

/// `POST /agents` - register a specialist endpoint
pub async fn register_agent(
    State(state): State<AppState>,
    Json(request): Json<RegisterAgentRequest>,
) -> ApiResult<(StatusCode, Json<AgentRecord>)> {
    if request.agent_id.trim().is_empty() || request.base_url.trim().is_empty() {
        return Err(OrchestratorError::Validation(
            "agent_id and base_url are required".into(),
        )
        .into());
    }
    let record = AgentRecord {
        display_name: request.display_name.unwrap_or_else(|| request.agent_id.clone()),
        agent_id: request.agent_id,
        base_url: request.base_url,
        capability_tags: request.capability_tags,
        status: AgentStatus::Active,
        last_heartbeat: Utc::now(),
    };
    state.runtime.registry.register(record.clone()).await?;
    Ok((StatusCode::CREATED, Json(record)))
}

/// `POST /agents/{agent_id}/heartbeat` - keep a registration alive
pub async fn heartbeat(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    Json(request): Json<HeartbeatRequest>,
) -> ApiResult<Json<AgentRecord>> {
    let status = request.status.unwrap_or(AgentStatus::Active);
    let record = state.runtime.registry.heartbeat(&agent_id, status).await?;
    Ok(Json(record))
}
