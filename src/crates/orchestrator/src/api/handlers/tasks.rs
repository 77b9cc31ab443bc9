//! Task submission, execution, resume, and status handlers

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;

use crate::api::error::ApiResult;
use crate::api::routes::AppState;
use crate::api::types::{OrchestrateRequest, TaskResponse};
use crate::models::TaskStatus;
use crate::workflows::OrchestrateParams;

/// `POST /orchestrate` - idempotent submission and decomposition
///
/// Returns 202 when the plan is gated on an approval, 200 otherwise.
pub async fn orchestrate(
    State(state): State<AppState>,
    Json(request): Json<OrchestrateRequest>,
) -> ApiResult<(StatusCode, Json<TaskResponse>)> {
    let task = request.into_task()?;
    let record = state.runtime.service.orchestrate(OrchestrateParams { task }).await?;

    let status = if record.status == TaskStatus::ApprovalPending {
        StatusCode::ACCEPTED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(TaskResponse::from_record(record))))
}

/// `POST /execute/{task_id}` - start a planned workflow
pub async fn execute_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> ApiResult<Json<TaskResponse>> {
    let record = state.runtime.service.execute(&task_id).await?;
    Ok(Json(TaskResponse::from_record(record)))
}

/// `POST /resume/{task_id}` - continue after an approval decision
///
/// 403 when the approval was rejected, 410 when it expired.
pub async fn resume_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> ApiResult<Json<TaskResponse>> {
    let record = state.runtime.service.resume_task(&task_id).await?;
    Ok(Json(TaskResponse::from_record(record)))
}

/// `GET /tasks/{task_id}` - status snapshot
pub async fn get_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> ApiResult<Json<TaskResponse>> {
    let record = state.runtime.service.snapshot(&task_id).await?;
    Ok(Json(TaskResponse::from_record(record)))
}
