//! HTTP mapping of domain errors
//!
//! Converts [`OrchestratorError`] into status codes and the wire shape
//! `{ error_kind, message, context?, suggested_recovery? }`.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::error::OrchestratorError;
use taskgraph_core::GraphError;

/// API result type
pub type ApiResult<T> = Result<T, ApiError>;

/// Error wire shape
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error_kind: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_recovery: Option<String>,
}

/// Response-ready wrapper around the domain error
#[derive(Debug)]
pub struct ApiError(pub OrchestratorError);

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        ApiError(err)
    }
}

impl ApiError {
    /// Status code for the wrapped error
    pub fn status_code(&self) -> StatusCode {
        match &self.0 {
            OrchestratorError::Validation(_) => StatusCode::BAD_REQUEST,
            OrchestratorError::NotFound { .. } => StatusCode::NOT_FOUND,
            OrchestratorError::Concurrency(_)
            | OrchestratorError::InvalidState(_)
            | OrchestratorError::ApprovalState(_) => StatusCode::CONFLICT,
            OrchestratorError::ApprovalRejected { .. } => StatusCode::FORBIDDEN,
            OrchestratorError::ApprovalExpired { .. } => StatusCode::GONE,
            OrchestratorError::Overloaded(_) => StatusCode::SERVICE_UNAVAILABLE,
            OrchestratorError::Chain(_) => StatusCode::INTERNAL_SERVER_ERROR,
            OrchestratorError::Graph(err) => match err {
                GraphError::Concurrency { .. } | GraphError::InvalidState { .. } => {
                    StatusCode::CONFLICT
                }
                GraphError::NotFound { .. } => StatusCode::NOT_FOUND,
                GraphError::Validation(_) => StatusCode::BAD_REQUEST,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            OrchestratorError::Store(_)
            | OrchestratorError::Serialization(_)
            | OrchestratorError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorBody {
            error_kind: self.0.kind().to_string(),
            message: self.0.to_string(),
            context: None,
            suggested_recovery: self.0.suggested_recovery().map(str::to_string),
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!("request failed: {}", self.0);
        } else {
            tracing::debug!(status = %status, "request rejected: {}", self.0);
        }

        let mut response = (status, Json(body)).into_response();
        if status == StatusCode::SERVICE_UNAVAILABLE {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, header::HeaderValue::from_static("1"));
        }
        response
    }
}
