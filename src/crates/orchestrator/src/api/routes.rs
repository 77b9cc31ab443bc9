//! API route definitions

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{MatchedPath, Request, State};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::api::handlers;
use crate::runtime::Runtime;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<Runtime>,
}

/// Build the complete API router
pub fn create_router(runtime: Arc<Runtime>) -> Router {
    let state = AppState { runtime };

    Router::new()
        // Task surface
        .route("/orchestrate", post(handlers::orchestrate))
        .route("/execute/:task_id", post(handlers::execute_task))
        .route("/resume/:task_id", post(handlers::resume_task))
        .route("/tasks/:task_id", get(handlers::get_task))
        // Agent registry
        .route("/agents", get(handlers::list_agents).post(handlers::register_agent))
        .route("/agents/:agent_id/heartbeat", post(handlers::heartbeat))
        // Approvals
        .route("/approvals/pending", get(handlers::pending_approvals))
        .route("/approvals/:approval_id", get(handlers::get_approval))
        .route("/approvals/:approval_id/approve", post(handlers::approve))
        .route("/approvals/:approval_id/reject", post(handlers::reject))
        // Streaming chat
        .route("/chat/stream", post(handlers::chat_stream))
        // Observability
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        .layer(middleware::from_fn_with_state(state.clone(), record_latency))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Per-route request counters and latency histogram
async fn record_latency(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());
    let started = Instant::now();

    let response = next.run(request).await;

    let elapsed_ms = started.elapsed().as_millis() as u64;
    state.runtime.metrics.inc("http_requests_total");
    state.runtime.metrics.observe_latency(&route, elapsed_ms);
    response
}
