//! Specialist invocation seam
//!
//! Specialist agents (feature-dev, code-review, devops, ...) are external
//! collaborators reached over HTTP; [`SpecialistClient`] is the only thing
//! the workflow nodes see. [`HttpSpecialistClient`] resolves the target
//! endpoint through the agent registry; [`ScriptedSpecialist`] is the
//! deterministic in-process implementation used in dev mode and tests.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use taskgraph_core::{NodeContext, NodeError};

use crate::registry::AgentRegistry;

/// What a specialist is asked to do
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpecialistRequest {
    pub workflow_id: String,
    pub subtask_index: usize,
    pub agent_kind: String,
    pub description: String,
    /// Qualified names of the disclosed tools
    pub tools: Vec<String>,
    /// Task context and prior subtask outputs
    pub context: Value,
}

/// What a specialist produced
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpecialistOutcome {
    pub summary: String,
    #[serde(default)]
    pub outputs: Value,
    #[serde(default)]
    pub tools_used: Vec<String>,
}

/// Executes one subtask on behalf of a specialist node
#[async_trait]
pub trait SpecialistClient: Send + Sync {
    /// Run the subtask, streaming chunks through `ctx`
    ///
    /// Transient failures (unreachable endpoint, 429/5xx) surface as
    /// [`NodeError::Upstream`] so the engine's retry policy applies.
    async fn execute(
        &self,
        request: &SpecialistRequest,
        ctx: &NodeContext,
    ) -> Result<SpecialistOutcome, NodeError>;
}

/// HTTP client resolving specialists through the agent registry
pub struct HttpSpecialistClient {
    http: reqwest::Client,
    registry: Arc<AgentRegistry>,
}

impl HttpSpecialistClient {
    /// Create a client over the shared registry
    pub fn new(registry: Arc<AgentRegistry>) -> Self {
        Self { http: reqwest::Client::new(), registry }
    }
}

#[async_trait]
impl SpecialistClient for HttpSpecialistClient {
    async fn execute(
        &self,
        request: &SpecialistRequest,
        ctx: &NodeContext,
    ) -> Result<SpecialistOutcome, NodeError> {
        let agent = self.registry.pick_for(&request.agent_kind).ok_or_else(|| {
            // Retryable: an agent for this capability may heartbeat back in.
            NodeError::upstream(format!(
                "no healthy agent registered for capability '{}'",
                request.agent_kind
            ))
        })?;

        tracing::debug!(
            workflow_id = %request.workflow_id,
            agent_id = %agent.agent_id,
            agent_kind = %request.agent_kind,
            "dispatching subtask to specialist"
        );
        let url = format!("{}/execute", agent.base_url.trim_end_matches('/'));
        let response = self
            .http
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| NodeError::upstream(format!("specialist unreachable: {e}")))?;

        let status = response.status();
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(NodeError::upstream(format!(
                "specialist '{}' returned {status}",
                agent.agent_id
            )));
        }
        if !status.is_success() {
            return Err(NodeError::internal(format!(
                "specialist '{}' rejected the request with {status}",
                agent.agent_id
            )));
        }

        let outcome: SpecialistOutcome = response
            .json()
            .await
            .map_err(|e| NodeError::upstream(format!("malformed specialist response: {e}")))?;

        ctx.emit_token(&request.agent_kind, &outcome.summary).await;
        Ok(outcome)
    }
}

/// Deterministic in-process specialist for dev mode and tests
///
/// Streams a short narration, "uses" the first disclosed tool, and returns a
/// completed summary. Never fails.
pub struct ScriptedSpecialist;

#[async_trait]
impl SpecialistClient for ScriptedSpecialist {
    async fn execute(
        &self,
        request: &SpecialistRequest,
        ctx: &NodeContext,
    ) -> Result<SpecialistOutcome, NodeError> {
        ctx.emit_token(
            &request.agent_kind,
            &format!("Starting: {}", request.description),
        )
        .await;

        let mut tools_used = Vec::new();
        if let Some(tool) = request.tools.first() {
            ctx.emit_tool_call(&request.agent_kind, tool).await;
            tools_used.push(tool.clone());
        }

        let summary = format!(
            "{} finished subtask {}: {}",
            request.agent_kind, request.subtask_index, request.description
        );
        ctx.emit_token(&request.agent_kind, &summary).await;

        Ok(SpecialistOutcome {
            summary,
            outputs: json!({
                "subtask_index": request.subtask_index,
                "agent_kind": request.agent_kind,
            }),
            tools_used,
        })
    }
}
