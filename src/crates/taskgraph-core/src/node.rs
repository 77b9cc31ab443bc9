//! The node contract: state in, delta plus command out
//!
//! A node receives an immutable snapshot of workflow state and returns a
//! [`NodeOutput`]: a state delta (merged through the graph's reducers) and a
//! [`NodeCommand`] telling the engine how to proceed. Approval pauses are the
//! [`NodeCommand::Interrupt`] value, not an error; the engine's loop treats
//! them as an ordinary transition into `waiting_approval`.
//!
//! Streamed chunks (tokens, tool calls) go through the [`NodeContext`], which
//! also carries the cooperative cancellation signal.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::cancel::CancellationSignal;
use crate::error::NodeError;
use crate::stream::GraphEvent;

/// Why a node suspended execution
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InterruptRequest {
    /// What is being gated (e.g. `deploy_production`)
    pub action_type: String,
    /// Risk classification computed by the requesting node
    pub risk_level: String,
    /// Human-readable description for the approval notification
    pub description: String,
    /// Extra context forwarded to the approval record
    #[serde(default)]
    pub payload: Value,
}

/// What the engine should do after merging a node's delta
#[derive(Debug, Clone)]
pub enum NodeCommand {
    /// Follow the node's outgoing edge
    Continue,
    /// Suspend the workflow until an external decision resumes it
    Interrupt(InterruptRequest),
}

/// A node's result: state delta plus routing command
#[derive(Debug, Clone)]
pub struct NodeOutput {
    /// Delta merged into state through the graph's reducers
    pub delta: Value,
    /// How to proceed
    pub command: NodeCommand,
}

impl NodeOutput {
    /// Continue with a state delta
    pub fn update(delta: Value) -> Self {
        Self { delta, command: NodeCommand::Continue }
    }

    /// Continue without touching state
    pub fn empty() -> Self {
        Self::update(Value::Null)
    }

    /// Suspend on an approval gate, recording `delta` first
    pub fn interrupt(delta: Value, request: InterruptRequest) -> Self {
        Self { delta, command: NodeCommand::Interrupt(request) }
    }
}

/// Collaborators handed to every node attempt
#[derive(Clone)]
pub struct NodeContext {
    /// Workflow being executed
    pub workflow_id: String,
    /// Name of the running node
    pub node: String,
    /// 1-based attempt number under the retry policy
    pub attempt: u32,
    cancel: CancellationSignal,
    events: Option<mpsc::Sender<GraphEvent>>,
}

impl NodeContext {
    /// Build a context; `events` is `None` for non-streaming invocations
    pub fn new(
        workflow_id: impl Into<String>,
        node: impl Into<String>,
        attempt: u32,
        cancel: CancellationSignal,
        events: Option<mpsc::Sender<GraphEvent>>,
    ) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            node: node.into(),
            attempt,
            cancel,
            events,
        }
    }

    /// Whether the caller requested cancellation
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// The cancellation signal, for nodes that fan out internally
    pub fn cancellation(&self) -> &CancellationSignal {
        &self.cancel
    }

    /// Stream a token chunk to the caller
    pub async fn emit_token(&self, agent: &str, content: &str) {
        self.emit(GraphEvent::TokenChunk {
            workflow_id: self.workflow_id.clone(),
            agent: agent.to_string(),
            content: content.to_string(),
        })
        .await;
    }

    /// Stream a tool invocation to the caller
    pub async fn emit_tool_call(&self, agent: &str, tool: &str) {
        self.emit(GraphEvent::ToolCall {
            workflow_id: self.workflow_id.clone(),
            agent: agent.to_string(),
            tool: tool.to_string(),
        })
        .await;
    }

    /// Signal that a specialist finished its portion of the work
    pub async fn emit_agent_complete(&self, agent: &str) {
        self.emit(GraphEvent::AgentComplete {
            workflow_id: self.workflow_id.clone(),
            agent: agent.to_string(),
        })
        .await;
    }

    async fn emit(&self, event: GraphEvent) {
        if let Some(tx) = &self.events {
            // A dropped receiver means the consumer went away; execution
            // continues and cancellation is signalled separately.
            let _ = tx.send(event).await;
        }
    }
}

/// A unit of the graph
#[async_trait]
pub trait Node: Send + Sync {
    /// Execute against an immutable state snapshot
    async fn run(&self, state: &Value, ctx: &NodeContext) -> Result<NodeOutput, NodeError>;
}

/// Adapter turning an async closure into a [`Node`]
pub struct FnNode<F> {
    f: F,
}

impl<F, Fut> FnNode<F>
where
    F: Fn(Value, NodeContext) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<NodeOutput, NodeError>> + Send,
{
    /// Wrap `f` as a node
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> Node for FnNode<F>
where
    F: Fn(Value, NodeContext) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<NodeOutput, NodeError>> + Send,
{
    async fn run(&self, state: &Value, ctx: &NodeContext) -> Result<NodeOutput, NodeError> {
        (self.f)(state.clone(), ctx.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::cancellation_pair;
    use serde_json::json;

    #[tokio::test]
    async fn test_fn_node_runs_closure() {
        let node = FnNode::new(|state: Value, _ctx: NodeContext| async move {
            let n = state["n"].as_i64().unwrap_or(0);
            Ok(NodeOutput::update(json!({ "n": n + 1 })))
        });

        let (_handle, signal) = cancellation_pair();
        let ctx = NodeContext::new("w", "incr", 1, signal, None);
        let out = node.run(&json!({ "n": 41 }), &ctx).await.unwrap();
        assert_eq!(out.delta, json!({ "n": 42 }));
    }

    #[tokio::test]
    async fn test_context_reports_cancellation() {
        let (handle, signal) = cancellation_pair();
        let ctx = NodeContext::new("w", "node", 1, signal, None);
        assert!(!ctx.is_cancelled());
        handle.cancel();
        assert!(ctx.is_cancelled());
    }
}
