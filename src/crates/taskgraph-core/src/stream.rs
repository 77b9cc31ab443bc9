//! Streamed execution events and stream modes
//!
//! Every run of a compiled graph can emit a finite, ordered sequence of
//! [`GraphEvent`]s over a bounded channel. Per workflow the sequence is
//! totally ordered and reflects sequential node execution; [`GraphEvent::Done`]
//! is always last.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use taskgraph_checkpoint::WorkflowStatus;

use crate::node::InterruptRequest;

/// Granularity of state events produced by `stream`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamMode {
    /// Emit the full reduced state after each node
    Values,
    /// Emit only each node's delta (default)
    Updates,
    /// Emit everything `stream_events` would, state included
    Debug,
}

impl Default for StreamMode {
    fn default() -> Self {
        StreamMode::Updates
    }
}

/// Fine-grained execution event
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GraphEvent {
    /// A node attempt is starting
    NodeStart {
        workflow_id: String,
        node: String,
        step: u64,
    },
    /// A node completed and its checkpoint was persisted
    NodeEnd {
        workflow_id: String,
        node: String,
        step: u64,
    },
    /// Reduced state (or delta, per [`StreamMode`]) after a node
    StateUpdate {
        workflow_id: String,
        node: String,
        state: Value,
    },
    /// A token chunk produced inside a node
    TokenChunk {
        workflow_id: String,
        agent: String,
        content: String,
    },
    /// A tool invocation inside a node
    ToolCall {
        workflow_id: String,
        agent: String,
        tool: String,
    },
    /// A specialist finished its portion of the work
    AgentComplete {
        workflow_id: String,
        agent: String,
    },
    /// Execution suspended on an approval gate
    Interrupted {
        workflow_id: String,
        node: String,
        request: InterruptRequest,
    },
    /// A node or the engine failed
    Error {
        workflow_id: String,
        message: String,
    },
    /// Terminal event; nothing follows
    Done {
        workflow_id: String,
        status: WorkflowStatus,
    },
}

impl GraphEvent {
    /// Workflow this event belongs to
    pub fn workflow_id(&self) -> &str {
        match self {
            GraphEvent::NodeStart { workflow_id, .. }
            | GraphEvent::NodeEnd { workflow_id, .. }
            | GraphEvent::StateUpdate { workflow_id, .. }
            | GraphEvent::TokenChunk { workflow_id, .. }
            | GraphEvent::ToolCall { workflow_id, .. }
            | GraphEvent::AgentComplete { workflow_id, .. }
            | GraphEvent::Interrupted { workflow_id, .. }
            | GraphEvent::Error { workflow_id, .. }
            | GraphEvent::Done { workflow_id, .. } => workflow_id,
        }
    }

    /// Whether `stream` (as opposed to `stream_events`) forwards this event
    /// under the given mode
    pub fn visible_in(&self, mode: StreamMode) -> bool {
        match mode {
            StreamMode::Debug => true,
            StreamMode::Values | StreamMode::Updates => matches!(
                self,
                GraphEvent::StateUpdate { .. }
                    | GraphEvent::TokenChunk { .. }
                    | GraphEvent::ToolCall { .. }
                    | GraphEvent::AgentComplete { .. }
                    | GraphEvent::Interrupted { .. }
                    | GraphEvent::Error { .. }
                    | GraphEvent::Done { .. }
            ),
        }
    }
}
