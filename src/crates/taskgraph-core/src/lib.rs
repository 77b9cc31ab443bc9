//! # taskgraph-core - Workflow Graph Engine
//!
//! Executes a compiled, directed graph of typed nodes with checkpointing,
//! streaming, interruption (for approvals), and resume. This crate is the
//! engine only; the control plane around it (HTTP surface, approval gate,
//! lifecycle, tool disclosure) lives in the `orchestrator` crate.
//!
//! ## Model
//!
//! - **State** is a JSON object whose fields carry declared reducers
//!   ([`state::AppendReducer`], [`state::MergeByIdReducer`], ...); node
//!   deltas merge at node boundaries only.
//! - **Nodes** implement [`Node`]: immutable state snapshot in, delta plus
//!   [`NodeCommand`] out. Approval pauses are the
//!   [`NodeCommand::Interrupt`] value, not an error.
//! - **Edges** are direct or conditional; the sentinel [`END`] terminates.
//! - **Checkpoints** are persisted through `taskgraph-checkpoint` after
//!   every node, making `resume` deterministic and cancellation safe.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use serde_json::{json, Value};
//! use taskgraph_checkpoint::{KvCheckpointSaver, MemoryKvStore};
//! use taskgraph_core::{
//!     CompiledGraph, ExecutionConfig, FnNode, NodeContext, NodeOutput, StateGraph, END,
//! };
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut graph = StateGraph::new("hello");
//! graph
//!     .add_node("greet", FnNode::new(|_state: Value, _ctx: NodeContext| async move {
//!         Ok(NodeOutput::update(json!({ "greeting": "hello" })))
//!     }))
//!     .add_edge("greet", END)
//!     .set_entry_point("greet");
//!
//! let saver = Arc::new(KvCheckpointSaver::new(Arc::new(MemoryKvStore::new())));
//! let compiled = CompiledGraph::new(graph.compile()?, saver);
//! let result = compiled.invoke("task-1", json!({}), ExecutionConfig::default()).await?;
//! assert_eq!(result.state["greeting"], "hello");
//! # Ok(())
//! # }
//! ```

pub mod cancel;
pub mod engine;
pub mod error;
pub mod graph;
pub mod node;
pub mod retry;
pub mod state;
pub mod stream;

pub use cancel::{cancellation_pair, CancelHandle, CancellationSignal};
pub use engine::{CompiledGraph, ExecutionConfig, ExecutionResult, GraphStream};
pub use error::{GraphError, NodeError, Result};
pub use graph::{Edge, GraphSpec, StateGraph, END};
pub use node::{FnNode, InterruptRequest, Node, NodeCommand, NodeContext, NodeOutput};
pub use retry::RetryPolicy;
pub use state::{
    AppendReducer, DedupReducer, MergeByIdReducer, MergeObjectReducer, OverwriteReducer, Reducer,
    StateSchema,
};
pub use stream::{GraphEvent, StreamMode};
