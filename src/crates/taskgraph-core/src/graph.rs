//! Graph construction and compile-time validation
//!
//! A [`StateGraph`] is built by registering nodes, wiring edges (direct or
//! conditional), and declaring the state schema. [`StateGraph::compile`]
//! validates the structure and produces an immutable [`GraphSpec`] the engine
//! executes. The router node is the single entry point; the sentinel [`END`]
//! terminates execution.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::error::{GraphError, Result};
use crate::node::Node;
use crate::state::StateSchema;

/// Sentinel edge target that terminates execution
pub const END: &str = "__end__";

/// Router function for conditional edges: state in, next node name out
pub type EdgeRouter = Arc<dyn Fn(&Value) -> String + Send + Sync>;

/// Outgoing edge of a node
#[derive(Clone)]
pub enum Edge {
    /// Always transition to the named node (or [`END`])
    Direct(String),
    /// Pick the successor from the current state
    Conditional(EdgeRouter),
}

/// Mutable graph under construction
pub struct StateGraph {
    name: String,
    nodes: HashMap<String, Arc<dyn Node>>,
    edges: HashMap<String, Edge>,
    recovery: HashMap<String, String>,
    entry: Option<String>,
    schema: StateSchema,
}

impl StateGraph {
    /// Start building a graph called `name`
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: HashMap::new(),
            edges: HashMap::new(),
            recovery: HashMap::new(),
            entry: None,
            schema: StateSchema::new(),
        }
    }

    /// Register a node under `name`
    pub fn add_node(&mut self, name: impl Into<String>, node: impl Node + 'static) -> &mut Self {
        self.nodes.insert(name.into(), Arc::new(node));
        self
    }

    /// Wire a direct edge from `from` to `to` (a node name or [`END`])
    pub fn add_edge(&mut self, from: impl Into<String>, to: impl Into<String>) -> &mut Self {
        self.edges.insert(from.into(), Edge::Direct(to.into()));
        self
    }

    /// Wire a conditional edge whose router inspects the current state
    pub fn add_conditional_edges<F>(&mut self, from: impl Into<String>, router: F) -> &mut Self
    where
        F: Fn(&Value) -> String + Send + Sync + 'static,
    {
        self.edges.insert(from.into(), Edge::Conditional(Arc::new(router)));
        self
    }

    /// Declare where a node's exhausted failures transition to instead of
    /// failing the workflow
    pub fn add_recovery_edge(
        &mut self,
        from: impl Into<String>,
        to: impl Into<String>,
    ) -> &mut Self {
        self.recovery.insert(from.into(), to.into());
        self
    }

    /// Declare the entry node
    pub fn set_entry_point(&mut self, node: impl Into<String>) -> &mut Self {
        self.entry = Some(node.into());
        self
    }

    /// Declare a state field's reducer
    pub fn with_channel(
        &mut self,
        field: impl Into<String>,
        reducer: Box<dyn crate::state::Reducer>,
    ) -> &mut Self {
        let schema = std::mem::take(&mut self.schema);
        self.schema = schema.with_field(field, reducer);
        self
    }

    /// Validate the structure and freeze it into a [`GraphSpec`]
    pub fn compile(self) -> Result<GraphSpec> {
        let entry = self
            .entry
            .ok_or_else(|| GraphError::Validation("no entry point declared".into()))?;
        if !self.nodes.contains_key(&entry) {
            return Err(GraphError::Validation(format!(
                "entry point '{entry}' is not a registered node"
            )));
        }
        for (from, edge) in &self.edges {
            if !self.nodes.contains_key(from) {
                return Err(GraphError::Validation(format!(
                    "edge declared from unknown node '{from}'"
                )));
            }
            if let Edge::Direct(to) = edge {
                if to != END && !self.nodes.contains_key(to) {
                    return Err(GraphError::Validation(format!(
                        "edge from '{from}' targets unknown node '{to}'"
                    )));
                }
            }
        }
        for (from, to) in &self.recovery {
            if !self.nodes.contains_key(from) || !self.nodes.contains_key(to) {
                return Err(GraphError::Validation(format!(
                    "recovery edge '{from}' -> '{to}' references an unknown node"
                )));
            }
        }
        for name in self.nodes.keys() {
            if !self.edges.contains_key(name) {
                return Err(GraphError::Validation(format!(
                    "node '{name}' has no outgoing edge; wire it to '{END}' explicitly"
                )));
            }
        }

        Ok(GraphSpec {
            name: self.name,
            nodes: self.nodes,
            edges: self.edges,
            recovery: self.recovery,
            entry,
            schema: self.schema,
        })
    }
}

/// Immutable, validated graph definition
pub struct GraphSpec {
    pub(crate) name: String,
    pub(crate) nodes: HashMap<String, Arc<dyn Node>>,
    pub(crate) edges: HashMap<String, Edge>,
    pub(crate) recovery: HashMap<String, String>,
    pub(crate) entry: String,
    pub(crate) schema: StateSchema,
}

impl GraphSpec {
    /// Graph name, recorded on workflow rows
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Entry node name
    pub fn entry(&self) -> &str {
        &self.entry
    }

    /// The state schema nodes' deltas are merged through
    pub fn schema(&self) -> &StateSchema {
        &self.schema
    }

    /// Resolve the successor of `node` for the given state
    pub(crate) fn next_node(&self, node: &str, state: &Value) -> Result<String> {
        let edge = self.edges.get(node).ok_or_else(|| {
            GraphError::Engine(format!("node '{node}' has no outgoing edge at runtime"))
        })?;
        let target = match edge {
            Edge::Direct(to) => to.clone(),
            Edge::Conditional(router) => router(state),
        };
        if target != END && !self.nodes.contains_key(&target) {
            return Err(GraphError::Engine(format!(
                "edge from '{node}' routed to unknown node '{target}'"
            )));
        }
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{FnNode, NodeContext, NodeOutput};
    use serde_json::json;

    fn noop() -> impl Node {
        FnNode::new(|_state: Value, _ctx: NodeContext| async move { Ok(NodeOutput::empty()) })
    }

    #[test]
    fn test_compile_requires_entry() {
        let mut graph = StateGraph::new("g");
        graph.add_node("a", noop()).add_edge("a", END);
        assert!(matches!(graph.compile(), Err(GraphError::Validation(_))));
    }

    #[test]
    fn test_compile_rejects_unknown_edge_target() {
        let mut graph = StateGraph::new("g");
        graph
            .add_node("a", noop())
            .add_edge("a", "ghost")
            .set_entry_point("a");
        assert!(matches!(graph.compile(), Err(GraphError::Validation(_))));
    }

    #[test]
    fn test_compile_requires_outgoing_edges() {
        let mut graph = StateGraph::new("g");
        graph.add_node("a", noop()).set_entry_point("a");
        assert!(matches!(graph.compile(), Err(GraphError::Validation(_))));
    }

    #[test]
    fn test_conditional_routing_resolves_from_state() {
        let mut graph = StateGraph::new("g");
        graph
            .add_node("router", noop())
            .add_node("work", noop())
            .add_conditional_edges("router", |state| {
                if state["pending"].as_bool().unwrap_or(false) {
                    "work".to_string()
                } else {
                    END.to_string()
                }
            })
            .add_edge("work", "router")
            .set_entry_point("router");

        let spec = graph.compile().unwrap();
        assert_eq!(spec.next_node("router", &json!({"pending": true})).unwrap(), "work");
        assert_eq!(spec.next_node("router", &json!({"pending": false})).unwrap(), END);
    }
}
