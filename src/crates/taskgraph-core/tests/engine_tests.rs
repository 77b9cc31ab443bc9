//! End-to-end engine behaviour: checkpointing, resume, interrupts,
//! cancellation, retries, and concurrency rejection.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio_stream::StreamExt;

use taskgraph_checkpoint::{
    CheckpointSaver, KvCheckpointSaver, MemoryKvStore, WorkflowStatus,
};
use taskgraph_core::{
    AppendReducer, CompiledGraph, ExecutionConfig, FnNode, GraphError, GraphEvent,
    InterruptRequest, NodeContext, NodeError, NodeOutput, RetryPolicy, StateGraph, StreamMode, END,
};

fn saver() -> Arc<KvCheckpointSaver> {
    Arc::new(KvCheckpointSaver::new(Arc::new(MemoryKvStore::new())))
}

fn fast_config() -> ExecutionConfig {
    ExecutionConfig::default()
        .with_node_timeout(Duration::from_millis(500))
        .with_retry(
            RetryPolicy::new(3)
                .with_initial_interval(Duration::from_millis(5))
                .with_jitter(false),
        )
}

/// Two-node pipeline appending to `messages`
fn linear_graph() -> StateGraph {
    let mut graph = StateGraph::new("linear");
    graph
        .add_node(
            "first",
            FnNode::new(|_state: Value, _ctx: NodeContext| async move {
                Ok(NodeOutput::update(json!({ "messages": ["first ran"] })))
            }),
        )
        .add_node(
            "second",
            FnNode::new(|_state: Value, _ctx: NodeContext| async move {
                Ok(NodeOutput::update(json!({ "messages": ["second ran"] })))
            }),
        )
        .add_edge("first", "second")
        .add_edge("second", END)
        .set_entry_point("first")
        .with_channel("messages", Box::new(AppendReducer));
    graph
}

#[tokio::test]
async fn test_invoke_runs_to_completion() {
    let saver = saver();
    let graph = CompiledGraph::new(linear_graph().compile().unwrap(), saver.clone());

    let result = graph
        .invoke("t1", json!({ "messages": ["input"] }), fast_config())
        .await
        .unwrap();

    assert_eq!(result.status, WorkflowStatus::Completed);
    assert_eq!(
        result.state["messages"],
        json!(["input", "first ran", "second ran"])
    );
}

#[tokio::test]
async fn test_checkpoints_are_monotonic_and_terminal() {
    let saver = saver();
    let graph = CompiledGraph::new(linear_graph().compile().unwrap(), saver.clone());
    graph.invoke("t1", json!({}), fast_config()).await.unwrap();

    let checkpoints = saver.list("t1").await.unwrap();
    assert!(!checkpoints.is_empty());
    for pair in checkpoints.windows(2) {
        assert!(pair[0].step_id < pair[1].step_id);
    }
    let last = checkpoints.last().unwrap();
    assert!(last.status.is_terminal());

    let (row, _) = saver.get_workflow("t1").await.unwrap().unwrap();
    assert_eq!(row.status, WorkflowStatus::Completed);
    assert_eq!(row.latest_step, last.step_id);
}

#[tokio::test]
async fn test_invoke_on_terminal_workflow_is_invalid() {
    let saver = saver();
    let graph = CompiledGraph::new(linear_graph().compile().unwrap(), saver.clone());
    graph.invoke("t1", json!({}), fast_config()).await.unwrap();

    let err = graph.invoke("t1", json!({}), fast_config()).await.unwrap_err();
    assert!(matches!(err, GraphError::InvalidState { .. }));
}

#[tokio::test]
async fn test_concurrent_invoke_is_rejected() {
    let saver = saver();
    let mut builder = StateGraph::new("slow");
    builder
        .add_node(
            "slow",
            FnNode::new(|_state: Value, _ctx: NodeContext| async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(NodeOutput::empty())
            }),
        )
        .add_edge("slow", END)
        .set_entry_point("slow");
    let graph = CompiledGraph::new(builder.compile().unwrap(), saver.clone());

    let first = {
        let graph = graph.clone();
        tokio::spawn(async move { graph.invoke("t1", json!({}), fast_config()).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = graph.invoke("t1", json!({}), fast_config()).await.unwrap_err();
    assert!(matches!(err, GraphError::Concurrency { .. }));

    first.await.unwrap().unwrap();
}

/// Gate graph: the gate interrupts until `approvals.deploy` is granted
fn gated_graph() -> StateGraph {
    let mut graph = StateGraph::new("gated");
    graph
        .add_node(
            "gate",
            FnNode::new(|state: Value, _ctx: NodeContext| async move {
                if state["approvals"]["deploy_production"] == json!("approved") {
                    Ok(NodeOutput::update(json!({ "gate_cleared": true })))
                } else {
                    Ok(NodeOutput::interrupt(
                        Value::Null,
                        InterruptRequest {
                            action_type: "deploy_production".into(),
                            risk_level: "high".into(),
                            description: "production deploy requires sign-off".into(),
                            payload: Value::Null,
                        },
                    ))
                }
            }),
        )
        .add_node(
            "work",
            FnNode::new(|_state: Value, _ctx: NodeContext| async move {
                Ok(NodeOutput::update(json!({ "messages": ["deployed"] })))
            }),
        )
        .add_edge("gate", "work")
        .add_edge("work", END)
        .set_entry_point("gate")
        .with_channel("messages", Box::new(AppendReducer));
    graph
}

#[tokio::test]
async fn test_interrupt_suspends_and_resume_completes() {
    let saver = saver();
    let graph = CompiledGraph::new(gated_graph().compile().unwrap(), saver.clone());

    let paused = graph.invoke("t1", json!({}), fast_config()).await.unwrap();
    assert_eq!(paused.status, WorkflowStatus::WaitingApproval);
    let interrupt = paused.interrupt.unwrap();
    assert_eq!(interrupt.action_type, "deploy_production");

    let (row, _) = saver.get_workflow("t1").await.unwrap().unwrap();
    assert_eq!(row.status, WorkflowStatus::WaitingApproval);
    assert_eq!(row.current_node, "gate");

    // A second invoke while suspended is invalid; resume is the only path.
    assert!(matches!(
        graph.invoke("t1", json!({}), fast_config()).await.unwrap_err(),
        GraphError::InvalidState { .. }
    ));

    let done = graph
        .resume_with(
            "t1",
            Some(json!({ "approvals": { "deploy_production": "approved" } })),
            fast_config(),
        )
        .await
        .unwrap();
    assert_eq!(done.status, WorkflowStatus::Completed);
    assert_eq!(done.state["messages"], json!(["deployed"]));
    assert_eq!(done.state["gate_cleared"], json!(true));
}

#[tokio::test]
async fn test_resume_unknown_workflow_is_not_found() {
    let graph = CompiledGraph::new(gated_graph().compile().unwrap(), saver());
    let err = graph.resume("ghost", fast_config()).await.unwrap_err();
    assert!(matches!(err, GraphError::NotFound { .. }));
}

#[tokio::test]
async fn test_retry_exhaustion_fails_workflow() {
    let saver = saver();
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = attempts.clone();

    let mut builder = StateGraph::new("flaky");
    builder
        .add_node(
            "flaky",
            FnNode::new(move |_state: Value, _ctx: NodeContext| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(NodeError::upstream("provider 503"))
                }
            }),
        )
        .add_edge("flaky", END)
        .set_entry_point("flaky");
    let graph = CompiledGraph::new(builder.compile().unwrap(), saver.clone());

    let err = graph.invoke("t1", json!({}), fast_config()).await.unwrap_err();
    assert!(matches!(err, GraphError::NodeFailed { .. }));
    assert_eq!(attempts.load(Ordering::SeqCst), 3);

    let (row, _) = saver.get_workflow("t1").await.unwrap().unwrap();
    assert_eq!(row.status, WorkflowStatus::Failed);
    let last = saver.latest("t1").await.unwrap().unwrap();
    assert_eq!(last.status, WorkflowStatus::Failed);
    assert!(last.state["last_error"]["error"]
        .as_str()
        .unwrap()
        .contains("provider 503"));
}

#[tokio::test]
async fn test_transient_failure_recovers_within_budget() {
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = attempts.clone();

    let mut builder = StateGraph::new("recovering");
    builder
        .add_node(
            "sometimes",
            FnNode::new(move |_state: Value, _ctx: NodeContext| {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(NodeError::upstream("connection reset"))
                    } else {
                        Ok(NodeOutput::update(json!({ "ok": true })))
                    }
                }
            }),
        )
        .add_edge("sometimes", END)
        .set_entry_point("sometimes");
    let graph = CompiledGraph::new(builder.compile().unwrap(), saver());

    let result = graph.invoke("t1", json!({}), fast_config()).await.unwrap();
    assert_eq!(result.status, WorkflowStatus::Completed);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_node_timeout_is_surfaced() {
    let mut builder = StateGraph::new("stuck");
    builder
        .add_node(
            "stuck",
            FnNode::new(|_state: Value, _ctx: NodeContext| async move {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(NodeOutput::empty())
            }),
        )
        .add_edge("stuck", END)
        .set_entry_point("stuck");
    let graph = CompiledGraph::new(builder.compile().unwrap(), saver());

    let config = fast_config()
        .with_node_timeout(Duration::from_millis(50))
        .with_retry(RetryPolicy::none());
    let err = graph.invoke("t1", json!({}), config).await.unwrap_err();
    match err {
        GraphError::NodeFailed { source, .. } => {
            assert!(matches!(source, NodeError::Timeout { .. }))
        }
        other => panic!("expected NodeFailed, got {other}"),
    }
}

#[tokio::test]
async fn test_recovery_edge_routes_failure() {
    let mut builder = StateGraph::new("recoverable");
    builder
        .add_node(
            "fragile",
            FnNode::new(|_state: Value, _ctx: NodeContext| async move {
                Err(NodeError::internal("broken invariant"))
            }),
        )
        .add_node(
            "cleanup",
            FnNode::new(|_state: Value, _ctx: NodeContext| async move {
                Ok(NodeOutput::update(json!({ "recovered": true })))
            }),
        )
        .add_edge("fragile", END)
        .add_edge("cleanup", END)
        .add_recovery_edge("fragile", "cleanup")
        .set_entry_point("fragile");
    let graph = CompiledGraph::new(builder.compile().unwrap(), saver());

    let result = graph.invoke("t1", json!({}), fast_config()).await.unwrap();
    assert_eq!(result.status, WorkflowStatus::Completed);
    assert_eq!(result.state["recovered"], json!(true));
    assert!(result.state["last_error"]["error"]
        .as_str()
        .unwrap()
        .contains("broken invariant"));
}

#[tokio::test]
async fn test_stream_events_are_ordered_and_done_is_last() {
    let saver = saver();
    let graph = CompiledGraph::new(linear_graph().compile().unwrap(), saver);

    let run = graph.stream_events(
        "t1",
        json!({}),
        fast_config().with_stream_mode(StreamMode::Debug),
    );
    let events: Vec<GraphEvent> = run.events.collect().await;
    run.handle.await.unwrap().unwrap();

    assert!(matches!(events.last(), Some(GraphEvent::Done { .. })));

    // NodeStart for "second" must come after NodeEnd for "first".
    let first_end = events
        .iter()
        .position(|e| matches!(e, GraphEvent::NodeEnd { node, .. } if node == "first"))
        .unwrap();
    let second_start = events
        .iter()
        .position(|e| matches!(e, GraphEvent::NodeStart { node, .. } if node == "second"))
        .unwrap();
    assert!(first_end < second_start);
}

#[tokio::test]
async fn test_cancellation_writes_cancelled_checkpoint() {
    let saver = saver();
    let mut builder = StateGraph::new("looping");
    builder
        .add_node(
            "tick",
            FnNode::new(|state: Value, _ctx: NodeContext| async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                let n = state["ticks"].as_i64().unwrap_or(0);
                Ok(NodeOutput::update(json!({ "ticks": n + 1 })))
            }),
        )
        .add_conditional_edges("tick", |state| {
            if state["ticks"].as_i64().unwrap_or(0) >= 1000 {
                END.to_string()
            } else {
                "tick".to_string()
            }
        })
        .set_entry_point("tick");
    let graph = CompiledGraph::new(builder.compile().unwrap(), saver.clone());

    let run = graph.stream_events("t1", json!({}), fast_config());
    tokio::time::sleep(Duration::from_millis(100)).await;
    run.cancel.cancel();

    let result = run.handle.await.unwrap().unwrap();
    assert_eq!(result.status, WorkflowStatus::Cancelled);

    let checkpoints = saver.list("t1").await.unwrap();
    let last = checkpoints.last().unwrap();
    assert_eq!(last.status, WorkflowStatus::Cancelled);

    // The cancelled checkpoint snapshots the state of the last completed
    // node; nothing beyond it was persisted.
    if checkpoints.len() >= 2 {
        let before = &checkpoints[checkpoints.len() - 2];
        assert_eq!(last.state, before.state);
    }

    let (row, _) = saver.get_workflow("t1").await.unwrap().unwrap();
    assert_eq!(row.status, WorkflowStatus::Cancelled);
}
