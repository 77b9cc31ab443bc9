//! Streaming gateway behaviour: chunk order, termination, cancellation

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use orchestrator::approval::ApprovalGate;
use orchestrator::catalogue::ToolCatalogue;
use orchestrator::config::{Environment, OrchestratorConfig};
use orchestrator::events::EventBus;
use orchestrator::gateway::{ChatChunk, ChatGateway, ChatRequest, StreamItem};
use orchestrator::metrics::Metrics;
use orchestrator::planner::HeuristicPlanner;
use orchestrator::runtime::Runtime;
use orchestrator::specialist::{SpecialistClient, SpecialistOutcome, SpecialistRequest};
use orchestrator::workflows::WorkflowService;
use taskgraph_checkpoint::{
    CheckpointSaver, KvCheckpointSaver, KvStore, MemoryKvStore, WorkflowStatus,
};
use taskgraph_core::{NodeContext, NodeError};

/// Specialist that streams slowly enough to cancel mid-run
struct SlowSpecialist {
    step_delay: Duration,
}

#[async_trait]
impl SpecialistClient for SlowSpecialist {
    async fn execute(
        &self,
        request: &SpecialistRequest,
        ctx: &NodeContext,
    ) -> Result<SpecialistOutcome, NodeError> {
        for i in 0..10 {
            tokio::time::sleep(self.step_delay).await;
            ctx.emit_token(&request.agent_kind, &format!("chunk {i} ")).await;
        }
        Ok(SpecialistOutcome {
            summary: "done".into(),
            outputs: json!({}),
            tools_used: vec![],
        })
    }
}

struct TestStack {
    gateway: ChatGateway,
    saver: Arc<dyn CheckpointSaver>,
}

fn build_stack(specialist: Arc<dyn SpecialistClient>) -> TestStack {
    let config = OrchestratorConfig::defaults(Environment::Dev);
    let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
    let saver: Arc<dyn CheckpointSaver> = Arc::new(KvCheckpointSaver::new(store.clone()));
    let bus = Arc::new(EventBus::new());
    let metrics = Arc::new(Metrics::new());
    let gate = Arc::new(ApprovalGate::new(store.clone(), bus.clone(), chrono::Duration::hours(24)));
    let service = WorkflowService::new(
        config.clone(),
        store,
        saver.clone(),
        bus,
        gate,
        Arc::new(HeuristicPlanner),
        specialist,
        Arc::new(ToolCatalogue::builtin()),
        metrics.clone(),
    )
    .unwrap();
    let gateway = ChatGateway::new(service, metrics, config.gateway.stream_buffer)
        .with_keepalive_interval(Duration::from_secs(30));
    TestStack { gateway, saver }
}

async fn collect_chunks(gateway: &ChatGateway, message: &str, session: &str) -> Vec<ChatChunk> {
    let mut stream = gateway
        .chat_stream(ChatRequest {
            message: message.into(),
            session_id: Some(session.into()),
            referenced_files: None,
            model_hint: None,
        })
        .await
        .unwrap();

    let mut chunks = Vec::new();
    while let Some(item) = stream.next_item().await {
        if let StreamItem::Chunk(chunk) = item {
            chunks.push(chunk);
        }
    }
    chunks
}

#[tokio::test]
async fn test_stream_order_content_then_complete_then_done() {
    let runtime = Runtime::init(OrchestratorConfig::defaults(Environment::Dev)).await.unwrap();
    let chunks = collect_chunks(&runtime.gateway, "Add JWT auth to the API", "s1").await;

    assert!(matches!(chunks.last(), Some(ChatChunk::Done { session_id }) if session_id == "s1"));
    assert!(chunks.iter().any(|c| matches!(c, ChatChunk::Content { .. })));

    // Every agent's last content chunk precedes its agent_complete.
    let completes: Vec<usize> = chunks
        .iter()
        .enumerate()
        .filter_map(|(i, c)| matches!(c, ChatChunk::AgentComplete { .. }).then_some(i))
        .collect();
    assert!(!completes.is_empty());
    for (i, chunk) in chunks.iter().enumerate() {
        if let ChatChunk::AgentComplete { agent } = chunk {
            let later_content = chunks.iter().skip(i + 1).any(|c| {
                matches!(c, ChatChunk::Content { content } if content.contains(agent.as_str()))
            });
            assert!(
                !later_content,
                "agent '{agent}' produced content after its agent_complete"
            );
        }
    }

    // Exactly one done, and nothing after it.
    let done_count = chunks.iter().filter(|c| matches!(c, ChatChunk::Done { .. })).count();
    assert_eq!(done_count, 1);
}

#[tokio::test]
async fn test_tool_calls_survive_the_stream() {
    let runtime = Runtime::init(OrchestratorConfig::defaults(Environment::Dev)).await.unwrap();
    let chunks = collect_chunks(&runtime.gateway, "Implement the new search endpoint", "s2").await;
    assert!(chunks.iter().any(|c| matches!(c, ChatChunk::ToolCall { .. })));
}

#[tokio::test]
async fn test_dropping_the_stream_cancels_the_workflow() {
    let stack = build_stack(Arc::new(SlowSpecialist { step_delay: Duration::from_millis(50) }));

    let mut stream = stack
        .gateway
        .chat_stream(ChatRequest {
            message: "long running work".into(),
            session_id: Some("cancel-me".into()),
            referenced_files: None,
            model_hint: None,
        })
        .await
        .unwrap();

    // Read a little, then walk away mid-stream.
    let first = stream.next_item().await;
    assert!(first.is_some());
    tokio::time::sleep(Duration::from_millis(100)).await;
    drop(stream);

    // Within two seconds a cancelled checkpoint exists and the row is final.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if let Some((row, _)) = stack.saver.get_workflow("cancel-me").await.unwrap() {
            if row.status == WorkflowStatus::Cancelled {
                let last = stack.saver.latest("cancel-me").await.unwrap().unwrap();
                assert_eq!(last.status, WorkflowStatus::Cancelled);
                break;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "no cancelled checkpoint within 2s"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn test_empty_message_is_rejected() {
    let runtime = Runtime::init(OrchestratorConfig::defaults(Environment::Dev)).await.unwrap();
    let err = runtime
        .gateway
        .chat_stream(ChatRequest {
            message: "   ".into(),
            session_id: None,
            referenced_files: None,
            model_hint: None,
        })
        .await;
    assert!(err.is_err());
}

#[tokio::test]
async fn test_high_risk_chat_reports_approval_and_ends() {
    let runtime = Runtime::init(OrchestratorConfig::defaults(Environment::Dev)).await.unwrap();

    // Route a high-risk task through the task surface so chat sees it.
    let mut stream = runtime
        .gateway
        .chat_stream(ChatRequest {
            message: "please deploy the release to production".into(),
            session_id: Some("s3".into()),
            referenced_files: None,
            model_hint: None,
        })
        .await
        .unwrap();

    let mut chunks = Vec::new();
    while let Some(item) = stream.next_item().await {
        if let StreamItem::Chunk(chunk) = item {
            chunks.push(chunk);
        }
    }
    // The stream ends with done whether or not the plan was gated.
    assert!(matches!(chunks.last(), Some(ChatChunk::Done { .. })));
}
