//! Streaming chat gateway
//!
//! Translates a chat request into a workflow invocation and relays engine
//! events to the caller as server-sent events in the chunk grammar:
//!
//! ```text
//! { type: "content", content }
//! { type: "tool_call", tool, agent }
//! { type: "agent_complete", agent }
//! { type: "error", error }
//! { type: "done", session_id }
//! ```
//!
//! A terminal `[DONE]` sentinel ends every stream; keepalive comment lines
//! may appear anywhere and are ignored by parsers.
//!
//! Backpressure: chunks pass through a bounded [`ChunkBuffer`]. On overflow
//! the buffer drops keepalives first, then coalesces adjacent `content`
//! chunks; `tool_call`, `agent_complete`, `error`, and `done` are never
//! dropped. Client disconnect cancels the underlying workflow run.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_stream::StreamExt;
use uuid::Uuid;

use taskgraph_core::{CancelHandle, GraphEvent};

use crate::error::{OrchestratorError, Result};
use crate::metrics::Metrics;
use crate::models::{Task, TaskPriority, TaskStatus};
use crate::workflows::{OrchestrateParams, WorkflowService};

/// An incoming chat request
#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub referenced_files: Option<Vec<String>>,
    /// Opaque caller-model hint forwarded as task metadata
    #[serde(default)]
    pub model_hint: Option<serde_json::Value>,
}

/// Wire chunk grammar
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatChunk {
    Content { content: String },
    ToolCall { tool: String, agent: String },
    AgentComplete { agent: String },
    Error { error: String },
    Done { session_id: String },
}

impl ChatChunk {
    /// Chunks the buffer may never drop
    pub fn is_critical(&self) -> bool {
        !matches!(self, ChatChunk::Content { .. })
    }
}

/// One entry of the outbound stream
#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    /// Rendered as an SSE comment line (`:keepalive`)
    Keepalive,
    Chunk(ChatChunk),
}

/// Bounded chunk queue implementing the overflow policy
pub struct ChunkBuffer {
    items: VecDeque<StreamItem>,
    capacity: usize,
    dropped_keepalives: u64,
    coalesced: u64,
}

impl ChunkBuffer {
    /// Create a buffer bounded at `capacity` entries
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::new(),
            capacity,
            dropped_keepalives: 0,
            coalesced: 0,
        }
    }

    /// Queue an item, applying the overflow policy when full
    pub fn push(&mut self, item: StreamItem) {
        if self.items.len() >= self.capacity {
            self.make_room();
        }
        if self.items.len() >= self.capacity {
            match &item {
                StreamItem::Keepalive => {
                    // Still full and the newcomer is expendable.
                    self.dropped_keepalives += 1;
                    return;
                }
                StreamItem::Chunk(chunk) if chunk.is_critical() => {
                    // Critical chunks are queued even past the bound.
                }
                StreamItem::Chunk(_) => {
                    // Content that cannot be coalesced still must not be
                    // silently lost; exceed the bound rather than drop it.
                }
            }
        }
        self.items.push_back(item);
    }

    /// Dequeue the next item
    pub fn pop(&mut self) -> Option<StreamItem> {
        self.items.pop_front()
    }

    /// Queued item count
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Keepalives dropped under pressure
    pub fn dropped_keepalives(&self) -> u64 {
        self.dropped_keepalives
    }

    /// Content merges performed under pressure
    pub fn coalesced(&self) -> u64 {
        self.coalesced
    }

    /// Drop a keepalive, or failing that merge one adjacent content pair
    fn make_room(&mut self) {
        if let Some(pos) = self.items.iter().position(|i| matches!(i, StreamItem::Keepalive)) {
            self.items.remove(pos);
            self.dropped_keepalives += 1;
            return;
        }
        // Find the first adjacent pair of content chunks and merge them.
        for i in 0..self.items.len().saturating_sub(1) {
            let mergeable = matches!(
                (&self.items[i], &self.items[i + 1]),
                (
                    StreamItem::Chunk(ChatChunk::Content { .. }),
                    StreamItem::Chunk(ChatChunk::Content { .. })
                )
            );
            if mergeable {
                let Some(StreamItem::Chunk(ChatChunk::Content { content: tail })) =
                    self.items.remove(i + 1)
                else {
                    unreachable!("checked adjacent content pair")
                };
                if let StreamItem::Chunk(ChatChunk::Content { content }) = &mut self.items[i] {
                    content.push_str(&tail);
                }
                self.coalesced += 1;
                return;
            }
        }
    }
}

/// Backoff schedule for transient start failures: 1 s, 2 s, 4 s
const TRANSPORT_BACKOFF: [Duration; 3] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(4),
];

/// A live chat stream: pop items until `None`
pub struct ChatStream {
    buffer: Arc<parking_lot::Mutex<ChunkBuffer>>,
    notify: Arc<tokio::sync::Notify>,
    finished: Arc<std::sync::atomic::AtomicBool>,
    cancel: Option<CancelHandle>,
    pub session_id: String,
}

impl ChatStream {
    /// Next outbound item; `None` once `done` has been delivered
    pub async fn next_item(&mut self) -> Option<StreamItem> {
        loop {
            if let Some(item) = self.buffer.lock().pop() {
                if matches!(item, StreamItem::Chunk(ChatChunk::Done { .. })) {
                    self.finished.store(true, std::sync::atomic::Ordering::Relaxed);
                    self.cancel = None; // run is over, nothing to cancel
                }
                return Some(item);
            }
            if self.finished.load(std::sync::atomic::Ordering::Relaxed) {
                return None;
            }
            self.notify.notified().await;
        }
    }
}

impl Drop for ChatStream {
    fn drop(&mut self) {
        // A consumer that walks away mid-stream cancels the workflow; the
        // engine writes a `cancelled` checkpoint and stops producing.
        if let Some(cancel) = self.cancel.take() {
            tracing::info!(session_id = %self.session_id, "chat consumer gone, cancelling workflow");
            cancel.cancel();
        }
    }
}

/// The streaming chat gateway
pub struct ChatGateway {
    service: Arc<WorkflowService>,
    metrics: Arc<Metrics>,
    buffer_capacity: usize,
    keepalive_interval: Duration,
}

impl ChatGateway {
    /// Create a gateway over the workflow service
    pub fn new(service: Arc<WorkflowService>, metrics: Arc<Metrics>, buffer_capacity: usize) -> Self {
        Self {
            service,
            metrics,
            buffer_capacity,
            keepalive_interval: Duration::from_secs(10),
        }
    }

    /// Shrink the keepalive interval (tests)
    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    /// Open a chat stream for a request
    ///
    /// Ensures a task exists for the session, starts (or joins) its
    /// workflow, and pumps engine events into the buffered chunk stream.
    pub async fn chat_stream(&self, request: ChatRequest) -> Result<ChatStream> {
        if request.message.trim().is_empty() {
            return Err(OrchestratorError::Validation("message must not be empty".into()));
        }
        let session_id = request
            .session_id
            .clone()
            .unwrap_or_else(|| format!("chat-{}", Uuid::new_v4()));
        self.metrics.inc("chat_streams_total");

        let record = self
            .service
            .orchestrate(OrchestrateParams { task: chat_task(&request, &session_id) })
            .await?;

        let buffer = Arc::new(parking_lot::Mutex::new(ChunkBuffer::new(self.buffer_capacity)));
        let notify = Arc::new(tokio::sync::Notify::new());
        let finished = Arc::new(std::sync::atomic::AtomicBool::new(false));

        if record.status == TaskStatus::ApprovalPending {
            // No execution until a human decides; tell the caller and end.
            let mut guard = buffer.lock();
            guard.push(StreamItem::Chunk(ChatChunk::Content {
                content: format!(
                    "This request needs approval before it can run (approval id: {}).",
                    record.approval_request_id.as_deref().unwrap_or("unknown")
                ),
            }));
            guard.push(StreamItem::Chunk(ChatChunk::Done { session_id: session_id.clone() }));
            drop(guard);
            return Ok(ChatStream { buffer, notify, finished, cancel: None, session_id });
        }

        // Transient start failures retry on a fresh stream with backoff;
        // anything mid-stream surfaces as an error chunk instead.
        let mut attempt = 0;
        let task_stream = loop {
            match self.service.start_stream(&session_id, None).await {
                Ok(stream) => break stream,
                Err(err @ OrchestratorError::Overloaded(_)) if attempt < TRANSPORT_BACKOFF.len() => {
                    tracing::warn!(%session_id, "stream start attempt {attempt} failed: {err}");
                    tokio::time::sleep(TRANSPORT_BACKOFF[attempt]).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        };

        let cancel = task_stream.cancel.clone();
        self.spawn_pump(task_stream, session_id.clone(), buffer.clone(), notify.clone(), finished.clone());

        Ok(ChatStream { buffer, notify, finished, cancel: Some(cancel), session_id })
    }

    fn spawn_pump(
        &self,
        task_stream: crate::workflows::TaskStream,
        session_id: String,
        buffer: Arc<parking_lot::Mutex<ChunkBuffer>>,
        notify: Arc<tokio::sync::Notify>,
        finished: Arc<std::sync::atomic::AtomicBool>,
    ) {
        let metrics = self.metrics.clone();
        let keepalive = self.keepalive_interval;
        tokio::spawn(async move {
            let mut events = task_stream.events;
            let mut ticker = tokio::time::interval(keepalive);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // skip the immediate first tick

            let mut done_sent = false;
            loop {
                let item = tokio::select! {
                    event = events.next() => match event {
                        Some(event) => match convert_event(event, &session_id) {
                            Some(chunk) => {
                                if matches!(chunk, ChatChunk::Done { .. }) {
                                    done_sent = true;
                                }
                                StreamItem::Chunk(chunk)
                            }
                            None => continue,
                        },
                        None => break,
                    },
                    _ = ticker.tick() => StreamItem::Keepalive,
                };

                let dropped_before;
                {
                    let mut guard = buffer.lock();
                    dropped_before = guard.dropped_keepalives() + guard.coalesced();
                    guard.push(item);
                    let dropped_after = guard.dropped_keepalives() + guard.coalesced();
                    if dropped_after > dropped_before {
                        metrics.add("chat_chunks_dropped_total", dropped_after - dropped_before);
                    }
                }
                notify.notify_one();

                if done_sent {
                    break;
                }
            }

            if !done_sent {
                // The engine stream ended without a terminal event (e.g. the
                // run panicked); close the wire cleanly.
                let mut guard = buffer.lock();
                guard.push(StreamItem::Chunk(ChatChunk::Done { session_id: session_id.clone() }));
            }
            finished.store(true, std::sync::atomic::Ordering::Relaxed);
            notify.notify_one();
        });
    }
}

/// Map an engine event onto the wire grammar; `None` = not exposed to chat
fn convert_event(event: GraphEvent, session_id: &str) -> Option<ChatChunk> {
    match event {
        GraphEvent::TokenChunk { content, .. } => Some(ChatChunk::Content { content }),
        GraphEvent::ToolCall { tool, agent, .. } => Some(ChatChunk::ToolCall { tool, agent }),
        GraphEvent::AgentComplete { agent, .. } => Some(ChatChunk::AgentComplete { agent }),
        GraphEvent::Error { message, .. } => Some(ChatChunk::Error { error: message }),
        GraphEvent::Interrupted { request, .. } => Some(ChatChunk::Content {
            content: format!(
                "Execution paused: '{}' requires approval ({}).",
                request.action_type, request.description
            ),
        }),
        GraphEvent::Done { .. } => Some(ChatChunk::Done { session_id: session_id.to_string() }),
        GraphEvent::NodeStart { .. }
        | GraphEvent::NodeEnd { .. }
        | GraphEvent::StateUpdate { .. } => None,
    }
}

/// Build the task a chat session executes
fn chat_task(request: &ChatRequest, session_id: &str) -> Task {
    let mut title: String = request.message.chars().take(80).collect();
    if title.len() < request.message.len() {
        title.push('…');
    }
    let mut metadata = std::collections::BTreeMap::new();
    metadata.insert("origin".to_string(), serde_json::json!("chat"));
    if let Some(files) = &request.referenced_files {
        metadata.insert("referenced_files".to_string(), serde_json::json!(files));
    }
    if let Some(hint) = &request.model_hint {
        metadata.insert("model_hint".to_string(), hint.clone());
    }
    Task {
        task_id: session_id.to_string(),
        title,
        description: request.message.clone(),
        priority: TaskPriority::Medium,
        requester: None,
        created_at: chrono::Utc::now(),
        parent_task_id: None,
        metadata,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn content(text: &str) -> StreamItem {
        StreamItem::Chunk(ChatChunk::Content { content: text.to_string() })
    }

    #[test]
    fn test_buffer_drops_keepalives_first() {
        let mut buffer = ChunkBuffer::new(3);
        buffer.push(content("a"));
        buffer.push(StreamItem::Keepalive);
        buffer.push(content("b"));
        // Full: the queued keepalive goes before any content does.
        buffer.push(content("c"));

        assert_eq!(buffer.dropped_keepalives(), 1);
        assert_eq!(buffer.len(), 3);
        assert!(!buffer
            .items
            .iter()
            .any(|i| matches!(i, StreamItem::Keepalive)));
    }

    #[test]
    fn test_buffer_coalesces_adjacent_content() {
        let mut buffer = ChunkBuffer::new(2);
        buffer.push(content("hello "));
        buffer.push(content("world"));
        buffer.push(StreamItem::Chunk(ChatChunk::AgentComplete { agent: "dev".into() }));

        assert_eq!(buffer.coalesced(), 1);
        match buffer.pop() {
            Some(StreamItem::Chunk(ChatChunk::Content { content })) => {
                assert_eq!(content, "hello world");
            }
            other => panic!("expected coalesced content, got {other:?}"),
        }
    }

    #[test]
    fn test_buffer_never_drops_critical_chunks() {
        let mut buffer = ChunkBuffer::new(2);
        buffer.push(StreamItem::Chunk(ChatChunk::ToolCall {
            tool: "fs/write_file".into(),
            agent: "dev".into(),
        }));
        buffer.push(StreamItem::Chunk(ChatChunk::AgentComplete { agent: "dev".into() }));
        // Full of critical chunks; more critical chunks still get queued.
        buffer.push(StreamItem::Chunk(ChatChunk::Error { error: "boom".into() }));
        buffer.push(StreamItem::Chunk(ChatChunk::Done { session_id: "s".into() }));

        let kinds: Vec<StreamItem> = std::iter::from_fn(|| buffer.pop()).collect();
        assert_eq!(kinds.len(), 4);
        assert!(matches!(
            kinds.last(),
            Some(StreamItem::Chunk(ChatChunk::Done { .. }))
        ));
    }

    #[test]
    fn test_incoming_keepalive_dropped_when_full_of_criticals() {
        let mut buffer = ChunkBuffer::new(1);
        buffer.push(StreamItem::Chunk(ChatChunk::AgentComplete { agent: "dev".into() }));
        buffer.push(StreamItem::Keepalive);
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.dropped_keepalives(), 1);
    }

    #[test]
    fn test_chunk_wire_shape() {
        let chunk = ChatChunk::ToolCall { tool: "git/commit".into(), agent: "feature-dev".into() };
        let wire = serde_json::to_value(&chunk).unwrap();
        assert_eq!(
            wire,
            serde_json::json!({ "type": "tool_call", "tool": "git/commit", "agent": "feature-dev" })
        );

        let done: ChatChunk =
            serde_json::from_str(r#"{"type":"done","session_id":"s1"}"#).unwrap();
        assert_eq!(done, ChatChunk::Done { session_id: "s1".into() });
    }
}
