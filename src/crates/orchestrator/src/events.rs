//! In-process event bus with typed kinds
//!
//! Used by the approval gate, lifecycle manager, workflow service, and
//! gateway. The contract:
//!
//! - multiple handlers per kind; each handler gets its own bounded queue and
//!   worker task, so one subscriber sees a kind's events in emission order
//!   while distinct handlers run concurrently;
//! - subscriber lists are copy-on-write: `emit` snapshots the `Arc`'d list
//!   and fans out without holding any lock;
//! - a handler failure (or panic) is logged and never affects `emit` or the
//!   other handlers; a subscriber whose queue overflows loses that event
//!   with a warning;
//! - no persistence, no replay - consumers needing durability read from the
//!   store directly.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

/// Typed event kinds flowing through the control plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    WorkflowStarted,
    WorkflowCompleted,
    WorkflowFailed,
    WorkflowCancelled,
    WorkflowExpired,
    SubtaskStarted,
    SubtaskCompleted,
    SubtaskFailed,
    ApprovalRequired,
    ApprovalApproved,
    ApprovalRejected,
    ApprovalExpired,
}

impl EventKind {
    /// Every kind, for subscribers that want the whole firehose
    pub const ALL: [EventKind; 12] = [
        EventKind::WorkflowStarted,
        EventKind::WorkflowCompleted,
        EventKind::WorkflowFailed,
        EventKind::WorkflowCancelled,
        EventKind::WorkflowExpired,
        EventKind::SubtaskStarted,
        EventKind::SubtaskCompleted,
        EventKind::SubtaskFailed,
        EventKind::ApprovalRequired,
        EventKind::ApprovalApproved,
        EventKind::ApprovalRejected,
        EventKind::ApprovalExpired,
    ];
}

/// A published event; in-memory only, handlers run once
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    pub payload: Value,
    pub source: String,
    pub correlation_id: String,
    pub emitted_at: DateTime<Utc>,
}

impl Event {
    /// The workflow this event references, when the payload carries one
    pub fn workflow_id(&self) -> Option<&str> {
        self.payload.get("workflow_id").and_then(Value::as_str)
    }
}

/// Async event handler
pub type EventHandler = Arc<dyn Fn(Event) -> BoxFuture<'static, ()> + Send + Sync>;

/// Bound of each subscriber's delivery queue
const SUBSCRIBER_QUEUE_CAPACITY: usize = 256;

#[derive(Clone)]
struct Subscriber {
    tx: mpsc::Sender<Event>,
}

/// In-process publish/subscribe
///
/// Subscriber lists are copy-on-write: each kind maps to an `Arc<Vec<_>>`
/// that `subscribe` replaces and `emit` snapshots.
pub struct EventBus {
    subscribers: RwLock<HashMap<EventKind, Arc<Vec<Subscriber>>>>,
}

impl EventBus {
    /// Create an empty bus
    pub fn new() -> Self {
        Self { subscribers: RwLock::new(HashMap::new()) }
    }

    /// Register `handler` for `kind`
    ///
    /// The handler runs on its own worker task; events it receives arrive in
    /// emission order for that kind.
    pub fn subscribe(&self, kind: EventKind, handler: EventHandler) {
        let (tx, mut rx) = mpsc::channel::<Event>(SUBSCRIBER_QUEUE_CAPACITY);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let fut = handler(event.clone());
                if std::panic::AssertUnwindSafe(fut).catch_unwind().await.is_err() {
                    tracing::error!(
                        kind = ?event.kind,
                        correlation_id = %event.correlation_id,
                        "event handler panicked"
                    );
                }
            }
        });
        let mut map = self.subscribers.write();
        let list = map.entry(kind).or_insert_with(|| Arc::new(Vec::new()));
        Arc::make_mut(list).push(Subscriber { tx });
    }

    /// Register `handler` for every kind
    pub fn subscribe_all(&self, handler: EventHandler) {
        for kind in EventKind::ALL {
            self.subscribe(kind, handler.clone());
        }
    }

    /// Publish an event to every subscriber of its kind
    ///
    /// Never fails. The subscriber list is snapshotted at emit time and the
    /// fan-out runs lock-free; a full subscriber queue loses this event for
    /// that subscriber only, with a warning.
    pub fn emit(
        &self,
        kind: EventKind,
        payload: Value,
        source: impl Into<String>,
        correlation_id: impl Into<String>,
    ) {
        let event = Event {
            kind,
            payload,
            source: source.into(),
            correlation_id: correlation_id.into(),
            emitted_at: Utc::now(),
        };
        tracing::debug!(kind = ?event.kind, source = %event.source, "event emitted");

        let Some(snapshot) = self.subscribers.read().get(&kind).cloned() else {
            return;
        };

        let mut closed = false;
        for subscriber in snapshot.iter() {
            match subscriber.tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(
                        kind = ?event.kind,
                        correlation_id = %event.correlation_id,
                        "subscriber queue full, event dropped for this subscriber"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => closed = true,
            }
        }
        if closed {
            let mut map = self.subscribers.write();
            if let Some(list) = map.get_mut(&kind) {
                Arc::make_mut(list).retain(|s| !s.tx.is_closed());
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    fn wait_handler(seen: Arc<Mutex<Vec<Event>>>) -> EventHandler {
        Arc::new(move |event| {
            let seen = seen.clone();
            async move {
                seen.lock().await.push(event);
            }
            .boxed()
        })
    }

    #[tokio::test]
    async fn test_handlers_see_emission_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(EventKind::SubtaskCompleted, wait_handler(seen.clone()));

        for i in 0..20 {
            bus.emit(
                EventKind::SubtaskCompleted,
                json!({ "workflow_id": "w", "index": i }),
                "test",
                format!("c{i}"),
            );
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let events = seen.lock().await;
        assert_eq!(events.len(), 20);
        for (i, event) in events.iter().enumerate() {
            assert_eq!(event.payload["index"], json!(i));
        }
    }

    #[tokio::test]
    async fn test_failing_handler_does_not_affect_others() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));

        bus.subscribe(
            EventKind::ApprovalRequired,
            Arc::new(|_event| async move { panic!("handler bug") }.boxed()),
        );
        let counter = count.clone();
        bus.subscribe(
            EventKind::ApprovalRequired,
            Arc::new(move |_event| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
                .boxed()
            }),
        );

        bus.emit(EventKind::ApprovalRequired, json!({}), "test", "c1");
        bus.emit(EventKind::ApprovalRequired, json!({}), "test", "c2");
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_overflowing_subscriber_does_not_block_emit_or_peers() {
        let bus = EventBus::new();

        // This handler parks on its first event, so its queue fills and
        // overflows; emit must keep going and the healthy peer must see
        // every event.
        let stall = Arc::new(tokio::sync::Notify::new());
        let gate = stall.clone();
        bus.subscribe(
            EventKind::SubtaskStarted,
            Arc::new(move |_event| {
                let gate = gate.clone();
                async move {
                    gate.notified().await;
                }
                .boxed()
            }),
        );
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        bus.subscribe(
            EventKind::SubtaskStarted,
            Arc::new(move |_event| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
                .boxed()
            }),
        );

        // Yield periodically so the healthy worker can drain its queue; the
        // stalled one overflows regardless.
        let total = SUBSCRIBER_QUEUE_CAPACITY + 100;
        for i in 0..total {
            bus.emit(
                EventKind::SubtaskStarted,
                json!({ "i": i }),
                "test",
                format!("c{i}"),
            );
            if i % 64 == 0 {
                tokio::task::yield_now().await;
            }
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        assert_eq!(count.load(Ordering::SeqCst), total);
        stall.notify_one();
    }

    #[tokio::test]
    async fn test_workflow_id_extraction() {
        let event = Event {
            kind: EventKind::WorkflowStarted,
            payload: json!({ "workflow_id": "T1" }),
            source: "engine".into(),
            correlation_id: "c".into(),
            emitted_at: Utc::now(),
        };
        assert_eq!(event.workflow_id(), Some("T1"));
    }
}
