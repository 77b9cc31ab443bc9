//! Workflow service: plan, execute, resume, snapshot
//!
//! Owns the static orchestration graph (`router` → `specialist` /
//! `approval_gate` → ... → `finalize`) and the task records around it.
//!
//! - `orchestrate` is idempotent on `task_id`: a duplicate submission
//!   returns the stored plan and never launches a second workflow.
//! - High-risk plans synthesize an approval request up front; the in-graph
//!   gate node re-requests idempotently when execution reaches it, so both
//!   paths converge on one pending record.
//! - Task and subtask rows are mutated only from engine-emitted bus events
//!   plus the post-run reconciliation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use futures::FutureExt;
use serde_json::{json, Map, Value};
use tokio::sync::Semaphore;
use tokio_stream::wrappers::ReceiverStream;

use taskgraph_checkpoint::{
    update_with_retry, CheckpointSaver, KvStore, StoreError, WorkflowStatus, CAS_MAX_ATTEMPTS,
};
use taskgraph_core::{
    AppendReducer, CancelHandle, CompiledGraph, DedupReducer, ExecutionConfig, ExecutionResult,
    FnNode, GraphError, GraphEvent, InterruptRequest, MergeByIdReducer, MergeObjectReducer,
    NodeContext, NodeError, NodeOutput, RetryPolicy, StateGraph, StreamMode, END,
};

use crate::approval::ApprovalGate;
use crate::catalogue::{DisclosureRequest, ToolCatalogue};
use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, Result};
use crate::events::{EventBus, EventKind};
use crate::metrics::Metrics;
use crate::models::{
    task_key, ApprovalState, Subtask, SubtaskState, Task, TaskRecord, TaskStatus,
};
use crate::planner::{sanitize_plan, Planner};
use crate::specialist::{SpecialistClient, SpecialistRequest};

/// Name of the orchestration graph
pub const GRAPH_NAME: &str = "dev_tasks";

/// A running task's event stream handed to the gateway
pub struct TaskStream {
    /// Ordered engine events; finite, `Done` last
    pub events: ReceiverStream<GraphEvent>,
    /// Cancels the underlying run cooperatively
    pub cancel: CancelHandle,
}

/// Validated `/orchestrate` parameters
#[derive(Debug, Clone)]
pub struct OrchestrateParams {
    pub task: Task,
}

/// Plans, executes, and tracks tasks
pub struct WorkflowService {
    config: OrchestratorConfig,
    store: Arc<dyn KvStore>,
    saver: Arc<dyn CheckpointSaver>,
    bus: Arc<EventBus>,
    gate: Arc<ApprovalGate>,
    planner: Arc<dyn Planner>,
    planner_slots: Arc<Semaphore>,
    metrics: Arc<Metrics>,
    engine: CompiledGraph,
    running: DashMap<String, CancelHandle>,
    accepting: AtomicBool,
}

impl WorkflowService {
    /// Wire the service and compile the orchestration graph
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: OrchestratorConfig,
        store: Arc<dyn KvStore>,
        saver: Arc<dyn CheckpointSaver>,
        bus: Arc<EventBus>,
        gate: Arc<ApprovalGate>,
        planner: Arc<dyn Planner>,
        specialist: Arc<dyn SpecialistClient>,
        catalogue: Arc<ToolCatalogue>,
        metrics: Arc<Metrics>,
    ) -> Result<Arc<Self>> {
        let spec = build_graph(&config, bus.clone(), gate.clone(), specialist, catalogue)
            .compile()
            .map_err(OrchestratorError::Graph)?;
        let engine = CompiledGraph::new(spec, saver.clone());

        let service = Arc::new(Self {
            planner_slots: Arc::new(Semaphore::new(config.planner.queue_capacity)),
            config,
            store,
            saver,
            bus,
            gate,
            planner,
            metrics,
            engine,
            running: DashMap::new(),
            accepting: AtomicBool::new(true),
        });
        service.attach_event_handlers();
        Ok(service)
    }

    /// Whether the service still accepts new work (false during shutdown)
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Relaxed)
    }

    /// Idempotent task submission and decomposition
    pub async fn orchestrate(&self, params: OrchestrateParams) -> Result<TaskRecord> {
        if !self.is_accepting() {
            return Err(OrchestratorError::Overloaded("shutting down".into()));
        }
        self.metrics.inc("orchestrate_requests_total");
        let task = params.task;

        if let Some(existing) = self.load_task(&task.task_id).await? {
            tracing::debug!(task_id = %task.task_id, "duplicate submission, returning stored plan");
            return Ok(existing);
        }

        // Bounded admission: beyond the high-water mark the caller gets a
        // 503 with Retry-After instead of a queued decomposition.
        let _permit = self.planner_slots.try_acquire().map_err(|_| {
            OrchestratorError::Overloaded("planner queue is at capacity".into())
        })?;

        let raw_plan = self.planner.plan(&task).await?;
        let subtasks = sanitize_plan(&raw_plan, &self.metrics)?;

        let gated = subtasks.iter().find(|s| s.requires_approval);
        let (status, approval_request_id) = match gated {
            Some(subtask) => {
                let action = subtask.action_type.clone().unwrap_or_default();
                let approval = self
                    .gate
                    .request(&task.task_id, subtask.risk_level, &action, &subtask.description)
                    .await?;
                (TaskStatus::ApprovalPending, Some(approval.approval_id))
            }
            None => (TaskStatus::Planned, None),
        };

        let record = TaskRecord {
            task,
            subtasks,
            status,
            approval_request_id,
            started_at: None,
            finished_at: None,
            failure_reason: None,
        };

        let key = task_key(&record.task.task_id);
        match self
            .store
            .compare_and_swap(&key, None, serde_json::to_value(&record)?)
            .await
        {
            Ok(_) => {
                tracing::info!(
                    task_id = %record.task.task_id,
                    subtasks = record.subtasks.len(),
                    status = ?record.status,
                    "task planned"
                );
                Ok(record)
            }
            Err(StoreError::VersionConflict { .. }) => {
                // Lost a submission race; the stored plan wins.
                self.load_task(&record.task.task_id)
                    .await?
                    .ok_or_else(|| OrchestratorError::Concurrency(
                        "task row vanished during concurrent submission".into(),
                    ))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Start execution of a planned task
    pub async fn execute(self: &Arc<Self>, task_id: &str) -> Result<TaskRecord> {
        let stream = self.start_stream(task_id, None).await?;
        // No streaming consumer: drain the events so the engine never blocks
        // on a full channel.
        tokio::spawn(async move {
            use tokio_stream::StreamExt;
            let mut events = stream.events;
            while events.next().await.is_some() {}
        });
        self.snapshot(task_id).await
    }

    /// Resume a task that paused for approval
    ///
    /// Fails with 403/410-mapped errors when the gating approval was
    /// rejected or expired, and 409 when it is still pending.
    pub async fn resume_task(self: &Arc<Self>, task_id: &str) -> Result<TaskRecord> {
        let record = self.require_task(task_id).await?;
        if record.status != TaskStatus::ApprovalPending {
            return Err(OrchestratorError::InvalidState(format!(
                "task '{task_id}' is {:?}, not approval_pending",
                record.status
            )));
        }
        let approval_id = record.approval_request_id.clone().ok_or_else(|| {
            OrchestratorError::Internal(format!(
                "task '{task_id}' is approval_pending without an approval id"
            ))
        })?;
        let approval = self.gate.get(&approval_id).await?;
        let grant = match approval.state {
            ApprovalState::Approved => {
                json!({ "approvals": { approval.action_type.clone(): "approved" } })
            }
            ApprovalState::Rejected => {
                return Err(OrchestratorError::ApprovalRejected {
                    task_id: task_id.to_string(),
                    reason: approval.reason,
                });
            }
            ApprovalState::Expired => {
                return Err(OrchestratorError::ApprovalExpired { task_id: task_id.to_string() });
            }
            ApprovalState::Pending => {
                return Err(OrchestratorError::InvalidState(format!(
                    "approval '{approval_id}' is still pending"
                )));
            }
        };

        let stream = self.start_stream(task_id, Some(grant)).await?;
        tokio::spawn(async move {
            use tokio_stream::StreamExt;
            let mut events = stream.events;
            while events.next().await.is_some() {}
        });
        self.snapshot(task_id).await
    }

    /// Launch (or resume) the engine run and hand back its event stream
    ///
    /// `grant` carries approval state into the run. Used by `execute`,
    /// `resume_task`, and the chat gateway.
    pub async fn start_stream(
        self: &Arc<Self>,
        task_id: &str,
        grant: Option<Value>,
    ) -> Result<TaskStream> {
        if !self.is_accepting() {
            return Err(OrchestratorError::Overloaded("shutting down".into()));
        }
        let record = self.require_task(task_id).await?;

        let resumable = self
            .saver
            .get_workflow(task_id)
            .await?
            .map(|(row, _)| row.status == WorkflowStatus::WaitingApproval)
            .unwrap_or(false);

        if resumable {
            // A suspended engine run only continues for a task still gated
            // on its approval; a task failed by a rejection stays failed.
            if record.status != TaskStatus::ApprovalPending {
                return Err(OrchestratorError::InvalidState(format!(
                    "task '{task_id}' is {:?} and cannot be resumed",
                    record.status
                )));
            }
        } else {
            match record.status {
                TaskStatus::Planned => {}
                TaskStatus::ApprovalPending if grant.is_some() => {}
                TaskStatus::Running => {
                    return Err(OrchestratorError::InvalidState(format!(
                        "task '{task_id}' is already running"
                    )));
                }
                status => {
                    return Err(OrchestratorError::InvalidState(format!(
                        "task '{task_id}' is {status:?} and cannot be executed"
                    )));
                }
            }
        }

        // The task row flips to running before the engine spawns so a fast
        // run's reconciliation can never be overwritten afterwards.
        self.mark_running(task_id).await?;

        let mut exec_config = self.execution_config();
        if let Some(parent) = &record.task.parent_task_id {
            exec_config = exec_config.with_parent(parent.clone());
        }
        let run = if resumable {
            self.engine.stream_resume(task_id, grant, exec_config)
        } else {
            let mut input = json!({
                "task": self.task_json(&record)?,
                "subtasks": serde_json::to_value(&record.subtasks)?,
                "messages": [],
            });
            if let Some(grant) = grant {
                merge_top_level(&mut input, grant);
            }
            self.engine.stream_events(task_id, input, exec_config)
        };

        self.metrics.inc("workflows_started_total");
        self.bus.emit(
            EventKind::WorkflowStarted,
            json!({ "workflow_id": task_id }),
            "workflow_service",
            task_id.to_string(),
        );

        self.running.insert(task_id.to_string(), run.cancel.clone());
        self.spawn_reconcile(task_id.to_string(), run.handle);

        Ok(TaskStream { events: run.events, cancel: run.cancel })
    }

    /// Cancel a running task, if any
    pub fn cancel(&self, task_id: &str) -> bool {
        match self.running.get(task_id) {
            Some(handle) => {
                handle.cancel();
                true
            }
            None => false,
        }
    }

    /// Current task record
    pub async fn snapshot(&self, task_id: &str) -> Result<TaskRecord> {
        self.require_task(task_id).await
    }

    /// Stop intake and cancel everything still running after the drain window
    pub async fn shutdown(&self, drain: std::time::Duration) {
        self.accepting.store(false, Ordering::Relaxed);
        let deadline = tokio::time::Instant::now() + drain;
        while !self.running.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        for entry in self.running.iter() {
            tracing::warn!(task_id = %entry.key(), "cancelling workflow at shutdown");
            entry.value().cancel();
        }
        // Give cancelled runs a moment to write their final checkpoint.
        let grace = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
        while !self.running.is_empty() && tokio::time::Instant::now() < grace {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
    }

    fn execution_config(&self) -> ExecutionConfig {
        ExecutionConfig::default()
            .with_node_timeout(self.config.node_timeout())
            .with_retry(RetryPolicy::new(self.config.engine.max_retries))
            .with_ttl(self.config.workflow_ttl())
            .with_stream_mode(StreamMode::Updates)
    }

    fn task_json(&self, record: &TaskRecord) -> Result<Value> {
        Ok(serde_json::to_value(&record.task)?)
    }

    async fn load_task(&self, task_id: &str) -> Result<Option<TaskRecord>> {
        match self.store.get(&task_key(task_id)).await? {
            Some(record) => Ok(Some(record.decode()?)),
            None => Ok(None),
        }
    }

    async fn require_task(&self, task_id: &str) -> Result<TaskRecord> {
        self.load_task(task_id).await?.ok_or_else(|| OrchestratorError::NotFound {
            kind: "task",
            id: task_id.to_string(),
        })
    }

    async fn mark_running(&self, task_id: &str) -> Result<()> {
        self.update_task(task_id, |record| {
            record.status = TaskStatus::Running;
            if record.started_at.is_none() {
                record.started_at = Some(Utc::now());
            }
        })
        .await
    }

    async fn update_task<F>(&self, task_id: &str, mut mutate: F) -> Result<()>
    where
        F: FnMut(&mut TaskRecord) + Send,
    {
        let key = task_key(task_id);
        update_with_retry(self.store.as_ref(), &key, CAS_MAX_ATTEMPTS, |current| {
            let record = current
                .ok_or_else(|| StoreError::NotFound(key.clone()))?;
            let mut task: TaskRecord = record.decode()?;
            mutate(&mut task);
            Ok(serde_json::to_value(&task)?)
        })
        .await
        .map_err(|err| match err {
            StoreError::NotFound(_) => OrchestratorError::NotFound {
                kind: "task",
                id: task_id.to_string(),
            },
            other => other.into(),
        })?;
        Ok(())
    }

    /// Post-run reconciliation: fold the engine outcome back into the task
    fn spawn_reconcile(
        self: &Arc<Self>,
        task_id: String,
        handle: tokio::task::JoinHandle<taskgraph_core::Result<ExecutionResult>>,
    ) {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = handle.await;
            service.running.remove(&task_id);

            match outcome {
                Ok(Ok(result)) => service.reconcile_success(&task_id, result).await,
                Ok(Err(err)) => service.reconcile_failure(&task_id, err).await,
                Err(join_err) => {
                    tracing::error!(%task_id, "workflow task panicked: {join_err}");
                    service.reconcile_failure(
                        &task_id,
                        GraphError::Engine("workflow task panicked".into()),
                    )
                    .await;
                }
            }
        });
    }

    async fn reconcile_success(&self, task_id: &str, result: ExecutionResult) {
        let subtasks = read_subtasks(&result.state).unwrap_or_default();
        let approval_id = match &result.interrupt {
            Some(interrupt) => self
                .gate
                .find_pending(task_id, &interrupt.action_type)
                .await
                .ok()
                .flatten()
                .map(|a| a.approval_id),
            None => None,
        };

        let (status, event) = match result.status {
            WorkflowStatus::Completed => (TaskStatus::Completed, Some(EventKind::WorkflowCompleted)),
            WorkflowStatus::Cancelled => (TaskStatus::Cancelled, Some(EventKind::WorkflowCancelled)),
            WorkflowStatus::WaitingApproval => (TaskStatus::ApprovalPending, None),
            other => {
                tracing::warn!(%task_id, status = ?other, "unexpected terminal engine status");
                (TaskStatus::Failed, Some(EventKind::WorkflowFailed))
            }
        };

        let update = self
            .update_task(task_id, |record| {
                if !subtasks.is_empty() {
                    record.subtasks = subtasks.clone();
                }
                record.status = status;
                if status == TaskStatus::ApprovalPending {
                    record.approval_request_id = approval_id.clone();
                } else if status.is_terminal() {
                    record.finished_at = Some(Utc::now());
                }
            })
            .await;
        if let Err(err) = update {
            tracing::error!(%task_id, "failed to reconcile task record: {err}");
        }

        match status {
            TaskStatus::Completed => self.metrics.inc("workflows_completed_total"),
            TaskStatus::Cancelled => self.metrics.inc("workflows_cancelled_total"),
            TaskStatus::Failed => self.metrics.inc("workflows_failed_total"),
            _ => {}
        }
        if let Some(kind) = event {
            self.bus.emit(
                kind,
                json!({ "workflow_id": task_id }),
                "workflow_service",
                task_id.to_string(),
            );
        }
    }

    async fn reconcile_failure(&self, task_id: &str, err: GraphError) {
        if matches!(err, GraphError::Concurrency { .. } | GraphError::InvalidState { .. }) {
            // Another runner owns the workflow; its reconciliation is the
            // authoritative one.
            tracing::warn!(%task_id, "run rejected without effect: {err}");
            return;
        }
        tracing::error!(%task_id, "workflow failed: {err}");
        self.metrics.inc("workflows_failed_total");

        // Best-effort: recover the subtask states from the final checkpoint.
        let subtasks = match self.saver.latest(task_id).await {
            Ok(Some(checkpoint)) => read_subtasks(&checkpoint.state).unwrap_or_default(),
            _ => Vec::new(),
        };
        let reason = err.to_string();
        let update = self
            .update_task(task_id, |record| {
                if !subtasks.is_empty() {
                    record.subtasks = subtasks.clone();
                }
                record.status = TaskStatus::Failed;
                record.failure_reason = Some(reason.clone());
                record.finished_at = Some(Utc::now());
            })
            .await;
        if let Err(err) = update {
            tracing::error!(%task_id, "failed to record workflow failure: {err}");
        }
        self.bus.emit(
            EventKind::WorkflowFailed,
            json!({ "workflow_id": task_id, "reason": reason }),
            "workflow_service",
            task_id.to_string(),
        );
    }

    /// Subscribe the task-row owners: subtask events and approval decisions
    fn attach_event_handlers(self: &Arc<Self>) {
        // Subtask progress flows from the graph nodes through the bus into
        // the task rows.
        for kind in [
            EventKind::SubtaskStarted,
            EventKind::SubtaskCompleted,
            EventKind::SubtaskFailed,
        ] {
            let service = Arc::clone(self);
            self.bus.subscribe(kind, Arc::new(move |event| {
                let service = service.clone();
                async move {
                    let Some(workflow_id) = event.workflow_id().map(str::to_string) else {
                        return;
                    };
                    let Some(index) = event.payload.get("index").and_then(Value::as_u64) else {
                        return;
                    };
                    let state = match event.kind {
                        EventKind::SubtaskStarted => SubtaskState::Running,
                        EventKind::SubtaskCompleted => SubtaskState::Completed,
                        _ => SubtaskState::Failed,
                    };
                    let outputs = event.payload.get("outputs").cloned();
                    let result = service
                        .update_task(&workflow_id, |record| {
                            if let Some(subtask) = record.subtasks.get_mut(index as usize) {
                                subtask.state = state;
                                if let Some(outputs) = &outputs {
                                    subtask.outputs = outputs.clone();
                                }
                            }
                        })
                        .await;
                    if let Err(err) = result {
                        tracing::debug!(%workflow_id, "subtask event not applied: {err}");
                    }
                }
                .boxed()
            }));
        }

        // A rejection fails the workflow (no rejection-recovery edge in this
        // graph) and preserves the reviewer's reason on the task.
        let service = Arc::clone(self);
        self.bus.subscribe(EventKind::ApprovalRejected, Arc::new(move |event| {
            let service = service.clone();
            async move {
                let Some(task_id) = event.workflow_id().map(str::to_string) else {
                    return;
                };
                let reason = event
                    .payload
                    .get("reason")
                    .and_then(Value::as_str)
                    .unwrap_or("approval rejected")
                    .to_string();
                let action = event
                    .payload
                    .get("action_type")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();

                let update = service
                    .update_task(&task_id, |record| {
                        record.status = TaskStatus::Failed;
                        record.failure_reason = Some(reason.clone());
                        record.finished_at = Some(Utc::now());
                    })
                    .await;
                if let Err(err) = update {
                    tracing::debug!(%task_id, "rejection not applied to task: {err}");
                }

                // Drive a suspended workflow into its failed terminal state.
                let waiting = service
                    .saver
                    .get_workflow(&task_id)
                    .await
                    .ok()
                    .flatten()
                    .map(|(row, _)| row.status == WorkflowStatus::WaitingApproval)
                    .unwrap_or(false);
                if waiting {
                    let injection = json!({ "approvals": { action: "rejected" } });
                    let result = service
                        .engine
                        .resume_with(&task_id, Some(injection), service.execution_config())
                        .await;
                    match result {
                        Err(GraphError::NodeFailed { .. }) | Ok(_) => {}
                        Err(err) => {
                            tracing::warn!(%task_id, "rejection resume failed: {err}")
                        }
                    }
                }
            }
            .boxed()
        }));
    }
}

/// Parse the subtask array out of workflow state
pub fn read_subtasks(state: &Value) -> Option<Vec<Subtask>> {
    serde_json::from_value(state.get("subtasks")?.clone()).ok()
}

fn merge_top_level(target: &mut Value, extra: Value) {
    if let (Some(target_map), Value::Object(extra_map)) = (target.as_object_mut(), extra) {
        for (key, value) in extra_map {
            target_map.insert(key, value);
        }
    }
}

/// Assemble the static orchestration graph
///
/// `router` picks the next runnable subtask; `approval_gate` suspends on
/// ungranted high-risk actions; `specialist` executes through the client;
/// `finalize` rolls the subtask states into an outcome.
fn build_graph(
    config: &OrchestratorConfig,
    bus: Arc<EventBus>,
    gate: Arc<ApprovalGate>,
    specialist: Arc<dyn SpecialistClient>,
    catalogue: Arc<ToolCatalogue>,
) -> StateGraph {
    let mut graph = StateGraph::new(GRAPH_NAME);
    graph
        .with_channel("messages", Box::new(AppendReducer))
        .with_channel("rag_context", Box::new(MergeByIdReducer::new("id")))
        .with_channel("tools_used", Box::new(DedupReducer))
        .with_channel("approvals", Box::new(MergeObjectReducer));

    // Router: reconcile interrupted work, cascade blocks, pick the next
    // runnable subtask.
    let router_bus = bus.clone();
    graph.add_node(
        "router",
        FnNode::new(move |state: Value, ctx: NodeContext| {
            let bus = router_bus.clone();
            async move {
                let mut subtasks = read_subtasks(&state).ok_or_else(|| {
                    NodeError::internal("state is missing the subtask plan")
                })?;

                // A pending error record at routing time means the cursor
                // subtask exhausted its retries and the recovery edge led
                // back here; mark it failed and consume the record.
                let pending_error = state
                    .get("last_error")
                    .map(|e| !e.is_null())
                    .unwrap_or(false);
                if pending_error {
                    if let Some(cursor) = state.get("cursor").and_then(Value::as_u64) {
                        let cursor = cursor as usize;
                        if matches!(
                            subtasks.get(cursor).map(|s| s.state),
                            Some(SubtaskState::Planned) | Some(SubtaskState::Running)
                        ) {
                            subtasks[cursor].state = SubtaskState::Failed;
                            bus.emit(
                                EventKind::SubtaskFailed,
                                json!({
                                    "workflow_id": ctx.workflow_id,
                                    "index": cursor,
                                    "error": state["last_error"]["error"],
                                }),
                                "router",
                                ctx.workflow_id.clone(),
                            );
                        }
                    }
                }
                cascade_blocks(&mut subtasks);

                let next = next_runnable(&subtasks);
                let mut delta = Map::new();
                delta.insert("last_error".into(), Value::Null);
                delta.insert("subtasks".into(), serde_json::to_value(&subtasks)
                    .map_err(|e| NodeError::internal(format!("subtask serialization: {e}")))?);
                match next {
                    Some(index) => {
                        delta.insert("cursor".into(), json!(index));
                        delta.insert(
                            "current_agent".into(),
                            json!(subtasks[index].agent_kind.clone()),
                        );
                    }
                    None => {
                        delta.insert("cursor".into(), Value::Null);
                    }
                }
                Ok(NodeOutput::update(Value::Object(delta)))
            }
        }),
    );

    graph.add_conditional_edges("router", |state| {
        let Some(cursor) = state.get("cursor").and_then(Value::as_u64) else {
            return "finalize".to_string();
        };
        let subtasks = read_subtasks(state).unwrap_or_default();
        let Some(subtask) = subtasks.get(cursor as usize) else {
            return "finalize".to_string();
        };
        if subtask.requires_approval && !approval_granted(state, subtask) {
            "approval_gate".to_string()
        } else {
            "specialist".to_string()
        }
    });

    // Approval gate: request idempotently, then suspend. After a decision the
    // node re-runs: a grant passes through, a rejection fails the workflow.
    let gate_for_node = gate;
    graph.add_node(
        "approval_gate",
        FnNode::new(move |state: Value, ctx: NodeContext| {
            let gate = gate_for_node.clone();
            async move {
                let subtasks = read_subtasks(&state)
                    .ok_or_else(|| NodeError::internal("state is missing the subtask plan"))?;
                let cursor = state
                    .get("cursor")
                    .and_then(Value::as_u64)
                    .ok_or_else(|| NodeError::internal("approval gate reached without a cursor"))?;
                let subtask = subtasks
                    .get(cursor as usize)
                    .ok_or_else(|| NodeError::internal("cursor points past the plan"))?;
                let action = subtask.action_type.clone().unwrap_or_default();

                match state
                    .get("approvals")
                    .and_then(|a| a.get(&action))
                    .and_then(Value::as_str)
                {
                    Some("approved") => Ok(NodeOutput::empty()),
                    Some("rejected") => Err(NodeError::internal(format!(
                        "approval for '{action}' was rejected"
                    ))),
                    _ => {
                        let request = gate
                            .request(
                                &ctx.workflow_id,
                                subtask.risk_level,
                                &action,
                                &subtask.description,
                            )
                            .await
                            .map_err(|e| NodeError::upstream(format!("approval gate: {e}")))?;
                        Ok(NodeOutput::interrupt(
                            Value::Null,
                            InterruptRequest {
                                action_type: request.action_type,
                                risk_level: format!("{:?}", subtask.risk_level).to_lowercase(),
                                description: request.description,
                                payload: json!({ "approval_id": request.approval_id }),
                            },
                        ))
                    }
                }
            }
        }),
    );
    graph.add_edge("approval_gate", "router");

    // Specialist: execute the cursor subtask through the client, streaming
    // chunks as they come.
    let specialist_bus = bus.clone();
    let disclosure_strategy = config.disclosure.default_strategy;
    let max_tools = config.disclosure.max_tools;
    graph.add_node(
        "specialist",
        FnNode::new(move |state: Value, ctx: NodeContext| {
            let bus = specialist_bus.clone();
            let specialist = specialist.clone();
            let catalogue = catalogue.clone();
            async move {
                let mut subtasks = read_subtasks(&state)
                    .ok_or_else(|| NodeError::internal("state is missing the subtask plan"))?;
                let cursor = state
                    .get("cursor")
                    .and_then(Value::as_u64)
                    .ok_or_else(|| NodeError::internal("specialist reached without a cursor"))?
                    as usize;
                let subtask = subtasks
                    .get_mut(cursor)
                    .ok_or_else(|| NodeError::internal("cursor points past the plan"))?;

                subtask.state = SubtaskState::Running;
                subtask.attempts = ctx.attempt;
                if ctx.attempt == 1 {
                    bus.emit(
                        EventKind::SubtaskStarted,
                        json!({ "workflow_id": ctx.workflow_id, "index": cursor }),
                        "specialist",
                        ctx.workflow_id.clone(),
                    );
                }

                let tools: Vec<String> = catalogue
                    .disclose(&DisclosureRequest {
                        text: &subtask.description,
                        agent_tools: None,
                        strategy: disclosure_strategy,
                        max_tools,
                    })
                    .iter()
                    .map(|t| t.qualified_name())
                    .collect();

                let request = SpecialistRequest {
                    workflow_id: ctx.workflow_id.clone(),
                    subtask_index: cursor,
                    agent_kind: subtask.agent_kind.clone(),
                    description: subtask.description.clone(),
                    tools,
                    context: json!({
                        "task": state.get("task").cloned().unwrap_or(Value::Null),
                        "messages": state.get("messages").cloned().unwrap_or(Value::Null),
                    }),
                };
                let outcome = specialist.execute(&request, &ctx).await?;

                subtask.state = SubtaskState::Completed;
                subtask.outputs = outcome.outputs.clone();
                let agent_kind = subtask.agent_kind.clone();

                bus.emit(
                    EventKind::SubtaskCompleted,
                    json!({
                        "workflow_id": ctx.workflow_id,
                        "index": cursor,
                        "outputs": outcome.outputs,
                    }),
                    "specialist",
                    ctx.workflow_id.clone(),
                );
                ctx.emit_agent_complete(&agent_kind).await;

                Ok(NodeOutput::update(json!({
                    "subtasks": subtasks,
                    "messages": [outcome.summary],
                    "tools_used": outcome.tools_used,
                })))
            }
        }),
    );
    graph.add_edge("specialist", "router");
    // Exhausted specialist retries route back through the router, which
    // marks the stuck subtask failed and blocks its dependents.
    graph.add_recovery_edge("specialist", "router");

    // Finalize: roll subtask states into the workflow outcome.
    graph.add_node(
        "finalize",
        FnNode::new(move |state: Value, _ctx: NodeContext| async move {
            let subtasks = read_subtasks(&state)
                .ok_or_else(|| NodeError::internal("state is missing the subtask plan"))?;
            let failed = subtasks
                .iter()
                .filter(|s| matches!(s.state, SubtaskState::Failed | SubtaskState::Blocked))
                .count();
            if failed > 0 {
                return Err(NodeError::internal(format!(
                    "{failed} subtask(s) failed or were blocked"
                )));
            }
            Ok(NodeOutput::update(json!({ "outcome": "completed" })))
        }),
    );
    graph.add_edge("finalize", END);

    graph.set_entry_point("router");
    graph
}

/// First planned subtask whose dependencies are all completed
fn next_runnable(subtasks: &[Subtask]) -> Option<usize> {
    subtasks.iter().position(|subtask| {
        subtask.state == SubtaskState::Planned
            && subtask
                .depends_on
                .iter()
                .all(|dep| subtasks.get(*dep).map(|d| d.state) == Some(SubtaskState::Completed))
    })
}

/// Block every planned subtask depending (transitively) on a failure
fn cascade_blocks(subtasks: &mut [Subtask]) {
    loop {
        let mut changed = false;
        for i in 0..subtasks.len() {
            if subtasks[i].state != SubtaskState::Planned {
                continue;
            }
            let doomed = subtasks[i].depends_on.iter().any(|dep| {
                matches!(
                    subtasks.get(*dep).map(|d| d.state),
                    Some(SubtaskState::Failed) | Some(SubtaskState::Blocked)
                )
            });
            if doomed {
                subtasks[i].state = SubtaskState::Blocked;
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }
}

fn approval_granted(state: &Value, subtask: &Subtask) -> bool {
    let Some(action) = &subtask.action_type else {
        return true;
    };
    state
        .get("approvals")
        .and_then(|a| a.get(action))
        .and_then(Value::as_str)
        == Some("approved")
}
