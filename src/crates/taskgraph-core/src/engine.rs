//! Checkpointed graph execution
//!
//! [`CompiledGraph`] runs a validated [`GraphSpec`] with the guarantees the
//! rest of the control plane leans on:
//!
//! - a checkpoint is persisted after **every** node completion, so `resume`
//!   is always deterministic from the latest step;
//! - the workflow head row is acquired with compare-and-swap, so a second
//!   concurrent `invoke` for the same task fails with a concurrency error;
//! - events per workflow are totally ordered and `Done` is last;
//! - cancellation is cooperative: the run stops before the next node and the
//!   final checkpoint carries status `cancelled`;
//! - an interrupt from a node is an ordinary transition into
//!   `waiting_approval`, never an error;
//! - a checkpoint write failure aborts the run, so callers never observe
//!   progress that was not made durable.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;

use taskgraph_checkpoint::{
    Checkpoint, CheckpointSaver, StoreError, WorkflowRow, WorkflowStatus, CAS_MAX_ATTEMPTS,
};

use crate::cancel::{cancellation_pair, CancelHandle, CancellationSignal};
use crate::error::{GraphError, NodeError, Result};
use crate::graph::{GraphSpec, END};
use crate::node::{InterruptRequest, NodeCommand, NodeContext, NodeOutput};
use crate::retry::RetryPolicy;
use crate::stream::{GraphEvent, StreamMode};

/// Per-invocation execution settings
#[derive(Clone)]
pub struct ExecutionConfig {
    /// Checkpoint thread; defaults to the task id
    pub thread_id: Option<String>,
    /// Granularity of state events on `stream`
    pub stream_mode: StreamMode,
    /// Per-node deadline
    pub node_timeout: Duration,
    /// Retry policy for retryable node failures
    pub retry: RetryPolicy,
    /// TTL applied to a freshly created workflow row
    pub ttl: chrono::Duration,
    /// Audit-chain parent recorded on a freshly created workflow row
    pub parent_workflow_id: Option<String>,
    /// Bound of the event channel handed to streaming callers
    pub stream_buffer: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            thread_id: None,
            stream_mode: StreamMode::default(),
            node_timeout: Duration::from_millis(120_000),
            retry: RetryPolicy::default(),
            ttl: chrono::Duration::hours(24),
            parent_workflow_id: None,
            stream_buffer: 256,
        }
    }
}

impl ExecutionConfig {
    /// Override the checkpoint thread id
    pub fn with_thread_id(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }

    /// Override the stream mode
    pub fn with_stream_mode(mut self, mode: StreamMode) -> Self {
        self.stream_mode = mode;
        self
    }

    /// Override the per-node deadline
    pub fn with_node_timeout(mut self, timeout: Duration) -> Self {
        self.node_timeout = timeout;
        self
    }

    /// Override the retry policy
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Override the workflow TTL
    pub fn with_ttl(mut self, ttl: chrono::Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Record an audit-chain parent on the created workflow
    pub fn with_parent(mut self, parent_workflow_id: impl Into<String>) -> Self {
        self.parent_workflow_id = Some(parent_workflow_id.into());
        self
    }
}

/// Outcome of `invoke` / `resume`
///
/// `status` distinguishes a run that completed from one that paused on an
/// approval gate (`waiting_approval`, with `interrupt` populated) or was
/// cancelled.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    /// Workflow that ran
    pub workflow_id: String,
    /// Status at return
    pub status: WorkflowStatus,
    /// Reduced state at the last persisted checkpoint
    pub state: Value,
    /// Step of the last persisted checkpoint
    pub step: u64,
    /// Populated when the run suspended on an approval gate
    pub interrupt: Option<InterruptRequest>,
}

/// A streaming run: ordered events, a cancel handle, and the join handle of
/// the driving task
pub struct GraphStream {
    /// Ordered event sequence; finite, `Done` last
    pub events: ReceiverStream<GraphEvent>,
    /// Cancels the underlying run cooperatively
    pub cancel: CancelHandle,
    /// Resolves to the run's [`ExecutionResult`]
    pub handle: JoinHandle<Result<ExecutionResult>>,
}

enum RunKind {
    Start { input: Value },
    Resume { injection: Option<Value> },
}

enum NodeRunFailure {
    Cancelled,
    Exhausted(NodeError),
}

/// Executable graph bound to a checkpoint saver
#[derive(Clone)]
pub struct CompiledGraph {
    spec: Arc<GraphSpec>,
    saver: Arc<dyn CheckpointSaver>,
}

impl CompiledGraph {
    /// Bind a compiled spec to a persistence backend
    pub fn new(spec: GraphSpec, saver: Arc<dyn CheckpointSaver>) -> Self {
        Self { spec: Arc::new(spec), saver }
    }

    /// Graph name
    pub fn name(&self) -> &str {
        self.spec.name()
    }

    /// Run to completion (or approval pause); no streaming
    pub async fn invoke(
        &self,
        task_id: &str,
        input: Value,
        config: ExecutionConfig,
    ) -> Result<ExecutionResult> {
        self.run(
            task_id,
            RunKind::Start { input },
            config,
            None,
            CancellationSignal::never(),
        )
        .await
    }

    /// Continue from the latest checkpoint, optionally merging a state delta
    /// (e.g. an approval grant) before the suspended node re-runs
    pub async fn resume_with(
        &self,
        task_id: &str,
        injection: Option<Value>,
        config: ExecutionConfig,
    ) -> Result<ExecutionResult> {
        self.run(
            task_id,
            RunKind::Resume { injection },
            config,
            None,
            CancellationSignal::never(),
        )
        .await
    }

    /// Continue from the latest checkpoint
    pub async fn resume(&self, task_id: &str, config: ExecutionConfig) -> Result<ExecutionResult> {
        self.resume_with(task_id, None, config).await
    }

    /// Run while streaming state-level events (per the config's stream mode)
    pub fn stream(&self, task_id: &str, input: Value, config: ExecutionConfig) -> GraphStream {
        self.spawn_stream(task_id, RunKind::Start { input }, config, false)
    }

    /// Run while streaming every fine-grained event
    pub fn stream_events(
        &self,
        task_id: &str,
        input: Value,
        config: ExecutionConfig,
    ) -> GraphStream {
        self.spawn_stream(task_id, RunKind::Start { input }, config, true)
    }

    /// Resume while streaming every fine-grained event
    pub fn stream_resume(
        &self,
        task_id: &str,
        injection: Option<Value>,
        config: ExecutionConfig,
    ) -> GraphStream {
        self.spawn_stream(task_id, RunKind::Resume { injection }, config, true)
    }

    fn spawn_stream(
        &self,
        task_id: &str,
        kind: RunKind,
        config: ExecutionConfig,
        fine_grained: bool,
    ) -> GraphStream {
        let (raw_tx, mut raw_rx) = mpsc::channel::<GraphEvent>(config.stream_buffer);
        let (out_tx, out_rx) = mpsc::channel::<GraphEvent>(config.stream_buffer);
        let (cancel, signal) = cancellation_pair();

        let mode = config.stream_mode;
        // Forwards everything in fine-grained mode, otherwise only the
        // events the configured stream mode exposes.
        tokio::spawn(async move {
            while let Some(event) = raw_rx.recv().await {
                if fine_grained || event.visible_in(mode) {
                    if out_tx.send(event).await.is_err() {
                        break;
                    }
                }
            }
        });

        let engine = self.clone();
        let task_id = task_id.to_string();
        let handle = tokio::spawn(async move {
            engine.run(&task_id, kind, config, Some(raw_tx), signal).await
        });

        GraphStream {
            events: ReceiverStream::new(out_rx),
            cancel,
            handle,
        }
    }

    async fn run(
        &self,
        task_id: &str,
        kind: RunKind,
        config: ExecutionConfig,
        events: Option<mpsc::Sender<GraphEvent>>,
        cancel: CancellationSignal,
    ) -> Result<ExecutionResult> {
        let workflow_id = config
            .thread_id
            .clone()
            .unwrap_or_else(|| task_id.to_string());

        let (mut state, mut node, mut step) = self.acquire(&workflow_id, kind, &config).await?;
        tracing::info!(%workflow_id, graph = %self.spec.name(), %node, step, "workflow run started");

        loop {
            if cancel.is_cancelled() {
                return self.finish_cancelled(&workflow_id, &node, state, step, &events).await;
            }
            if node == END {
                return self.finish_completed(&workflow_id, state, step, &events).await;
            }

            self.send(&events, GraphEvent::NodeStart {
                workflow_id: workflow_id.clone(),
                node: node.clone(),
                step: step + 1,
            })
            .await;

            let output = match self
                .run_node_with_retry(&workflow_id, &node, &state, &config, &events, &cancel)
                .await
            {
                Ok(output) => output,
                Err(NodeRunFailure::Cancelled) => {
                    return self.finish_cancelled(&workflow_id, &node, state, step, &events).await;
                }
                Err(NodeRunFailure::Exhausted(err)) => {
                    step += 1;
                    let error_record = json!({
                        "node": node,
                        "error": err.to_string(),
                        "at": Utc::now().to_rfc3339(),
                    });
                    self.spec
                        .schema()
                        .apply(&mut state, &json!({ "last_error": error_record }))
                        .map_err(|e| {
                            GraphError::Engine(format!("failed to record node error: {e}"))
                        })?;

                    match self.spec.recovery.get(&node).cloned() {
                        Some(recovery) => {
                            tracing::warn!(
                                %workflow_id, %node, recovery,
                                "node failed, taking recovery edge: {err}"
                            );
                            self.persist(
                                &workflow_id,
                                step,
                                &node,
                                WorkflowStatus::Running,
                                &state,
                                |row| {
                                    row.status = WorkflowStatus::Running;
                                    row.current_node = recovery.clone();
                                    row.latest_step = step;
                                },
                            )
                            .await?;
                            self.send(&events, GraphEvent::Error {
                                workflow_id: workflow_id.clone(),
                                message: err.to_string(),
                            })
                            .await;
                            node = recovery;
                            continue;
                        }
                        None => {
                            return self
                                .finish_failed(&workflow_id, &node, err, state, step, &events)
                                .await;
                        }
                    }
                }
            };

            self.spec
                .schema()
                .apply(&mut state, &output.delta)
                .map_err(|e| GraphError::Engine(format!("reducer failure in '{node}': {e}")))?;
            step += 1;

            if let NodeCommand::Interrupt(request) = output.command {
                return self
                    .finish_interrupted(&workflow_id, &node, request, state, step, &events)
                    .await;
            }

            let next = self.spec.next_node(&node, &state)?;

            self.persist(&workflow_id, step, &node, WorkflowStatus::Running, &state, |row| {
                row.status = WorkflowStatus::Running;
                row.current_node = next.clone();
                row.latest_step = step;
            })
            .await?;

            self.send(&events, GraphEvent::NodeEnd {
                workflow_id: workflow_id.clone(),
                node: node.clone(),
                step,
            })
            .await;
            let update = match config.stream_mode {
                StreamMode::Updates => output.delta.clone(),
                StreamMode::Values | StreamMode::Debug => state.clone(),
            };
            self.send(&events, GraphEvent::StateUpdate {
                workflow_id: workflow_id.clone(),
                node: node.clone(),
                state: update,
            })
            .await;

            node = next;
        }
    }

    /// Acquire the workflow head row, transitioning it to `running`
    async fn acquire(
        &self,
        workflow_id: &str,
        kind: RunKind,
        config: &ExecutionConfig,
    ) -> Result<(Value, String, u64)> {
        match kind {
            RunKind::Start { input } => match self.saver.get_workflow(workflow_id).await? {
                None => {
                    let mut row = WorkflowRow::new(
                        workflow_id,
                        self.spec.name(),
                        self.spec.entry(),
                        Utc::now() + config.ttl,
                    );
                    row.parent_workflow_id = config.parent_workflow_id.clone();
                    row.status = WorkflowStatus::Running;
                    match self.saver.put_workflow(&row, None).await {
                        Ok(_) => {}
                        Err(StoreError::VersionConflict { .. }) => {
                            return Err(GraphError::Concurrency {
                                workflow_id: workflow_id.to_string(),
                                reason: "another caller created this workflow concurrently".into(),
                            });
                        }
                        Err(err) => return Err(err.into()),
                    }
                    self.saver.index_ttl(workflow_id, row.expires_at).await?;

                    let mut state = json!({});
                    self.spec
                        .schema()
                        .apply(&mut state, &input)
                        .map_err(|e| GraphError::Engine(format!("invalid input: {e}")))?;
                    Ok((state, self.spec.entry().to_string(), 0))
                }
                Some((row, version)) => match row.status {
                    WorkflowStatus::Running => Err(GraphError::Concurrency {
                        workflow_id: workflow_id.to_string(),
                        reason: "workflow is already running".into(),
                    }),
                    WorkflowStatus::WaitingApproval => Err(GraphError::InvalidState {
                        workflow_id: workflow_id.to_string(),
                        status: "waiting_approval".into(),
                        operation: "invoked".into(),
                    }),
                    WorkflowStatus::Created => {
                        let node = row.current_node.clone();
                        let latest_step = row.latest_step;
                        self.transition_to_running(row, version).await?;
                        match self.saver.latest(workflow_id).await? {
                            Some(cp) => Ok((cp.state, node, latest_step)),
                            None => {
                                let mut state = json!({});
                                self.spec
                                    .schema()
                                    .apply(&mut state, &input)
                                    .map_err(|e| {
                                        GraphError::Engine(format!("invalid input: {e}"))
                                    })?;
                                Ok((state, self.spec.entry().to_string(), 0))
                            }
                        }
                    }
                    status => Err(GraphError::InvalidState {
                        workflow_id: workflow_id.to_string(),
                        status: status_name(status),
                        operation: "invoked".into(),
                    }),
                },
            },
            RunKind::Resume { injection } => {
                let (row, version) = self
                    .saver
                    .get_workflow(workflow_id)
                    .await?
                    .ok_or_else(|| GraphError::NotFound {
                        workflow_id: workflow_id.to_string(),
                    })?;
                match row.status {
                    WorkflowStatus::WaitingApproval | WorkflowStatus::Created => {}
                    WorkflowStatus::Running => {
                        return Err(GraphError::Concurrency {
                            workflow_id: workflow_id.to_string(),
                            reason: "workflow is already running".into(),
                        });
                    }
                    status => {
                        return Err(GraphError::InvalidState {
                            workflow_id: workflow_id.to_string(),
                            status: status_name(status),
                            operation: "resumed".into(),
                        });
                    }
                }
                let checkpoint =
                    self.saver.latest(workflow_id).await?.ok_or_else(|| {
                        GraphError::Engine(format!(
                            "workflow '{workflow_id}' has no checkpoint to resume from"
                        ))
                    })?;
                let node = row.current_node.clone();
                let step = row.latest_step;
                self.transition_to_running(row, version).await?;

                let mut state = checkpoint.state;
                if let Some(delta) = injection {
                    self.spec
                        .schema()
                        .apply(&mut state, &delta)
                        .map_err(|e| GraphError::Engine(format!("invalid resume delta: {e}")))?;
                }
                Ok((state, node, step))
            }
        }
    }

    async fn transition_to_running(&self, mut row: WorkflowRow, version: u64) -> Result<()> {
        let workflow_id = row.workflow_id.clone();
        row.status = WorkflowStatus::Running;
        row.updated_at = Utc::now();
        self.saver
            .put_workflow(&row, Some(version))
            .await
            .map_err(|err| match err {
                StoreError::VersionConflict { .. } => GraphError::Concurrency {
                    workflow_id,
                    reason: "lost the acquisition race to another caller".into(),
                },
                other => other.into(),
            })?;
        Ok(())
    }

    async fn run_node_with_retry(
        &self,
        workflow_id: &str,
        node: &str,
        state: &Value,
        config: &ExecutionConfig,
        events: &Option<mpsc::Sender<GraphEvent>>,
        cancel: &CancellationSignal,
    ) -> std::result::Result<NodeOutput, NodeRunFailure> {
        let node_impl = self
            .spec
            .nodes
            .get(node)
            .ok_or_else(|| {
                NodeRunFailure::Exhausted(NodeError::internal(format!(
                    "node '{node}' missing from compiled graph"
                )))
            })?
            .clone();

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let ctx = NodeContext::new(workflow_id, node, attempt, cancel.clone(), events.clone());

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(NodeRunFailure::Cancelled),
                res = tokio::time::timeout(config.node_timeout, node_impl.run(state, &ctx)) => {
                    match res {
                        Ok(inner) => inner,
                        Err(_) => Err(NodeError::Timeout {
                            elapsed_ms: config.node_timeout.as_millis() as u64,
                        }),
                    }
                }
            };

            match outcome {
                Ok(output) => return Ok(output),
                Err(err) if err.is_retryable() && config.retry.should_retry(attempt) => {
                    let delay = config.retry.delay_for(attempt);
                    tracing::warn!(
                        %workflow_id, node, attempt,
                        delay_ms = delay.as_millis() as u64,
                        "retryable node failure: {err}"
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(NodeRunFailure::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(err) => return Err(NodeRunFailure::Exhausted(err)),
            }
        }
    }

    async fn finish_completed(
        &self,
        workflow_id: &str,
        state: Value,
        step: u64,
        events: &Option<mpsc::Sender<GraphEvent>>,
    ) -> Result<ExecutionResult> {
        let step = step + 1;
        self.persist(workflow_id, step, END, WorkflowStatus::Completed, &state, |row| {
            row.status = WorkflowStatus::Completed;
            row.current_node = END.to_string();
            row.latest_step = step;
        })
        .await?;
        self.send(events, GraphEvent::Done {
            workflow_id: workflow_id.to_string(),
            status: WorkflowStatus::Completed,
        })
        .await;
        tracing::info!(%workflow_id, step, "workflow completed");
        Ok(ExecutionResult {
            workflow_id: workflow_id.to_string(),
            status: WorkflowStatus::Completed,
            state,
            step,
            interrupt: None,
        })
    }

    async fn finish_cancelled(
        &self,
        workflow_id: &str,
        node: &str,
        state: Value,
        step: u64,
        events: &Option<mpsc::Sender<GraphEvent>>,
    ) -> Result<ExecutionResult> {
        let step = step + 1;
        self.persist(workflow_id, step, node, WorkflowStatus::Cancelled, &state, |row| {
            row.status = WorkflowStatus::Cancelled;
            row.latest_step = step;
        })
        .await?;
        self.send(events, GraphEvent::Done {
            workflow_id: workflow_id.to_string(),
            status: WorkflowStatus::Cancelled,
        })
        .await;
        tracing::info!(%workflow_id, node, "workflow cancelled");
        Ok(ExecutionResult {
            workflow_id: workflow_id.to_string(),
            status: WorkflowStatus::Cancelled,
            state,
            step,
            interrupt: None,
        })
    }

    async fn finish_interrupted(
        &self,
        workflow_id: &str,
        node: &str,
        request: InterruptRequest,
        state: Value,
        step: u64,
        events: &Option<mpsc::Sender<GraphEvent>>,
    ) -> Result<ExecutionResult> {
        self.persist(workflow_id, step, node, WorkflowStatus::WaitingApproval, &state, |row| {
            row.status = WorkflowStatus::WaitingApproval;
            row.latest_step = step;
        })
        .await?;
        self.send(events, GraphEvent::Interrupted {
            workflow_id: workflow_id.to_string(),
            node: node.to_string(),
            request: request.clone(),
        })
        .await;
        self.send(events, GraphEvent::Done {
            workflow_id: workflow_id.to_string(),
            status: WorkflowStatus::WaitingApproval,
        })
        .await;
        tracing::info!(
            %workflow_id, node, action_type = %request.action_type,
            "workflow suspended for approval"
        );
        Ok(ExecutionResult {
            workflow_id: workflow_id.to_string(),
            status: WorkflowStatus::WaitingApproval,
            state,
            step,
            interrupt: Some(request),
        })
    }

    async fn finish_failed(
        &self,
        workflow_id: &str,
        node: &str,
        err: NodeError,
        state: Value,
        step: u64,
        events: &Option<mpsc::Sender<GraphEvent>>,
    ) -> Result<ExecutionResult> {
        tracing::error!(%workflow_id, node, "node failed fatally: {err}");
        self.persist(workflow_id, step, node, WorkflowStatus::Failed, &state, |row| {
            row.status = WorkflowStatus::Failed;
            row.latest_step = step;
        })
        .await?;
        self.send(events, GraphEvent::Error {
            workflow_id: workflow_id.to_string(),
            message: err.to_string(),
        })
        .await;
        self.send(events, GraphEvent::Done {
            workflow_id: workflow_id.to_string(),
            status: WorkflowStatus::Failed,
        })
        .await;
        Err(GraphError::NodeFailed { node: node.to_string(), source: err })
    }

    /// Write the checkpoint for `step`, then CAS the head row
    ///
    /// The row mutation retries on version conflicts (the lifecycle manager
    /// CASes `expires_at` on the same row) and re-applies onto the freshest
    /// copy, so concurrent TTL refreshes are never lost.
    async fn persist<F>(
        &self,
        workflow_id: &str,
        step: u64,
        node: &str,
        status: WorkflowStatus,
        state: &Value,
        mut mutate: F,
    ) -> Result<()>
    where
        F: FnMut(&mut WorkflowRow) + Send,
    {
        let checkpoint = Checkpoint::new(
            workflow_id,
            step,
            (step > 1).then(|| step - 1),
            node,
            status,
            state.clone(),
        );
        self.saver.save(&checkpoint).await?;

        for attempt in 1..=CAS_MAX_ATTEMPTS {
            let (mut row, version) = self
                .saver
                .get_workflow(workflow_id)
                .await?
                .ok_or_else(|| {
                    GraphError::Engine(format!("workflow row '{workflow_id}' vanished mid-run"))
                })?;
            mutate(&mut row);
            row.updated_at = Utc::now();
            match self.saver.put_workflow(&row, Some(version)).await {
                Ok(_) => return Ok(()),
                Err(StoreError::VersionConflict { .. }) if attempt < CAS_MAX_ATTEMPTS => continue,
                Err(StoreError::VersionConflict { .. }) => {
                    return Err(GraphError::Concurrency {
                        workflow_id: workflow_id.to_string(),
                        reason: "head row contention exceeded the retry budget".into(),
                    });
                }
                Err(err) => return Err(err.into()),
            }
        }
        unreachable!("CAS loop returns within the attempt budget")
    }

    async fn send(&self, events: &Option<mpsc::Sender<GraphEvent>>, event: GraphEvent) {
        if let Some(tx) = events {
            let _ = tx.send(event).await;
        }
    }
}

fn status_name(status: WorkflowStatus) -> String {
    // serde renders the canonical snake_case name
    serde_json::to_value(status)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| format!("{status:?}"))
}
