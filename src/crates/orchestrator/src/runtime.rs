//! Runtime wiring and lifecycle
//!
//! All global state is reified as a [`Runtime`] value built at startup and
//! handed to the components explicitly: store → saver → bus → registry →
//! catalogue → gate → lifecycle → workflow service → gateway. Background
//! sweepers start with [`Runtime::start_background`]; shutdown stops intake,
//! drains in-flight workflows up to the configured timeout, cancels the
//! remainder, and lets cancelled runs flush their final checkpoints.

use std::sync::Arc;
use std::time::Duration;

use crate::approval::ApprovalGate;
use crate::catalogue::ToolCatalogue;
use crate::config::{Environment, OrchestratorConfig};
use crate::error::Result;
use crate::events::EventBus;
use crate::gateway::ChatGateway;
use crate::lifecycle::LifecycleManager;
use crate::metrics::Metrics;
use crate::planner::{HeuristicPlanner, Planner};
use crate::registry::AgentRegistry;
use crate::specialist::{HttpSpecialistClient, ScriptedSpecialist, SpecialistClient};
use crate::workflows::WorkflowService;
use taskgraph_checkpoint::{CheckpointSaver, KvCheckpointSaver, KvStore, MemoryKvStore};

/// The assembled control plane
pub struct Runtime {
    pub config: OrchestratorConfig,
    pub store: Arc<dyn KvStore>,
    pub saver: Arc<dyn CheckpointSaver>,
    pub bus: Arc<EventBus>,
    pub metrics: Arc<Metrics>,
    pub registry: Arc<AgentRegistry>,
    pub catalogue: Arc<ToolCatalogue>,
    pub gate: Arc<ApprovalGate>,
    pub lifecycle: Arc<LifecycleManager>,
    pub service: Arc<WorkflowService>,
    pub gateway: Arc<ChatGateway>,
    sweepers: parking_lot::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Runtime {
    /// Assemble the runtime with the in-memory reference backend
    pub async fn init(config: OrchestratorConfig) -> Result<Arc<Self>> {
        let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        Self::init_with_store(config, store).await
    }

    /// Assemble the runtime over a caller-provided backend
    pub async fn init_with_store(
        config: OrchestratorConfig,
        store: Arc<dyn KvStore>,
    ) -> Result<Arc<Self>> {
        let saver: Arc<dyn CheckpointSaver> =
            Arc::new(KvCheckpointSaver::new(store.clone()));
        let bus = Arc::new(EventBus::new());
        let metrics = Arc::new(Metrics::new());

        let registry = Arc::new(AgentRegistry::new(
            store.clone(),
            chrono::Duration::seconds(config.registry.heartbeat_ttl_secs as i64),
        ));
        registry.load().await?;

        let catalogue = Arc::new(match &config.disclosure.manifest_path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|e| {
                    crate::error::OrchestratorError::Validation(format!(
                        "cannot read tool manifest '{path}': {e}"
                    ))
                })?;
                ToolCatalogue::from_yaml(&raw)?
            }
            None => ToolCatalogue::builtin(),
        });
        tracing::info!(tools = catalogue.len(), "tool catalogue loaded");

        let gate = Arc::new(ApprovalGate::new(
            store.clone(),
            bus.clone(),
            config.approval_expiry(),
        ));

        let lifecycle = Arc::new(LifecycleManager::new(
            saver.clone(),
            bus.clone(),
            config.workflow_ttl(),
            chrono::Duration::hours(config.workflow.approval_grace_hours),
            config.chain.max_depth,
        ));
        lifecycle.attach();

        // Dev tier runs against the deterministic in-process specialist;
        // staging/prod dispatch over HTTP through the registry.
        let specialist: Arc<dyn SpecialistClient> = if config.environment == Environment::Dev {
            Arc::new(ScriptedSpecialist)
        } else {
            Arc::new(HttpSpecialistClient::new(registry.clone()))
        };
        let planner: Arc<dyn Planner> = Arc::new(HeuristicPlanner);

        let service = WorkflowService::new(
            config.clone(),
            store.clone(),
            saver.clone(),
            bus.clone(),
            gate.clone(),
            planner,
            specialist,
            catalogue.clone(),
            metrics.clone(),
        )?;

        let gateway = Arc::new(ChatGateway::new(
            service.clone(),
            metrics.clone(),
            config.gateway.stream_buffer,
        ));

        tracing::info!(env = ?config.environment, "runtime initialized");
        Ok(Arc::new(Self {
            config,
            store,
            saver,
            bus,
            metrics,
            registry,
            catalogue,
            gate,
            lifecycle,
            service,
            gateway,
            sweepers: parking_lot::Mutex::new(Vec::new()),
        }))
    }

    /// Start the approval, lifecycle, and registry sweepers
    pub fn start_background(self: &Arc<Self>) {
        let mut sweepers = self.sweepers.lock();
        sweepers.push(
            self.gate
                .spawn_sweeper(Duration::from_secs(self.config.approval.sweep_interval_secs)),
        );
        sweepers.push(
            self.lifecycle
                .spawn_sweeper(Duration::from_secs(self.config.workflow.sweep_interval_secs)),
        );
        sweepers.push(
            self.registry
                .spawn_sweeper(Duration::from_secs(self.config.registry.sweep_interval_secs)),
        );
        tracing::info!("background sweepers started");
    }

    /// Graceful shutdown: stop intake, drain, cancel, stop sweepers
    pub async fn shutdown(&self) {
        tracing::info!("shutting down: draining in-flight workflows");
        self.service
            .shutdown(Duration::from_secs(self.config.server.drain_timeout_secs))
            .await;
        for sweeper in self.sweepers.lock().drain(..) {
            sweeper.abort();
        }
        tracing::info!("shutdown complete");
    }
}
