//! Layered configuration: defaults → TOML file → environment overrides
//!
//! Defaults are environment-tiered: the `dev` tier shortens the workflow TTL
//! to 3 h, `staging` to 12 h, `prod` keeps 24 h. Secrets and collaborator
//! endpoints always come from environment variables; nothing here mandates a
//! vendor.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::catalogue::DisclosureStrategy;
use crate::error::{OrchestratorError, Result};

/// Deployment environment tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Dev,
    Staging,
    Prod,
}

impl Environment {
    /// Workflow TTL default for this tier, in hours
    pub fn default_ttl_hours(&self) -> i64 {
        match self {
            Environment::Dev => 3,
            Environment::Staging => 12,
            Environment::Prod => 24,
        }
    }
}

impl FromStr for Environment {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "dev" | "development" => Ok(Environment::Dev),
            "staging" => Ok(Environment::Staging),
            "prod" | "production" => Ok(Environment::Prod),
            other => Err(OrchestratorError::Validation(format!(
                "unknown environment '{other}'"
            ))),
        }
    }
}

/// Workflow TTL settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Hours a workflow lives without event-driven refresh
    pub ttl_hours: i64,
    /// Grace window added for `waiting_approval` workflows, in hours
    pub approval_grace_hours: i64,
    /// Lifecycle sweep cadence, in seconds
    pub sweep_interval_secs: u64,
}

/// Engine execution settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Per-node deadline, in milliseconds
    pub node_timeout_ms: u64,
    /// Node retry budget (attempts, including the first)
    pub max_retries: u32,
}

/// Approval gate settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalConfig {
    /// Hours before a pending request expires
    pub expiry_hours: i64,
    /// Expiry sweep cadence, in seconds
    pub sweep_interval_secs: u64,
}

/// Parent-chain settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    /// Maximum chain length before `ChainError`
    pub max_depth: usize,
}

/// Tool disclosure settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisclosureConfig {
    /// Strategy when the caller does not pick one
    pub default_strategy: DisclosureStrategy,
    /// Cap on disclosed tools
    pub max_tools: usize,
    /// Optional path of the tool manifest (YAML)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manifest_path: Option<String>,
}

/// Streaming gateway settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Bounded chunk buffer per stream
    pub stream_buffer: usize,
}

/// Planner admission settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerConfig {
    /// Concurrent decompositions before `/orchestrate` sheds load
    pub queue_capacity: usize,
}

/// Agent registry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Seconds without a heartbeat before an agent goes `offline`
    pub heartbeat_ttl_secs: u64,
    /// Staleness sweep cadence, in seconds
    pub sweep_interval_secs: u64,
}

/// HTTP server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Seconds to drain in-flight workflows on shutdown before cancelling
    pub drain_timeout_secs: u64,
}

/// Complete orchestrator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    pub environment: Environment,
    pub workflow: WorkflowConfig,
    pub engine: EngineConfig,
    pub approval: ApprovalConfig,
    pub chain: ChainConfig,
    pub disclosure: DisclosureConfig,
    pub gateway: GatewayConfig,
    pub planner: PlannerConfig,
    pub registry: RegistryConfig,
    pub server: ServerConfig,
}

impl OrchestratorConfig {
    /// Tiered defaults for `environment`
    pub fn defaults(environment: Environment) -> Self {
        Self {
            environment,
            workflow: WorkflowConfig {
                ttl_hours: environment.default_ttl_hours(),
                approval_grace_hours: 6,
                sweep_interval_secs: 3_600,
            },
            engine: EngineConfig {
                node_timeout_ms: 120_000,
                max_retries: 3,
            },
            approval: ApprovalConfig {
                expiry_hours: 24,
                sweep_interval_secs: 300,
            },
            chain: ChainConfig { max_depth: 20 },
            disclosure: DisclosureConfig {
                default_strategy: DisclosureStrategy::Minimal,
                max_tools: 30,
                manifest_path: None,
            },
            gateway: GatewayConfig { stream_buffer: 256 },
            planner: PlannerConfig { queue_capacity: 64 },
            registry: RegistryConfig {
                heartbeat_ttl_secs: 60,
                sweep_interval_secs: 30,
            },
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
                drain_timeout_secs: 30,
            },
        }
    }

    /// Load from an optional TOML file, then apply environment overrides
    ///
    /// The tier comes from `ORCHESTRATOR_ENV` (default `dev`), the file path
    /// from the argument or `ORCHESTRATOR_CONFIG`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let environment = std::env::var("ORCHESTRATOR_ENV")
            .ok()
            .map(|v| v.parse())
            .transpose()?
            .unwrap_or(Environment::Dev);

        let mut config = Self::defaults(environment);

        let file = path
            .map(|p| p.to_path_buf())
            .or_else(|| std::env::var("ORCHESTRATOR_CONFIG").ok().map(Into::into));
        if let Some(file) = file {
            let raw = std::fs::read_to_string(&file).map_err(|e| {
                OrchestratorError::Validation(format!(
                    "cannot read config file {}: {e}",
                    file.display()
                ))
            })?;
            config = toml::from_str::<PartialConfig>(&raw)
                .map_err(|e| OrchestratorError::Validation(format!("invalid config file: {e}")))?
                .merge_into(config);
        }

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        override_parse("ORCHESTRATOR_WORKFLOW_TTL_HOURS", &mut self.workflow.ttl_hours);
        override_parse("ORCHESTRATOR_NODE_TIMEOUT_MS", &mut self.engine.node_timeout_ms);
        override_parse("ORCHESTRATOR_MAX_RETRIES", &mut self.engine.max_retries);
        override_parse("ORCHESTRATOR_APPROVAL_EXPIRY_HOURS", &mut self.approval.expiry_hours);
        override_parse("ORCHESTRATOR_CHAIN_MAX_DEPTH", &mut self.chain.max_depth);
        override_parse("ORCHESTRATOR_DISCLOSURE_MAX_TOOLS", &mut self.disclosure.max_tools);
        override_parse("ORCHESTRATOR_STREAM_BUFFER", &mut self.gateway.stream_buffer);
        override_parse("ORCHESTRATOR_PLANNER_QUEUE", &mut self.planner.queue_capacity);
        override_parse("ORCHESTRATOR_PORT", &mut self.server.port);
        if let Ok(host) = std::env::var("ORCHESTRATOR_HOST") {
            self.server.host = host;
        }
        if let Ok(strategy) = std::env::var("ORCHESTRATOR_DISCLOSURE_STRATEGY") {
            if let Ok(parsed) = strategy.parse() {
                self.disclosure.default_strategy = parsed;
            }
        }
        if let Ok(path) = std::env::var("ORCHESTRATOR_TOOL_MANIFEST") {
            self.disclosure.manifest_path = Some(path);
        }
    }

    fn validate(&self) -> Result<()> {
        if self.workflow.ttl_hours <= 0 {
            return Err(OrchestratorError::Validation(
                "workflow.ttl_hours must be positive".into(),
            ));
        }
        if self.engine.max_retries == 0 {
            return Err(OrchestratorError::Validation(
                "engine.max_retries must be at least 1".into(),
            ));
        }
        if self.chain.max_depth == 0 || self.chain.max_depth > 100 {
            return Err(OrchestratorError::Validation(
                "chain.max_depth must be in 1..=100".into(),
            ));
        }
        if self.gateway.stream_buffer == 0 {
            return Err(OrchestratorError::Validation(
                "gateway.stream_buffer must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Node timeout as a [`Duration`]
    pub fn node_timeout(&self) -> Duration {
        Duration::from_millis(self.engine.node_timeout_ms)
    }

    /// Workflow TTL as a chrono duration
    pub fn workflow_ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(self.workflow.ttl_hours)
    }

    /// Approval expiry window as a chrono duration
    pub fn approval_expiry(&self) -> chrono::Duration {
        chrono::Duration::hours(self.approval.expiry_hours)
    }
}

fn override_parse<T: FromStr>(var: &str, target: &mut T) {
    if let Ok(raw) = std::env::var(var) {
        match raw.parse() {
            Ok(value) => *target = value,
            Err(_) => tracing::warn!(var, raw, "ignoring unparseable environment override"),
        }
    }
}

/// TOML file shape: every section optional so files stay minimal
#[derive(Debug, Default, Deserialize)]
struct PartialConfig {
    environment: Option<Environment>,
    workflow: Option<WorkflowConfig>,
    engine: Option<EngineConfig>,
    approval: Option<ApprovalConfig>,
    chain: Option<ChainConfig>,
    disclosure: Option<DisclosureConfig>,
    gateway: Option<GatewayConfig>,
    planner: Option<PlannerConfig>,
    registry: Option<RegistryConfig>,
    server: Option<ServerConfig>,
}

impl PartialConfig {
    fn merge_into(self, mut base: OrchestratorConfig) -> OrchestratorConfig {
        if let Some(environment) = self.environment {
            base.environment = environment;
            base.workflow.ttl_hours = environment.default_ttl_hours();
        }
        if let Some(workflow) = self.workflow {
            base.workflow = workflow;
        }
        if let Some(engine) = self.engine {
            base.engine = engine;
        }
        if let Some(approval) = self.approval {
            base.approval = approval;
        }
        if let Some(chain) = self.chain {
            base.chain = chain;
        }
        if let Some(disclosure) = self.disclosure {
            base.disclosure = disclosure;
        }
        if let Some(gateway) = self.gateway {
            base.gateway = gateway;
        }
        if let Some(planner) = self.planner {
            base.planner = planner;
        }
        if let Some(registry) = self.registry {
            base.registry = registry;
        }
        if let Some(server) = self.server {
            base.server = server;
        }
        base
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tiered_ttl_defaults() {
        assert_eq!(OrchestratorConfig::defaults(Environment::Dev).workflow.ttl_hours, 3);
        assert_eq!(OrchestratorConfig::defaults(Environment::Staging).workflow.ttl_hours, 12);
        assert_eq!(OrchestratorConfig::defaults(Environment::Prod).workflow.ttl_hours, 24);
    }

    #[test]
    fn test_defaults_match_contract() {
        let config = OrchestratorConfig::defaults(Environment::Prod);
        assert_eq!(config.engine.node_timeout_ms, 120_000);
        assert_eq!(config.engine.max_retries, 3);
        assert_eq!(config.approval.expiry_hours, 24);
        assert_eq!(config.chain.max_depth, 20);
        assert_eq!(config.disclosure.max_tools, 30);
        assert_eq!(config.gateway.stream_buffer, 256);
        assert_eq!(config.registry.heartbeat_ttl_secs, 60);
    }

    #[test]
    fn test_partial_toml_merge() {
        let base = OrchestratorConfig::defaults(Environment::Dev);
        let partial: PartialConfig =
            toml::from_str("[engine]\nnode_timeout_ms = 5000\nmax_retries = 2\n").unwrap();
        let merged = partial.merge_into(base);
        assert_eq!(merged.engine.node_timeout_ms, 5_000);
        assert_eq!(merged.engine.max_retries, 2);
        // Untouched sections keep their defaults.
        assert_eq!(merged.workflow.ttl_hours, 3);
    }

    #[test]
    fn test_validation_rejects_zero_retry_budget() {
        let mut config = OrchestratorConfig::defaults(Environment::Dev);
        config.engine.max_retries = 0;
        assert!(config.validate().is_err());
    }
}
