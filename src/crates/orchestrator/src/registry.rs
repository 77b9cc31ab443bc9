//! Agent registry: heartbeats, health, capability lookup
//!
//! Specialist endpoints register themselves and heartbeat every few seconds.
//! The write path is a transactional CAS on the agent row; reads come from a
//! lock-free in-memory snapshot warmed from the store at startup. A missed
//! heartbeat beyond the TTL moves the agent to `offline` via the staleness
//! sweeper.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde_json::json;

use taskgraph_checkpoint::{update_with_retry, KvStore, CAS_MAX_ATTEMPTS};

use crate::error::{OrchestratorError, Result};
use crate::models::{agent_key, AgentRecord, AgentStatus, AGENT_PREFIX};

/// Registry of callable specialist agents
pub struct AgentRegistry {
    store: Arc<dyn KvStore>,
    cache: DashMap<String, AgentRecord>,
    heartbeat_ttl: chrono::Duration,
}

impl AgentRegistry {
    /// Create a registry over the shared KV backend
    pub fn new(store: Arc<dyn KvStore>, heartbeat_ttl: chrono::Duration) -> Self {
        Self {
            store,
            cache: DashMap::new(),
            heartbeat_ttl,
        }
    }

    /// Warm the in-memory snapshot from persisted rows
    pub async fn load(&self) -> Result<usize> {
        let rows = self.store.scan_prefix(AGENT_PREFIX).await?;
        let mut loaded = 0;
        for (_, record) in rows {
            let agent: AgentRecord = record.decode()?;
            self.cache.insert(agent.agent_id.clone(), agent);
            loaded += 1;
        }
        tracing::info!(agents = loaded, "agent registry loaded");
        Ok(loaded)
    }

    /// Upsert an agent registration
    pub async fn register(&self, mut agent: AgentRecord) -> Result<()> {
        agent.last_heartbeat = Utc::now();
        let key = agent_key(&agent.agent_id);
        let blob = serde_json::to_value(&agent)?;
        update_with_retry(self.store.as_ref(), &key, CAS_MAX_ATTEMPTS, |_current| {
            Ok(blob.clone())
        })
        .await?;
        tracing::info!(agent_id = %agent.agent_id, tags = ?agent.capability_tags, "agent registered");
        self.cache.insert(agent.agent_id.clone(), agent);
        Ok(())
    }

    /// Record a heartbeat, reviving offline agents
    pub async fn heartbeat(&self, agent_id: &str, status: AgentStatus) -> Result<AgentRecord> {
        let key = agent_key(agent_id);
        let now = Utc::now();
        update_with_retry(self.store.as_ref(), &key, CAS_MAX_ATTEMPTS, |current| {
            let record = current.ok_or_else(|| {
                taskgraph_checkpoint::StoreError::NotFound(key.clone())
            })?;
            let mut agent: AgentRecord = record.decode()?;
            agent.last_heartbeat = now;
            agent.status = status;
            Ok(serde_json::to_value(&agent)?)
        })
        .await
        .map_err(|err| match err {
            taskgraph_checkpoint::StoreError::NotFound(_) => OrchestratorError::NotFound {
                kind: "agent",
                id: agent_id.to_string(),
            },
            other => other.into(),
        })?;

        let record = self.store.get(&key).await?.ok_or_else(|| OrchestratorError::NotFound {
            kind: "agent",
            id: agent_id.to_string(),
        })?;
        let agent: AgentRecord = record.decode()?;
        self.cache.insert(agent_id.to_string(), agent.clone());
        Ok(agent)
    }

    /// Look up one agent by id
    pub fn get(&self, agent_id: &str) -> Option<AgentRecord> {
        self.cache.get(agent_id).map(|a| a.clone())
    }

    /// Snapshot of all agents
    pub fn list(&self) -> Vec<AgentRecord> {
        let mut agents: Vec<AgentRecord> = self.cache.iter().map(|a| a.clone()).collect();
        agents.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        agents
    }

    /// Agents carrying a capability tag
    pub fn find_by_capability(&self, tag: &str) -> Vec<AgentRecord> {
        let mut agents: Vec<AgentRecord> = self
            .cache
            .iter()
            .filter(|a| a.capability_tags.iter().any(|t| t == tag))
            .map(|a| a.clone())
            .collect();
        agents.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        agents
    }

    /// The healthiest agent for a capability, if any
    pub fn pick_for(&self, tag: &str) -> Option<AgentRecord> {
        let now = Utc::now();
        self.find_by_capability(tag)
            .into_iter()
            .find(|a| a.is_healthy(now, self.heartbeat_ttl))
    }

    /// Move agents with stale heartbeats to `offline`
    pub async fn sweep_stale(&self) -> Result<usize> {
        let now = Utc::now();
        let stale: Vec<String> = self
            .cache
            .iter()
            .filter(|a| a.status != AgentStatus::Offline && now - a.last_heartbeat > self.heartbeat_ttl)
            .map(|a| a.agent_id.clone())
            .collect();

        for agent_id in &stale {
            let key = agent_key(agent_id);
            let result = update_with_retry(self.store.as_ref(), &key, CAS_MAX_ATTEMPTS, |current| {
                let record = current.ok_or_else(|| {
                    taskgraph_checkpoint::StoreError::NotFound(key.clone())
                })?;
                let mut agent: AgentRecord = record.decode()?;
                agent.status = AgentStatus::Offline;
                Ok(serde_json::to_value(&agent)?)
            })
            .await;
            match result {
                Ok(_) => {
                    if let Some(mut agent) = self.cache.get_mut(agent_id) {
                        agent.status = AgentStatus::Offline;
                    }
                    tracing::warn!(%agent_id, "agent marked offline after missed heartbeat");
                }
                Err(err) => {
                    tracing::warn!(%agent_id, "failed to mark agent offline: {err}");
                }
            }
        }
        Ok(stale.len())
    }

    /// Spawn the periodic staleness sweeper
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(err) = registry.sweep_stale().await {
                    tracing::error!("agent staleness sweep failed: {err}");
                }
            }
        })
    }

    /// Serialize the registry for the `/agents` endpoint
    pub fn snapshot_json(&self) -> serde_json::Value {
        json!({ "agents": self.list() })
    }
}
