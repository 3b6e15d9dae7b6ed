//! Proxy configuration, loaded from a TOML file.
//!
//! One file describes a single proxy instance: its identity and role, the
//! bus it attaches to, the agent groups whose topics it uses, and the full
//! agent registry (local and remote entries alike). The registry is read
//! once at startup; changing it requires a restart.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

// ── Top-level config ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Proxy identity, listen address, and request timing (`[proxy]`).
    pub proxy: ProxySettings,

    /// Bus backend and retry policy (`[bus]`).
    #[serde(default)]
    pub bus: BusSettings,

    /// Agent groups; each group owns a requests/responses/deadletter topic triple.
    #[serde(default)]
    pub groups: Vec<TopicGroupConfig>,

    /// Agent registry entries, local and remote.
    #[serde(default)]
    pub agents: Vec<AgentConfig>,
}

/// Static role of a proxy in the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyRole {
    /// Creates the bus topology once at startup.
    Coordinator,
    /// Attaches to topology the coordinator created.
    Follower,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxySettings {
    pub id: String,
    pub role: ProxyRole,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Base URL clients use to reach this proxy; rewritten into agent cards.
    /// Defaults to `http://{host}:{port}`.
    #[serde(default)]
    pub public_base_url: Option<String>,
    /// Deadline for a synchronous cross-proxy call.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Streams use an idle timer instead of a total timer, reset per chunk.
    #[serde(default = "default_stream_idle_timeout")]
    pub stream_idle_timeout_secs: u64,
    /// Capacity of the ordered chunk channel between registry and HTTP writer.
    #[serde(default = "default_stream_buffer")]
    pub stream_buffer: usize,
    /// Maximum out-of-order chunks held per stream before it is failed.
    #[serde(default = "default_reorder_window")]
    pub reorder_window: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusSettings {
    /// Bus backend. `memory` runs the in-process session-ordered bus.
    #[serde(default = "default_backend")]
    pub backend: String,
    /// Publish attempts before surfacing a failure; also the delivery cap
    /// before a message dead-letters.
    #[serde(default = "default_max_retry_count")]
    pub max_retry_count: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
}

/// Topic properties for one agent group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicGroupConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_max_size_mb")]
    pub max_size_mb: u64,
    #[serde(default = "default_message_ttl_secs")]
    pub message_ttl_secs: u64,
    #[serde(default = "default_dup_window_mins")]
    pub duplicate_detection_window_mins: u64,
    #[serde(default = "default_true")]
    pub enable_partitioning: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub id: String,
    pub group: String,
    /// Proxy that hosts this agent.
    pub proxy_id: String,
    /// `host:port` of the agent process; absent for agents hosted elsewhere.
    #[serde(default)]
    pub host_port: Option<String>,
    #[serde(default = "default_agent_card_endpoint")]
    pub agent_card_endpoint: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

fn default_host() -> String {
    "127.0.0.1".into()
}
fn default_port() -> u16 {
    8080
}
fn default_request_timeout() -> u64 {
    30
}
fn default_stream_idle_timeout() -> u64 {
    60
}
fn default_stream_buffer() -> usize {
    64
}
fn default_reorder_window() -> usize {
    256
}
fn default_backend() -> String {
    "memory".into()
}
fn default_max_retry_count() -> u32 {
    3
}
fn default_retry_base_delay_ms() -> u64 {
    200
}
fn default_retry_max_delay_ms() -> u64 {
    5000
}
fn default_max_size_mb() -> u64 {
    1024
}
fn default_message_ttl_secs() -> u64 {
    3600
}
fn default_dup_window_mins() -> u64 {
    10
}
fn default_true() -> bool {
    true
}
fn default_agent_card_endpoint() -> String {
    "/.well-known/agent.json".into()
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            max_retry_count: default_max_retry_count(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
        }
    }
}

impl Config {
    /// Load and validate a config file.
    pub async fn load(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Config = toml::from_str(raw).context("failed to parse config TOML")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.proxy.id.trim().is_empty() {
            bail!("proxy.id must not be empty");
        }
        if self.proxy.port == 0 {
            bail!("proxy.port must not be 0");
        }
        if self.proxy.request_timeout_secs == 0 {
            bail!("proxy.request_timeout_secs must be positive");
        }
        if self.proxy.stream_buffer == 0 {
            bail!("proxy.stream_buffer must be positive");
        }
        if self.proxy.reorder_window == 0 {
            bail!("proxy.reorder_window must be positive");
        }

        let group_names: HashSet<&str> = self.groups.iter().map(|g| g.name.as_str()).collect();
        if group_names.len() != self.groups.len() {
            bail!("duplicate group names in [[groups]]");
        }

        let mut agent_ids = HashSet::new();
        for agent in &self.agents {
            if agent.id.trim().is_empty() {
                bail!("agent id must not be empty");
            }
            if !agent_ids.insert(agent.id.as_str()) {
                bail!("duplicate agent id '{}'", agent.id);
            }
            if !group_names.contains(agent.group.as_str()) {
                bail!(
                    "agent '{}' references unknown group '{}'",
                    agent.id,
                    agent.group
                );
            }
            if agent.proxy_id == self.proxy.id && agent.host_port.is_none() {
                bail!(
                    "agent '{}' is hosted by this proxy but has no host_port",
                    agent.id
                );
            }
        }
        Ok(())
    }

    /// Base URL advertised in rewritten agent cards.
    pub fn public_base_url(&self) -> String {
        self.proxy
            .public_base_url
            .clone()
            .unwrap_or_else(|| format!("http://{}:{}", self.proxy.host, self.proxy.port))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.proxy.request_timeout_secs)
    }

    pub fn stream_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.proxy.stream_idle_timeout_secs)
    }
}
