//! Bus adapter: topic/queue abstraction with session-ordered publish and
//! filtered receive.
//!
//! Each agent group owns a topic triple (`a2a.{group}.requests`,
//! `.responses`, `.deadletter`). Publishing keys the bus session on the
//! envelope's correlation id so all messages of one logical call arrive in
//! publish order at a single receiver. Deliveries are settled explicitly:
//! ack on success, abandon for retriable failures (redelivered up to the
//! delivery cap, then dead-lettered), dead-letter for poison messages.

pub mod envelope;
pub mod memory;
pub mod publisher;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::{BusSettings, TopicGroupConfig};
use envelope::Envelope;

/// Topic name for a group's request traffic.
pub fn requests_topic(group: &str) -> String {
    format!("a2a.{group}.requests")
}

/// Topic name for a group's response traffic.
pub fn responses_topic(group: &str) -> String {
    format!("a2a.{group}.responses")
}

/// Topic name for a group's dead-lettered messages.
pub fn deadletter_topic(group: &str) -> String {
    format!("a2a.{group}.deadletter")
}

/// Role component of a subscription name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionRole {
    Requests,
    Responses,
}

impl SubscriptionRole {
    fn as_str(self) -> &'static str {
        match self {
            Self::Requests => "req",
            Self::Responses => "resp",
        }
    }
}

/// Durable subscription name: `{proxy_id}.{group}.{role}`, suffixed with
/// the agent id for per-agent request subscriptions so two hosted agents
/// in one group get distinct subscriptions.
pub fn subscription_name(
    proxy_id: &str,
    group: &str,
    role: SubscriptionRole,
    agent_id: Option<&str>,
) -> String {
    match agent_id {
        Some(agent) => format!("{proxy_id}.{group}.{}.{agent}", role.as_str()),
        None => format!("{proxy_id}.{group}.{}", role.as_str()),
    }
}

// ── Message properties ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Request,
    Response,
}

/// Bus-level properties set on every published message.
#[derive(Debug, Clone)]
pub struct MessageProps {
    pub message_id: Uuid,
    pub correlation_id: Uuid,
    /// Equal to the correlation id: guarantees FIFO per correlation.
    pub session_id: Uuid,
    pub content_type: &'static str,
    pub to_agent: String,
    pub from_agent: String,
    pub group: String,
    pub to_proxy: Option<String>,
    pub message_type: MessageType,
}

impl MessageProps {
    /// Derive properties for an envelope, minting a fresh message id.
    pub fn for_envelope(envelope: &Envelope) -> Self {
        Self::with_message_id(envelope, Uuid::new_v4())
    }

    pub fn with_message_id(envelope: &Envelope, message_id: Uuid) -> Self {
        let head = envelope.head();
        Self {
            message_id,
            correlation_id: head.correlation_id,
            session_id: head.correlation_id,
            content_type: "application/json",
            to_agent: head.to_agent.clone(),
            from_agent: head.from_agent.clone(),
            group: head.group.clone(),
            to_proxy: envelope.to_proxy().map(str::to_string),
            message_type: match envelope {
                Envelope::Request(_) => MessageType::Request,
                Envelope::Reply(_) | Envelope::StreamChunk(_) => MessageType::Response,
            },
        }
    }
}

/// Server-side subscription filter.
#[derive(Debug, Clone)]
pub enum Selector {
    ToAgent(String),
    ToProxy(String),
    CorrelationId(Uuid),
}

impl Selector {
    pub fn matches(&self, props: &MessageProps) -> bool {
        match self {
            Self::ToAgent(agent) => props.to_agent == *agent,
            Self::ToProxy(proxy) => props.to_proxy.as_deref() == Some(proxy.as_str()),
            Self::CorrelationId(id) => props.correlation_id == *id,
        }
    }

    /// SQL-ish rendering of the filter, for logs and diagnostics.
    pub fn rule(&self) -> String {
        match self {
            Self::ToAgent(agent) => format!("toAgent = '{agent}'"),
            Self::ToProxy(proxy) => format!("toProxy = '{proxy}'"),
            Self::CorrelationId(id) => format!("correlationId = '{id}'"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SubscriptionSpec {
    pub name: String,
    pub selector: Selector,
    /// Deliveries before a message dead-letters.
    pub max_delivery_count: u32,
}

// ── Topology ─────────────────────────────────────────────────────

/// Properties applied when a topic is created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicProperties {
    pub max_size_mb: u64,
    pub message_ttl_secs: u64,
    pub duplicate_detection_window_mins: u64,
    pub enable_partitioning: bool,
    pub support_ordering: bool,
}

impl Default for TopicProperties {
    fn default() -> Self {
        Self {
            max_size_mb: 1024,
            message_ttl_secs: 3600,
            duplicate_detection_window_mins: 10,
            enable_partitioning: true,
            support_ordering: true,
        }
    }
}

impl TopicProperties {
    pub fn from_group(group: &TopicGroupConfig) -> Self {
        Self {
            max_size_mb: group.max_size_mb,
            message_ttl_secs: group.message_ttl_secs,
            duplicate_detection_window_mins: group.duplicate_detection_window_mins,
            enable_partitioning: group.enable_partitioning,
            support_ordering: true,
        }
    }
}

/// Outcome of an `ensure_topology` run.
#[derive(Debug, Clone, Default)]
pub struct TopologyReport {
    pub created: Vec<String>,
    pub existing: Vec<String>,
    /// Topics that exist with divergent properties; left untouched.
    pub divergent: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum TopologyError {
    /// Insufficient permission to create topology. Exit code 2 for the
    /// coordinator role.
    #[error("topology creation refused: {0}")]
    Refused(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

// ── Delivery & settlement ────────────────────────────────────────

/// A received message awaiting settlement. Only the owning task may
/// settle it; all three settlement paths consume the delivery.
pub struct Delivery {
    pub envelope: Envelope,
    pub props: MessageProps,
    /// 1 on first delivery.
    pub delivery_count: u32,
    pub(crate) settlement: Settlement,
}

/// One variant per bus backend.
pub(crate) enum Settlement {
    Memory(memory::MemorySettlement),
}

impl Delivery {
    pub fn ack(self) {
        match self.settlement {
            Settlement::Memory(s) => s.ack(),
        }
    }

    /// Return the message to the queue for redelivery; dead-letters once
    /// the delivery cap is reached.
    pub fn abandon(self) {
        match self.settlement {
            Settlement::Memory(s) => s.abandon(),
        }
    }

    pub fn dead_letter(self, reason: &str) {
        match self.settlement {
            Settlement::Memory(s) => s.dead_letter(reason),
        }
    }
}

/// Filtered delivery stream for one subscription.
pub struct BusReceiver {
    pub(crate) rx: mpsc::Receiver<Delivery>,
}

impl BusReceiver {
    /// Next delivery; `None` when the subscription has been detached.
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }
}

// ── The adapter trait ────────────────────────────────────────────

#[async_trait]
pub trait Bus: Send + Sync {
    /// Idempotently create the topic triple for each group. Coordinator
    /// role only; followers attach to existing topology.
    async fn ensure_topology(
        &self,
        groups: &[TopicGroupConfig],
    ) -> Result<TopologyReport, TopologyError>;

    /// Publish one envelope. Message properties are derived from the
    /// envelope; the session key is the correlation id.
    async fn publish(&self, topic: &str, envelope: &Envelope) -> Result<()>;

    /// Create or attach to a durable subscription and stream its
    /// deliveries.
    async fn subscribe(&self, topic: &str, spec: SubscriptionSpec) -> Result<BusReceiver>;
}

/// Build the configured bus backend.
pub fn create_bus(settings: &BusSettings) -> Result<std::sync::Arc<dyn Bus>> {
    match settings.backend.as_str() {
        "memory" => Ok(std::sync::Arc::new(memory::MemoryBus::new())),
        other => bail!("unsupported bus backend '{other}'"),
    }
}
