//! In-process bus backend.
//!
//! Implements the full adapter contract: topic triples, selector-filtered
//! durable subscriptions, per-subscription bounded queues, delivery
//! counting with dead-letter overflow, and a duplicate-detection window
//! keyed on message id. Publish order is preserved per subscription queue,
//! which subsumes the per-session FIFO guarantee: all envelopes of one
//! correlation come from a single publishing task.
//!
//! A full subscription queue makes `publish` wait, which is the session
//! flow control the SSE bridge's back-pressure contract relies on.

use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::TopicGroupConfig;
use crate::expiry::ExpiringMap;

use super::envelope::Envelope;
use super::{
    deadletter_topic, requests_topic, responses_topic, Bus, BusReceiver, Delivery, MessageProps,
    Settlement, SubscriptionSpec, TopicProperties, TopologyError, TopologyReport,
};

/// Bounded queue depth per subscription.
const SUBSCRIPTION_QUEUE_CAP: usize = 256;

/// Upper bound on tracked message ids per topic.
const DEDUP_MAX_ENTRIES: usize = 4096;

struct SubscriptionState {
    name: String,
    spec: SubscriptionSpec,
    tx: Mutex<mpsc::Sender<Delivery>>,
}

struct TopicState {
    name: String,
    properties: TopicProperties,
    dedup: ExpiringMap<Uuid, ()>,
    subscriptions: Mutex<HashMap<String, Arc<SubscriptionState>>>,
    /// Dead-letter topics retain copies so operators (and tests) can
    /// inspect poison messages.
    retained: Mutex<Vec<Envelope>>,
}

impl TopicState {
    fn new(name: String, properties: TopicProperties) -> Self {
        Self {
            name,
            properties,
            dedup: ExpiringMap::new(DEDUP_MAX_ENTRIES),
            subscriptions: Mutex::new(HashMap::new()),
            retained: Mutex::new(Vec::new()),
        }
    }

    fn is_deadletter(&self) -> bool {
        self.name.ends_with(".deadletter")
    }
}

struct Inner {
    allow_topology: bool,
    topics: Mutex<HashMap<String, Arc<TopicState>>>,
}

/// In-memory session-ordered bus shared by every proxy in one process.
#[derive(Clone)]
pub struct MemoryBus {
    inner: Arc<Inner>,
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                allow_topology: true,
                topics: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// A bus that refuses topology creation, for exercising the
    /// coordinator permission-refused path.
    pub fn read_only() -> Self {
        Self {
            inner: Arc::new(Inner {
                allow_topology: false,
                topics: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn topic_exists(&self, name: &str) -> bool {
        self.inner.topics.lock().contains_key(name)
    }

    /// Number of attached subscriptions on a topic. Startup sequencing in
    /// tests waits on this.
    pub fn subscription_count(&self, topic: &str) -> usize {
        let topic = self.inner.topics.lock().get(topic).cloned();
        topic.map_or(0, |t| t.subscriptions.lock().len())
    }

    /// Messages dead-lettered for a group.
    pub fn dead_letters(&self, group: &str) -> Vec<Envelope> {
        let topic = self.inner.topics.lock().get(&deadletter_topic(group)).cloned();
        topic.map_or_else(Vec::new, |t| t.retained.lock().clone())
    }

    /// Publish with a caller-chosen message id, as a redelivering producer
    /// would. Duplicate ids inside the topic's detection window are
    /// dropped.
    pub async fn publish_with_message_id(
        &self,
        topic: &str,
        envelope: &Envelope,
        message_id: Uuid,
    ) -> Result<()> {
        let props = MessageProps::with_message_id(envelope, message_id);
        self.publish_inner(topic, envelope, props).await
    }

    async fn publish_inner(
        &self,
        topic_name: &str,
        envelope: &Envelope,
        props: MessageProps,
    ) -> Result<()> {
        let topic = {
            let topics = self.inner.topics.lock();
            match topics.get(topic_name) {
                Some(t) => Arc::clone(t),
                None => bail!("topic '{topic_name}' does not exist"),
            }
        };

        if topic.dedup.contains(&props.message_id) {
            debug!(
                topic = topic_name,
                message_id = %props.message_id,
                "duplicate message id inside detection window, dropping"
            );
            return Ok(());
        }
        topic.dedup.insert(
            props.message_id,
            Duration::from_secs(topic.properties.duplicate_detection_window_mins * 60),
            (),
        );

        if topic.is_deadletter() {
            topic.retained.lock().push(envelope.clone());
        }

        let matching: Vec<(Arc<SubscriptionState>, mpsc::Sender<Delivery>)> = {
            let subs = topic.subscriptions.lock();
            subs.values()
                .filter(|sub| sub.spec.selector.matches(&props))
                .map(|sub| (Arc::clone(sub), sub.tx.lock().clone()))
                .collect()
        };

        if matching.is_empty() && !topic.is_deadletter() {
            debug!(topic = topic_name, correlation_id = %props.correlation_id, "no matching subscription, message dropped");
        }

        for (sub, tx) in matching {
            let delivery = self.build_delivery(&sub, envelope.clone(), props.clone(), 1);
            // A full queue throttles the publisher; this is the session
            // flow control back-pressure propagates through.
            if tx.send(delivery).await.is_err() {
                debug!(subscription = %sub.name, "subscription detached, delivery dropped");
            }
        }
        Ok(())
    }

    fn build_delivery(
        &self,
        sub: &Arc<SubscriptionState>,
        envelope: Envelope,
        props: MessageProps,
        delivery_count: u32,
    ) -> Delivery {
        Delivery {
            envelope: envelope.clone(),
            props: props.clone(),
            delivery_count,
            settlement: Settlement::Memory(MemorySettlement {
                inner: Arc::clone(&self.inner),
                sub: Arc::clone(sub),
                envelope,
                props,
                delivery_count,
            }),
        }
    }
}

#[async_trait]
impl Bus for MemoryBus {
    async fn ensure_topology(
        &self,
        groups: &[TopicGroupConfig],
    ) -> Result<TopologyReport, TopologyError> {
        if !self.inner.allow_topology {
            return Err(TopologyError::Refused(
                "insufficient permission to manage topics".into(),
            ));
        }

        let mut report = TopologyReport::default();
        let mut topics = self.inner.topics.lock();

        for group in groups {
            let wanted = TopicProperties::from_group(group);
            for name in [
                requests_topic(&group.name),
                responses_topic(&group.name),
                deadletter_topic(&group.name),
            ] {
                match topics.get(&name) {
                    Some(existing) if existing.properties == wanted => {
                        report.existing.push(name);
                    }
                    Some(existing) => {
                        warn!(
                            topic = %name,
                            "topic exists with divergent properties, leaving untouched \
                             (existing ttl {}s, wanted {}s)",
                            existing.properties.message_ttl_secs,
                            wanted.message_ttl_secs,
                        );
                        report.divergent.push(name);
                    }
                    None => {
                        topics.insert(
                            name.clone(),
                            Arc::new(TopicState::new(name.clone(), wanted.clone())),
                        );
                        report.created.push(name);
                    }
                }
            }
        }
        Ok(report)
    }

    async fn publish(&self, topic: &str, envelope: &Envelope) -> Result<()> {
        let props = MessageProps::for_envelope(envelope);
        self.publish_inner(topic, envelope, props).await
    }

    async fn subscribe(&self, topic_name: &str, spec: SubscriptionSpec) -> Result<BusReceiver> {
        let topic = {
            let topics = self.inner.topics.lock();
            match topics.get(topic_name) {
                Some(t) => Arc::clone(t),
                None => bail!("cannot subscribe: topic '{topic_name}' does not exist"),
            }
        };

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_QUEUE_CAP);
        let mut subs = topic.subscriptions.lock();
        if subs.contains_key(&spec.name) {
            info!(
                subscription = %spec.name,
                topic = topic_name,
                "re-attaching to existing subscription"
            );
        } else {
            debug!(
                subscription = %spec.name,
                topic = topic_name,
                filter = %spec.selector.rule(),
                "subscription created"
            );
        }
        subs.insert(
            spec.name.clone(),
            Arc::new(SubscriptionState {
                name: spec.name.clone(),
                spec,
                tx: Mutex::new(tx),
            }),
        );
        Ok(BusReceiver { rx })
    }
}

// ── Settlement ───────────────────────────────────────────────────

pub(crate) struct MemorySettlement {
    inner: Arc<Inner>,
    sub: Arc<SubscriptionState>,
    envelope: Envelope,
    props: MessageProps,
    delivery_count: u32,
}

impl MemorySettlement {
    pub(crate) fn ack(self) {}

    pub(crate) fn abandon(self) {
        if self.delivery_count >= self.sub.spec.max_delivery_count {
            self.dead_letter("max delivery count exceeded");
            return;
        }

        let next_count = self.delivery_count + 1;
        let tx = self.sub.tx.lock().clone();
        let delivery = Delivery {
            envelope: self.envelope.clone(),
            props: self.props.clone(),
            delivery_count: next_count,
            settlement: Settlement::Memory(MemorySettlement {
                delivery_count: next_count,
                ..self
            }),
        };

        match tx.try_send(delivery) {
            Ok(()) => {}
            Err(TrySendError::Full(delivery)) => {
                tokio::spawn(async move {
                    let _ = tx.send(delivery).await;
                });
            }
            Err(TrySendError::Closed(_)) => {
                debug!("subscription detached, abandoned message dropped");
            }
        }
    }

    pub(crate) fn dead_letter(self, reason: &str) {
        let group = self.props.group.clone();
        warn!(
            correlation_id = %self.props.correlation_id,
            group = %group,
            reason,
            "dead-lettering message"
        );

        let dlq = deadletter_topic(&group);
        let topic = self.inner.topics.lock().get(&dlq).cloned();
        match topic {
            Some(topic) => topic.retained.lock().push(self.envelope),
            None => warn!(topic = %dlq, "dead-letter topic missing, message dropped"),
        }
    }
}
