//! Publish wrapper with retry policy.
//!
//! Retries are the bus adapter's exclusive responsibility; the routing
//! engine never retries at application level. Exponential backoff with
//! jitter, capped attempts, then the failure surfaces as
//! `ProxyError::PublishFailed`.

use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::config::BusSettings;
use crate::protocol::error::ProxyError;

use super::envelope::Envelope;
use super::Bus;

pub struct BusPublisher {
    bus: Arc<dyn Bus>,
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl BusPublisher {
    pub fn new(bus: Arc<dyn Bus>, settings: &BusSettings) -> Self {
        Self {
            bus,
            max_attempts: settings.max_retry_count.max(1),
            base_delay: Duration::from_millis(settings.retry_base_delay_ms),
            max_delay: Duration::from_millis(settings.retry_max_delay_ms),
        }
    }

    pub async fn publish(&self, topic: &str, envelope: &Envelope) -> Result<(), ProxyError> {
        let mut delay = self.base_delay;

        for attempt in 1..=self.max_attempts {
            match self.bus.publish(topic, envelope).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(
                        topic,
                        correlation_id = %envelope.correlation_id(),
                        attempt,
                        max_attempts = self.max_attempts,
                        "bus publish failed: {e:#}"
                    );
                    if attempt < self.max_attempts {
                        tokio::time::sleep(with_jitter(delay)).await;
                        delay = (delay * 2).min(self.max_delay);
                    }
                }
            }
        }
        Err(ProxyError::PublishFailed)
    }
}

/// Add up to 50% random jitter so colliding retries spread out.
fn with_jitter(delay: Duration) -> Duration {
    let millis = delay.as_millis() as u64;
    if millis == 0 {
        return delay;
    }
    let jitter = rand::thread_rng().gen_range(0..=millis / 2);
    Duration::from_millis(millis + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::envelope::{Head, RequestEnvelope};
    use crate::bus::memory::MemoryBus;
    use crate::config::TopicGroupConfig;
    use serde_json::json;
    use uuid::Uuid;

    fn settings() -> BusSettings {
        BusSettings {
            backend: "memory".into(),
            max_retry_count: 3,
            retry_base_delay_ms: 1,
            retry_max_delay_ms: 5,
        }
    }

    fn request() -> Envelope {
        Envelope::Request(RequestEnvelope {
            head: Head::new("blog-agents", "critic", "proxy", Uuid::new_v4()),
            from_proxy: "p1".into(),
            method: "POST".into(),
            http_path: "/v1/messages:send".into(),
            is_stream: false,
            payload: json!({}),
        })
    }

    #[tokio::test]
    async fn publish_succeeds_against_existing_topic() {
        let bus = Arc::new(MemoryBus::new());
        bus.ensure_topology(&[TopicGroupConfig {
            name: "blog-agents".into(),
            description: String::new(),
            max_size_mb: 1024,
            message_ttl_secs: 3600,
            duplicate_detection_window_mins: 10,
            enable_partitioning: true,
        }])
        .await
        .unwrap();

        let publisher = BusPublisher::new(bus, &settings());
        assert!(publisher
            .publish("a2a.blog-agents.requests", &request())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn publish_surfaces_failure_after_retries() {
        // No topology: every attempt fails, and the retry budget runs out.
        let bus = Arc::new(MemoryBus::new());
        let publisher = BusPublisher::new(bus, &settings());
        let err = publisher
            .publish("a2a.blog-agents.requests", &request())
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::PublishFailed));
    }

    #[test]
    fn jitter_stays_within_half_delay() {
        for _ in 0..50 {
            let jittered = with_jitter(Duration::from_millis(100));
            assert!(jittered >= Duration::from_millis(100));
            assert!(jittered <= Duration::from_millis(150));
        }
    }
}
