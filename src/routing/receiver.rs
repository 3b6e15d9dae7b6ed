//! Bus-side background tasks.
//!
//! One request receiver per hosted `(group, agent)` pair consumes the
//! group's requests topic filtered on the agent, forwards to the local
//! agent over HTTP, and publishes the reply: a single envelope for plain
//! responses, a sequenced chunk run for SSE. The request is settled only
//! after its reply (or final chunk) is accepted by the bus, so a crash
//! redelivers the request and the duplicates collapse on the requester
//! side.
//!
//! One shared response subscriber per group fans reply envelopes into the
//! pending registry. It completes before settling: a full stream channel
//! stalls settlement, and the bus session flow control throttles the
//! publisher.

use futures_util::StreamExt;
use serde_json::json;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::envelope::{
    ChunkBody, ChunkType, Envelope, Head, ReplyEnvelope, RequestEnvelope, StreamChunkEnvelope,
    StreamMeta,
};
use crate::bus::{
    requests_topic, responses_topic, subscription_name, Delivery, Selector, SubscriptionRole,
    SubscriptionSpec,
};
use crate::directory::AgentEntry;
use crate::protocol::error::ProxyError;
use crate::protocol::{request_id, JsonRpcError, DONE_SENTINEL};
use crate::sse::parser::{SseEvent, SseParser};
use crate::util::now_millis;

use super::{forward, AppState};

/// Backoff between re-subscription attempts after a transient disconnect.
const RESUBSCRIBE_BACKOFF: Duration = Duration::from_secs(1);

// ── Request receivers ───────────────────────────────────────────

pub fn spawn_request_receivers(state: &AppState) -> Vec<JoinHandle<()>> {
    state
        .directory
        .hosted_agents()
        .into_iter()
        .map(|entry| {
            let state = state.clone();
            let entry = entry.clone();
            tokio::spawn(async move {
                run_request_receiver(state, entry).await;
            })
        })
        .collect()
}

async fn run_request_receiver(state: AppState, entry: AgentEntry) {
    let topic = requests_topic(&entry.group);
    let spec = SubscriptionSpec {
        name: subscription_name(
            &state.config.proxy.id,
            &entry.group,
            SubscriptionRole::Requests,
            Some(&entry.id),
        ),
        selector: Selector::ToAgent(entry.id.clone()),
        max_delivery_count: state.config.bus.max_retry_count,
    };

    loop {
        let mut rx = match state.bus.subscribe(&topic, spec.clone()).await {
            Ok(rx) => rx,
            Err(e) => {
                warn!(topic = %topic, "request subscription failed, retrying: {e:#}");
                tokio::time::sleep(RESUBSCRIBE_BACKOFF).await;
                continue;
            }
        };
        info!(
            topic = %topic,
            agent = %entry.id,
            filter = %spec.selector.rule(),
            "request receiver attached"
        );

        while let Some(delivery) = rx.recv().await {
            let state = state.clone();
            let entry = entry.clone();
            tokio::spawn(async move {
                handle_request_delivery(state, entry, delivery).await;
            });
        }

        warn!(topic = %topic, "request subscription detached, re-attaching");
        tokio::time::sleep(RESUBSCRIBE_BACKOFF).await;
    }
}

async fn handle_request_delivery(state: AppState, entry: AgentEntry, delivery: Delivery) {
    if delivery.envelope.expired(now_millis()) {
        debug!(
            correlation_id = %delivery.envelope.correlation_id(),
            "envelope past ttl, dropping"
        );
        delivery.ack();
        return;
    }

    let request = match &delivery.envelope {
        Envelope::Request(req) => req.clone(),
        other => {
            warn!(kind = other.kind_name(), "unexpected envelope on requests topic");
            delivery.dead_letter("unexpected envelope kind");
            return;
        }
    };

    debug!(
        correlation_id = %request.head.correlation_id,
        agent = %entry.id,
        path = %request.http_path,
        stream = request.is_stream,
        "forwarding bus request to local agent"
    );

    let body = if request.method == "GET" {
        None
    } else {
        Some(&request.payload)
    };
    // Streams are bounded by their idle timer, not a total deadline.
    let timeout = if request.is_stream {
        None
    } else {
        Some(state.config.request_timeout())
    };

    let upstream = forward::send_to_agent(
        &state.http,
        &entry,
        &request.method,
        &request.http_path,
        &request.head.headers,
        body,
        timeout,
    )
    .await;

    match upstream {
        Err(err) => publish_error_reply(&state, &request, &err, delivery).await,
        Ok(response) => {
            let content_type = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string();
            if content_type.starts_with("text/event-stream") {
                relay_stream(&state, &request, response, delivery).await;
            } else {
                relay_reply(&state, &request, response, delivery).await;
            }
        }
    }
}

async fn relay_reply(
    state: &AppState,
    request: &RequestEnvelope,
    response: reqwest::Response,
    delivery: Delivery,
) {
    let status = response.status().as_u16();
    let bytes = match response.bytes().await {
        Ok(bytes) => bytes,
        Err(e) => {
            publish_error_reply(state, request, &forward::map_transport_error(e), delivery).await;
            return;
        }
    };
    let payload = serde_json::from_slice(&bytes)
        .unwrap_or_else(|_| json!({"data": String::from_utf8_lossy(&bytes).to_string()}));

    let reply = Envelope::Reply(ReplyEnvelope {
        head: turnaround_head(request),
        to_proxy: request.from_proxy.clone(),
        status,
        payload,
    });

    match state
        .publisher
        .publish(&responses_topic(&request.head.group), &reply)
        .await
    {
        Ok(()) => {
            debug!(correlation_id = %request.head.correlation_id, status, "reply published");
            delivery.ack();
        }
        Err(err) => {
            warn!(
                correlation_id = %request.head.correlation_id,
                "reply publish failed after retries, abandoning request: {err}"
            );
            delivery.abandon();
        }
    }
}

/// Forwarding failed: the requester still gets a reply, carrying the
/// JSON-RPC error object and the mapped status.
async fn publish_error_reply(
    state: &AppState,
    request: &RequestEnvelope,
    err: &ProxyError,
    delivery: Delivery,
) {
    warn!(
        correlation_id = %request.head.correlation_id,
        agent = %request.head.to_agent,
        "local forward failed: {err}"
    );
    let payload = serde_json::to_value(err.to_jsonrpc(request_id(&request.payload)))
        .unwrap_or_else(|_| json!({}));
    let reply = Envelope::Reply(ReplyEnvelope {
        head: turnaround_head(request),
        to_proxy: request.from_proxy.clone(),
        status: err.http_status().as_u16(),
        payload,
    });

    match state
        .publisher
        .publish(&responses_topic(&request.head.group), &reply)
        .await
    {
        Ok(()) => delivery.ack(),
        Err(publish_err) => {
            warn!(
                correlation_id = %request.head.correlation_id,
                "error-reply publish failed, abandoning request: {publish_err}"
            );
            delivery.abandon();
        }
    }
}

async fn relay_stream(
    state: &AppState,
    request: &RequestEnvelope,
    response: reqwest::Response,
    delivery: Delivery,
) {
    let topic = responses_topic(&request.head.group);
    let stream_id = Uuid::new_v4();
    let mut sequence: u64 = 0;
    let mut parser = SseParser::new();
    let mut body = response.bytes_stream();

    while let Some(item) = body.next().await {
        match item {
            Ok(bytes) => {
                for event in parser.push(&bytes) {
                    if event.data == DONE_SENTINEL {
                        finish_stream(state, request, &topic, stream_id, sequence, delivery).await;
                        return;
                    }
                    let chunk = data_chunk(request, stream_id, sequence, &event);
                    if let Err(err) = state.publisher.publish(&topic, &chunk).await {
                        warn!(
                            correlation_id = %request.head.correlation_id,
                            sequence,
                            "mid-stream publish failed, abandoning request: {err}"
                        );
                        delivery.abandon();
                        return;
                    }
                    sequence += 1;
                }
            }
            Err(e) => {
                // Upstream broke mid-stream: error chunk, then terminal end.
                let err = ProxyError::StreamBroken(e.to_string());
                warn!(correlation_id = %request.head.correlation_id, "{err}");
                let chunk = error_chunk(request, stream_id, sequence, &err);
                if state.publisher.publish(&topic, &chunk).await.is_err() {
                    delivery.abandon();
                    return;
                }
                sequence += 1;
                finish_stream(state, request, &topic, stream_id, sequence, delivery).await;
                return;
            }
        }
    }

    finish_stream(state, request, &topic, stream_id, sequence, delivery).await;
}

/// Publish the final `end` chunk; the request is acked only once the bus
/// accepted it.
async fn finish_stream(
    state: &AppState,
    request: &RequestEnvelope,
    topic: &str,
    stream_id: Uuid,
    sequence: u64,
    delivery: Delivery,
) {
    let end = end_chunk(request, stream_id, sequence);
    match state.publisher.publish(topic, &end).await {
        Ok(()) => {
            info!(
                correlation_id = %request.head.correlation_id,
                chunks = sequence,
                "stream relayed"
            );
            delivery.ack();
        }
        Err(err) => {
            warn!(
                correlation_id = %request.head.correlation_id,
                "final chunk publish failed, abandoning request: {err}"
            );
            delivery.abandon();
        }
    }
}

/// Head for anything travelling back: agent roles swap, correlation and
/// group stay.
fn turnaround_head(request: &RequestEnvelope) -> Head {
    Head::new(
        &request.head.group,
        &request.head.from_agent,
        &request.head.to_agent,
        request.head.correlation_id,
    )
}

fn data_chunk(
    request: &RequestEnvelope,
    stream_id: Uuid,
    sequence: u64,
    event: &SseEvent,
) -> Envelope {
    Envelope::StreamChunk(StreamChunkEnvelope {
        head: turnaround_head(request),
        to_proxy: request.from_proxy.clone(),
        sequence,
        chunk: ChunkBody {
            data: event.data.clone(),
            event: event.event.clone(),
            id: event.id.clone(),
            retry: event.retry,
        },
        meta: StreamMeta {
            stream_id,
            chunk_type: if event.event.is_some() {
                ChunkType::Event
            } else {
                ChunkType::Data
            },
            event_name: event.event.clone(),
            retry: event.retry,
            last_event_id: event.id.clone(),
            is_final: false,
        },
    })
}

fn error_chunk(
    request: &RequestEnvelope,
    stream_id: Uuid,
    sequence: u64,
    err: &ProxyError,
) -> Envelope {
    let data = serde_json::to_string(&JsonRpcError {
        code: err.jsonrpc_code(),
        message: err.to_string(),
        data: None,
    })
    .unwrap_or_else(|_| r#"{"code":-32603,"message":"Internal error"}"#.to_string());

    Envelope::StreamChunk(StreamChunkEnvelope {
        head: turnaround_head(request),
        to_proxy: request.from_proxy.clone(),
        sequence,
        chunk: ChunkBody {
            data,
            event: Some("error".into()),
            id: None,
            retry: None,
        },
        meta: StreamMeta {
            stream_id,
            chunk_type: ChunkType::Error,
            event_name: Some("error".into()),
            retry: None,
            last_event_id: None,
            is_final: false,
        },
    })
}

fn end_chunk(request: &RequestEnvelope, stream_id: Uuid, sequence: u64) -> Envelope {
    Envelope::StreamChunk(StreamChunkEnvelope {
        head: turnaround_head(request),
        to_proxy: request.from_proxy.clone(),
        sequence,
        chunk: ChunkBody::default(),
        meta: StreamMeta {
            stream_id,
            chunk_type: ChunkType::End,
            event_name: None,
            retry: None,
            last_event_id: None,
            is_final: true,
        },
    })
}

// ── Response subscribers ────────────────────────────────────────

pub fn spawn_response_subscribers(state: &AppState) -> Vec<JoinHandle<()>> {
    state
        .directory
        .groups()
        .into_iter()
        .map(|group| {
            let state = state.clone();
            tokio::spawn(async move {
                run_response_subscriber(state, group).await;
            })
        })
        .collect()
}

async fn run_response_subscriber(state: AppState, group: String) {
    let topic = responses_topic(&group);
    let spec = SubscriptionSpec {
        name: subscription_name(
            &state.config.proxy.id,
            &group,
            SubscriptionRole::Responses,
            None,
        ),
        selector: Selector::ToProxy(state.config.proxy.id.clone()),
        max_delivery_count: state.config.bus.max_retry_count,
    };

    loop {
        let mut rx = match state.bus.subscribe(&topic, spec.clone()).await {
            Ok(rx) => rx,
            Err(e) => {
                debug!(topic = %topic, "response subscription not ready, retrying: {e:#}");
                tokio::time::sleep(RESUBSCRIBE_BACKOFF).await;
                continue;
            }
        };
        info!(topic = %topic, filter = %spec.selector.rule(), "response subscriber attached");

        while let Some(delivery) = rx.recv().await {
            if delivery.envelope.expired(now_millis()) {
                debug!(
                    correlation_id = %delivery.envelope.correlation_id(),
                    "reply past ttl, dropping"
                );
                delivery.ack();
                continue;
            }
            // Complete before settling: a stalled stream channel delays
            // the ack, which is the back-pressure contract.
            state.registry.complete(delivery.envelope.clone()).await;
            delivery.ack();
        }

        warn!(topic = %topic, "response subscription detached, re-attaching");
        tokio::time::sleep(RESUBSCRIBE_BACKOFF).await;
    }
}
