//! Agent-card fetch and rewrite.
//!
//! The proxy serves each agent's card with the top-level `url` rewritten
//! to point at itself, so callers keep talking through the proxy. A
//! failed fetch degrades to a minimal card (HTTP 200) naming the error.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

use crate::bus::envelope::{Envelope, Head, Headers, RequestEnvelope};
use crate::bus::requests_topic;
use crate::directory::AgentEntry;
use crate::protocol::error::ProxyError;
use crate::protocol::AGENT_CARD_PATH;

use super::{forward, AppState};

/// Deadline for fetching a card from a co-located agent.
const LOCAL_CARD_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn handle(state: AppState, agent_id: String) -> Response {
    let Some(entry) = state.directory.get(&agent_id) else {
        return (
            StatusCode::NOT_FOUND,
            Json(ProxyError::AgentNotFound.to_jsonrpc(Value::Null)),
        )
            .into_response();
    };
    let proxied_url = format!("{}/agents/{}", state.config.public_base_url(), agent_id);

    let fetched = if state.directory.is_local(&agent_id) {
        fetch_local(&state, entry).await
    } else {
        fetch_remote(&state, entry, &agent_id).await
    };

    match fetched {
        Ok(mut card) => {
            rewrite_url(&mut card, &proxied_url);
            Json(card).into_response()
        }
        Err(err) => {
            warn!(agent_id = %agent_id, "agent card fetch failed: {err}");
            Json(minimal_card(&agent_id, &proxied_url, &err)).into_response()
        }
    }
}

async fn fetch_local(state: &AppState, entry: &AgentEntry) -> Result<Value, ProxyError> {
    let (status, card) = forward::send_expect_json(
        &state.http,
        entry,
        "GET",
        &entry.agent_card_endpoint,
        &Headers::new(),
        None,
        Some(LOCAL_CARD_TIMEOUT),
    )
    .await?;
    if status >= 400 {
        return Err(ProxyError::AgentUnavailable);
    }
    Ok(card)
}

/// Remote cards ride the same envelope flow as any other request.
async fn fetch_remote(
    state: &AppState,
    entry: &AgentEntry,
    agent_id: &str,
) -> Result<Value, ProxyError> {
    let correlation_id = Uuid::new_v4();
    let envelope = Envelope::Request(RequestEnvelope {
        head: Head::new(&entry.group, agent_id, "proxy", correlation_id),
        from_proxy: state.config.proxy.id.clone(),
        method: "GET".into(),
        http_path: AGENT_CARD_PATH.into(),
        is_stream: false,
        payload: Value::Null,
    });

    let waiter = state
        .registry
        .register_single(correlation_id, state.config.request_timeout());
    if let Err(err) = state
        .publisher
        .publish(&requests_topic(&entry.group), &envelope)
        .await
    {
        state.registry.cancel(correlation_id, "publish failed");
        return Err(err);
    }

    let reply = waiter.await_reply().await?;
    if reply.status >= 400 {
        return Err(ProxyError::AgentUnavailable);
    }
    Ok(reply.payload)
}

fn rewrite_url(card: &mut Value, proxied_url: &str) {
    if let Some(obj) = card.as_object_mut() {
        obj.insert("url".to_string(), json!(proxied_url));
    }
}

fn minimal_card(agent_id: &str, proxied_url: &str, err: &ProxyError) -> Value {
    json!({
        "name": agent_id,
        "url": proxied_url,
        "version": "unknown",
        "error": err.to_string(),
    })
}
