//! HTTP ingress handlers.
//!
//! Synchronous calls: look up the target, wrap, dispatch locally or over
//! the bus, await the correlated reply. Streaming calls: same, but the
//! reply is an ordered chunk channel re-streamed as `text/event-stream`.
//! Every response echoes the correlation id as `X-Correlation-ID`.

use axum::body::Bytes;
use axum::extract::{Path, RawQuery, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json, Response};
use futures_util::stream;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::bus::envelope::{Envelope, Head, Headers, RequestEnvelope, StreamChunkEnvelope};
use crate::bus::requests_topic;
use crate::pending::{PendingRegistry, StreamWaiter};
use crate::protocol::error::ProxyError;
use crate::protocol::request_id;
use crate::sse::egress;

use super::{agent_card, forward, AppState};

const X_CORRELATION_ID: &str = "x-correlation-id";

// ── Handlers ────────────────────────────────────────────────────

/// GET /health. Liveness only, never authenticated.
pub async fn handle_health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "proxy_id": state.config.proxy.id,
        "role": serde_json::to_value(state.config.proxy.role).unwrap_or(Value::Null),
        "agents": state.directory.len(),
    }))
}

/// GET /.well-known/agent.json, the proxy's own card.
pub async fn handle_proxy_card(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "name": format!("A2A Relay {}", state.config.proxy.id),
        "description": "Bus-backed transparent proxy for A2A agents",
        "url": state.config.public_base_url(),
        "version": env!("CARGO_PKG_VERSION"),
        "capabilities": {
            "streaming": true,
            "routing": true,
        },
        "role": serde_json::to_value(state.config.proxy.role).unwrap_or(Value::Null),
    }))
}

/// GET /agents/{id}/.well-known/agent.json
pub async fn handle_agent_card(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
) -> Response {
    agent_card::handle(state, agent_id).await
}

/// POST /agents/{id}/v1/messages:send
pub async fn handle_message_send(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let payload = match parse_body(&body) {
        Ok(v) => v,
        Err(response) => return response,
    };
    dispatch_sync(
        &state,
        &agent_id,
        "POST",
        "/v1/messages:send".to_string(),
        &headers,
        payload,
    )
    .await
}

/// POST /agents/{id}/v1/messages:stream
pub async fn handle_message_stream(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let payload = match parse_body(&body) {
        Ok(v) => v,
        Err(response) => return response,
    };
    dispatch_stream(
        &state,
        &agent_id,
        "/v1/messages:stream".to_string(),
        &headers,
        payload,
    )
    .await
}

/// GET /agents/{id}/v1/tasks:get. The query string is forwarded verbatim.
pub async fn handle_tasks_get(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Response {
    let path = match query {
        Some(q) => format!("/v1/tasks:get?{q}"),
        None => "/v1/tasks:get".to_string(),
    };
    dispatch_sync(&state, &agent_id, "GET", path, &headers, Value::Null).await
}

/// POST /agents/{id}/v1/tasks:cancel
pub async fn handle_tasks_cancel(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let payload = match parse_body(&body) {
        Ok(v) => v,
        Err(response) => return response,
    };
    dispatch_sync(
        &state,
        &agent_id,
        "POST",
        "/v1/tasks:cancel".to_string(),
        &headers,
        payload,
    )
    .await
}

/// POST /agents/{id}/v1/tasks:resubscribe, an SSE reply.
pub async fn handle_tasks_resubscribe(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let payload = match parse_body(&body) {
        Ok(v) => v,
        Err(response) => return response,
    };
    dispatch_stream(
        &state,
        &agent_id,
        "/v1/tasks:resubscribe".to_string(),
        &headers,
        payload,
    )
    .await
}

// ── Dispatch ────────────────────────────────────────────────────

async fn dispatch_sync(
    state: &AppState,
    agent_id: &str,
    method: &str,
    path: String,
    http_headers: &HeaderMap,
    payload: Value,
) -> Response {
    let id = request_id(&payload);
    let Some(entry) = state.directory.get(agent_id) else {
        return error_response(&ProxyError::AgentNotFound, id, None);
    };
    let correlation_id = correlation_from_headers(http_headers).unwrap_or_else(Uuid::new_v4);
    let headers = Headers::from_http(http_headers);

    if state.directory.is_local(agent_id) {
        debug!(agent_id, correlation_id = %correlation_id, path = %path, "routing to local agent");
        let body = if method == "GET" { None } else { Some(&payload) };
        return match forward::send_expect_json(
            &state.http,
            entry,
            method,
            &path,
            &headers,
            body,
            Some(state.config.request_timeout()),
        )
        .await
        {
            Ok((status, value)) => {
                let status = StatusCode::from_u16(status).unwrap_or(StatusCode::OK);
                with_correlation((status, Json(value)).into_response(), correlation_id)
            }
            Err(err) => error_response(&err, id, Some(correlation_id)),
        };
    }

    info!(agent_id, correlation_id = %correlation_id, group = %entry.group, "routing to remote agent over the bus");
    let envelope = Envelope::Request(RequestEnvelope {
        head: Head::new(&entry.group, agent_id, &from_agent(http_headers), correlation_id)
            .with_headers(headers),
        from_proxy: state.config.proxy.id.clone(),
        method: method.to_string(),
        http_path: path,
        is_stream: false,
        payload,
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
        return error_response(&err, id, Some(correlation_id));
    }

    match waiter.await_reply().await {
        Ok(reply) => {
            let status = StatusCode::from_u16(reply.status).unwrap_or(StatusCode::OK);
            with_correlation((status, Json(reply.payload)).into_response(), correlation_id)
        }
        Err(err) => error_response(&err, id, Some(correlation_id)),
    }
}

async fn dispatch_stream(
    state: &AppState,
    agent_id: &str,
    path: String,
    http_headers: &HeaderMap,
    payload: Value,
) -> Response {
    let id = request_id(&payload);
    let Some(entry) = state.directory.get(agent_id) else {
        return error_response(&ProxyError::AgentNotFound, id, None);
    };
    let correlation_id = correlation_from_headers(http_headers).unwrap_or_else(Uuid::new_v4);
    let headers = Headers::from_http(http_headers);

    if state.directory.is_local(agent_id) {
        debug!(agent_id, correlation_id = %correlation_id, "streaming from local agent");
        // Pipe the upstream SSE body straight through; no bus involved.
        return match forward::send_to_agent(
            &state.http,
            entry,
            "POST",
            &path,
            &headers,
            Some(&payload),
            None,
        )
        .await
        {
            Ok(upstream) => {
                let status =
                    StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::OK);
                let body = axum::body::Body::from_stream(upstream.bytes_stream());
                match Response::builder()
                    .status(status)
                    .header(header::CONTENT_TYPE, "text/event-stream")
                    .header(header::CACHE_CONTROL, "no-cache")
                    .body(body)
                {
                    Ok(response) => with_correlation(response, correlation_id),
                    Err(e) => error_response(
                        &ProxyError::StreamBroken(e.to_string()),
                        id,
                        Some(correlation_id),
                    ),
                }
            }
            Err(err) => error_response(&err, id, Some(correlation_id)),
        };
    }

    info!(agent_id, correlation_id = %correlation_id, group = %entry.group, "streaming from remote agent over the bus");
    let envelope = Envelope::Request(RequestEnvelope {
        head: Head::new(&entry.group, agent_id, &from_agent(http_headers), correlation_id)
            .with_headers(headers),
        from_proxy: state.config.proxy.id.clone(),
        method: "POST".to_string(),
        http_path: path,
        is_stream: true,
        payload,
    });

    let waiter = state.registry.register_stream(
        correlation_id,
        state.config.stream_idle_timeout(),
        state.config.proxy.stream_buffer,
        state.config.proxy.reorder_window,
    );
    if let Err(err) = state
        .publisher
        .publish(&requests_topic(&entry.group), &envelope)
        .await
    {
        state.registry.cancel(correlation_id, "publish failed");
        return error_response(&err, id, Some(correlation_id));
    }

    with_correlation(
        sse_response(Arc::clone(&state.registry), correlation_id, waiter),
        correlation_id,
    )
}

// ── SSE egress ──────────────────────────────────────────────────

/// Notifies the registry when the HTTP handler goes away, releasing
/// back-pressure on the upstream. The registry holds the channel, the
/// handler drains it; neither owns the other.
struct CancelOnDrop {
    registry: Arc<PendingRegistry>,
    correlation_id: Uuid,
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        // No-op when the stream already terminated.
        self.registry
            .cancel(self.correlation_id, "client disconnected");
    }
}

fn sse_response(
    registry: Arc<PendingRegistry>,
    correlation_id: Uuid,
    waiter: StreamWaiter,
) -> Response {
    struct EgressState {
        rx: mpsc::Receiver<Result<StreamChunkEnvelope, ProxyError>>,
        _guard: CancelOnDrop,
        finished: bool,
    }

    let egress_state = EgressState {
        rx: waiter.rx,
        _guard: CancelOnDrop {
            registry,
            correlation_id,
        },
        finished: false,
    };

    let stream = stream::unfold(egress_state, |mut st| async move {
        if st.finished {
            return None;
        }
        match st.rx.recv().await {
            Some(Ok(chunk)) => match egress::chunk_to_event(&chunk) {
                Some(event) => Some((Ok::<Event, Infallible>(event), st)),
                // The end chunk produces no bytes; close the response.
                None => None,
            },
            Some(Err(err)) => {
                st.finished = true;
                Some((Ok(egress::error_event(&err)), st))
            }
            None => None,
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
}

// ── Shared helpers ──────────────────────────────────────────────

fn parse_body(body: &Bytes) -> Result<Value, Response> {
    serde_json::from_slice(body).map_err(|e| {
        error_response(
            &ProxyError::InvalidRequest(format!("body is not valid JSON: {e}")),
            Value::Null,
            None,
        )
    })
}

fn correlation_from_headers(headers: &HeaderMap) -> Option<Uuid> {
    headers
        .get(X_CORRELATION_ID)?
        .to_str()
        .ok()?
        .parse()
        .ok()
}

/// `From-Agent` (or `X-From-Agent`) header, defaulting to "proxy".
fn from_agent(headers: &HeaderMap) -> String {
    for name in ["from-agent", "x-from-agent"] {
        if let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) {
            return value.to_string();
        }
    }
    "proxy".to_string()
}

fn with_correlation(mut response: Response, correlation_id: Uuid) -> Response {
    if let Ok(value) = HeaderValue::from_str(&correlation_id.to_string()) {
        response.headers_mut().insert(X_CORRELATION_ID, value);
    }
    response
}

fn error_response(err: &ProxyError, id: Value, correlation_id: Option<Uuid>) -> Response {
    let response = (err.http_status(), Json(err.to_jsonrpc(id))).into_response();
    match correlation_id {
        Some(corr) => with_correlation(response, corr),
        None => response,
    }
}
