//! Local HTTP forwarding.
//!
//! Exact rewrite: method preserved, URL `http://{host:port}{path}`, body
//! passed through, headers copied minus hop-by-hop. The connection pool
//! is shared across the proxy. Forwarded requests are never retried;
//! they may be non-idempotent.

use anyhow::{Context, Result};
use serde_json::{json, Value};
use std::time::Duration;

use crate::bus::envelope::{is_stripped_header, Headers};
use crate::directory::AgentEntry;
use crate::protocol::error::ProxyError;

/// Shared pooled client with per-host connection limits.
pub fn build_http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .pool_max_idle_per_host(8)
        .pool_idle_timeout(Duration::from_secs(90))
        .connect_timeout(Duration::from_secs(5))
        .build()
        .context("failed to build HTTP client")
}

/// Forward a request to a locally hosted agent. `timeout` is `None` for
/// streaming calls, whose lifetime is bounded by the idle timer instead.
pub async fn send_to_agent(
    client: &reqwest::Client,
    entry: &AgentEntry,
    method: &str,
    path: &str,
    headers: &Headers,
    body: Option<&Value>,
    timeout: Option<Duration>,
) -> Result<reqwest::Response, ProxyError> {
    let host_port = entry
        .host_port
        .as_deref()
        .ok_or(ProxyError::AgentUnavailable)?;
    let url = format!("http://{host_port}{path}");
    let method = reqwest::Method::from_bytes(method.as_bytes())
        .map_err(|_| ProxyError::Unsupported(format!("HTTP method '{method}'")))?;

    let mut request = client.request(method, &url);
    if let Some(timeout) = timeout {
        request = request.timeout(timeout);
    }
    for (name, value) in headers.iter() {
        if !is_stripped_header(name) {
            request = request.header(name, value);
        }
    }
    if let Some(body) = body {
        request = request.json(body);
    }

    request.send().await.map_err(map_transport_error)
}

/// Forward and decode a JSON response body. Non-JSON bodies are wrapped
/// so they still round-trip through the envelope.
pub async fn send_expect_json(
    client: &reqwest::Client,
    entry: &AgentEntry,
    method: &str,
    path: &str,
    headers: &Headers,
    body: Option<&Value>,
    timeout: Option<Duration>,
) -> Result<(u16, Value), ProxyError> {
    let response = send_to_agent(client, entry, method, path, headers, body, timeout).await?;
    let status = response.status().as_u16();
    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let bytes = response.bytes().await.map_err(map_transport_error)?;
    let value = serde_json::from_slice(&bytes).unwrap_or_else(|_| {
        json!({
            "data": String::from_utf8_lossy(&bytes).to_string(),
            "content_type": content_type,
        })
    });
    Ok((status, value))
}

pub fn map_transport_error(e: reqwest::Error) -> ProxyError {
    if e.is_timeout() {
        ProxyError::AgentTimeout
    } else {
        ProxyError::AgentUnavailable
    }
}
