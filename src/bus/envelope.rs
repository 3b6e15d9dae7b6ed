//! The envelope: sole payload format on the bus.
//!
//! Envelope kinds are a tagged union (request, non-stream reply, or one
//! chunk of an SSE stream), so incoherent combinations are rejected at
//! deserialisation rather than checked at every use site. All envelopes of
//! one logical call share a correlation id, which doubles as the bus
//! session key for ordered delivery.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::protocol::PROTOCOL_VERSION;
use crate::util::now_millis;

/// Default envelope TTL: one hour, matching the topic-level message TTL.
pub const DEFAULT_TTL_MS: u64 = 3_600_000;

/// Hop-by-hop headers that must not cross the proxy, plus framing headers
/// the forwarding client regenerates itself.
const STRIPPED_HEADERS: &[&str] = &[
    "connection",
    "transfer-encoding",
    "upgrade",
    "keep-alive",
    "te",
    "trailer",
    "proxy-authenticate",
    "proxy-authorization",
    "host",
    "content-length",
];

pub fn is_stripped_header(name: &str) -> bool {
    STRIPPED_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}

// ── Headers ──────────────────────────────────────────────────────

/// Case-insensitive-keyed, case-preserving header map.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers(BTreeMap<String, String>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert, replacing any existing entry whose name differs only in case.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let existing: Vec<String> = self
            .0
            .keys()
            .filter(|k| k.eq_ignore_ascii_case(&name))
            .cloned()
            .collect();
        for k in existing {
            self.0.remove(&k);
        }
        self.0.insert(name, value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Capture HTTP headers into an envelope map, dropping hop-by-hop
    /// headers and any value that is not valid UTF-8.
    pub fn from_http(headers: &axum::http::HeaderMap) -> Self {
        let mut out = Self::new();
        for (name, value) in headers {
            if is_stripped_header(name.as_str()) {
                continue;
            }
            if let Ok(v) = value.to_str() {
                out.insert(name.as_str(), v);
            }
        }
        out
    }
}

// ── Envelope ─────────────────────────────────────────────────────

/// Fields shared by every envelope kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Head {
    pub protocol: String,
    pub group: String,
    pub to_agent: String,
    pub from_agent: String,
    pub correlation_id: Uuid,
    /// Milliseconds since epoch; informational.
    pub timestamp: u64,
    /// Milliseconds; receivers drop envelopes older than `timestamp + ttl`.
    pub ttl: u64,
    #[serde(default, skip_serializing_if = "Headers::is_empty")]
    pub headers: Headers,
}

impl Head {
    pub fn new(group: &str, to_agent: &str, from_agent: &str, correlation_id: Uuid) -> Self {
        Self {
            protocol: PROTOCOL_VERSION.to_string(),
            group: group.to_string(),
            to_agent: to_agent.to_string(),
            from_agent: from_agent.to_string(),
            correlation_id,
            timestamp: now_millis(),
            ttl: DEFAULT_TTL_MS,
            headers: Headers::new(),
        }
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }
}

/// A wrapped A2A request travelling to the hosting proxy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    #[serde(flatten)]
    pub head: Head,
    /// Proxy awaiting the reply.
    pub from_proxy: String,
    pub method: String,
    /// Original path suffix (plus query string), forwarded verbatim.
    pub http_path: String,
    pub is_stream: bool,
    /// Opaque JSON-RPC body.
    pub payload: Value,
}

/// A non-stream reply travelling back to the requesting proxy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyEnvelope {
    #[serde(flatten)]
    pub head: Head,
    pub to_proxy: String,
    /// HTTP status carried side-channel; the ingress re-emits it.
    pub status: u16,
    /// Full JSON-RPC response object.
    pub payload: Value,
}

/// One SSE event of a stream reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamChunkEnvelope {
    #[serde(flatten)]
    pub head: Head,
    pub to_proxy: String,
    /// Dense ascending run starting at 0 within the correlation.
    pub sequence: u64,
    pub chunk: ChunkBody,
    pub meta: StreamMeta,
}

/// SSE fields copied from the upstream event.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkBody {
    pub data: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkType {
    Data,
    Event,
    Error,
    End,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamMeta {
    pub stream_id: Uuid,
    pub chunk_type: ChunkType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_event_id: Option<String>,
    /// True exactly once per stream, on the last envelope.
    #[serde(rename = "final", default)]
    pub is_final: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Envelope {
    Request(RequestEnvelope),
    Reply(ReplyEnvelope),
    StreamChunk(StreamChunkEnvelope),
}

impl Envelope {
    pub fn head(&self) -> &Head {
        match self {
            Self::Request(e) => &e.head,
            Self::Reply(e) => &e.head,
            Self::StreamChunk(e) => &e.head,
        }
    }

    pub fn correlation_id(&self) -> Uuid {
        self.head().correlation_id
    }

    pub fn group(&self) -> &str {
        &self.head().group
    }

    /// Proxy this envelope should be delivered to, when routed point-to-point.
    pub fn to_proxy(&self) -> Option<&str> {
        match self {
            Self::Request(_) => None,
            Self::Reply(e) => Some(&e.to_proxy),
            Self::StreamChunk(e) => Some(&e.to_proxy),
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Request(_) => "request",
            Self::Reply(_) => "reply",
            Self::StreamChunk(_) => "stream_chunk",
        }
    }

    /// A receiver older than `timestamp + ttl` must drop the envelope.
    pub fn expired(&self, now_ms: u64) -> bool {
        let head = self.head();
        now_ms > head.timestamp.saturating_add(head.ttl)
    }
}
