//! Egress formatting: chunk envelopes back into standard SSE frames.

use axum::response::sse::Event;
use std::time::Duration;

use crate::bus::envelope::{ChunkType, StreamChunkEnvelope};
use crate::protocol::error::ProxyError;
use crate::protocol::JsonRpcError;

/// Render a chunk as an SSE event. `end` chunks produce no bytes; the
/// caller closes the response instead.
pub fn chunk_to_event(chunk: &StreamChunkEnvelope) -> Option<Event> {
    match chunk.meta.chunk_type {
        ChunkType::End => None,
        ChunkType::Error => {
            Some(apply_fields(Event::default().event("error"), chunk))
        }
        ChunkType::Data | ChunkType::Event => {
            let mut event = Event::default();
            if let Some(name) = chunk
                .meta
                .event_name
                .as_deref()
                .or(chunk.chunk.event.as_deref())
            {
                event = event.event(name);
            }
            Some(apply_fields(event, chunk))
        }
    }
}

fn apply_fields(mut event: Event, chunk: &StreamChunkEnvelope) -> Event {
    if let Some(id) = chunk
        .meta
        .last_event_id
        .as_deref()
        .or(chunk.chunk.id.as_deref())
    {
        event = event.id(id);
    }
    if let Some(retry) = chunk.meta.retry.or(chunk.chunk.retry) {
        event = event.retry(Duration::from_millis(retry));
    }
    event.data(&chunk.chunk.data)
}

/// Render a proxy-side stream failure as a terminal `error` event carrying
/// the JSON-RPC error object.
pub fn error_event(err: &ProxyError) -> Event {
    let body = JsonRpcError {
        code: err.jsonrpc_code(),
        message: err.to_string(),
        data: None,
    };
    let data = serde_json::to_string(&body)
        .unwrap_or_else(|_| r#"{"code":-32603,"message":"Internal error"}"#.to_string());
    Event::default().event("error").data(data)
}
