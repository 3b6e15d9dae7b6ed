//! A2A protocol surface: JSON-RPC 2.0 types and shared constants.
//!
//! The proxy never interprets JSON-RPC payloads beyond what is needed to
//! echo the request `id` back in error responses; these types exist for
//! the envelope boundary and for the errors the proxy itself originates.

pub mod error;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Wire-format version tag carried by every envelope.
pub const PROTOCOL_VERSION: &str = "a2a-jsonrpc-sse/1.0";

/// JSON-RPC version string.
pub const JSONRPC_VERSION: &str = "2.0";

/// Data payload some agents emit as their terminal stream marker.
pub const DONE_SENTINEL: &str = "[DONE]";

/// Well-known agent card path.
pub const AGENT_CARD_PATH: &str = "/.well-known/agent.json";

/// JSON-RPC 2.0 request, parsed only when the proxy needs the `id`.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// JSON-RPC 2.0 response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Value, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }
}

/// Extract the `id` field of a JSON-RPC request body, `null` when absent.
///
/// Error responses must echo the original id even for bodies the proxy
/// otherwise treats as opaque.
pub fn request_id(payload: &Value) -> Value {
    payload.get("id").cloned().unwrap_or(Value::Null)
}
