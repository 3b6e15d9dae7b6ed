//! Error taxonomy for proxy-originated failures.
//!
//! Every variant maps onto a JSON-RPC error code and an HTTP status; the
//! bus side of a call never throws into an HTTP handler; failures arrive
//! through the pending registry as one of these.

use axum::http::StatusCode;
use serde_json::Value;

use super::JsonRpcResponse;

/// JSON-RPC error code for "agent not found".
pub const CODE_AGENT_NOT_FOUND: i32 = -32001;
/// JSON-RPC error code for malformed or unroutable requests.
pub const CODE_INVALID_REQUEST: i32 = -32600;
/// JSON-RPC error code for operations the proxy does not support.
pub const CODE_UNSUPPORTED: i32 = -32004;
/// JSON-RPC internal-error code shared by transport-level failures.
pub const CODE_INTERNAL: i32 = -32603;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ProxyError {
    #[error("Agent not found")]
    AgentNotFound,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// The local agent took too long to answer a forwarded call.
    #[error("Agent timeout")]
    AgentTimeout,

    /// Connect refused, DNS failure, or other transport error reaching the agent.
    #[error("Agent unavailable")]
    AgentUnavailable,

    /// Publish gave up after the adapter's retry budget.
    #[error("Bus publish failed")]
    PublishFailed,

    /// No correlated reply arrived before the deadline.
    #[error("Request timeout")]
    RequestTimeout,

    #[error("Stream out-of-order window exceeded")]
    StreamWindowExceeded,

    #[error("Stream broken: {0}")]
    StreamBroken(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),
}

impl ProxyError {
    pub fn jsonrpc_code(&self) -> i32 {
        match self {
            Self::AgentNotFound => CODE_AGENT_NOT_FOUND,
            Self::InvalidRequest(_) => CODE_INVALID_REQUEST,
            Self::Unsupported(_) => CODE_UNSUPPORTED,
            _ => CODE_INTERNAL,
        }
    }

    pub fn http_status(&self) -> StatusCode {
        match self {
            Self::AgentNotFound => StatusCode::NOT_FOUND,
            Self::InvalidRequest(_) | Self::Unsupported(_) => StatusCode::BAD_REQUEST,
            Self::AgentTimeout | Self::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            Self::AgentUnavailable => StatusCode::BAD_GATEWAY,
            Self::PublishFailed => StatusCode::SERVICE_UNAVAILABLE,
            Self::StreamWindowExceeded | Self::StreamBroken(_) | Self::Cancelled(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Render as a JSON-RPC error response echoing the request id.
    pub fn to_jsonrpc(&self, id: Value) -> JsonRpcResponse {
        JsonRpcResponse::error(id, self.jsonrpc_code(), self.to_string())
    }
}
