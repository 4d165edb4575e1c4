//! Wire-protocol adapters.
//!
//! Each adapter decodes one protocol's request body into the canonical
//! [`Request`], and encodes canonical responses and chunks back into that
//! protocol. All translation functions are pure (no I/O).

pub mod anthropic;
pub mod anthropic_types;
pub mod chat;
pub mod chat_types;
pub mod responses;
pub mod responses_types;

use crate::canonical::{Request, Response};
use crate::error::{GatewayError, Result};
use crate::sse::FrameEncoder;

use axum::http::HeaderMap;
use serde::Serialize;

/// Decode/encode contract every wire protocol satisfies.
pub trait ProtocolAdapter: Send + Sync + 'static {
    /// Wire document returned for a non-streaming request.
    type Response: Serialize;
    /// Per-request encoder for the streaming path.
    type Encoder: FrameEncoder;

    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Header checks that run before the body is decoded.
    fn check_headers(&self, _headers: &HeaderMap) -> Result<()> {
        Ok(())
    }

    /// Parse a raw request body. Fails with `MalformedRequest`.
    fn decode(&self, body: &[u8]) -> Result<Request>;

    fn encode(&self, response: Response) -> Self::Response;

    fn stream_encoder(&self, request: &Request) -> Self::Encoder;

    /// Error document in this protocol's shape.
    fn error_body(&self, error: &GatewayError) -> serde_json::Value;
}

/// Fold system/developer texts into one instruction string, in document order.
pub(crate) fn join_instructions(parts: Vec<String>) -> Option<String> {
    let parts: Vec<String> = parts.into_iter().filter(|p| !p.is_empty()).collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n\n"))
    }
}

/// Parse a body as JSON, mapping failures to `MalformedRequest`.
pub(crate) fn parse_body<T: serde::de::DeserializeOwned>(body: &[u8], what: &str) -> Result<T> {
    serde_json::from_slice(body).map_err(|e| GatewayError::malformed(format!("Invalid {what}: {e}")))
}

pub(crate) fn require_model(model: &str) -> Result<()> {
    if model.trim().is_empty() {
        return Err(GatewayError::malformed("model is required"));
    }
    Ok(())
}

/// Schema used when a tool definition omits its parameters.
pub(crate) fn empty_object_schema() -> serde_json::Value {
    serde_json::json!({ "type": "object", "properties": {} })
}
