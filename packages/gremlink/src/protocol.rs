//! Wire protocol types and frame codec.
//!
//! Outbound frames are binary: a one-byte MIME-type length, the MIME-type
//! string, then the UTF-8 JSON payload. Inbound frames are plain JSON
//! response envelopes carrying a numeric status code, optional attributes
//! (request charge) and an optional result payload.

use std::collections::HashMap;

use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{GremlinError, Result};

/// MIME type carried in the outbound frame header.
pub const FRAME_MIME_TYPE: &str = "application/json";

/// Language tag sent with every eval request.
pub const QUERY_LANGUAGE: &str = "gremlin-groovy";

/// Response attribute holding the request charge for one frame.
pub const REQUEST_CHARGE_ATTRIBUTE: &str = "x-ms-total-request-charge";

/// Server status codes driving the response dispatch.
pub mod status {
    /// Terminal success with content.
    pub const SUCCESS: u16 = 200;
    /// Terminal success, no content.
    pub const NO_CONTENT: u16 = 204;
    /// Partial content; more frames follow for the same request.
    pub const PARTIAL_CONTENT: u16 = 206;
    /// Authentication challenge; answer with a SASL token.
    pub const AUTHENTICATE: u16 = 407;

    pub const UNAUTHORIZED: u16 = 401;
    pub const MALFORMED_REQUEST: u16 = 498;
    pub const SERVER_ERROR: u16 = 500;
    pub const SCRIPT_EVALUATION_ERROR: u16 = 597;
    pub const SERVER_TIMEOUT: u16 = 598;
    pub const SERIALIZATION_ERROR: u16 = 599;
}

// ============================================================================
// Outbound messages
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Eval,
    Authentication,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum RequestArgs {
    #[serde(rename_all = "camelCase")]
    Eval {
        query: String,
        bindings: HashMap<String, Value>,
        language: String,
    },
    #[serde(rename_all = "camelCase")]
    Authentication { sasl_token: String },
}

/// Outbound request envelope. Immutable once built; the request id is the
/// correlation key for every response frame the server sends back.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GremlinRequestMessage {
    pub request_id: Uuid,
    pub operation: Operation,
    pub processor_name: String,
    pub args: RequestArgs,
}

impl GremlinRequestMessage {
    /// Build an eval request for `query` under a fresh v4 request id.
    pub fn eval(query: &str) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            operation: Operation::Eval,
            processor_name: String::new(),
            args: RequestArgs::Eval {
                query: query.to_string(),
                bindings: HashMap::new(),
                language: QUERY_LANGUAGE.to_string(),
            },
        }
    }

    /// Build the answer to an authentication challenge. The challenged
    /// request's id and processor name are reused so the server resumes the
    /// original operation once the token is accepted.
    pub fn authentication(challenged: &GremlinRequestMessage, username: &str, password: &str) -> Self {
        Self {
            request_id: challenged.request_id,
            operation: Operation::Authentication,
            processor_name: challenged.processor_name.clone(),
            args: RequestArgs::Authentication {
                sasl_token: sasl_plain_token(username, password),
            },
        }
    }
}

/// SASL PLAIN token: `base64(NUL username NUL password)`.
pub fn sasl_plain_token(username: &str, password: &str) -> String {
    let mut raw = Vec::with_capacity(username.len() + password.len() + 2);
    raw.push(0);
    raw.extend_from_slice(username.as_bytes());
    raw.push(0);
    raw.extend_from_slice(password.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(raw)
}

// ============================================================================
// Inbound messages
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GremlinResponse {
    /// Echoed request id. Absent on some transport-level failures.
    #[serde(default)]
    pub request_id: Option<String>,
    pub status: ResponseStatus,
    #[serde(default)]
    pub result: Option<ResponseResult>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseStatus {
    pub code: u16,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub attributes: HashMap<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResponseResult {
    /// Untyped result payload; its shape depends on the query.
    #[serde(default)]
    pub data: Value,
}

impl GremlinResponse {
    /// Parsed request id, if present and well formed.
    pub fn request_id(&self) -> Option<Uuid> {
        self.request_id
            .as_deref()
            .and_then(|raw| Uuid::parse_str(raw).ok())
    }

    pub fn status_message(&self) -> &str {
        self.status.message.as_deref().unwrap_or("")
    }

    /// Raw request charge attribute carried by this frame, if any.
    pub fn request_charge(&self) -> Option<&Value> {
        self.status.attributes.get(REQUEST_CHARGE_ATTRIBUTE)
    }
}

// ============================================================================
// Frame codec
// ============================================================================

/// Encode a request into a binary frame:
/// `[1-byte MIME length][MIME bytes][UTF-8 JSON payload]`.
pub fn encode_frame(message: &GremlinRequestMessage) -> Result<Vec<u8>> {
    let payload =
        serde_json::to_vec(message).map_err(|err| GremlinError::Serialization(err.to_string()))?;
    let mut frame = Vec::with_capacity(1 + FRAME_MIME_TYPE.len() + payload.len());
    frame.push(FRAME_MIME_TYPE.len() as u8);
    frame.extend_from_slice(FRAME_MIME_TYPE.as_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Outcome of decoding one inbound payload.
#[derive(Debug)]
pub enum DecodedFrame {
    Response(Box<GremlinResponse>),
    /// Zero-length payload. Informational, not an error.
    Empty,
}

/// Decode an inbound payload. The server sends binary frames; text frames
/// are accepted defensively and treated the same way.
pub fn decode_frame(payload: &[u8]) -> Result<DecodedFrame> {
    if payload.is_empty() {
        return Ok(DecodedFrame::Empty);
    }
    match serde_json::from_slice::<GremlinResponse>(payload) {
        Ok(response) => Ok(DecodedFrame::Response(Box::new(response))),
        Err(err) => Err(GremlinError::Decode(err.to_string())),
    }
}

/// Extract a numeric request charge from a wire attribute. The server is
/// expected to send numbers but numeric strings show up in practice.
pub fn parse_request_charge(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    }
}
