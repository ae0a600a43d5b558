//! Gateway wire protocol: frame shapes, error codes, scopes and constants.
//!
//! Every WebSocket text frame is a JSON object tagged by `type`:
//! - `connect`: first frame from a client or node (identity + auth)
//! - `req`: RPC request `{id, method, params}`
//! - `res`: RPC response `{id, ok, payload | error}`
//! - `event`: server push `{event, payload, seq}`, never request-correlated
//!
//! Bridge nodes use the same shapes in the opposite direction: the gateway
//! sends `req` frames to a node and the node answers with `res`.

use serde::{Deserialize, Serialize};

pub const PROTOCOL_VERSION: u32 = 3;

/// Idempotency window for `chat.send` / `agent` keys.
pub const DEDUPE_TTL_MS: u64 = 5 * 60 * 1000;
pub const DEDUPE_MAX_ENTRIES: usize = 1000;

/// Default timeout for gateway → node requests.
pub const NODE_REQUEST_TIMEOUT_MS: u64 = 30_000;

/// Frames larger than this are rejected before parsing.
pub const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

pub mod error_codes {
    pub const INVALID_REQUEST: &str = "INVALID_REQUEST";
    pub const UNAUTHORIZED: &str = "UNAUTHORIZED";
    pub const FORBIDDEN: &str = "FORBIDDEN";
    pub const NOT_FOUND: &str = "NOT_FOUND";
    pub const SEND_BLOCKED: &str = "SEND_BLOCKED";
    pub const TOOL_ERROR: &str = "TOOL_ERROR";
    pub const TIMEOUT: &str = "TIMEOUT";
    pub const INTERNAL: &str = "INTERNAL";
}

pub mod scopes {
    pub const ADMIN: &str = "operator.admin";
    pub const READ: &str = "operator.read";
    pub const WRITE: &str = "operator.write";
}

pub mod roles {
    pub const OPERATOR: &str = "operator";
    pub const NODE: &str = "node";
}

// ── Errors ───────────────────────────────────────────────────────────────────

/// Error payload carried by failed responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct ErrorShape {
    pub code: String,
    pub message: String,
}

impl ErrorShape {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(error_codes::INVALID_REQUEST, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(error_codes::UNAUTHORIZED, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(error_codes::FORBIDDEN, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(error_codes::NOT_FOUND, message)
    }

    pub fn send_blocked(message: impl Into<String>) -> Self {
        Self::new(error_codes::SEND_BLOCKED, message)
    }

    pub fn tool_error(message: impl Into<String>) -> Self {
        Self::new(error_codes::TOOL_ERROR, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(error_codes::TIMEOUT, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(error_codes::INTERNAL, message)
    }

    pub fn is(&self, code: &str) -> bool {
        self.code == code
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("frame exceeds {max} bytes")]
    TooLarge { max: usize },
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

// ── Frames ───────────────────────────────────────────────────────────────────

/// Client identity sent in the connect handshake.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub id: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub platform: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectAuth {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// Payload of the `connect` frame.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    /// Optional correlation id echoed in the handshake response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_protocol: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_protocol: Option<u32>,
    pub client: ClientInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scopes: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<ConnectAuth>,
}

impl ConnectParams {
    pub fn role(&self) -> &str {
        self.role.as_deref().unwrap_or(roles::OPERATOR)
    }

    /// Whether the client's advertised protocol range includes ours.
    pub fn supports_protocol(&self, version: u32) -> bool {
        let min = self.min_protocol.unwrap_or(1);
        let max = self.max_protocol.unwrap_or(u32::MAX);
        (min..=max).contains(&version)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestFrame {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub id: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorShape>,
}

impl ResponseFrame {
    pub fn ok(id: &str, payload: serde_json::Value) -> Self {
        Self {
            id: id.to_string(),
            ok: true,
            payload: Some(payload),
            error: None,
        }
    }

    pub fn err(id: &str, error: ErrorShape) -> Self {
        Self {
            id: id.to_string(),
            ok: false,
            payload: None,
            error: Some(error),
        }
    }

    /// Collapse into a `Result` (used for bridge responses).
    pub fn into_result(self) -> Result<serde_json::Value, ErrorShape> {
        if self.ok {
            Ok(self.payload.unwrap_or(serde_json::Value::Null))
        } else {
            Err(self
                .error
                .unwrap_or_else(|| ErrorShape::internal("response without error body")))
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventFrame {
    pub event: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
}

impl EventFrame {
    pub fn new(event: impl Into<String>, payload: serde_json::Value, seq: u64) -> Self {
        Self {
            event: event.into(),
            payload,
            seq: Some(seq),
        }
    }
}

/// Any frame on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Frame {
    Connect(ConnectParams),
    Req(RequestFrame),
    Res(ResponseFrame),
    Event(EventFrame),
}

impl Frame {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        if text.len() > MAX_FRAME_BYTES {
            return Err(ProtocolError::TooLarge {
                max: MAX_FRAME_BYTES,
            });
        }
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_text(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

impl From<ResponseFrame> for Frame {
    fn from(res: ResponseFrame) -> Self {
        Self::Res(res)
    }
}

impl From<EventFrame> for Frame {
    fn from(ev: EventFrame) -> Self {
        Self::Event(ev)
    }
}

impl From<RequestFrame> for Frame {
    fn from(req: RequestFrame) -> Self {
        Self::Req(req)
    }
}

/// Payload of a successful connect response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloOk {
    #[serde(rename = "type")]
    pub kind: String,
    pub protocol: u32,
    pub server: ServerInfo,
    pub methods: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    pub version: String,
    pub host: String,
    pub conn_id: String,
}
