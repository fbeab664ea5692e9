//! Typed envelopes exchanged with the gateway.
//!
//! Every frame is a JSON object tagged by `type`: `req`, `res` or `event`.
//! Method names and payloads are opaque to the bridge and carried as
//! [`serde_json::Value`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Name of the event the gateway sends to open the handshake.
pub const CHALLENGE_EVENT: &str = "connect.challenge";

/// A gateway frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    #[serde(rename = "req")]
    Req(RequestFrame),
    #[serde(rename = "res")]
    Res(ResponseFrame),
    #[serde(rename = "event")]
    Event(EventFrame),
}

/// An RPC request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    pub id: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

/// The reply to a [`RequestFrame`], matched by `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub id: String,
    #[serde(default)]
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorShape>,
}

impl ResponseFrame {
    /// Successful response carrying `payload`.
    pub fn success(id: impl Into<String>, payload: Value) -> Self {
        Self {
            id: id.into(),
            ok: true,
            payload: Some(payload),
            error: None,
        }
    }

    /// Failed response carrying an error message.
    pub fn failure(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ok: false,
            payload: None,
            error: Some(ErrorShape::Detailed {
                code: None,
                message: Some(message.into()),
            }),
        }
    }

    /// A response only counts as success when `ok` is set and no error is attached.
    pub fn is_success(&self) -> bool {
        self.ok && self.error.is_none()
    }

    /// Human-readable failure reason: message, else code, else `fallback`.
    pub fn error_message(&self, fallback: &str) -> String {
        match &self.error {
            Some(ErrorShape::Detailed { message: Some(m), .. }) => m.clone(),
            Some(ErrorShape::Detailed { code: Some(c), .. }) => c.clone(),
            Some(ErrorShape::Text(t)) => t.clone(),
            _ => fallback.to_string(),
        }
    }
}

/// Error object attached to a failed response.
///
/// Gateways normally send `{code, message}`; a bare string is accepted too.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ErrorShape {
    Detailed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Text(String),
}

/// A server-pushed event.
///
/// Fields the bridge does not know about are kept in `extra` so the frame
/// can be forwarded to clients unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventFrame {
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl EventFrame {
    pub fn new(event: impl Into<String>, payload: Value) -> Self {
        Self {
            event: event.into(),
            payload,
            seq: None,
            extra: Map::new(),
        }
    }

    /// Nonce carried by a `connect.challenge` event, if this is one.
    pub fn challenge_nonce(&self) -> Option<String> {
        if self.event != CHALLENGE_EVENT {
            return None;
        }
        Some(
            self.payload
                .get("nonce")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        )
    }
}
