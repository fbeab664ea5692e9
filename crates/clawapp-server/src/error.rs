//! Bridge error type and its HTTP mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use clawapp_core::ClawError;
use serde_json::json;
use thiserror::Error;

/// Errors surfaced by sessions, the registry and the HTTP layer.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("authentication failed: invalid token")]
    AuthenticationFailure,

    #[error("gateway handshake failed: {0}")]
    HandshakeFailure(String),

    #[error("session not found")]
    SessionNotFound,

    #[error("session not ready")]
    SessionNotReady,

    #[error("upstream connection unavailable")]
    UpstreamUnavailable,

    #[error("request timed out")]
    RequestTimeout,

    #[error("session closed")]
    SessionClosed,

    /// RPC error reported by the gateway.
    #[error("{0}")]
    Upstream(String),

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("session capacity reached ({0})")]
    Capacity(usize),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Core(ClawError),
}

pub type BridgeResult<T> = Result<T, BridgeError>;

impl From<ClawError> for BridgeError {
    fn from(e: ClawError) -> Self {
        match e {
            ClawError::MalformedFrame(msg) => BridgeError::MalformedFrame(msg),
            other => BridgeError::Core(other),
        }
    }
}

impl BridgeError {
    pub fn status(&self) -> StatusCode {
        match self {
            BridgeError::AuthenticationFailure => StatusCode::UNAUTHORIZED,
            BridgeError::HandshakeFailure(_) | BridgeError::UpstreamUnavailable => {
                StatusCode::BAD_GATEWAY
            }
            BridgeError::SessionNotFound => StatusCode::NOT_FOUND,
            BridgeError::SessionNotReady
            | BridgeError::MalformedFrame(_)
            | BridgeError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            BridgeError::Capacity(_) => StatusCode::SERVICE_UNAVAILABLE,
            BridgeError::RequestTimeout
            | BridgeError::SessionClosed
            | BridgeError::Upstream(_)
            | BridgeError::Config(_)
            | BridgeError::Io(_)
            | BridgeError::Core(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for BridgeError {
    fn into_response(self) -> Response {
        let status = self.status();
        (status, Json(json!({ "ok": false, "error": self.to_string() }))).into_response()
    }
}
