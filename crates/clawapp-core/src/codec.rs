//! JSON text framing for the gateway socket.
//!
//! One WebSocket text message carries exactly one [`Frame`].

use crate::error::{ClawError, ClawResult};
use crate::frames::Frame;
use serde::Serialize;

/// Encode a frame (or any serializable envelope) as a JSON text message.
pub fn encode_frame<T: Serialize>(value: &T) -> ClawResult<String> {
    Ok(serde_json::to_string(value)?)
}

/// Decode one inbound text message.
///
/// Anything that is not valid JSON or lacks a known `type` is reported as
/// [`ClawError::MalformedFrame`]; callers drop such frames.
pub fn decode_frame(text: &str) -> ClawResult<Frame> {
    serde_json::from_str(text).map_err(|e| ClawError::MalformedFrame(e.to_string()))
}
