//! Client-facing transports: HTTP + SSE, and a WebSocket alternative.

pub mod http;
pub mod websocket;

pub use http::{router, AppState, HealthInfo};
