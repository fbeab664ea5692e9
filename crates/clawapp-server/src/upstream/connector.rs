//! Opens one authenticated gateway socket per session.
//!
//! Each attempt is a single structured async operation: dial, wait briefly
//! for `connect.challenge`, send the signed `connect` request, then wait for
//! its response. Attempts are retried with a fixed delay.

use crate::config::Timings;
use crate::error::{BridgeError, BridgeResult};
use crate::session::Session;
use clawapp_core::{
    build_connect_frame, decode_frame, encode_frame, ClientDescriptor, DeviceIdentity, Frame,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::ORIGIN;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

pub type GatewaySocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// An upstream socket that completed the handshake.
pub struct Handshaken {
    pub socket: GatewaySocket,
    pub hello: Value,
}

pub struct UpstreamConnector {
    url: String,
    token: String,
    identity: Arc<DeviceIdentity>,
    client: ClientDescriptor,
    timings: Timings,
}

impl UpstreamConnector {
    pub fn new(url: String, token: String, identity: Arc<DeviceIdentity>, timings: Timings) -> Self {
        Self {
            url,
            token,
            identity,
            client: ClientDescriptor::default(),
            timings,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn timings(&self) -> &Timings {
        &self.timings
    }

    /// Connect and handshake on behalf of `session`, retrying on failure.
    ///
    /// The session moves to `Connecting` for every attempt. Closing the
    /// session aborts the loop with `SessionClosed`.
    pub async fn connect(&self, session: &Session) -> BridgeResult<Handshaken> {
        let attempts = self.timings.retry_count.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            session.begin_attempt()?;
            debug!(session_id = %session.id(), attempt, url = %self.url, "connecting to gateway");

            let outcome = tokio::select! {
                _ = session.cancel_token().cancelled() => return Err(BridgeError::SessionClosed),
                r = tokio::time::timeout(self.timings.connect_timeout, self.attempt()) => r,
            };

            match outcome {
                Ok(Ok(handshaken)) => {
                    info!(session_id = %session.id(), attempt, "gateway handshake complete");
                    return Ok(handshaken);
                }
                Ok(Err(e)) => {
                    warn!(session_id = %session.id(), attempt, error = %e, "gateway connect attempt failed");
                    last_error = match e {
                        BridgeError::HandshakeFailure(reason) => reason,
                        other => other.to_string(),
                    };
                }
                Err(_) => {
                    warn!(session_id = %session.id(), attempt, "gateway connect attempt timed out");
                    last_error = "gateway connect timed out".to_string();
                }
            }

            if attempt < attempts {
                tokio::select! {
                    _ = session.cancel_token().cancelled() => return Err(BridgeError::SessionClosed),
                    _ = tokio::time::sleep(self.timings.retry_delay) => {}
                }
            }
        }

        Err(BridgeError::HandshakeFailure(last_error))
    }

    async fn attempt(&self) -> BridgeResult<Handshaken> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| BridgeError::HandshakeFailure(format!("invalid gateway url: {e}")))?;
        if let Ok(origin) = HeaderValue::from_str(&origin_for(&self.url)) {
            request.headers_mut().insert(ORIGIN, origin);
        }

        let (mut socket, _response) = connect_async(request)
            .await
            .map_err(|e| BridgeError::HandshakeFailure(format!("gateway unreachable: {e}")))?;

        let nonce = match tokio::time::timeout(self.timings.challenge_grace, wait_for_challenge(&mut socket)).await {
            Ok(nonce) => nonce?,
            Err(_) => {
                debug!("no connect.challenge received, sending connect without nonce");
                String::new()
            }
        };

        let frame = build_connect_frame(&self.identity, &self.client, &self.token, &nonce, now_ms());
        let connect_id = frame.id.clone();
        let text = encode_frame(&Frame::Req(frame))?;
        socket
            .send(Message::Text(text))
            .await
            .map_err(|e| BridgeError::HandshakeFailure(format!("failed to send connect: {e}")))?;

        let hello = wait_for_response(&mut socket, &connect_id).await?;
        Ok(Handshaken { socket, hello })
    }
}

/// Read frames until the challenge arrives. Other frames are ignored.
async fn wait_for_challenge(socket: &mut GatewaySocket) -> BridgeResult<String> {
    loop {
        let Some(text) = next_text(socket).await? else {
            continue;
        };
        if let Ok(Frame::Event(event)) = decode_frame(&text) {
            if let Some(nonce) = event.challenge_nonce() {
                debug!("received connect.challenge");
                return Ok(nonce);
            }
        }
    }
}

/// Read frames until the `res` matching `connect_id`, returning its payload.
async fn wait_for_response(socket: &mut GatewaySocket, connect_id: &str) -> BridgeResult<Value> {
    loop {
        let Some(text) = next_text(socket).await? else {
            continue;
        };
        match decode_frame(&text) {
            Ok(Frame::Res(res)) if res.id == connect_id => {
                if res.is_success() {
                    return Ok(res.payload.unwrap_or(Value::Null));
                }
                return Err(BridgeError::HandshakeFailure(
                    res.error_message("gateway rejected connect"),
                ));
            }
            Ok(_) => {}
            Err(e) => debug!(error = %e, "dropping malformed frame during handshake"),
        }
    }
}

/// Next text message; `None` for control or binary messages.
async fn next_text(socket: &mut GatewaySocket) -> BridgeResult<Option<String>> {
    match socket.next().await {
        Some(Ok(Message::Text(text))) => Ok(Some(text)),
        Some(Ok(Message::Close(frame))) => Err(BridgeError::HandshakeFailure(match frame {
            Some(f) => format!("gateway closed connection: {} {}", u16::from(f.code), f.reason),
            None => "gateway closed connection".to_string(),
        })),
        Some(Ok(_)) => Ok(None),
        Some(Err(e)) => Err(BridgeError::HandshakeFailure(format!("gateway socket error: {e}"))),
        None => Err(BridgeError::HandshakeFailure("gateway closed connection".to_string())),
    }
}

/// `ws://` becomes `http://` and `wss://` becomes `https://`.
pub fn origin_for(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("wss://") {
        format!("https://{rest}")
    } else if let Some(rest) = url.strip_prefix("ws://") {
        format!("http://{rest}")
    } else {
        url.to_string()
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
