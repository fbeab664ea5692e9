//! WebSocket alternative to HTTP + SSE.
//!
//! One socket per session: `proxy.connected`, then `proxy.ready` (or
//! `proxy.error`), then client `req` frames answered with `res` frames while
//! events stream down as `event` frames. Closing the socket disconnects.

use super::http::AppState;
use crate::session::{Established, SessionRegistry, SinkItem};
use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use clawapp_core::{decode_frame, encode_frame, Frame, ResponseFrame};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Default, Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
) -> Response {
    ws.on_upgrade(move |socket| serve_client(socket, state.registry, query.token))
}

type ClientSink = SplitSink<WebSocket, Message>;

fn notice(event: &str, payload: Value) -> String {
    json!({ "type": "event", "event": event, "payload": payload }).to_string()
}

async fn send_text(tx: &mut ClientSink, text: String) -> bool {
    tx.send(Message::Text(text.into())).await.is_ok()
}

async fn serve_client(socket: WebSocket, registry: Arc<SessionRegistry>, token: Option<String>) {
    let (mut tx, mut rx) = socket.split();

    if !send_text(&mut tx, notice("proxy.connected", json!({}))).await {
        return;
    }

    let Established { sid, hello, snapshot, session_key } =
        match registry.establish(token.as_deref()).await {
            Ok(est) => est,
            Err(e) => {
                warn!(error = %e, "websocket session establishment failed");
                let _ = send_text(&mut tx, notice("proxy.error", json!({ "message": e.to_string() }))).await;
                let _ = tx.send(Message::Close(None)).await;
                return;
            }
        };

    let mut sink = match registry.attach(&sid, None).await {
        Ok(sink) => sink,
        Err(e) => {
            let _ = send_text(&mut tx, notice("proxy.error", json!({ "message": e.to_string() }))).await;
            registry.disconnect(&sid).await;
            return;
        }
    };

    let ready = notice(
        "proxy.ready",
        json!({ "sid": sid, "hello": hello, "snapshot": snapshot, "sessionKey": session_key }),
    );
    if !send_text(&mut tx, ready).await {
        registry.disconnect(&sid).await;
        return;
    }
    info!(session_id = %sid, "websocket client attached");

    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<String>();

    loop {
        tokio::select! {
            item = sink.next() => {
                let text = match item {
                    // Upstream frames are forwarded as received.
                    Some(SinkItem::Event(e)) if e.name == "message" => e.payload.to_string(),
                    Some(SinkItem::Event(e)) => notice(&e.name, e.payload.clone()),
                    Some(SinkItem::Notice { .. }) => continue,
                    Some(SinkItem::Heartbeat) => {
                        if tx.send(Message::Ping(Bytes::new())).await.is_err() {
                            break;
                        }
                        continue;
                    }
                    None => break,
                };
                if !send_text(&mut tx, text).await {
                    break;
                }
            }
            msg = rx.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    handle_client_frame(text.as_str(), &sid, &registry, &reply_tx);
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            Some(text) = reply_rx.recv() => {
                if !send_text(&mut tx, text).await {
                    break;
                }
            }
        }
    }

    drop(sink);
    if registry.disconnect(&sid).await {
        info!(session_id = %sid, "websocket client gone, session closed");
    }
}

/// Forward one client `req` upstream; the answer arrives on `replies`.
fn handle_client_frame(
    text: &str,
    sid: &str,
    registry: &Arc<SessionRegistry>,
    replies: &mpsc::UnboundedSender<String>,
) {
    let req = match decode_frame(text) {
        Ok(Frame::Req(req)) => req,
        Ok(_) => {
            debug!(session_id = %sid, "ignoring non-request frame from client");
            return;
        }
        Err(e) => {
            debug!(session_id = %sid, error = %e, "dropping malformed client frame");
            return;
        }
    };

    let registry = Arc::clone(registry);
    let sid = sid.to_string();
    let replies = replies.clone();
    tokio::spawn(async move {
        let response = match registry.send(&sid, req.method, req.params).await {
            Ok(payload) => ResponseFrame::success(req.id, payload),
            Err(e) => ResponseFrame::failure(req.id, e.to_string()),
        };
        match encode_frame(&Frame::Res(response)) {
            Ok(text) => {
                let _ = replies.send(text);
            }
            Err(e) => warn!(error = %e, "failed to encode response"),
        }
    });
}
