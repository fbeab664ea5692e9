//! Reader and writer tasks bound to one connected gateway socket.
//!
//! Both tasks stop when the session's cancellation token fires. An
//! unsolicited close from the gateway, or a failed write, is terminal for
//! the session.

use super::connector::GatewaySocket;
use crate::session::{CloseReason, Session, SessionRegistry};
use clawapp_core::{decode_frame, Frame};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde_json::{json, Value};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Close code reported when the socket dropped without a close frame.
const ABNORMAL_CLOSURE: u16 = 1006;

/// Start the upstream tasks for an activated session.
pub fn spawn(
    socket: GatewaySocket,
    session: Arc<Session>,
    registry: Weak<SessionRegistry>,
    ping_every: Duration,
) {
    let (sink, stream) = socket.split();
    start(sink, stream, session, registry, ping_every);
}

fn start<S, R>(
    sink: S,
    stream: R,
    session: Arc<Session>,
    registry: Weak<SessionRegistry>,
    ping_every: Duration,
) where
    S: Sink<Message> + Unpin + Send + 'static,
    S::Error: fmt::Display,
    R: Stream<Item = Result<Message, WsError>> + Unpin + Send + 'static,
{
    let Some(outbound) = session.take_outbound() else {
        warn!(session_id = %session.id(), "outbound queue already taken, dropping socket");
        session.mark_link_down();
        return;
    };

    // Fired by the writer on a failed send so the reader tears the session down.
    let write_failed = CancellationToken::new();
    let cancel = session.cancel_token().clone();
    let writer_session = Arc::clone(&session);
    let writer_failed = write_failed.clone();
    tokio::spawn(async move {
        let result = write_loop(sink, outbound, cancel, ping_every).await;
        writer_session.mark_link_down();
        if let Err(e) = result {
            warn!(session_id = %writer_session.id(), error = %e, "upstream write failed");
            writer_failed.cancel();
        }
    });
    tokio::spawn(read_loop(stream, session, registry, write_failed));
}

async fn write_loop<S>(
    mut sink: S,
    mut outbound: mpsc::UnboundedReceiver<String>,
    cancel: CancellationToken,
    ping_every: Duration,
) -> Result<(), String>
where
    S: Sink<Message> + Unpin,
    S::Error: fmt::Display,
{
    let mut ping = tokio::time::interval_at(tokio::time::Instant::now() + ping_every, ping_every);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                return Ok(());
            }
            next = outbound.recv() => {
                let Some(text) = next else { return Ok(()) };
                sink.send(Message::Text(text)).await.map_err(|e| e.to_string())?;
            }
            _ = ping.tick() => {
                sink.send(Message::Ping(Vec::new())).await.map_err(|e| format!("ping: {e}"))?;
            }
        }
    }
}

async fn read_loop<R>(
    mut stream: R,
    session: Arc<Session>,
    registry: Weak<SessionRegistry>,
    write_failed: CancellationToken,
) where
    R: Stream<Item = Result<Message, WsError>> + Unpin,
{
    let cancel = session.cancel_token().clone();

    let (message, code) = loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return,
            _ = write_failed.cancelled() => {
                break ("gateway connection error: write failed".to_string(), ABNORMAL_CLOSURE);
            }
            next = stream.next() => next,
        };
        match next {
            Some(Ok(Message::Text(text))) => {
                session.touch();
                dispatch(&session, &text);
            }
            Some(Ok(Message::Close(frame))) => {
                let code = frame.as_ref().map(|f| u16::from(f.code)).unwrap_or(1005);
                break ("gateway connection closed".to_string(), code);
            }
            Some(Ok(_)) => session.touch(),
            Some(Err(e)) => break (format!("gateway connection error: {e}"), ABNORMAL_CLOSURE),
            None => break ("gateway connection closed".to_string(), ABNORMAL_CLOSURE),
        }
    };

    session.mark_link_down();
    if cancel.is_cancelled() {
        return;
    }

    warn!(session_id = %session.id(), code, "upstream disconnected");
    session.emit("proxy.disconnect", json!({ "message": message, "code": code }));
    match registry.upgrade() {
        Some(registry) => {
            registry.cleanup(session.id(), CloseReason::UpstreamClosed).await;
        }
        None => {
            session.close(CloseReason::UpstreamClosed);
        }
    }
}

/// Route one inbound text frame.
fn dispatch(session: &Session, text: &str) {
    match decode_frame(text) {
        Ok(Frame::Res(res)) => {
            let id = res.id.clone();
            if !session.resolve(res) {
                debug!(session_id = %session.id(), %id, "unmatched upstream response");
            }
        }
        Ok(Frame::Event(_)) => match serde_json::from_str::<Value>(text) {
            Ok(raw) => {
                session.emit("message", raw);
            }
            Err(e) => debug!(error = %e, "dropping upstream event"),
        },
        Ok(Frame::Req(req)) => {
            info!(session_id = %session.id(), method = %req.method, "ignoring request from gateway");
        }
        Err(e) => debug!(session_id = %session.id(), error = %e, "dropping malformed upstream frame"),
    }
}
