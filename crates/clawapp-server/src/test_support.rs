//! Loopback gateway used by the async tests.
//!
//! Speaks just enough of the gateway protocol: optional challenge, connect
//! response, and a handful of test methods (`echo`, `fail`, `never`,
//! `delay`, `emit`, `drop`).

use crate::auth::ClientAuth;
use crate::config::Timings;
use crate::session::SessionRegistry;
use crate::upstream::UpstreamConnector;
use clawapp_core::DeviceIdentity;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;

#[derive(Debug, Clone)]
pub struct GatewayOptions {
    pub send_challenge: bool,
    pub reject_connect: bool,
    pub hello: Value,
}

impl Default for GatewayOptions {
    fn default() -> Self {
        Self {
            send_challenge: true,
            reject_connect: false,
            hello: json!({
                "type": "hello-ok",
                "protocol": 3,
                "snapshot": { "sessionDefaults": { "defaultAgentId": "main" } },
            }),
        }
    }
}

enum Control {
    Send(String),
    Close,
}

#[derive(Default)]
struct Recorded {
    connect_params: Vec<Value>,
    origins: Vec<String>,
    connections: Vec<mpsc::UnboundedSender<Control>>,
}

pub struct FakeGateway {
    addr: SocketAddr,
    recorded: Arc<Mutex<Recorded>>,
}

impl FakeGateway {
    pub async fn start(options: GatewayOptions) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let recorded = Arc::new(Mutex::new(Recorded::default()));

        let shared = Arc::clone(&recorded);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve(stream, options.clone(), Arc::clone(&shared)));
            }
        });

        Self { addr, recorded }
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub async fn connect_params(&self) -> Vec<Value> {
        self.recorded.lock().unwrap().connect_params.clone()
    }

    pub async fn origins(&self) -> Vec<String> {
        self.recorded.lock().unwrap().origins.clone()
    }

    /// Send an event frame on every open connection.
    pub async fn push_event(&self, name: &str, payload: Value) {
        let text = json!({ "type": "event", "event": name, "payload": payload }).to_string();
        for conn in &self.recorded.lock().unwrap().connections {
            let _ = conn.send(Control::Send(text.clone()));
        }
    }

    /// Close every open connection from the gateway side.
    pub async fn drop_connections(&self) {
        for conn in self.recorded.lock().unwrap().connections.drain(..) {
            let _ = conn.send(Control::Close);
        }
    }
}

async fn serve(stream: TcpStream, options: GatewayOptions, recorded: Arc<Mutex<Recorded>>) {
    let origin_sink = Arc::clone(&recorded);
    let callback = move |req: &Request, resp: Response| {
        if let Some(origin) = req.headers().get("origin").and_then(|v| v.to_str().ok()) {
            origin_sink.lock().unwrap().origins.push(origin.to_string());
        }
        Ok::<Response, ErrorResponse>(resp)
    };
    let Ok(ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await else {
        return;
    };
    let (mut tx, mut rx) = ws.split();

    if options.send_challenge {
        let challenge = json!({
            "type": "event",
            "event": "connect.challenge",
            "payload": { "nonce": "nonce-1", "ts": 0 },
        });
        let _ = tx.send(Message::Text(challenge.to_string())).await;
    }

    let (ctl_tx, mut ctl_rx) = mpsc::unbounded_channel();
    recorded.lock().unwrap().connections.push(ctl_tx.clone());

    loop {
        tokio::select! {
            msg = rx.next() => {
                let text = match msg {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => continue,
                };
                let Ok(frame) = serde_json::from_str::<Value>(&text) else { continue };
                handle(&frame, &options, &recorded, &ctl_tx);
            }
            ctl = ctl_rx.recv() => match ctl {
                Some(Control::Send(text)) => {
                    if tx.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Some(Control::Close) | None => {
                    let _ = tx.send(Message::Close(None)).await;
                    break;
                }
            },
        }
    }
}

fn handle(
    frame: &Value,
    options: &GatewayOptions,
    recorded: &Arc<Mutex<Recorded>>,
    out: &mpsc::UnboundedSender<Control>,
) {
    let id = frame["id"].as_str().unwrap_or_default().to_string();
    let params = frame["params"].clone();
    let reply = |payload: Value| {
        let _ = out.send(Control::Send(
            json!({ "type": "res", "id": id, "ok": true, "payload": payload }).to_string(),
        ));
    };

    match frame["method"].as_str().unwrap_or_default() {
        "connect" => {
            recorded.lock().unwrap().connect_params.push(params);
            if options.reject_connect {
                let _ = out.send(Control::Send(
                    json!({
                        "type": "res",
                        "id": id,
                        "ok": false,
                        "error": { "code": "NOT_PAIRED", "message": "pairing required" },
                    })
                    .to_string(),
                ));
            } else {
                reply(options.hello.clone());
            }
        }
        "echo" => reply(params),
        "fail" => {
            let _ = out.send(Control::Send(
                json!({ "type": "res", "id": id, "ok": false, "error": { "code": "E_FAIL", "message": "boom" } })
                    .to_string(),
            ));
        }
        "never" => {}
        "delay" => {
            let ms = params["ms"].as_u64().unwrap_or(0);
            let out = out.clone();
            let text = json!({ "type": "res", "id": id, "ok": true, "payload": params }).to_string();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                let _ = out.send(Control::Send(text));
            });
        }
        "emit" => {
            let count = params["count"].as_u64().unwrap_or(1);
            for n in 1..=count {
                let event = json!({ "type": "event", "event": "tick", "payload": { "n": n }, "seq": n });
                let _ = out.send(Control::Send(event.to_string()));
            }
            reply(json!({ "emitted": count }));
        }
        "drop" => {
            let _ = out.send(Control::Close);
        }
        _ => reply(Value::Null),
    }
}

/// Registry wired to `gateway` with fast timings.
pub fn registry_for(gateway: &FakeGateway, proxy_token: Option<&str>) -> Arc<SessionRegistry> {
    registry_inner(gateway, proxy_token, 100)
}

pub fn registry_with_capacity(gateway: &FakeGateway, max_sessions: usize) -> Arc<SessionRegistry> {
    registry_inner(gateway, None, max_sessions)
}

fn registry_inner(gateway: &FakeGateway, proxy_token: Option<&str>, max_sessions: usize) -> Arc<SessionRegistry> {
    let connector = UpstreamConnector::new(
        gateway.url(),
        "gw-token".into(),
        Arc::new(DeviceIdentity::generate()),
        Timings::fast(),
    );
    SessionRegistry::new(connector, ClientAuth::new(proxy_token), max_sessions)
}
