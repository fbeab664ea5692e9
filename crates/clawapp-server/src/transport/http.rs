//! HTTP surface: connect, push stream (SSE), RPC send, disconnect, health.

use super::websocket;
use crate::error::{BridgeError, BridgeResult};
use crate::session::{SessionRegistry, SinkItem};
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::StreamExt;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;
use tracing::{debug, info};

/// Static facts reported by `/health`.
#[derive(Debug, Clone)]
pub struct HealthInfo {
    pub port: u16,
    pub gateway_url: String,
    pub has_proxy_token: bool,
    pub has_gateway_token: bool,
}

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub health: Arc<HealthInfo>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/connect", post(connect))
        .route("/api/events", get(events))
        .route("/api/send", post(send))
        .route("/api/disconnect", post(disconnect))
        .route("/ws", get(websocket::ws_handler))
        .with_state(state)
}

#[derive(Debug, Default, Deserialize)]
struct ConnectBody {
    token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct SendBody {
    sid: Option<String>,
    method: Option<String>,
    params: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct SidBody {
    sid: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct EventsQuery {
    sid: Option<String>,
    #[serde(rename = "lastEventId")]
    last_event_id: Option<String>,
}

/// Bodies are parsed leniently: a missing or broken body means "no fields".
fn parse_body<T: DeserializeOwned + Default>(body: &Bytes) -> T {
    if body.is_empty() {
        return T::default();
    }
    serde_json::from_slice(body).unwrap_or_else(|e| {
        debug!(error = %e, "ignoring unparseable request body");
        T::default()
    })
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    let h = &state.health;
    Json(json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "sessions": state.registry.count().await,
        "config": {
            "port": h.port,
            "gatewayUrl": h.gateway_url,
            "hasProxyToken": h.has_proxy_token,
            "hasGatewayToken": h.has_gateway_token,
        },
    }))
}

async fn connect(State(state): State<AppState>, body: Bytes) -> BridgeResult<Json<Value>> {
    let body: ConnectBody = parse_body(&body);
    let est = state.registry.establish(body.token.as_deref()).await?;
    Ok(Json(json!({
        "ok": true,
        "sid": est.sid,
        "hello": est.hello,
        "snapshot": est.snapshot,
        "sessionKey": est.session_key,
    })))
}

/// Last seen sequence number: `Last-Event-ID` header, else `lastEventId` query.
fn last_seen(headers: &HeaderMap, query: Option<&str>) -> Option<u64> {
    headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .or(query)
        .and_then(|v| v.trim().parse().ok())
}

async fn events(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
    headers: HeaderMap,
) -> BridgeResult<impl IntoResponse> {
    let sid = query.sid.unwrap_or_default();
    let from = last_seen(&headers, query.last_event_id.as_deref());
    let sink = state.registry.attach(&sid, from).await?;
    info!(session_id = %sid, "event stream opened");

    let stream = sink.map(|item| Ok::<_, Infallible>(to_sse(item)));
    Ok(([("x-accel-buffering", "no")], Sse::new(stream)))
}

fn to_sse(item: SinkItem) -> Event {
    match item {
        SinkItem::Event(e) => Event::default()
            .id(e.seq.to_string())
            .event(&e.name)
            .data(e.payload.to_string()),
        SinkItem::Notice { name, payload } => Event::default().event(name).data(payload.to_string()),
        SinkItem::Heartbeat => Event::default().comment("heartbeat"),
    }
}

async fn send(State(state): State<AppState>, body: Bytes) -> BridgeResult<Json<Value>> {
    let body: SendBody = parse_body(&body);
    let sid = body.sid.unwrap_or_default();
    let session = state
        .registry
        .get(&sid)
        .await
        .ok_or(BridgeError::SessionNotFound)?;
    let method = body
        .method
        .filter(|m| !m.is_empty())
        .ok_or_else(|| BridgeError::InvalidRequest("method is required".into()))?;

    debug!(session_id = %sid, %method, "rpc request");
    let payload = session
        .send(
            method,
            body.params.unwrap_or(Value::Null),
            state.registry.timings().request_timeout,
        )
        .await?;
    Ok(Json(json!({ "ok": true, "payload": payload })))
}

async fn disconnect(State(state): State<AppState>, body: Bytes) -> Json<Value> {
    let body: SidBody = parse_body(&body);
    if let Some(sid) = body.sid {
        if state.registry.disconnect(&sid).await {
            info!(session_id = %sid, "client disconnected");
        }
    }
    Json(json!({ "ok": true }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{registry_for, FakeGateway, GatewayOptions};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn app(registry: Arc<SessionRegistry>) -> Router {
        router(AppState {
            health: Arc::new(HealthInfo {
                port: 3210,
                gateway_url: registry.connector().url().to_string(),
                has_proxy_token: registry.auth().is_enabled(),
                has_gateway_token: true,
            }),
            registry,
        })
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(resp: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn last_seen_prefers_header() {
        let mut headers = HeaderMap::new();
        assert_eq!(last_seen(&headers, None), None);
        assert_eq!(last_seen(&headers, Some("4")), Some(4));
        headers.insert("last-event-id", "7".parse().unwrap());
        assert_eq!(last_seen(&headers, Some("4")), Some(7));
        headers.insert("last-event-id", "junk".parse().unwrap());
        assert_eq!(last_seen(&headers, None), None);
    }

    #[tokio::test]
    async fn health_reports_config() {
        let gateway = FakeGateway::start(GatewayOptions::default()).await;
        let resp = app(registry_for(&gateway, Some("t")))
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["sessions"], 0);
        assert_eq!(body["config"]["hasProxyToken"], true);
        assert_eq!(body["config"]["gatewayUrl"], gateway.url());
    }

    #[tokio::test]
    async fn connect_rejects_bad_token() {
        let gateway = FakeGateway::start(GatewayOptions::default()).await;
        let resp = app(registry_for(&gateway, Some("secret")))
            .oneshot(post_json("/api/connect", json!({ "token": "nope" })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        let body = json_body(resp).await;
        assert_eq!(body["ok"], false);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn connect_reports_gateway_failure() {
        let gateway = FakeGateway::start(GatewayOptions {
            reject_connect: true,
            ..Default::default()
        })
        .await;
        let resp = app(registry_for(&gateway, None))
            .oneshot(post_json("/api/connect", json!({})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn unknown_session_routes() {
        let gateway = FakeGateway::start(GatewayOptions::default()).await;
        let router = app(registry_for(&gateway, None));

        let resp = router
            .clone()
            .oneshot(post_json("/api/send", json!({ "sid": "missing", "method": "echo" })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = router
            .clone()
            .oneshot(Request::get("/api/events?sid=missing").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = router
            .oneshot(post_json("/api/disconnect", json!({ "sid": "missing" })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await, json!({ "ok": true }));
    }

    #[tokio::test]
    async fn connect_send_disconnect_flow() {
        let gateway = FakeGateway::start(GatewayOptions::default()).await;
        let registry = registry_for(&gateway, None);
        let router = app(Arc::clone(&registry));

        let resp = router.clone().oneshot(post_json("/api/connect", json!({}))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["ok"], true);
        assert_eq!(body["sessionKey"], "agent:main:main");
        let sid = body["sid"].as_str().unwrap().to_string();

        let resp = router
            .clone()
            .oneshot(post_json(
                "/api/send",
                json!({ "sid": sid, "method": "echo", "params": { "q": 1 } }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await, json!({ "ok": true, "payload": { "q": 1 } }));

        let resp = router
            .clone()
            .oneshot(post_json("/api/send", json!({ "sid": sid, "method": "fail" })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json_body(resp).await["error"], "boom");

        let resp = router
            .clone()
            .oneshot(post_json("/api/send", json!({ "sid": sid })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = router
            .oneshot(post_json("/api/disconnect", json!({ "sid": sid })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(registry.count().await, 0);
    }

    #[tokio::test]
    async fn event_stream_replays_from_last_event_id() {
        let gateway = FakeGateway::start(GatewayOptions::default()).await;
        let registry = registry_for(&gateway, None);
        let est = registry.establish(None).await.unwrap();
        registry
            .send(&est.sid, "emit".into(), json!({ "count": 3 }))
            .await
            .unwrap();

        let resp = app(Arc::clone(&registry))
            .oneshot(
                Request::get(format!("/api/events?sid={}", est.sid))
                    .header("last-event-id", "1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get("content-type").unwrap(),
            "text/event-stream"
        );

        let mut body = resp.into_body().into_data_stream();
        let mut text = String::new();
        while !text.contains("event: proxy.ready") {
            let chunk = tokio::time::timeout(std::time::Duration::from_secs(2), body.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            text.push_str(&String::from_utf8_lossy(&chunk));
        }
        assert!(!text.contains("id: 1\n"));
        let two = text.find("id: 2\n").unwrap();
        let three = text.find("id: 3\n").unwrap();
        let ready = text.find("event: proxy.ready").unwrap();
        assert!(two < three && three < ready);
        assert!(text.contains("event: message"));
    }

    #[tokio::test]
    async fn event_stream_sends_heartbeat_comments() {
        let gateway = FakeGateway::start(GatewayOptions::default()).await;
        let registry = registry_for(&gateway, None);
        let est = registry.establish(None).await.unwrap();

        let resp = app(Arc::clone(&registry))
            .oneshot(
                Request::get(format!("/api/events?sid={}", est.sid))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let mut body = resp.into_body().into_data_stream();
        let mut text = String::new();
        while text.matches(": heartbeat\n").count() < 2 {
            let chunk = tokio::time::timeout(std::time::Duration::from_secs(2), body.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            text.push_str(&String::from_utf8_lossy(&chunk));
        }
        assert!(text.contains("event: proxy.ready"));
        assert!(!text.contains("id: "), "heartbeats must not carry an id: {text}");
    }
}
