//! Registry of live sessions.
//!
//! Injected into the transports as an explicit object. Every teardown path
//! ends in [`SessionRegistry::cleanup`], which is idempotent.

use super::lifecycle::{default_session_key, Session};
use super::sink::SinkStream;
use super::state::CloseReason;
use crate::auth::ClientAuth;
use crate::config::Timings;
use crate::error::{BridgeError, BridgeResult};
use crate::upstream::{link, Handshaken, UpstreamConnector};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Result of a successful connect.
#[derive(Debug, Clone)]
pub struct Established {
    pub sid: String,
    pub hello: Value,
    pub snapshot: Value,
    pub session_key: String,
}

pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    connector: UpstreamConnector,
    auth: ClientAuth,
    max_sessions: usize,
}

impl SessionRegistry {
    pub fn new(connector: UpstreamConnector, auth: ClientAuth, max_sessions: usize) -> Arc<Self> {
        Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            connector,
            auth,
            max_sessions,
        })
    }

    pub fn timings(&self) -> &Timings {
        self.connector.timings()
    }

    pub fn connector(&self) -> &UpstreamConnector {
        &self.connector
    }

    pub fn auth(&self) -> &ClientAuth {
        &self.auth
    }

    /// Authenticate the client, create a session and bring its upstream up.
    ///
    /// On any failure the session is discarded before returning. If the
    /// returned future is dropped mid-handshake, the session is discarded
    /// in the background.
    pub async fn establish(self: &Arc<Self>, credential: Option<&str>) -> BridgeResult<Established> {
        self.auth.validate(credential)?;
        let session = self.create().await?;
        let sid = session.id().to_string();
        let mut guard = PendingSession::new(self, &session);

        let Handshaken { socket, hello } = match self.connector.connect(&session).await {
            Ok(handshaken) => handshaken,
            Err(e) => {
                warn!(session_id = %sid, error = %e, "session establishment failed");
                self.cleanup(&sid, CloseReason::HandshakeFailed).await;
                guard.disarm();
                return Err(e);
            }
        };

        if let Err(e) = session.activate(hello, Arc::new(AtomicBool::new(true))) {
            // Closed while the handshake was in flight; the socket is dropped here.
            self.cleanup(&sid, CloseReason::HandshakeFailed).await;
            guard.disarm();
            return Err(e);
        }
        guard.disarm();
        link::spawn(
            socket,
            Arc::clone(&session),
            Arc::downgrade(self),
            self.timings().upstream_ping_interval,
        );

        let hello = session.hello();
        let snapshot = session.snapshot();
        let sessions = self.count().await;
        info!(session_id = %sid, sessions, "session established");
        Ok(Established {
            session_key: default_session_key(&snapshot),
            sid,
            hello,
            snapshot,
        })
    }

    /// Insert a fresh session in `Init`.
    pub async fn create(&self) -> BridgeResult<Arc<Session>> {
        let mut sessions = self.sessions.write().await;
        if sessions.len() >= self.max_sessions {
            return Err(BridgeError::Capacity(self.max_sessions));
        }

        let mut session_id = generate_session_id();
        while sessions.contains_key(&session_id) {
            session_id = generate_session_id();
        }
        let session = Session::new(session_id.clone(), self.timings());
        sessions.insert(session_id.clone(), Arc::clone(&session));
        debug!(session_id = %session_id, "session created");
        Ok(session)
    }

    pub async fn get(&self, sid: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(sid).cloned()
    }

    /// Remove and close a session. Returns false if it was already gone.
    pub async fn cleanup(&self, sid: &str, reason: CloseReason) -> bool {
        let removed = self.sessions.write().await.remove(sid);
        match removed {
            Some(session) => {
                session.close(reason);
                true
            }
            None => false,
        }
    }

    /// Attach a push sink, replaying everything after `last_seen`.
    pub async fn attach(self: &Arc<Self>, sid: &str, last_seen: Option<u64>) -> BridgeResult<SinkStream> {
        let session = self.get(sid).await.ok_or(BridgeError::SessionNotFound)?;
        let (rx, generation) = session.attach_sink(last_seen)?;
        Ok(SinkStream::new(
            rx,
            self.timings().heartbeat_interval,
            session,
            Arc::downgrade(self),
            generation,
        ))
    }

    /// Forward one RPC on the session's upstream.
    pub async fn send(&self, sid: &str, method: String, params: Value) -> BridgeResult<Value> {
        let session = self.get(sid).await.ok_or(BridgeError::SessionNotFound)?;
        session
            .send(method, params, self.timings().request_timeout)
            .await
    }

    /// Explicit client disconnect. Unknown ids are not an error.
    pub async fn disconnect(&self, sid: &str) -> bool {
        self.cleanup(sid, CloseReason::Disconnect).await
    }

    /// Called when a [`SinkStream`] is dropped; arms the linger timer.
    pub(crate) fn sink_detached(self: &Arc<Self>, session: &Arc<Session>, generation: u64) {
        if !session.detach_sink(generation) {
            return;
        }
        // Streams can be dropped after the runtime is gone.
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let registry = Arc::downgrade(self);
        let sid = session.id().to_string();
        let linger = self.timings().linger;
        let task = handle.spawn(async move {
            tokio::time::sleep(linger).await;
            if let Some(registry) = registry.upgrade() {
                registry.linger_expired(&sid).await;
            }
        });
        session.set_linger(task.abort_handle());
        debug!(session_id = %session.id(), linger_ms = linger.as_millis() as u64, "linger started");
    }

    async fn linger_expired(&self, sid: &str) {
        let Some(session) = self.get(sid).await else {
            return;
        };
        if session.linger_expired() {
            info!(session_id = %sid, "push sink not reattached, closing session");
            self.cleanup(sid, CloseReason::LingerExpired).await;
        }
    }

    /// Close sessions without a sink that have been idle past the timeout.
    ///
    /// Returns the IDs of sessions that were removed.
    pub async fn sweep_idle(&self, now: Instant) -> Vec<String> {
        let idle_timeout = self.timings().idle_timeout;
        let mut sessions = self.sessions.write().await;
        let mut removed = Vec::new();

        sessions.retain(|id, session| {
            if session.is_idle(now, idle_timeout) {
                warn!(session_id = %id, "session expired (idle)");
                session.close(CloseReason::IdleTimeout);
                removed.push(id.clone());
                return false;
            }
            true
        });

        if !removed.is_empty() {
            debug!(count = removed.len(), "sweep removed sessions");
        }
        removed
    }

    /// Run [`sweep_idle`](Self::sweep_idle) every sweep interval until `stop` fires.
    pub fn spawn_sweeper(self: &Arc<Self>, stop: CancellationToken) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        let every = self.timings().sweep_interval;
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + every;
            let mut interval = tokio::time::interval_at(start, every);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = interval.tick() => {
                        registry.sweep_idle(Instant::now()).await;
                    }
                }
            }
        })
    }

    /// Close every session. Used on process shutdown.
    pub async fn shutdown(&self) -> usize {
        let drained: Vec<Arc<Session>> = self.sessions.write().await.drain().map(|(_, s)| s).collect();
        let count = drained.len();
        for session in drained {
            session.close(CloseReason::Shutdown);
        }
        if count > 0 {
            info!(count, "closed all sessions");
        }
        count
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

/// Discards a session whose `establish` was abandoned before it connected.
struct PendingSession {
    registry: Weak<SessionRegistry>,
    session: Arc<Session>,
    armed: bool,
}

impl PendingSession {
    fn new(registry: &Arc<SessionRegistry>, session: &Arc<Session>) -> Self {
        Self {
            registry: Arc::downgrade(registry),
            session: Arc::clone(session),
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PendingSession {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.session.close(CloseReason::HandshakeFailed);
        let (Some(registry), Ok(handle)) = (self.registry.upgrade(), tokio::runtime::Handle::try_current()) else {
            return;
        };
        let sid = self.session.id().to_string();
        warn!(session_id = %sid, "connect abandoned mid-handshake");
        handle.spawn(async move {
            registry.cleanup(&sid, CloseReason::HandshakeFailed).await;
        });
    }
}

/// Generate a random session ID (hex-encoded, 16 bytes = 32 hex chars).
fn generate_session_id() -> String {
    use rand::Rng;
    let bytes: [u8; 16] = rand::thread_rng().gen();
    hex::encode(bytes)
}
