//! A single client session and its upstream binding.
//!
//! All mutable state sits behind one `std::sync::Mutex` that is never held
//! across an `.await`. The pending-request table has its own lock.

use super::correlator::Correlator;
use super::event_buffer::EventBuffer;
use super::sink::{SinkItem, SinkSlot};
use super::state::{CloseReason, SessionState};
use crate::config::Timings;
use crate::error::{BridgeError, BridgeResult};
use clawapp_core::{encode_frame, Frame, RequestFrame, ResponseFrame};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Room left in a sink channel after a full replay burst.
const SINK_HEADROOM: usize = 64;

struct SessionCore {
    state: SessionState,
    last_activity: Instant,
    buffer: EventBuffer,
    sink: Option<SinkSlot>,
    next_generation: u64,
    linger: Option<AbortHandle>,
    link_open: Option<Arc<AtomicBool>>,
    hello: Value,
    snapshot: Value,
}

pub struct Session {
    id: String,
    core: Mutex<SessionCore>,
    pending: Arc<Correlator>,
    cancel: CancellationToken,
    outbound_tx: mpsc::UnboundedSender<String>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
}

impl Session {
    pub fn new(id: String, timings: &Timings) -> Arc<Self> {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let now = Instant::now();
        Arc::new(Self {
            id,
            core: Mutex::new(SessionCore {
                state: SessionState::Init,
                last_activity: now,
                buffer: EventBuffer::new(timings.buffer_capacity),
                sink: None,
                next_generation: 0,
                linger: None,
                link_open: None,
                hello: Value::Null,
                snapshot: Value::Null,
            }),
            pending: Correlator::new(),
            cancel: CancellationToken::new(),
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
        })
    }

    fn lock(&self) -> MutexGuard<'_, SessionCore> {
        self.core.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Handshake response payload captured on connect.
    pub fn hello(&self) -> Value {
        self.lock().hello.clone()
    }

    pub fn snapshot(&self) -> Value {
        self.lock().snapshot.clone()
    }

    /// Fires when the session is closed. Every session task selects on it.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    fn transition(core: &mut SessionCore, next: SessionState) -> BridgeResult<()> {
        if core.state.can_transition(next) {
            core.state = next;
            Ok(())
        } else if core.state == SessionState::Closed {
            Err(BridgeError::SessionClosed)
        } else {
            Err(BridgeError::SessionNotReady)
        }
    }

    /// Enter (or re-enter, on retry) `Connecting`.
    pub fn begin_attempt(&self) -> BridgeResult<()> {
        Self::transition(&mut self.lock(), SessionState::Connecting)
    }

    /// Record a successful handshake and mark the upstream link open.
    pub fn activate(&self, hello: Value, link_open: Arc<AtomicBool>) -> BridgeResult<()> {
        let mut core = self.lock();
        Self::transition(&mut core, SessionState::Connected)?;
        core.snapshot = hello.get("snapshot").cloned().unwrap_or(Value::Null);
        core.hello = hello;
        core.link_open = Some(link_open);
        core.last_activity = Instant::now();
        Ok(())
    }

    /// Hand the outbound frame queue to the upstream writer. Yields once.
    pub fn take_outbound(&self) -> Option<mpsc::UnboundedReceiver<String>> {
        self.outbound_rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    pub fn touch(&self) {
        self.lock().last_activity = Instant::now();
    }

    /// Buffer an event and push it to the attached sink, if any.
    ///
    /// Returns the assigned sequence number, or `None` when not connected.
    pub fn emit(&self, name: &str, payload: Value) -> Option<u64> {
        let mut core = self.lock();
        if core.state != SessionState::Connected {
            return None;
        }
        core.last_activity = Instant::now();
        let event = core.buffer.push(name, payload);
        let seq = event.seq;

        let overflowed = core
            .sink
            .as_ref()
            .is_some_and(|slot| slot.tx.try_send(SinkItem::Event(event)).is_err());
        if overflowed {
            warn!(session_id = %self.id, seq, "push sink cannot keep up, ending it");
            core.sink = None;
        }
        Some(seq)
    }

    /// Open a new push channel, replacing any existing one.
    ///
    /// With `last_seen` set, every buffered event newer than it is queued
    /// first. A `proxy.ready` notice follows the replay.
    pub(crate) fn attach_sink(
        &self,
        last_seen: Option<u64>,
    ) -> BridgeResult<(mpsc::Receiver<SinkItem>, u64)> {
        let mut core = self.lock();
        if core.state != SessionState::Connected {
            return Err(match core.state {
                SessionState::Closed => BridgeError::SessionClosed,
                _ => BridgeError::SessionNotReady,
            });
        }

        if let Some(linger) = core.linger.take() {
            linger.abort();
            debug!(session_id = %self.id, "linger cancelled by reattach");
        }

        let capacity = core.buffer.capacity() + SINK_HEADROOM;
        let (tx, rx) = mpsc::channel(capacity);

        let replay = last_seen.map(|seq| core.buffer.since(seq)).unwrap_or_default();
        let replayed = replay.len();
        for event in replay {
            // Capacity covers the whole buffer, so this cannot fail.
            let _ = tx.try_send(SinkItem::Event(event));
        }
        let _ = tx.try_send(SinkItem::Notice {
            name: "proxy.ready",
            payload: json!({ "sid": self.id, "state": core.state.as_str() }),
        });

        core.next_generation += 1;
        let generation = core.next_generation;
        if core.sink.replace(SinkSlot { tx, generation }).is_some() {
            debug!(session_id = %self.id, "previous push sink replaced");
        }
        core.last_activity = Instant::now();

        info!(
            session_id = %self.id,
            replayed,
            buffered = core.buffer.len(),
            from = ?last_seen,
            "push sink attached"
        );
        Ok((rx, generation))
    }

    /// Forget the sink of `generation` if it is still current.
    ///
    /// Returns true when the session is now without a sink and needs a
    /// linger timer.
    pub(crate) fn detach_sink(&self, generation: u64) -> bool {
        let mut core = self.lock();
        if core.sink.as_ref().is_some_and(|s| s.generation == generation) {
            core.sink = None;
            core.last_activity = Instant::now();
            info!(session_id = %self.id, "push sink detached");
        }
        core.sink.is_none() && core.linger.is_none() && core.state == SessionState::Connected
    }

    /// Install a linger timer, unless a sink reattached in the meantime.
    pub(crate) fn set_linger(&self, handle: AbortHandle) {
        let mut core = self.lock();
        if core.sink.is_some() || core.state == SessionState::Closed {
            handle.abort();
            return;
        }
        if let Some(old) = core.linger.replace(handle) {
            old.abort();
        }
    }

    /// Called when the linger timer fires. True if the session should close.
    pub(crate) fn linger_expired(&self) -> bool {
        let mut core = self.lock();
        core.linger = None;
        core.sink.is_none() && core.state != SessionState::Closed
    }

    /// Idle means no sink attached and no activity for longer than `idle`.
    pub fn is_idle(&self, now: Instant, idle: Duration) -> bool {
        let core = self.lock();
        core.sink.is_none() && now.saturating_duration_since(core.last_activity) > idle
    }

    /// Queue a raw frame for the upstream writer, in FIFO order.
    pub fn enqueue(&self, text: String) -> BridgeResult<()> {
        self.outbound_tx
            .send(text)
            .map_err(|_| BridgeError::UpstreamUnavailable)
    }

    /// Send an RPC upstream and wait for its response.
    pub async fn send(&self, method: String, params: Value, timeout: Duration) -> BridgeResult<Value> {
        {
            let mut core = self.lock();
            if core.state != SessionState::Connected {
                return Err(BridgeError::SessionNotReady);
            }
            let open = core
                .link_open
                .as_ref()
                .is_some_and(|open| open.load(Ordering::Acquire));
            if !open {
                return Err(BridgeError::UpstreamUnavailable);
            }
            core.last_activity = Instant::now();
        }

        let pending = self.pending.register()?;
        let frame = Frame::Req(RequestFrame {
            id: pending.id().to_string(),
            method,
            params,
        });
        self.enqueue(encode_frame(&frame)?)?;
        debug!(session_id = %self.id, id = %pending.id(), "rpc sent");
        pending.wait(timeout).await
    }

    /// Route an upstream response to its waiting caller.
    pub fn resolve(&self, frame: ResponseFrame) -> bool {
        self.pending.resolve(frame)
    }

    /// Mark the upstream socket as gone. Sends fail with `UpstreamUnavailable` afterwards.
    pub fn mark_link_down(&self) {
        if let Some(open) = &self.lock().link_open {
            open.store(false, Ordering::Release);
        }
    }

    /// Tear the session down. Returns false if it was already closed.
    pub fn close(&self, reason: CloseReason) -> bool {
        {
            let mut core = self.lock();
            if core.state == SessionState::Closed {
                return false;
            }
            core.state = SessionState::Closed;
            core.sink = None;
            if let Some(linger) = core.linger.take() {
                linger.abort();
            }
            if let Some(open) = &core.link_open {
                open.store(false, Ordering::Release);
            }
        }
        self.cancel.cancel();
        let failed = self.pending.fail_all();
        info!(session_id = %self.id, %reason, failed_requests = failed, "session closed");
        true
    }
}

/// Session key the client should use: the gateway's main key when present,
/// else `agent:<defaultAgentId or "main">:main`.
pub fn default_session_key(snapshot: &Value) -> String {
    let defaults = &snapshot["sessionDefaults"];
    if let Some(key) = defaults["mainSessionKey"].as_str().filter(|k| !k.is_empty()) {
        return key.to_string();
    }
    let agent = defaults["defaultAgentId"]
        .as_str()
        .filter(|a| !a.is_empty())
        .unwrap_or("main");
    format!("agent:{agent}:main")
}

#[cfg(test)]
impl Session {
    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    pub fn is_link_open(&self) -> bool {
        self.lock()
            .link_open
            .as_ref()
            .is_some_and(|open| open.load(Ordering::Acquire))
    }

    pub fn has_sink(&self) -> bool {
        self.lock().sink.is_some()
    }

    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    /// A connected session with an open link and no upstream tasks.
    pub fn connected_for_test(id: &str, timings: &Timings) -> Arc<Self> {
        let session = Self::new(id.to_string(), timings);
        session.begin_attempt().unwrap();
        session
            .activate(json!({ "snapshot": {} }), Arc::new(AtomicBool::new(true)))
            .unwrap();
        session
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seqs(rx: &mut mpsc::Receiver<SinkItem>) -> Vec<u64> {
        let mut out = Vec::new();
        while let Ok(item) = rx.try_recv() {
            if let SinkItem::Event(e) = item {
                out.push(e.seq);
            }
        }
        out
    }

    #[test]
    fn emit_requires_connected() {
        let s = Session::new("s".into(), &Timings::fast());
        assert_eq!(s.emit("message", json!({})), None);
        s.begin_attempt().unwrap();
        assert_eq!(s.emit("message", json!({})), None);
    }

    #[test]
    fn activate_captures_hello_and_snapshot() {
        let s = Session::new("s".into(), &Timings::fast());
        s.begin_attempt().unwrap();
        s.begin_attempt().unwrap();
        let hello = json!({ "protocol": 3, "snapshot": { "sessionDefaults": { "defaultAgentId": "a1" } } });
        s.activate(hello.clone(), Arc::new(AtomicBool::new(true))).unwrap();
        assert_eq!(s.state(), SessionState::Connected);
        assert_eq!(s.hello(), hello);
        assert_eq!(default_session_key(&s.snapshot()), "agent:a1:main");
        assert!(s.is_link_open());
    }

    #[test]
    fn replay_then_live_without_gaps() {
        let s = Session::connected_for_test("s", &Timings::fast());
        for _ in 0..10 {
            s.emit("message", json!({}));
        }
        let (mut rx, _) = s.attach_sink(Some(5)).unwrap();
        s.emit("message", json!({}));

        let mut items = Vec::new();
        while let Ok(item) = rx.try_recv() {
            items.push(item);
        }
        let replayed: Vec<u64> = items[..5]
            .iter()
            .map(|i| match i {
                SinkItem::Event(e) => e.seq,
                other => panic!("expected event, got {other:?}"),
            })
            .collect();
        assert_eq!(replayed, vec![6, 7, 8, 9, 10]);
        assert!(matches!(&items[5], SinkItem::Notice { name: "proxy.ready", payload } if payload["state"] == "connected"));
        assert!(matches!(&items[6], SinkItem::Event(e) if e.seq == 11));
    }

    #[test]
    fn attach_without_last_seen_skips_replay() {
        let s = Session::connected_for_test("s", &Timings::fast());
        s.emit("message", json!({}));
        let (mut rx, _) = s.attach_sink(None).unwrap();
        assert!(seqs(&mut rx).is_empty());
    }

    #[test]
    fn reattach_ends_previous_sink() {
        let s = Session::connected_for_test("s", &Timings::fast());
        let (mut first, g1) = s.attach_sink(None).unwrap();
        let (mut second, g2) = s.attach_sink(None).unwrap();
        assert_ne!(g1, g2);

        s.emit("message", json!({}));
        // The old channel drains its ready notice and then reports closed.
        assert!(matches!(first.try_recv(), Ok(SinkItem::Notice { .. })));
        assert!(matches!(
            first.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
        assert_eq!(seqs(&mut second), vec![1]);

        assert!(!s.detach_sink(g1));
        assert!(s.has_sink());
        assert!(s.detach_sink(g2));
        assert!(!s.has_sink());
    }

    #[test]
    fn slow_sink_is_ended_and_reattach_replays() {
        let timings = Timings {
            buffer_capacity: 8,
            ..Timings::fast()
        };
        let s = Session::connected_for_test("s", &timings);
        let (mut slow, _) = s.attach_sink(None).unwrap();

        // 8 + 64 slots, one taken by the ready notice.
        for _ in 0..72 {
            s.emit("message", json!({}));
        }
        assert!(!s.has_sink());
        let delivered = seqs(&mut slow);
        assert_eq!(delivered.len(), 71);
        assert!(matches!(slow.try_recv(), Err(mpsc::error::TryRecvError::Disconnected)));

        let last = *delivered.last().unwrap();
        let (mut again, _) = s.attach_sink(Some(last)).unwrap();
        assert_eq!(seqs(&mut again), vec![72]);
    }

    #[test]
    fn idle_only_without_sink() {
        let s = Session::connected_for_test("s", &Timings::fast());
        let later = Instant::now() + Duration::from_secs(10);
        assert!(s.is_idle(later, Duration::from_secs(1)));

        let (_rx, _) = s.attach_sink(None).unwrap();
        assert!(!s.is_idle(later, Duration::from_secs(1)));
    }

    #[test]
    fn close_is_idempotent_and_final() {
        let s = Session::connected_for_test("s", &Timings::fast());
        let (mut rx, _) = s.attach_sink(None).unwrap();
        assert!(s.close(CloseReason::Disconnect));
        assert!(!s.close(CloseReason::Disconnect));
        assert_eq!(s.state(), SessionState::Closed);
        assert!(s.cancel_token().is_cancelled());
        assert!(!s.is_link_open());
        assert!(s.begin_attempt().is_err());
        assert_eq!(s.emit("message", json!({})), None);

        while rx.try_recv().is_ok() {}
        assert!(matches!(rx.try_recv(), Err(mpsc::error::TryRecvError::Disconnected)));
    }

    #[tokio::test]
    async fn send_before_connected_is_not_ready() {
        let s = Session::new("s".into(), &Timings::fast());
        let err = s
            .send("chat.send".into(), json!({}), Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::SessionNotReady));
    }

    #[tokio::test]
    async fn send_on_dead_link_creates_no_pending_entry() {
        let s = Session::connected_for_test("s", &Timings::fast());
        s.mark_link_down();
        let err = s
            .send("chat.send".into(), json!({}), Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::UpstreamUnavailable));
        assert_eq!(s.pending_requests(), 0);
    }

    #[tokio::test]
    async fn send_writes_request_and_resolves() {
        let s = Session::connected_for_test("s", &Timings::fast());
        let mut outbound = s.take_outbound().unwrap();

        let session = Arc::clone(&s);
        let responder = tokio::spawn(async move {
            let text = outbound.recv().await.unwrap();
            let frame: Value = serde_json::from_str(&text).unwrap();
            assert_eq!(frame["type"], "req");
            assert_eq!(frame["method"], "sessions.list");
            let id = frame["id"].as_str().unwrap().to_string();
            session.resolve(ResponseFrame::success(id, json!({ "sessions": [] })));
        });

        let value = s
            .send("sessions.list".into(), json!({}), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(value, json!({ "sessions": [] }));
        responder.await.unwrap();
        assert_eq!(s.pending_requests(), 0);
    }

    #[tokio::test]
    async fn close_fails_in_flight_requests() {
        let s = Session::connected_for_test("s", &Timings::fast());
        let session = Arc::clone(&s);
        let call = tokio::spawn(async move {
            session
                .send("chat.send".into(), json!({}), Duration::from_secs(5))
                .await
        });
        while s.pending_requests() == 0 {
            tokio::task::yield_now().await;
        }
        s.close(CloseReason::Shutdown);
        assert!(matches!(call.await.unwrap(), Err(BridgeError::SessionClosed)));
    }

    #[test]
    fn session_key_fallbacks() {
        assert_eq!(
            default_session_key(&json!({ "sessionDefaults": { "mainSessionKey": "agent:x:main" } })),
            "agent:x:main"
        );
        assert_eq!(
            default_session_key(&json!({ "sessionDefaults": { "defaultAgentId": "ops" } })),
            "agent:ops:main"
        );
        assert_eq!(default_session_key(&Value::Null), "agent:main:main");
    }
}
