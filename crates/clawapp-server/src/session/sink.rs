//! Push channel handed to an attached client.
//!
//! The session keeps the sending half; the transport drains a [`SinkStream`].
//! Dropping the stream detaches it, which starts the linger timer.

use super::event_buffer::Event;
use super::lifecycle::Session;
use super::registry::SessionRegistry;
use futures_util::Stream;
use serde_json::Value;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Interval, MissedTickBehavior};

/// One item written to a client push channel.
#[derive(Debug, Clone)]
pub enum SinkItem {
    /// A buffered, sequenced event.
    Event(Arc<Event>),
    /// Unsequenced control notice such as `proxy.ready`.
    Notice { name: &'static str, payload: Value },
    /// Keep-alive; never buffered.
    Heartbeat,
}

/// Sending half stored inside the session.
#[derive(Debug)]
pub(crate) struct SinkSlot {
    pub tx: mpsc::Sender<SinkItem>,
    pub generation: u64,
}

/// Receiving half of a push channel, yielding items plus periodic heartbeats.
pub struct SinkStream {
    rx: mpsc::Receiver<SinkItem>,
    heartbeat: Interval,
    session: Arc<Session>,
    registry: Weak<SessionRegistry>,
    generation: u64,
}

impl SinkStream {
    pub(crate) fn new(
        rx: mpsc::Receiver<SinkItem>,
        heartbeat_every: Duration,
        session: Arc<Session>,
        registry: Weak<SessionRegistry>,
        generation: u64,
    ) -> Self {
        let start = tokio::time::Instant::now() + heartbeat_every;
        let mut heartbeat = tokio::time::interval_at(start, heartbeat_every);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            rx,
            heartbeat,
            session,
            registry,
            generation,
        }
    }
}

impl Stream for SinkStream {
    type Item = SinkItem;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<SinkItem>> {
        match self.rx.poll_recv(cx) {
            Poll::Ready(item) => return Poll::Ready(item),
            Poll::Pending => {}
        }
        match self.heartbeat.poll_tick(cx) {
            Poll::Ready(_) => Poll::Ready(Some(SinkItem::Heartbeat)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for SinkStream {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.sink_detached(&self.session, self.generation);
        }
    }
}
