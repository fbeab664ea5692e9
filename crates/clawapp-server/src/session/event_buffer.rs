//! Bounded event history for replay on reattach.
//!
//! Keeps the most recent events of a session so a client that lost its push
//! channel can resume from the last sequence number it saw.

use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;

/// Default number of events kept per session.
pub const DEFAULT_CAPACITY: usize = 200;

/// A sequenced client-facing event. Immutable once buffered.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub seq: u64,
    pub name: String,
    pub payload: Value,
}

/// Fixed-capacity FIFO of events, oldest evicted first.
#[derive(Debug)]
pub struct EventBuffer {
    events: VecDeque<Arc<Event>>,
    capacity: usize,
    /// Last sequence number handed out.
    last_seq: u64,
}

impl EventBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: VecDeque::with_capacity(capacity),
            capacity,
            last_seq: 0,
        }
    }

    /// Assign the next sequence number and append, evicting beyond capacity.
    pub fn push(&mut self, name: impl Into<String>, payload: Value) -> Arc<Event> {
        self.last_seq += 1;
        let event = Arc::new(Event {
            seq: self.last_seq,
            name: name.into(),
            payload,
        });
        if self.events.len() == self.capacity {
            self.events.pop_front();
        }
        self.events.push_back(Arc::clone(&event));
        event
    }

    /// Buffered events with `seq > last_seen`, oldest first.
    pub fn since(&self, last_seen: u64) -> Vec<Arc<Event>> {
        // Sequence numbers are contiguous, so the start index is arithmetic.
        let first = match self.events.front() {
            Some(e) => e.seq,
            None => return Vec::new(),
        };
        let skip = last_seen.saturating_sub(first - 1) as usize;
        self.events.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

}

impl Default for EventBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
