//! Request/response matching for RPCs sent upstream.
//!
//! Each in-flight request owns one entry keyed by its id. An entry is removed
//! exactly once: by the matching response, by the caller's timeout, by the
//! caller going away, or by [`Correlator::fail_all`] at cleanup.

use crate::error::{BridgeError, BridgeResult};
use clawapp_core::ResponseFrame;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;

const FALLBACK_ERROR: &str = "request failed";

type Completion = oneshot::Sender<BridgeResult<Value>>;

#[derive(Default)]
struct Table {
    pending: HashMap<String, Completion>,
    closed: bool,
}

/// Pending-request table of one session.
#[derive(Default)]
pub struct Correlator {
    table: Mutex<Table>,
}

impl Correlator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Allocate a fresh request id and register its completion handle.
    pub fn register(self: &Arc<Self>) -> BridgeResult<PendingRequest> {
        let id = format!("rpc-{}", uuid::Uuid::new_v4());
        let (tx, rx) = oneshot::channel();
        {
            let mut table = self.lock();
            if table.closed {
                return Err(BridgeError::SessionClosed);
            }
            table.pending.insert(id.clone(), tx);
        }
        Ok(PendingRequest {
            id,
            rx,
            correlator: Arc::clone(self),
        })
    }

    /// Complete the request matching `frame.id`. Returns false if none was pending.
    pub fn resolve(&self, frame: ResponseFrame) -> bool {
        let Some(tx) = self.lock().pending.remove(&frame.id) else {
            debug!(id = %frame.id, "response without pending request");
            return false;
        };
        let result = if frame.ok {
            Ok(frame.payload.unwrap_or(Value::Null))
        } else {
            Err(BridgeError::Upstream(frame.error_message(FALLBACK_ERROR)))
        };
        // The caller may have just given up; nothing to do then.
        let _ = tx.send(result);
        true
    }

    /// Fail every pending request with `SessionClosed` and refuse new ones.
    pub fn fail_all(&self) -> usize {
        let drained: Vec<Completion> = {
            let mut table = self.lock();
            table.closed = true;
            table.pending.drain().map(|(_, tx)| tx).collect()
        };
        let count = drained.len();
        for tx in drained {
            let _ = tx.send(Err(BridgeError::SessionClosed));
        }
        count
    }

    fn remove(&self, id: &str) -> bool {
        self.lock().pending.remove(id).is_some()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Caller side of a registered request. Dropping it removes the entry.
pub struct PendingRequest {
    id: String,
    rx: oneshot::Receiver<BridgeResult<Value>>,
    correlator: Arc<Correlator>,
}

impl PendingRequest {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for the response, or fail with `RequestTimeout` after `timeout`.
    pub async fn wait(mut self, timeout: Duration) -> BridgeResult<Value> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BridgeError::SessionClosed),
            Err(_) => {
                if self.correlator.remove(&self.id) {
                    return Err(BridgeError::RequestTimeout);
                }
                // Lost the race to a response or to cleanup; take its outcome.
                self.rx.try_recv().unwrap_or(Err(BridgeError::RequestTimeout))
            }
        }
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        self.correlator.remove(&self.id);
    }
}
