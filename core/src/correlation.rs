// Request correlation: id -> pending continuation + deadline
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::trace;

use crate::envelope::{codes, ErrorInfo};

/// Outcome delivered to a pending request: `(error, payload)`.
#[derive(Debug, Clone, Default)]
pub struct Settlement {
    pub error: Option<ErrorInfo>,
    pub payload: Option<Value>,
}

struct PendingEntry {
    tx: oneshot::Sender<Settlement>,
    deadline: JoinHandle<()>,
}

/// Per-sender table of outstanding requests.
///
/// An entry is created before the request is transmitted and destroyed on
/// reply receipt or deadline, whichever comes first. Settlement is
/// at-most-once by construction: removing the entry transfers ownership of
/// the oneshot sender, so a second settle attempt finds nothing. Late
/// replies are inert for the same reason.
pub struct CorrelationTable {
    entries: Arc<DashMap<String, PendingEntry>>,
    timeout: Duration,
}

impl CorrelationTable {
    pub fn new(timeout: Duration) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Register an outstanding request and start its deadline timer.
    ///
    /// The receiver resolves exactly once: with the reply settlement, or
    /// with a `TIMEOUT` error when the deadline fires first.
    pub fn track(&self, id: &str) -> oneshot::Receiver<Settlement> {
        let (tx, rx) = oneshot::channel();
        let entries = Arc::clone(&self.entries);
        let timeout = self.timeout;
        let timer_id = id.to_string();
        let deadline = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some((_, entry)) = entries.remove(&timer_id) {
                trace!(target: "correlation", id = %timer_id, "request deadline fired");
                let _ = entry.tx.send(Settlement {
                    error: Some(ErrorInfo::new(codes::TIMEOUT, "request timed out")),
                    payload: None,
                });
            }
        });
        self.entries
            .insert(id.to_string(), PendingEntry { tx, deadline });
        rx
    }

    /// Settle an outstanding request by id.
    ///
    /// Returns `false` when no entry exists (already settled, timed out, or
    /// never tracked); the caller should drop the reply silently.
    pub fn settle(&self, id: &str, error: Option<ErrorInfo>, payload: Option<Value>) -> bool {
        match self.entries.remove(id) {
            Some((_, entry)) => {
                // Aborting an already-fired timer is a no-op.
                entry.deadline.abort();
                let _ = entry.tx.send(Settlement { error, payload });
                true
            }
            None => {
                trace!(target: "correlation", id = %id, "no pending entry, reply dropped");
                false
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every pending entry without settling; outstanding callers see a
    /// closed-channel error. Used on teardown.
    pub fn clear(&self) {
        self.entries.retain(|_, entry| {
            entry.deadline.abort();
            false
        });
    }
}

impl Drop for CorrelationTable {
    fn drop(&mut self) {
        self.clear();
    }
}
