//! Request tracker - id allocation and the pending-response table.
//!
//! The table is the only state touched by both the inbound loop (on
//! completion) and the outbound path (on submission), so all of it lives
//! behind one lock. Each entry is removed exactly once: by a response, by a
//! cancellation or timeout, or by [`RequestTracker::fail_all`] at teardown.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::oneshot;

use crate::codec::ResponseError;
use crate::error::{BridgeError, Result};

type Completion = Result<Value>;

struct PendingRequest {
    method: String,
    submitted_at: Instant,
    tx: oneshot::Sender<Completion>,
}

struct Table {
    next_id: u64,
    /// Set at teardown. Nothing new is accepted afterwards.
    closed: bool,
    pending: HashMap<u64, PendingRequest>,
}

/// A submitted request awaiting its response.
pub(crate) struct Ticket {
    pub id: u64,
    pub method: String,
    rx: oneshot::Receiver<Completion>,
}

pub(crate) struct RequestTracker {
    table: Mutex<Table>,
}

impl RequestTracker {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(Table {
                next_id: 1,
                closed: false,
                pending: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate a fresh id and record the pending entry.
    ///
    /// Ids are strictly increasing and never reused within a session.
    pub fn submit(&self, method: &str) -> Result<Ticket> {
        let mut table = self.lock();
        if table.closed {
            return Err(BridgeError::TransportClosed);
        }
        let id = table.next_id;
        table.next_id += 1;

        let (tx, rx) = oneshot::channel();
        table.pending.insert(
            id,
            PendingRequest {
                method: method.to_string(),
                submitted_at: Instant::now(),
                tx,
            },
        );
        Ok(Ticket {
            id,
            method: method.to_string(),
            rx,
        })
    }

    /// Wait for the ticket's completion, bounded by `timeout`.
    ///
    /// On timeout the entry is removed; a late response becomes an unmatched
    /// completion.
    pub async fn wait(&self, ticket: &mut Ticket, timeout: Duration) -> Result<Value> {
        match tokio::time::timeout(timeout, &mut ticket.rx).await {
            Ok(Ok(outcome)) => outcome,
            // Sender dropped without completing: the table went away.
            Ok(Err(_)) => Err(BridgeError::TransportClosed),
            Err(_) => {
                self.cancel(ticket.id);
                tracing::debug!(
                    id = ticket.id,
                    method = %ticket.method,
                    "Request timed out"
                );
                Err(BridgeError::RequestTimeout {
                    method: ticket.method.clone(),
                    after: timeout,
                })
            }
        }
    }

    /// Deliver a response. Returns `false` when no request with `id` is
    /// pending (already completed, cancelled, timed out or never issued).
    pub fn complete(&self, id: u64, outcome: std::result::Result<Value, ResponseError>) -> bool {
        let Some(entry) = self.lock().pending.remove(&id) else {
            tracing::warn!(id, "Response for unknown request id");
            return false;
        };
        tracing::trace!(
            id,
            method = %entry.method,
            elapsed_ms = entry.submitted_at.elapsed().as_millis(),
            "Request completed"
        );
        // The caller may have stopped waiting; that's fine.
        let _ = entry.tx.send(outcome.map_err(BridgeError::from));
        true
    }

    /// Remove a pending entry without completing it.
    pub fn cancel(&self, id: u64) -> bool {
        self.lock().pending.remove(&id).is_some()
    }

    /// Fail every pending request with `TransportClosed` and refuse new ones.
    pub fn fail_all(&self) -> usize {
        let drained: Vec<(u64, PendingRequest)> = {
            let mut table = self.lock();
            table.closed = true;
            table.pending.drain().collect()
        };
        let count = drained.len();
        for (id, entry) in drained {
            tracing::debug!(id, method = %entry.method, "Failing pending request");
            let _ = entry.tx.send(Err(BridgeError::TransportClosed));
        }
        count
    }

    pub fn outstanding(&self) -> usize {
        self.lock().pending.len()
    }
}
