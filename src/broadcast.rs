//! Broadcast fan-out over an explicit connection registry.
//!
//! Every live connection owns a bounded outbound queue drained by its socket
//! writer. The registry is touched only from the router task, so frames are
//! enqueued per connection in store-apply order. A queue that is full or
//! closed counts as a delivery failure: the connection is logged and dropped,
//! which closes its queue and lets the writer hang up. Other connections and
//! the store are unaffected.

use crate::protocol::Frame;
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

/// Registry-assigned connection identifier, unique for the process lifetime.
pub type ConnectionId = u64;

/// Result of a fan-out pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FanOut {
    /// Connections the frame was queued for.
    pub delivered: usize,
    /// Connections dropped because their queue failed.
    pub dropped: Vec<ConnectionId>,
}

/// Live connections and their outbound queues.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: BTreeMap<ConnectionId, mpsc::Sender<Frame>>,
    next_id: ConnectionId,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection and return its id.
    pub fn register(&mut self, outbound: mpsc::Sender<Frame>) -> ConnectionId {
        self.next_id += 1;
        let id = self.next_id;
        self.connections.insert(id, outbound);
        id
    }

    /// Forget a connection. Returns `false` if it was already gone.
    pub fn unregister(&mut self, id: ConnectionId) -> bool {
        self.connections.remove(&id).is_some()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Queue a frame for a single connection.
    pub fn send_to(&mut self, id: ConnectionId, frame: &Frame) -> bool {
        let Some(outbound) = self.connections.get(&id) else {
            debug!(conn = id, "send to unknown connection skipped");
            return false;
        };
        if offer(id, outbound, frame) {
            true
        } else {
            self.connections.remove(&id);
            false
        }
    }

    /// Queue a frame for every connection except `except`.
    pub fn fan_out(&mut self, frame: &Frame, except: Option<ConnectionId>) -> FanOut {
        let mut report = FanOut::default();
        for (&id, outbound) in &self.connections {
            if Some(id) == except {
                continue;
            }
            if offer(id, outbound, frame) {
                report.delivered += 1;
            } else {
                report.dropped.push(id);
            }
        }
        for id in &report.dropped {
            self.connections.remove(id);
        }
        report
    }
}

fn offer(id: ConnectionId, outbound: &mpsc::Sender<Frame>, frame: &Frame) -> bool {
    match outbound.try_send(Frame::clone(frame)) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            warn!(
                conn = id,
                "outbound queue full; dropping connection until it reconnects"
            );
            false
        }
        Err(TrySendError::Closed(_)) => {
            warn!(conn = id, "outbound queue closed; dropping connection");
            false
        }
    }
}
