//! Fan-out of server events to connection outboxes.
//!
//! Delivery never blocks: each outbox is a bounded channel drained by the
//! connection's writer task. A full or closed outbox marks the connection for
//! eviction instead of stalling the sender or the rest of the room.

use std::sync::Arc;

use parlor_core::ids::ConnectionId;
use parlor_core::ServerEvent;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::directory::Member;
use crate::stats::BrokerStats;

/// Sending half of a connection's frame queue.
#[derive(Clone, Debug)]
pub struct Outbox {
    connection_id: ConnectionId,
    tx: mpsc::Sender<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("outbox full")]
    Full,
    #[error("outbox closed")]
    Closed,
}

impl Outbox {
    pub fn new(connection_id: ConnectionId, tx: mpsc::Sender<String>) -> Self {
        Self { connection_id, tx }
    }

    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    pub fn try_deliver(&self, frame: String) -> Result<(), DeliveryError> {
        self.tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Full,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }
}

/// Encodes events once and enqueues them on one or many outboxes.
#[derive(Clone)]
pub struct BroadcastEngine {
    evictions: mpsc::UnboundedSender<ConnectionId>,
    stats: Arc<BrokerStats>,
}

impl BroadcastEngine {
    pub fn new(evictions: mpsc::UnboundedSender<ConnectionId>, stats: Arc<BrokerStats>) -> Self {
        Self { evictions, stats }
    }

    /// Deliver an event to a single connection.
    pub fn send_to(&self, outbox: &Outbox, event: &ServerEvent) -> bool {
        match encode(event) {
            Some(frame) => self.deliver(outbox, frame),
            None => false,
        }
    }

    /// Deliver an event to every member of a room snapshot, optionally
    /// skipping one connection. Returns how many outboxes accepted it.
    pub fn emit(
        &self,
        event: &ServerEvent,
        members: &[Member],
        exclude: Option<&ConnectionId>,
    ) -> usize {
        let Some(frame) = encode(event) else {
            return 0;
        };
        members
            .iter()
            .filter(|m| Some(&m.connection_id) != exclude)
            .filter(|m| self.deliver(&m.outbox, frame.clone()))
            .count()
    }

    fn deliver(&self, outbox: &Outbox, frame: String) -> bool {
        match outbox.try_deliver(frame) {
            Ok(()) => {
                self.stats.delivered();
                true
            }
            Err(DeliveryError::Full) => {
                warn!(
                    connection_id = %outbox.connection_id,
                    "send queue full, evicting slow connection"
                );
                self.stats.delivery_failed();
                self.evict(outbox.connection_id());
                false
            }
            Err(DeliveryError::Closed) => {
                debug!(connection_id = %outbox.connection_id, "outbox closed, evicting");
                self.stats.delivery_failed();
                self.evict(outbox.connection_id());
                false
            }
        }
    }

    fn evict(&self, connection_id: &ConnectionId) {
        // Receiver is gone only during shutdown.
        let _ = self.evictions.send(connection_id.clone());
    }
}

fn encode(event: &ServerEvent) -> Option<String> {
    match event.encode() {
        Ok(frame) => Some(frame),
        Err(e) => {
            error!(event_type = event.event_type(), error = %e, "failed to encode event");
            None
        }
    }
}
