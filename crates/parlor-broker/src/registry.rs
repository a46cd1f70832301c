//! Live connections and their session state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};
use parlor_core::ids::{ConnectionId, RoomId, SessionToken, UserId};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::broadcast::Outbox;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Unidentified,
    Identified,
    Joined,
    Closed,
}

/// Per-connection protocol state.
///
/// `user_id` is set exactly once. `room_id` is `Some` only while `Joined`.
#[derive(Clone, Debug)]
pub struct Session {
    pub connection_id: ConnectionId,
    pub user_id: Option<UserId>,
    pub user_name: Option<String>,
    pub room_id: Option<RoomId>,
    pub session_token: Option<SessionToken>,
    pub state: SessionState,
}

impl Session {
    fn new(connection_id: ConnectionId) -> Self {
        Self {
            connection_id,
            user_id: None,
            user_name: None,
            room_id: None,
            session_token: None,
            state: SessionState::Unidentified,
        }
    }
}

/// A registered connection.
pub struct ConnectionEntry {
    pub outbox: Outbox,
    session: Mutex<Session>,
    last_pong: AtomicU64,
}

impl ConnectionEntry {
    fn new(outbox: Outbox) -> Self {
        let session = Session::new(outbox.connection_id().clone());
        Self {
            outbox,
            session: Mutex::new(session),
            last_pong: AtomicU64::new(now_secs()),
        }
    }

    pub fn id(&self) -> &ConnectionId {
        self.outbox.connection_id()
    }

    /// Lock the session. Never hold the guard across an `.await`.
    pub fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock()
    }

    pub fn record_pong(&self) {
        self.last_pong.store(now_secs(), Ordering::Relaxed);
    }

    pub fn is_alive(&self, timeout: Duration) -> bool {
        let last = self.last_pong.load(Ordering::Relaxed);
        now_secs().saturating_sub(last) < timeout.as_secs()
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Registry of live connections.
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<ConnectionEntry>>,
    max_send_queue: usize,
}

impl ConnectionRegistry {
    pub fn new(max_send_queue: usize) -> Self {
        Self {
            connections: DashMap::new(),
            max_send_queue,
        }
    }

    /// Register a new connection in `Unidentified` state. The receiver feeds
    /// the connection's writer.
    pub fn register(&self) -> (ConnectionId, mpsc::Receiver<String>) {
        let id = ConnectionId::new();
        let (tx, rx) = mpsc::channel(self.max_send_queue);
        let entry = Arc::new(ConnectionEntry::new(Outbox::new(id.clone(), tx)));
        self.connections.insert(id.clone(), entry);
        (id, rx)
    }

    pub fn get(&self, id: &ConnectionId) -> Option<Arc<ConnectionEntry>> {
        self.connections.get(id).map(|e| Arc::clone(e.value()))
    }

    /// Take a connection out of the registry. Only the first call for a given
    /// id returns the entry.
    pub fn remove(&self, id: &ConnectionId) -> Option<Arc<ConnectionEntry>> {
        self.connections.remove(id).map(|(_, entry)| entry)
    }

    /// Snapshot of a connection's session.
    pub fn session(&self, id: &ConnectionId) -> Option<Session> {
        self.get(id).map(|entry| entry.session().clone())
    }

    pub fn count(&self) -> usize {
        self.connections.len()
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        self.connections.iter().map(|e| e.key().clone()).collect()
    }

    /// Connections that have not answered a ping within `timeout`.
    pub fn unresponsive(&self, timeout: Duration) -> Vec<ConnectionId> {
        self.connections
            .iter()
            .filter(|e| !e.value().is_alive(timeout))
            .map(|e| e.key().clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_remove() {
        let registry = ConnectionRegistry::new(8);
        assert_eq!(registry.count(), 0);

        let (a, _rx_a) = registry.register();
        let (b, _rx_b) = registry.register();
        assert_ne!(a, b);
        assert_eq!(registry.count(), 2);

        assert!(registry.remove(&a).is_some());
        assert!(registry.remove(&a).is_none());
        assert_eq!(registry.count(), 1);
        assert!(registry.get(&b).is_some());
    }

    #[test]
    fn new_connection_is_unidentified() {
        let registry = ConnectionRegistry::new(8);
        let (id, _rx) = registry.register();
        let session = registry.session(&id).unwrap();
        assert_eq!(session.state, SessionState::Unidentified);
        assert_eq!(session.connection_id, id);
        assert!(session.user_id.is_none());
        assert!(session.room_id.is_none());
    }

    #[test]
    fn outbox_feeds_receiver() {
        let registry = ConnectionRegistry::new(8);
        let (id, mut rx) = registry.register();
        let entry = registry.get(&id).unwrap();
        entry.outbox.try_deliver("frame".into()).unwrap();
        assert_eq!(rx.try_recv().unwrap(), "frame");
        assert_eq!(entry.id(), &id);
    }

    #[test]
    fn outbox_capacity_matches_config() {
        let registry = ConnectionRegistry::new(2);
        let (id, _rx) = registry.register();
        let entry = registry.get(&id).unwrap();
        assert!(entry.outbox.try_deliver("1".into()).is_ok());
        assert!(entry.outbox.try_deliver("2".into()).is_ok());
        assert!(entry.outbox.try_deliver("3".into()).is_err());
    }

    #[test]
    fn pong_tracking() {
        let registry = ConnectionRegistry::new(8);
        let (id, _rx) = registry.register();
        let entry = registry.get(&id).unwrap();
        assert!(entry.is_alive(Duration::from_secs(90)));
        assert!(registry.unresponsive(Duration::from_secs(90)).is_empty());

        entry.last_pong.store(0, Ordering::Relaxed);
        assert_eq!(registry.unresponsive(Duration::from_secs(90)), vec![id]);

        entry.record_pong();
        assert!(registry.unresponsive(Duration::from_secs(90)).is_empty());
    }

    #[test]
    fn state_serializes_like_the_wire() {
        let json = serde_json::to_string(&SessionState::Unidentified).unwrap();
        assert_eq!(json, "\"UNIDENTIFIED\"");
    }
}
