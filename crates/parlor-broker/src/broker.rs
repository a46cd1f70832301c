use std::sync::Arc;

use parking_lot::Mutex;
use parlor_core::ids::ConnectionId;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::broadcast::BroadcastEngine;
use crate::config::BrokerConfig;
use crate::directory::RoomDirectory;
use crate::identity::{IdentityLookup, SessionTokens};
use crate::registry::{ConnectionEntry, ConnectionRegistry, Session};
use crate::session::SessionMachine;
use crate::stats::{BrokerStats, StatsSnapshot};

/// The broker: connection registry, room directory and session machine
/// behind one handle. Inbound frames enter through [`Broker::handle_text`].
pub struct Broker {
    pub(crate) config: BrokerConfig,
    pub(crate) registry: ConnectionRegistry,
    pub(crate) directory: Arc<RoomDirectory>,
    pub(crate) machine: SessionMachine,
    pub(crate) broadcast: BroadcastEngine,
    pub(crate) tokens: SessionTokens,
    pub(crate) lookup: Arc<dyn IdentityLookup>,
    pub(crate) stats: Arc<BrokerStats>,
    evictions: Mutex<Option<mpsc::UnboundedReceiver<ConnectionId>>>,
}

impl Broker {
    pub fn new(config: BrokerConfig, lookup: Arc<dyn IdentityLookup>) -> Arc<Self> {
        let (evict_tx, evict_rx) = mpsc::unbounded_channel();
        let stats = Arc::new(BrokerStats::default());
        let directory = Arc::new(RoomDirectory::new());
        let broadcast = BroadcastEngine::new(evict_tx, Arc::clone(&stats));
        Arc::new(Self {
            registry: ConnectionRegistry::new(config.max_send_queue),
            machine: SessionMachine::new(Arc::clone(&directory), broadcast.clone()),
            tokens: SessionTokens::new(config.session_token_ttl),
            directory,
            broadcast,
            lookup,
            stats,
            config,
            evictions: Mutex::new(Some(evict_rx)),
        })
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Register a new connection. Frames for it appear on the receiver.
    pub fn register(&self) -> (ConnectionId, mpsc::Receiver<String>) {
        let (id, rx) = self.registry.register();
        self.stats.connection_opened();
        debug!(connection_id = %id, "connection registered");
        (id, rx)
    }

    /// Tear a connection down: leave its room (notifying the others once)
    /// and mark the session closed. Safe to call repeatedly and from any
    /// teardown path; only the first call does anything.
    pub fn unregister(&self, id: &ConnectionId) -> bool {
        let Some(entry) = self.registry.remove(id) else {
            return false;
        };
        let room = {
            let mut session = entry.session();
            self.machine.close(&mut session)
        };
        self.stats.connection_closed();
        match room {
            Some(room_id) => info!(connection_id = %id, room_id = %room_id, "connection closed"),
            None => info!(connection_id = %id, "connection closed"),
        }
        true
    }

    pub fn connection(&self, id: &ConnectionId) -> Option<Arc<ConnectionEntry>> {
        self.registry.get(id)
    }

    pub fn session(&self, id: &ConnectionId) -> Option<Session> {
        self.registry.session(id)
    }

    pub fn record_pong(&self, id: &ConnectionId) {
        if let Some(entry) = self.registry.get(id) {
            entry.record_pong();
        }
    }

    pub fn directory(&self) -> &RoomDirectory {
        &self.directory
    }

    pub fn connection_count(&self) -> usize {
        self.registry.count()
    }

    pub fn room_count(&self) -> usize {
        self.directory.room_count()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Unregister every connection queued for eviction by the broadcast
    /// engine. The reaper task does this continuously; tests call it directly.
    pub fn reap_evictions(&self) -> usize {
        let mut queued = Vec::new();
        if let Some(rx) = self.evictions.lock().as_mut() {
            while let Ok(id) = rx.try_recv() {
                queued.push(id);
            }
        }
        queued.into_iter().filter(|id| self.evict(id)).count()
    }

    fn evict(&self, id: &ConnectionId) -> bool {
        let removed = self.unregister(id);
        if removed {
            self.stats.evicted();
            info!(connection_id = %id, "evicted connection");
        }
        removed
    }

    /// Drop unresponsive connections and expired tokens.
    pub fn sweep(&self) -> usize {
        let dead = self.registry.unresponsive(self.config.heartbeat_timeout);
        let removed = dead.iter().filter(|id| self.evict(id)).count();
        let pruned = self.tokens.prune_expired();
        if removed > 0 || pruned > 0 {
            info!(removed, pruned, "maintenance sweep");
        }
        removed
    }

    /// Spawn the eviction reaper and the periodic sweep. Both stop when
    /// `shutdown` is cancelled. Only the first call starts a reaper.
    pub fn start_maintenance(self: &Arc<Self>, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(2);

        if let Some(mut rx) = self.evictions.lock().take() {
            let broker = Arc::clone(self);
            let token = shutdown.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        () = token.cancelled() => break,
                        next = rx.recv() => match next {
                            Some(id) => {
                                broker.evict(&id);
                            }
                            None => break,
                        },
                    }
                }
                debug!("eviction reaper stopped");
            }));
        }

        let broker = Arc::clone(self);
        let interval = self.config.sweep_interval;
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        broker.sweep();
                    }
                }
            }
            debug!("maintenance sweep stopped");
        }));

        handles
    }

    /// Close every connection, e.g. on shutdown.
    pub fn close_all(&self) -> usize {
        let ids: Vec<ConnectionId> = self.registry.ids();
        ids.iter().filter(|id| self.unregister(id)).count()
    }
}
