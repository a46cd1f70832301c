//! Room-based real-time message broker.
//!
//! Transport-agnostic: a connection is an id plus a bounded outbox of encoded
//! frames. The server crate owns the sockets and feeds text frames in through
//! [`Broker::handle_text`].

pub mod broadcast;
pub mod broker;
pub mod config;
pub mod directory;
pub mod gateway;
pub mod identity;
pub mod registry;
pub mod session;
pub mod stats;

pub use broadcast::{BroadcastEngine, DeliveryError, Outbox};
pub use broker::Broker;
pub use config::BrokerConfig;
pub use directory::{Member, Room, RoomDirectory};
pub use identity::{IdentityLookup, OpenIdentity, SessionTokens};
pub use registry::{ConnectionEntry, ConnectionRegistry, Session, SessionState};
pub use stats::{BrokerStats, StatsSnapshot};
