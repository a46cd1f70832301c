use async_trait::async_trait;
use parlor_broker::IdentityLookup;
use parlor_core::ids::{RoomId, UserId};
use parlor_core::BrokerError;
use parlor_store::rooms::RoomRepo;
use parlor_store::users::UserRepo;
use parlor_store::{Database, StoreError};
use tracing::warn;

/// Identity lookups backed by the user and room tables.
pub struct StoreIdentity {
    users: UserRepo,
    rooms: RoomRepo,
    require_known_users: bool,
}

impl StoreIdentity {
    pub fn new(db: Database, require_known_users: bool) -> Self {
        Self {
            users: UserRepo::new(db.clone()),
            rooms: RoomRepo::new(db),
            require_known_users,
        }
    }
}

#[async_trait]
impl IdentityLookup for StoreIdentity {
    async fn user_exists(&self, user_id: &UserId) -> Result<bool, BrokerError> {
        if !self.require_known_users {
            return Ok(true);
        }
        self.users
            .exists(user_id)
            .map_err(|e| BrokerError::Transport(format!("user lookup failed: {e}")))
    }

    async fn room_name(&self, room_id: &RoomId) -> Option<String> {
        match self.rooms.get(room_id) {
            Ok(room) => Some(room.name),
            Err(StoreError::NotFound(_)) => None,
            Err(e) => {
                warn!(room_id = %room_id, error = %e, "room lookup failed");
                None
            }
        }
    }
}
