//! Room directory: which users are in which room, and over which
//! connection.
//!
//! Membership is keyed by user id. A user joining again from a fresh
//! connection takes over the existing entry instead of adding a second one,
//! so peers see one presence per user however often the client reconnects.
//!
//! Rooms are created on first join and dropped when their last member
//! leaves. Each room guards its member list with its own lock, so activity
//! in one room never contends with another.
//!
//! A room that empties is marked closed and removed from the map while its
//! lock is still held. A joiner that raced the removal and locked the stale
//! room sees the flag and retries against a fresh one.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use parlor_core::ids::{ConnectionId, RoomId, UserId};
use tracing::debug;

use crate::broadcast::Outbox;

/// One user's presence in a room, bound to the connection that delivers it.
#[derive(Clone, Debug)]
pub struct Member {
    pub connection_id: ConnectionId,
    pub user_id: UserId,
    pub user_name: String,
    pub outbox: Outbox,
}

#[derive(Default)]
struct RoomState {
    /// Join order, one entry per user.
    members: Vec<Member>,
    closed: bool,
}

impl RoomState {
    fn position(&self, user_id: &UserId) -> Option<usize> {
        self.members.iter().position(|m| &m.user_id == user_id)
    }
}

pub struct Room {
    id: RoomId,
    state: Mutex<RoomState>,
}

impl Room {
    pub fn id(&self) -> &RoomId {
        &self.id
    }

    pub fn member_count(&self) -> usize {
        self.state.lock().members.len()
    }

    /// Set once the room has emptied and left the directory.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

/// How [`RoomDirectory::add_member`] changed the room.
#[derive(Debug)]
pub enum JoinOutcome {
    /// New presence; peers should hear about it.
    Inserted,
    /// The user was already present through another connection, which has
    /// been replaced. Peers see no change.
    Rebound { previous: Member },
    /// Same user on the same connection; nothing changed.
    Unchanged,
}

/// Result of [`RoomDirectory::add_member`].
#[derive(Debug)]
pub struct Joined {
    pub outcome: JoinOutcome,
    /// Every other user in the room at the moment of the join.
    pub others: Vec<Member>,
}

impl Joined {
    pub fn is_new_presence(&self) -> bool {
        matches!(self.outcome, JoinOutcome::Inserted)
    }
}

/// Result of [`RoomDirectory::remove_member`].
#[derive(Debug)]
pub struct Departed {
    pub member: Member,
    pub remaining: Vec<Member>,
}

#[derive(Default)]
pub struct RoomDirectory {
    rooms: DashMap<RoomId, Arc<Room>>,
}

impl RoomDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look a room up, creating it empty if absent. Any id is accepted.
    pub fn get_or_create(&self, room_id: &RoomId) -> Arc<Room> {
        let entry = self.rooms.entry(room_id.clone()).or_insert_with(|| {
            debug!(room_id = %room_id, "room created");
            Arc::new(Room {
                id: room_id.clone(),
                state: Mutex::new(RoomState::default()),
            })
        });
        Arc::clone(entry.value())
    }

    // Clones the Arc out so the shard guard is released before the room lock
    // is taken; `remove_member` takes those in the opposite order.
    fn lookup(&self, room_id: &RoomId) -> Option<Arc<Room>> {
        self.rooms.get(room_id).map(|r| Arc::clone(r.value()))
    }

    /// Add a user to a room, creating the room if needed. If the user is
    /// already present through another connection the entry is rebound to
    /// `member`'s connection in place. Insertion and the snapshot of other
    /// members happen under one lock, so concurrent joiners each see a
    /// consistent set of peers.
    pub fn add_member(&self, room_id: &RoomId, member: Member) -> Joined {
        loop {
            let room = self.get_or_create(room_id);
            let mut state = room.state.lock();
            if state.closed {
                continue;
            }

            let others = state
                .members
                .iter()
                .filter(|m| m.user_id != member.user_id)
                .cloned()
                .collect();
            let outcome = match state.position(&member.user_id) {
                None => {
                    state.members.push(member);
                    JoinOutcome::Inserted
                }
                Some(pos) if state.members[pos].connection_id == member.connection_id => {
                    JoinOutcome::Unchanged
                }
                Some(pos) => {
                    let previous = std::mem::replace(&mut state.members[pos], member);
                    debug!(
                        room_id = %room_id,
                        user_id = %previous.user_id,
                        stale_connection = %previous.connection_id,
                        "member rebound to new connection"
                    );
                    JoinOutcome::Rebound { previous }
                }
            };
            return Joined { outcome, others };
        }
    }

    /// Remove a user from a room, but only while `connection_id` is still
    /// the connection bound for them. Returns `None` otherwise, including
    /// when the entry was taken over by a newer connection. Empties the room
    /// out of the directory when it was the last one.
    pub fn remove_member(
        &self,
        room_id: &RoomId,
        user_id: &UserId,
        connection_id: &ConnectionId,
    ) -> Option<Departed> {
        let room = self.lookup(room_id)?;
        let mut state = room.state.lock();
        let pos = state.position(user_id)?;
        if &state.members[pos].connection_id != connection_id {
            return None;
        }
        let member = state.members.remove(pos);

        if state.members.is_empty() {
            state.closed = true;
            self.rooms.remove_if(room_id, |_, r| Arc::ptr_eq(r, &room));
            debug!(room_id = %room_id, "room emptied");
        }

        Some(Departed {
            member,
            remaining: state.members.clone(),
        })
    }

    /// Snapshot of a room's members, in join order. Empty for unknown rooms.
    pub fn members_of(&self, room_id: &RoomId) -> Vec<Member> {
        self.lookup(room_id)
            .map(|room| room.state.lock().members.clone())
            .unwrap_or_default()
    }

    pub fn contains(&self, room_id: &RoomId, user_id: &UserId) -> bool {
        self.bound_connection(room_id, user_id).is_some()
    }

    /// The connection currently carrying `user_id`'s presence in the room.
    pub fn bound_connection(&self, room_id: &RoomId, user_id: &UserId) -> Option<ConnectionId> {
        let room = self.lookup(room_id)?;
        let state = room.state.lock();
        state
            .position(user_id)
            .map(|pos| state.members[pos].connection_id.clone())
    }

    pub fn is_bound(&self, room_id: &RoomId, user_id: &UserId, connection_id: &ConnectionId) -> bool {
        self.bound_connection(room_id, user_id).as_ref() == Some(connection_id)
    }

    pub fn member_count(&self, room_id: &RoomId) -> usize {
        self.lookup(room_id)
            .map(|room| room.state.lock().members.len())
            .unwrap_or(0)
    }

    /// Number of rooms with at least one member.
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn room_ids(&self) -> Vec<RoomId> {
        self.rooms.iter().map(|r| r.key().clone()).collect()
    }
}
