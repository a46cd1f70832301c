//! Session state machine.
//!
//! ```text
//! Unidentified --SET_USER--> Identified --JOIN_ROOM--> Joined
//!                                ^                        |
//!                                +-------LEAVE_ROOM-------+
//! any --disconnect--> Closed
//! ```
//!
//! Transitions run with the session lock held and take room locks inside it,
//! never the other way round. Nothing here awaits.
//!
//! A user who joins a room from a fresh connection takes over the presence
//! held by their older connection. `join` reports the connection it replaced
//! so the caller can [`SessionMachine::detach`] that session once the
//! joiner's lock is released. Until then the old session cannot announce a
//! departure, and a chat frame from it detaches it on the spot.

use std::sync::Arc;

use parlor_core::ids::{ConnectionId, RoomId, SessionToken, UserId};
use parlor_core::{BrokerError, ServerEvent};
use tracing::{debug, info};

use crate::broadcast::{BroadcastEngine, Outbox};
use crate::directory::{JoinOutcome, Member, RoomDirectory};
use crate::registry::{Session, SessionState};

/// A verified identity ready to bind to a session.
#[derive(Clone, Debug)]
pub struct Identity {
    pub user_id: UserId,
    pub user_name: String,
    pub session_token: SessionToken,
}

#[derive(Clone)]
pub struct SessionMachine {
    directory: Arc<RoomDirectory>,
    broadcast: BroadcastEngine,
}

impl SessionMachine {
    pub fn new(directory: Arc<RoomDirectory>, broadcast: BroadcastEngine) -> Self {
        Self {
            directory,
            broadcast,
        }
    }

    /// `SET_USER`: bind an identity. The user id never changes afterwards.
    pub fn identify(
        &self,
        session: &mut Session,
        outbox: &Outbox,
        identity: Identity,
    ) -> Result<(), BrokerError> {
        match session.state {
            SessionState::Closed => return Ok(()),
            SessionState::Unidentified => {}
            SessionState::Identified | SessionState::Joined => {
                return Err(already_identified(session));
            }
        }

        info!(
            connection_id = %session.connection_id,
            user_id = %identity.user_id,
            "connection identified"
        );
        session.user_id = Some(identity.user_id.clone());
        session.user_name = Some(identity.user_name);
        session.session_token = Some(identity.session_token.clone());
        session.state = SessionState::Identified;

        self.broadcast.send_to(
            outbox,
            &ServerEvent::UserSet {
                user_id: identity.user_id,
                session_token: identity.session_token,
            },
        );
        Ok(())
    }

    /// `JOIN_ROOM`: enter a room and exchange presence with its members.
    ///
    /// The joiner receives `ROOM_JOINED` followed by one `USER_JOINED` per
    /// existing member; each existing member receives `USER_JOINED` for the
    /// joiner. Returns the older connection whose presence was taken over,
    /// if any.
    pub fn join(
        &self,
        session: &mut Session,
        outbox: &Outbox,
        room_id: RoomId,
        room_name: Option<String>,
    ) -> Result<Option<ConnectionId>, BrokerError> {
        match session.state {
            SessionState::Closed => return Ok(None),
            SessionState::Identified => {}
            SessionState::Unidentified => {
                return Err(BrokerError::protocol_state("Send SET_USER before JOIN_ROOM"));
            }
            SessionState::Joined => {
                let current = session.room_id.as_ref().map(RoomId::as_str).unwrap_or("");
                return Err(BrokerError::protocol_state(format!(
                    "Already in room {current}; send LEAVE_ROOM first"
                )));
            }
        }
        let (user_id, user_name) = identity_of(session)?;

        let joined = self.directory.add_member(
            &room_id,
            Member {
                connection_id: session.connection_id.clone(),
                user_id: user_id.clone(),
                user_name: user_name.clone(),
                outbox: outbox.clone(),
            },
        );
        session.room_id = Some(room_id.clone());
        session.state = SessionState::Joined;
        info!(
            connection_id = %session.connection_id,
            room_id = %room_id,
            peers = joined.others.len(),
            "joined room"
        );

        let mut replaced = None;
        if let JoinOutcome::Rebound { previous } = &joined.outcome {
            info!(
                connection_id = %session.connection_id,
                stale_connection = %previous.connection_id,
                room_id = %room_id,
                "presence taken over from older connection"
            );
            self.broadcast.send_to(
                &previous.outbox,
                &ServerEvent::RoomLeft {
                    room_id: room_id.clone(),
                },
            );
            replaced = Some(previous.connection_id.clone());
        }

        self.broadcast.send_to(
            outbox,
            &ServerEvent::RoomJoined {
                room_id,
                name: room_name,
            },
        );
        for peer in &joined.others {
            self.broadcast.send_to(
                outbox,
                &ServerEvent::UserJoined {
                    user_id: peer.user_id.clone(),
                    user_name: peer.user_name.clone(),
                },
            );
        }
        if joined.is_new_presence() {
            self.broadcast.emit(
                &ServerEvent::UserJoined { user_id, user_name },
                &joined.others,
                None,
            );
        }
        Ok(replaced)
    }

    /// Move a session whose presence in `room_id` was taken over by another
    /// connection back to `Identified`. No-op if the session has since left,
    /// moved, or won its presence back.
    pub fn detach(&self, session: &mut Session, room_id: &RoomId) -> bool {
        if session.state != SessionState::Joined || session.room_id.as_ref() != Some(room_id) {
            return false;
        }
        let Some(user_id) = session.user_id.as_ref() else {
            return false;
        };
        if self
            .directory
            .is_bound(room_id, user_id, &session.connection_id)
        {
            return false;
        }
        session.room_id = None;
        session.state = SessionState::Identified;
        debug!(
            connection_id = %session.connection_id,
            room_id = %room_id,
            "stale session detached"
        );
        true
    }

    /// `CHAT_MESSAGE`: fan out to every member of the sender's room,
    /// the sender included. The sender name comes from the session, not
    /// the frame.
    pub fn chat(&self, session: &mut Session, content: String) -> Result<(), BrokerError> {
        match session.state {
            SessionState::Closed => return Ok(()),
            SessionState::Joined => {}
            SessionState::Unidentified | SessionState::Identified => {
                return Err(BrokerError::protocol_state(
                    "Join a room before sending messages",
                ));
            }
        }
        let (user_id, user_name) = identity_of(session)?;
        let room_id = session
            .room_id
            .clone()
            .ok_or_else(|| BrokerError::protocol_state("Not in a room"))?;

        if self.detach(session, &room_id) {
            return Err(BrokerError::protocol_state(format!(
                "Room {room_id} was rejoined from another connection"
            )));
        }

        let members = self.directory.members_of(&room_id);
        let event = ServerEvent::chat(room_id.clone(), user_id, Some(user_name), content);
        let delivered = self.broadcast.emit(&event, &members, None);
        debug!(
            connection_id = %session.connection_id,
            room_id = %room_id,
            delivered,
            "chat message fanned out"
        );
        Ok(())
    }

    /// `LEAVE_ROOM`: back to `Identified`.
    pub fn leave(&self, session: &mut Session, outbox: &Outbox) -> Result<(), BrokerError> {
        match session.state {
            SessionState::Closed => return Ok(()),
            SessionState::Joined => {}
            SessionState::Unidentified | SessionState::Identified => {
                return Err(BrokerError::protocol_state("Not in a room"));
            }
        }
        let Some(room_id) = session.room_id.take() else {
            return Err(BrokerError::protocol_state("Not in a room"));
        };
        session.state = SessionState::Identified;
        self.depart(session, &room_id);
        info!(connection_id = %session.connection_id, room_id = %room_id, "left room");

        self.broadcast
            .send_to(outbox, &ServerEvent::RoomLeft { room_id });
        Ok(())
    }

    /// Disconnect: terminal from any state. Returns the room the session was
    /// in, if any.
    pub fn close(&self, session: &mut Session) -> Option<RoomId> {
        if session.state == SessionState::Closed {
            return None;
        }
        session.state = SessionState::Closed;
        let room_id = session.room_id.take()?;
        self.depart(session, &room_id);
        Some(room_id)
    }

    /// Drop the session's presence and tell the room, unless a newer
    /// connection for the same user holds it.
    fn depart(&self, session: &Session, room_id: &RoomId) {
        let Some(user_id) = session.user_id.as_ref() else {
            return;
        };
        let Some(departed) =
            self.directory
                .remove_member(room_id, user_id, &session.connection_id)
        else {
            debug!(
                connection_id = %session.connection_id,
                room_id = %room_id,
                "presence held by another connection, departure not announced"
            );
            return;
        };
        self.broadcast.emit(
            &ServerEvent::UserLeft {
                user_id: departed.member.user_id,
                user_name: Some(departed.member.user_name),
            },
            &departed.remaining,
            None,
        );
    }
}

fn identity_of(session: &Session) -> Result<(UserId, String), BrokerError> {
    let user_id = session
        .user_id
        .clone()
        .ok_or_else(|| BrokerError::protocol_state("Send SET_USER first"))?;
    let user_name = session
        .user_name
        .clone()
        .unwrap_or_else(|| parlor_core::protocol::DEFAULT_USER_NAME.to_string());
    Ok((user_id, user_name))
}

fn already_identified(session: &Session) -> BrokerError {
    let current = session.user_id.as_ref().map(UserId::as_str).unwrap_or("");
    BrokerError::protocol_state(format!(
        "Connection is already identified as {current}; userId cannot change"
    ))
}

/// Pre-flight check for `SET_USER`, so the async lookup is skipped for
/// sessions that would reject it anyway.
pub(crate) fn ensure_identifiable(session: &Session) -> Result<(), BrokerError> {
    match session.state {
        SessionState::Identified | SessionState::Joined => Err(already_identified(session)),
        SessionState::Unidentified | SessionState::Closed => Ok(()),
    }
}

/// Pre-flight check for `JOIN_ROOM`, before the room name lookup.
pub(crate) fn ensure_joinable(session: &Session) -> Result<(), BrokerError> {
    match session.state {
        SessionState::Unidentified => {
            Err(BrokerError::protocol_state("Send SET_USER before JOIN_ROOM"))
        }
        SessionState::Joined => Err(BrokerError::protocol_state(
            "Already in a room; send LEAVE_ROOM first",
        )),
        SessionState::Identified | SessionState::Closed => Ok(()),
    }
}
