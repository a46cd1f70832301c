//! Protocol gateway: decode inbound frames and route them into the session
//! machine. Failures go back to the sender as `ERROR` events and never touch
//! session state.

use parlor_core::ids::{ConnectionId, SessionToken, UserId};
use parlor_core::protocol::DEFAULT_USER_NAME;
use parlor_core::{BrokerError, ClientFrame, FrameError, ServerEvent};
use tracing::{debug, warn};

use crate::broker::Broker;
use crate::registry::ConnectionEntry;
use crate::session::{self, Identity};

impl Broker {
    /// Handle one inbound text frame from a connection.
    pub async fn handle_text(&self, connection_id: &ConnectionId, raw: &str) {
        self.stats.frame_received();
        let Some(entry) = self.registry.get(connection_id) else {
            debug!(connection_id = %connection_id, "frame for unregistered connection dropped");
            return;
        };

        let frame = match ClientFrame::decode(raw, self.config.max_content_len) {
            Ok(frame) => frame,
            Err(e) => {
                self.reject(&entry, e.into());
                return;
            }
        };

        let frame_type = frame.frame_type();
        if let Err(e) = self.dispatch(&entry, frame).await {
            debug!(
                connection_id = %connection_id,
                frame_type,
                error_kind = e.error_kind(),
                "frame rejected"
            );
            self.reject(&entry, e);
        }
    }

    /// Binary frames are not part of the protocol.
    pub fn handle_binary(&self, connection_id: &ConnectionId) {
        self.stats.frame_received();
        if let Some(entry) = self.registry.get(connection_id) {
            self.reject(&entry, FrameError::Binary.into());
        }
    }

    async fn dispatch(&self, entry: &ConnectionEntry, frame: ClientFrame) -> Result<(), BrokerError> {
        match frame {
            // roomId on SET_USER is accepted for compatibility and ignored;
            // rooms are entered with JOIN_ROOM.
            ClientFrame::SetUser {
                user_id,
                user_name,
                session_token,
                ..
            } => {
                session::ensure_identifiable(&entry.session())?;
                let session_token = self.authenticate(&user_id, session_token).await?;
                let identity = Identity {
                    user_id,
                    user_name: user_name
                        .filter(|n| !n.trim().is_empty())
                        .unwrap_or_else(|| DEFAULT_USER_NAME.to_string()),
                    session_token,
                };
                let mut session = entry.session();
                self.machine.identify(&mut session, &entry.outbox, identity)
            }
            ClientFrame::JoinRoom { room_id } => {
                session::ensure_joinable(&entry.session())?;
                let room_name = self.lookup.room_name(&room_id).await;
                let replaced = {
                    let mut session = entry.session();
                    self.machine
                        .join(&mut session, &entry.outbox, room_id.clone(), room_name)?
                };
                // The joiner's lock is released before the stale session's
                // is taken, so two session locks are never held at once.
                if let Some(stale) = replaced.and_then(|id| self.registry.get(&id)) {
                    let mut session = stale.session();
                    self.machine.detach(&mut session, &room_id);
                }
                Ok(())
            }
            ClientFrame::ChatMessage { content, .. } => {
                let mut session = entry.session();
                self.machine.chat(&mut session, content)
            }
            ClientFrame::LeaveRoom {} => {
                let mut session = entry.session();
                self.machine.leave(&mut session, &entry.outbox)
            }
        }
    }

    /// A presented token must be valid for this user and is handed back
    /// unchanged. Without one, the identity lookup decides and a fresh token
    /// is issued.
    async fn authenticate(
        &self,
        user_id: &UserId,
        presented: Option<SessionToken>,
    ) -> Result<SessionToken, BrokerError> {
        if let Some(token) = presented {
            self.tokens.redeem(&token, user_id)?;
            return Ok(token);
        }

        if !self.lookup.user_exists(user_id).await? {
            return Err(BrokerError::validation(format!("Unknown user {user_id}")));
        }
        Ok(self.tokens.issue(user_id))
    }

    fn reject(&self, entry: &ConnectionEntry, err: BrokerError) {
        self.stats.frame_rejected();
        if !err.is_client_error() {
            warn!(connection_id = %entry.id(), error = %err, "frame failed");
        }
        self.broadcast.send_to(&entry.outbox, &ServerEvent::error(&err));
    }
}
