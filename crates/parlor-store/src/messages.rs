use rusqlite::OptionalExtension;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use parlor_core::ids::{MessageId, RoomId, UserId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers::{self, get, get_opt};

/// A persisted chat message. `sender_name` is filled from the users table on reads.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRow {
    pub id: MessageId,
    pub content: String,
    pub sender_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    pub room_id: RoomId,
    pub created_at: String,
}

impl MessageRow {
    fn from_row(row: &rusqlite::Row<'_>) -> Result<Self, StoreError> {
        Ok(Self {
            id: MessageId::from_raw(get::<String>(row, 0, "messages", "id")?),
            content: get(row, 1, "messages", "content")?,
            sender_id: UserId::from_raw(get::<String>(row, 2, "messages", "sender_id")?),
            sender_name: get_opt(row, 3, "users", "name")?,
            room_id: RoomId::from_raw(get::<String>(row, 4, "messages", "room_id")?),
            created_at: get(row, 5, "messages", "created_at")?,
        })
    }
}

pub struct MessageRepo {
    db: Database,
}

impl MessageRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Store a message. Both the room and the sender must exist.
    #[instrument(skip(self, content), fields(room_id = %room_id, user_id = %sender_id))]
    pub fn create(
        &self,
        room_id: &RoomId,
        sender_id: &UserId,
        content: &str,
    ) -> Result<MessageRow, StoreError> {
        self.db.with_conn(|conn| {
            let sender_name: Option<String> = conn
                .query_row("SELECT name FROM users WHERE id = ?1", [sender_id.as_str()], |row| {
                    row.get(0)
                })
                .optional()?;
            let Some(sender_name) = sender_name else {
                return Err(StoreError::NotFound(format!("user {sender_id}")));
            };

            let room_known: Option<i64> = conn
                .query_row("SELECT 1 FROM rooms WHERE id = ?1", [room_id.as_str()], |row| row.get(0))
                .optional()?;
            if room_known.is_none() {
                return Err(StoreError::NotFound(format!("room {room_id}")));
            }

            let message = MessageRow {
                id: MessageId::new(),
                content: content.to_string(),
                sender_id: sender_id.clone(),
                sender_name: Some(sender_name),
                room_id: room_id.clone(),
                created_at: row_helpers::now(),
            };
            conn.execute(
                "INSERT INTO messages (id, room_id, sender_id, content, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    message.id.as_str(),
                    message.room_id.as_str(),
                    message.sender_id.as_str(),
                    message.content,
                    message.created_at,
                ],
            )?;
            Ok(message)
        })
    }

    /// Room history, oldest first.
    #[instrument(skip(self), fields(room_id = %room_id))]
    pub fn list_for_room(&self, room_id: &RoomId) -> Result<Vec<MessageRow>, StoreError> {
        self.db.with_conn(|conn| {
            row_helpers::collect_rows(
                conn,
                "SELECT m.id, m.content, m.sender_id, u.name, m.room_id, m.created_at
                 FROM messages m LEFT JOIN users u ON u.id = m.sender_id
                 WHERE m.room_id = ?1
                 ORDER BY m.created_at ASC, m.id ASC",
                [room_id.as_str()],
                MessageRow::from_row,
            )
        })
    }
}
