use rusqlite::OptionalExtension;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use parlor_core::ids::{RoomId, UserId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers::{self, get, get_opt};

/// A chat room. The password is kept for the room check but never serialized.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomRow {
    pub id: RoomId,
    pub name: String,
    #[serde(skip_serializing, default)]
    pub password: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<UserId>,
    pub created_at: String,
}

impl RoomRow {
    fn from_row(row: &rusqlite::Row<'_>) -> Result<Self, StoreError> {
        Ok(Self {
            id: RoomId::from_raw(get::<String>(row, 0, "rooms", "id")?),
            name: get(row, 1, "rooms", "name")?,
            password: get(row, 2, "rooms", "password")?,
            created_by: get_opt::<String>(row, 3, "rooms", "created_by")?.map(UserId::from_raw),
            created_at: get(row, 4, "rooms", "created_at")?,
        })
    }
}

const SELECT_ROOM: &str = "SELECT id, name, password, created_by, created_at FROM rooms";

pub struct RoomRepo {
    db: Database,
}

impl RoomRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self, password))]
    pub fn create(
        &self,
        name: &str,
        password: &str,
        created_by: Option<&UserId>,
    ) -> Result<RoomRow, StoreError> {
        let room = RoomRow {
            id: RoomId::new(),
            name: name.to_string(),
            password: password.to_string(),
            created_by: created_by.cloned(),
            created_at: row_helpers::now(),
        };
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO rooms (id, name, password, created_by, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    room.id.as_str(),
                    room.name,
                    room.password,
                    room.created_by.as_ref().map(UserId::as_str),
                    room.created_at,
                ],
            )?;
            Ok(())
        })?;
        Ok(room)
    }

    #[instrument(skip(self), fields(room_id = %id))]
    pub fn get(&self, id: &RoomId) -> Result<RoomRow, StoreError> {
        self.db.with_conn(|conn| {
            conn.query_row(&format!("{SELECT_ROOM} WHERE id = ?1"), [id.as_str()], |row| {
                Ok(RoomRow::from_row(row))
            })
            .optional()?
            .transpose()?
            .ok_or_else(|| StoreError::NotFound(format!("room {id}")))
        })
    }

    /// All rooms, oldest first.
    #[instrument(skip(self))]
    pub fn list(&self) -> Result<Vec<RoomRow>, StoreError> {
        self.db.with_conn(|conn| {
            row_helpers::collect_rows(
                conn,
                &format!("{SELECT_ROOM} ORDER BY created_at ASC, id ASC"),
                [],
                RoomRow::from_row,
            )
        })
    }

    /// Plaintext comparison against the stored password.
    #[instrument(skip(self, password), fields(room_id = %id))]
    pub fn verify_password(&self, id: &RoomId, password: &str) -> Result<bool, StoreError> {
        let room = self.get(id)?;
        Ok(room.password == password)
    }
}
