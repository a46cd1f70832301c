use rusqlite::OptionalExtension;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use parlor_core::ids::UserId;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers::{self, get};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRow {
    pub id: UserId,
    pub name: String,
    pub created_at: String,
}

impl UserRow {
    fn from_row(row: &rusqlite::Row<'_>) -> Result<Self, StoreError> {
        Ok(Self {
            id: UserId::from_raw(get::<String>(row, 0, "users", "id")?),
            name: get(row, 1, "users", "name")?,
            created_at: get(row, 2, "users", "created_at")?,
        })
    }
}

/// Whether `find_or_create` signed an existing user in or signed a new one up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignIn {
    Existing,
    Created,
}

pub struct UserRepo {
    db: Database,
}

impl UserRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Look a user up by name, creating it when absent.
    #[instrument(skip(self))]
    pub fn find_or_create(&self, name: &str) -> Result<(UserRow, SignIn), StoreError> {
        self.db.with_conn(|conn| {
            let existing = conn
                .query_row(
                    "SELECT id, name, created_at FROM users WHERE name = ?1",
                    [name],
                    |row| Ok(UserRow::from_row(row)),
                )
                .optional()?
                .transpose()?;

            if let Some(user) = existing {
                return Ok((user, SignIn::Existing));
            }

            let user = UserRow {
                id: UserId::new(),
                name: name.to_string(),
                created_at: row_helpers::now(),
            };
            conn.execute(
                "INSERT INTO users (id, name, created_at) VALUES (?1, ?2, ?3)",
                rusqlite::params![user.id.as_str(), user.name, user.created_at],
            )?;
            Ok((user, SignIn::Created))
        })
    }

    #[instrument(skip(self), fields(user_id = %id))]
    pub fn get(&self, id: &UserId) -> Result<UserRow, StoreError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT id, name, created_at FROM users WHERE id = ?1",
                [id.as_str()],
                |row| Ok(UserRow::from_row(row)),
            )
            .optional()?
            .transpose()?
            .ok_or_else(|| StoreError::NotFound(format!("user {id}")))
        })
    }

    pub fn exists(&self, id: &UserId) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let found: Option<i64> = conn
                .query_row("SELECT 1 FROM users WHERE id = ?1", [id.as_str()], |row| row.get(0))
                .optional()?;
            Ok(found.is_some())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo() -> UserRepo {
        UserRepo::new(Database::in_memory().unwrap())
    }

    #[test]
    fn first_sign_in_creates_user() {
        let repo = repo();
        let (user, outcome) = repo.find_or_create("ada").unwrap();
        assert_eq!(outcome, SignIn::Created);
        assert_eq!(user.name, "ada");
        assert!(user.id.as_str().starts_with("user_"));
    }

    #[test]
    fn second_sign_in_returns_same_user() {
        let repo = repo();
        let (first, _) = repo.find_or_create("ada").unwrap();
        let (second, outcome) = repo.find_or_create("ada").unwrap();
        assert_eq!(outcome, SignIn::Existing);
        assert_eq!(first, second);
    }

    #[test]
    fn get_by_id() {
        let repo = repo();
        let (user, _) = repo.find_or_create("grace").unwrap();
        assert_eq!(repo.get(&user.id).unwrap().name, "grace");
        assert!(repo.exists(&user.id).unwrap());
    }

    #[test]
    fn unknown_user() {
        let repo = repo();
        let missing = UserId::from_raw("user_missing");
        assert!(matches!(repo.get(&missing), Err(StoreError::NotFound(_))));
        assert!(!repo.exists(&missing).unwrap());
    }

    #[test]
    fn serializes_camel_case() {
        let repo = repo();
        let (user, _) = repo.find_or_create("ada").unwrap();
        let json = serde_json::to_value(&user).unwrap();
        assert!(json.get("createdAt").is_some());
    }
}
