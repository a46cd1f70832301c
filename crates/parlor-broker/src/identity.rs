//! Identity verification and reconnect tokens.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use parlor_core::ids::{RoomId, SessionToken, UserId};
use parlor_core::BrokerError;

/// Lookups the broker needs from whoever owns users and rooms.
#[async_trait]
pub trait IdentityLookup: Send + Sync {
    /// Whether `SET_USER` may claim this user id.
    async fn user_exists(&self, user_id: &UserId) -> Result<bool, BrokerError>;

    /// Display name reported in `ROOM_JOINED`, when the room is known.
    async fn room_name(&self, room_id: &RoomId) -> Option<String>;
}

/// Accepts every user id and knows no room names.
#[derive(Clone, Copy, Debug, Default)]
pub struct OpenIdentity;

#[async_trait]
impl IdentityLookup for OpenIdentity {
    async fn user_exists(&self, _user_id: &UserId) -> Result<bool, BrokerError> {
        Ok(true)
    }

    async fn room_name(&self, _room_id: &RoomId) -> Option<String> {
        None
    }
}

struct Grant {
    user_id: UserId,
    expires_at: Instant,
}

/// Tokens issued in `USER_SET`. Presenting one on a later `SET_USER` proves
/// the client identified as that user before, without another lookup.
pub struct SessionTokens {
    grants: DashMap<SessionToken, Grant>,
    ttl: Duration,
}

impl SessionTokens {
    pub fn new(ttl: Duration) -> Self {
        Self {
            grants: DashMap::new(),
            ttl,
        }
    }

    pub fn issue(&self, user_id: &UserId) -> SessionToken {
        let token = SessionToken::new();
        self.grants.insert(
            token.clone(),
            Grant {
                user_id: user_id.clone(),
                expires_at: Instant::now() + self.ttl,
            },
        );
        token
    }

    /// Check a presented token. Valid tokens get their expiry pushed out.
    pub fn redeem(&self, token: &SessionToken, user_id: &UserId) -> Result<(), BrokerError> {
        let now = Instant::now();
        let Some(mut grant) = self.grants.get_mut(token) else {
            return Err(BrokerError::validation("Unknown session token"));
        };
        if now >= grant.expires_at {
            drop(grant);
            self.grants.remove(token);
            return Err(BrokerError::validation("Session token expired"));
        }
        if &grant.user_id != user_id {
            return Err(BrokerError::validation(
                "Session token was issued to a different user",
            ));
        }
        grant.expires_at = now + self.ttl;
        Ok(())
    }

    /// Drop expired tokens. Returns how many were removed.
    pub fn prune_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.grants.len();
        self.grants.retain(|_, grant| grant.expires_at > now);
        before.saturating_sub(self.grants.len())
    }

    pub fn len(&self) -> usize {
        self.grants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grants.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_token_redeems_for_same_user() {
        let tokens = SessionTokens::new(Duration::from_secs(60));
        let ada = UserId::from_raw("user_ada");
        let token = tokens.issue(&ada);
        assert!(token.as_str().starts_with("tok_"));
        assert!(tokens.redeem(&token, &ada).is_ok());
        assert!(tokens.redeem(&token, &ada).is_ok());
    }

    #[test]
    fn token_is_bound_to_user() {
        let tokens = SessionTokens::new(Duration::from_secs(60));
        let token = tokens.issue(&UserId::from_raw("user_ada"));
        let err = tokens.redeem(&token, &UserId::from_raw("user_bob")).unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[test]
    fn unknown_token_rejected() {
        let tokens = SessionTokens::new(Duration::from_secs(60));
        let err = tokens
            .redeem(&SessionToken::from_raw("tok_nope"), &UserId::from_raw("user_ada"))
            .unwrap_err();
        assert!(err.to_string().contains("Unknown"));
    }

    #[test]
    fn expired_token_rejected_and_forgotten() {
        let tokens = SessionTokens::new(Duration::ZERO);
        let ada = UserId::from_raw("user_ada");
        let token = tokens.issue(&ada);
        let err = tokens.redeem(&token, &ada).unwrap_err();
        assert!(err.to_string().contains("expired"));
        assert!(tokens.is_empty());
    }

    #[test]
    fn prune_removes_only_expired() {
        let short = SessionTokens::new(Duration::ZERO);
        short.issue(&UserId::from_raw("a"));
        short.issue(&UserId::from_raw("b"));
        assert_eq!(short.prune_expired(), 2);
        assert!(short.is_empty());

        let long = SessionTokens::new(Duration::from_secs(60));
        long.issue(&UserId::from_raw("a"));
        assert_eq!(long.prune_expired(), 0);
        assert_eq!(long.len(), 1);
    }

    #[tokio::test]
    async fn open_identity_accepts_everyone() {
        let lookup = OpenIdentity;
        assert!(lookup.user_exists(&UserId::from_raw("anyone")).await.unwrap());
        assert!(lookup.room_name(&RoomId::from_raw("room_x")).await.is_none());
    }
}
