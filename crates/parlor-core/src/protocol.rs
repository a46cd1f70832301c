//! Broker wire protocol: JSON text frames tagged by a `type` field.
//!
//! Inbound frames come from chat clients, outbound events go back to them.
//! Field names are camelCase on the wire.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::BrokerError;
use crate::ids::{MessageId, RoomId, SessionToken, UserId};

/// Display name used when a client identifies without one.
pub const DEFAULT_USER_NAME: &str = "Anonymous";

const INBOUND_TYPES: [&str; 4] = ["SET_USER", "JOIN_ROOM", "CHAT_MESSAGE", "LEAVE_ROOM"];

/// Frames a client may send.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientFrame {
    #[serde(rename_all = "camelCase")]
    SetUser {
        user_id: UserId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_id: Option<RoomId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_token: Option<SessionToken>,
    },

    #[serde(rename_all = "camelCase")]
    JoinRoom { room_id: RoomId },

    #[serde(rename_all = "camelCase")]
    ChatMessage {
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender_name: Option<String>,
    },

    LeaveRoom {},
}

impl ClientFrame {
    pub fn frame_type(&self) -> &'static str {
        match self {
            Self::SetUser { .. } => "SET_USER",
            Self::JoinRoom { .. } => "JOIN_ROOM",
            Self::ChatMessage { .. } => "CHAT_MESSAGE",
            Self::LeaveRoom {} => "LEAVE_ROOM",
        }
    }

    /// Decode and validate a raw text frame.
    pub fn decode(raw: &str, max_content_len: usize) -> Result<Self, FrameError> {
        let value: serde_json::Value =
            serde_json::from_str(raw).map_err(|e| FrameError::Malformed(e.to_string()))?;

        let Some(object) = value.as_object() else {
            return Err(FrameError::Malformed("expected a JSON object".into()));
        };
        let frame_type = match object.get("type") {
            Some(serde_json::Value::String(t)) => t.clone(),
            _ => return Err(FrameError::MissingType),
        };
        if !INBOUND_TYPES.contains(&frame_type.as_str()) {
            return Err(FrameError::UnknownType(frame_type));
        }

        let frame: Self = serde_json::from_value(value).map_err(|e| FrameError::InvalidFields {
            frame_type: frame_type.clone(),
            detail: e.to_string(),
        })?;
        frame.validate(max_content_len)?;
        Ok(frame)
    }

    fn validate(&self, max_content_len: usize) -> Result<(), FrameError> {
        match self {
            Self::SetUser { user_id, .. } => require_non_empty("SET_USER", "userId", user_id.as_str()),
            Self::JoinRoom { room_id } => require_non_empty("JOIN_ROOM", "roomId", room_id.as_str()),
            Self::ChatMessage { content, .. } => {
                require_non_empty("CHAT_MESSAGE", "content", content)?;
                let len = content.chars().count();
                if len > max_content_len {
                    return Err(FrameError::ContentTooLong { len, max: max_content_len });
                }
                Ok(())
            }
            Self::LeaveRoom {} => Ok(()),
        }
    }
}

fn require_non_empty(frame_type: &str, field: &'static str, value: &str) -> Result<(), FrameError> {
    if value.trim().is_empty() {
        return Err(FrameError::EmptyField {
            frame_type: frame_type.to_string(),
            field,
        });
    }
    Ok(())
}

/// Why an inbound frame was rejected.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("frame is missing a string `type` field")]
    MissingType,

    #[error("unknown frame type: {0}")]
    UnknownType(String),

    #[error("invalid {frame_type} frame: {detail}")]
    InvalidFields { frame_type: String, detail: String },

    #[error("{frame_type} requires a non-empty `{field}`")]
    EmptyField { frame_type: String, field: &'static str },

    #[error("message content is {len} characters, limit is {max}")]
    ContentTooLong { len: usize, max: usize },

    #[error("binary frames are not supported")]
    Binary,
}

/// Events the broker sends to clients.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerEvent {
    #[serde(rename_all = "camelCase")]
    UserSet {
        user_id: UserId,
        session_token: SessionToken,
    },

    #[serde(rename_all = "camelCase")]
    RoomJoined {
        room_id: RoomId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    RoomLeft { room_id: RoomId },

    #[serde(rename_all = "camelCase")]
    UserJoined { user_id: UserId, user_name: String },

    #[serde(rename_all = "camelCase")]
    UserLeft {
        user_id: UserId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_name: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    ChatMessage {
        id: MessageId,
        content: String,
        sender_id: UserId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender_name: Option<String>,
        room_id: RoomId,
        timestamp: String,
    },

    Error { message: String, code: String },
}

impl ServerEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::UserSet { .. } => "USER_SET",
            Self::RoomJoined { .. } => "ROOM_JOINED",
            Self::RoomLeft { .. } => "ROOM_LEFT",
            Self::UserJoined { .. } => "USER_JOINED",
            Self::UserLeft { .. } => "USER_LEFT",
            Self::ChatMessage { .. } => "CHAT_MESSAGE",
            Self::Error { .. } => "ERROR",
        }
    }

    /// Build a chat message stamped with a fresh id and the current time.
    pub fn chat(
        room_id: RoomId,
        sender_id: UserId,
        sender_name: Option<String>,
        content: String,
    ) -> Self {
        Self::ChatMessage {
            id: MessageId::new(),
            content,
            sender_id,
            sender_name,
            room_id,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }

    pub fn error(err: &BrokerError) -> Self {
        Self::Error {
            message: err.to_string(),
            code: err.code().to_string(),
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: usize = 4000;

    #[test]
    fn decode_set_user() {
        let raw = r#"{"type":"SET_USER","userId":"u1","userName":"Ada","roomId":"r1"}"#;
        let frame = ClientFrame::decode(raw, MAX).unwrap();
        assert_eq!(
            frame,
            ClientFrame::SetUser {
                user_id: UserId::from_raw("u1"),
                user_name: Some("Ada".into()),
                room_id: Some(RoomId::from_raw("r1")),
                session_token: None,
            }
        );
        assert_eq!(frame.frame_type(), "SET_USER");
    }

    #[test]
    fn decode_join_chat_and_leave() {
        let join = ClientFrame::decode(r#"{"type":"JOIN_ROOM","roomId":"r1"}"#, MAX).unwrap();
        assert_eq!(join, ClientFrame::JoinRoom { room_id: RoomId::from_raw("r1") });

        let chat =
            ClientFrame::decode(r#"{"type":"CHAT_MESSAGE","content":"hi","senderName":"Ada"}"#, MAX)
                .unwrap();
        assert_eq!(
            chat,
            ClientFrame::ChatMessage {
                content: "hi".into(),
                sender_name: Some("Ada".into()),
            }
        );

        let leave = ClientFrame::decode(r#"{"type":"LEAVE_ROOM"}"#, MAX).unwrap();
        assert_eq!(leave, ClientFrame::LeaveRoom {});
    }

    #[test]
    fn decode_ignores_extra_fields() {
        let frame = ClientFrame::decode(r#"{"type":"LEAVE_ROOM","roomId":"r1","x":1}"#, MAX).unwrap();
        assert_eq!(frame, ClientFrame::LeaveRoom {});
    }

    #[test]
    fn decode_rejects_invalid_json() {
        let err = ClientFrame::decode("{not json", MAX).unwrap_err();
        assert!(matches!(err, FrameError::Malformed(_)));
    }

    #[test]
    fn decode_rejects_non_object() {
        let err = ClientFrame::decode("[1,2]", MAX).unwrap_err();
        assert!(matches!(err, FrameError::Malformed(_)));
    }

    #[test]
    fn decode_rejects_missing_type() {
        assert_eq!(
            ClientFrame::decode(r#"{"roomId":"r1"}"#, MAX).unwrap_err(),
            FrameError::MissingType
        );
        assert_eq!(
            ClientFrame::decode(r#"{"type":7}"#, MAX).unwrap_err(),
            FrameError::MissingType
        );
    }

    #[test]
    fn decode_rejects_unknown_type() {
        let err = ClientFrame::decode(r#"{"type":"PING"}"#, MAX).unwrap_err();
        assert_eq!(err, FrameError::UnknownType("PING".into()));
    }

    #[test]
    fn decode_rejects_outbound_type_sent_inbound() {
        let err = ClientFrame::decode(r#"{"type":"USER_SET"}"#, MAX).unwrap_err();
        assert!(matches!(err, FrameError::UnknownType(_)));
    }

    #[test]
    fn decode_rejects_missing_fields() {
        let err = ClientFrame::decode(r#"{"type":"JOIN_ROOM"}"#, MAX).unwrap_err();
        match err {
            FrameError::InvalidFields { frame_type, detail } => {
                assert_eq!(frame_type, "JOIN_ROOM");
                assert!(detail.contains("roomId"), "got: {detail}");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn decode_rejects_wrong_field_types() {
        let err = ClientFrame::decode(r#"{"type":"CHAT_MESSAGE","content":42}"#, MAX).unwrap_err();
        assert!(matches!(err, FrameError::InvalidFields { .. }));
    }

    #[test]
    fn decode_rejects_blank_required_strings() {
        let err = ClientFrame::decode(r#"{"type":"SET_USER","userId":"  "}"#, MAX).unwrap_err();
        assert_eq!(
            err,
            FrameError::EmptyField {
                frame_type: "SET_USER".into(),
                field: "userId"
            }
        );
        let err = ClientFrame::decode(r#"{"type":"CHAT_MESSAGE","content":""}"#, MAX).unwrap_err();
        assert!(matches!(err, FrameError::EmptyField { field: "content", .. }));
    }

    #[test]
    fn decode_enforces_content_limit() {
        let raw = format!(r#"{{"type":"CHAT_MESSAGE","content":"{}"}}"#, "a".repeat(11));
        let err = ClientFrame::decode(&raw, 10).unwrap_err();
        assert_eq!(err, FrameError::ContentTooLong { len: 11, max: 10 });
    }

    #[test]
    fn user_set_wire_shape() {
        let event = ServerEvent::UserSet {
            user_id: UserId::from_raw("u1"),
            session_token: SessionToken::from_raw("tok_1"),
        };
        let json: serde_json::Value = serde_json::from_str(&event.encode().unwrap()).unwrap();
        assert_eq!(json["type"], "USER_SET");
        assert_eq!(json["userId"], "u1");
        assert_eq!(json["sessionToken"], "tok_1");
    }

    #[test]
    fn optional_fields_are_omitted() {
        let event = ServerEvent::RoomJoined {
            room_id: RoomId::from_raw("r1"),
            name: None,
        };
        let json = event.encode().unwrap();
        assert!(!json.contains("name"), "got: {json}");

        let event = ServerEvent::UserLeft {
            user_id: UserId::from_raw("u1"),
            user_name: None,
        };
        let json = event.encode().unwrap();
        assert_eq!(json, r#"{"type":"USER_LEFT","userId":"u1"}"#);
    }

    #[test]
    fn chat_message_wire_shape() {
        let event = ServerEvent::chat(
            RoomId::from_raw("r1"),
            UserId::from_raw("u1"),
            Some("Ada".into()),
            "hi".into(),
        );
        let json: serde_json::Value = serde_json::from_str(&event.encode().unwrap()).unwrap();
        assert_eq!(json["type"], "CHAT_MESSAGE");
        assert_eq!(json["content"], "hi");
        assert_eq!(json["senderId"], "u1");
        assert_eq!(json["senderName"], "Ada");
        assert_eq!(json["roomId"], "r1");
        assert!(json["id"].as_str().unwrap().starts_with("msg_"));
        assert!(json["timestamp"].as_str().unwrap().ends_with('Z'));
    }

    #[test]
    fn error_event_carries_code() {
        let event = ServerEvent::error(&BrokerError::protocol_state("Join a room first"));
        assert_eq!(
            event,
            ServerEvent::Error {
                message: "Join a room first".into(),
                code: "PROTOCOL_STATE_ERROR".into(),
            }
        );
    }

    #[test]
    fn every_outbound_variant_survives_the_wire() {
        let events = vec![
            ServerEvent::UserSet {
                user_id: UserId::from_raw("u1"),
                session_token: SessionToken::new(),
            },
            ServerEvent::RoomJoined {
                room_id: RoomId::from_raw("r1"),
                name: Some("General".into()),
            },
            ServerEvent::RoomJoined {
                room_id: RoomId::from_raw("r2"),
                name: None,
            },
            ServerEvent::RoomLeft { room_id: RoomId::from_raw("r1") },
            ServerEvent::UserJoined {
                user_id: UserId::from_raw("u2"),
                user_name: "Grace".into(),
            },
            ServerEvent::UserLeft {
                user_id: UserId::from_raw("u2"),
                user_name: Some("Grace".into()),
            },
            ServerEvent::chat(RoomId::from_raw("r1"), UserId::from_raw("u1"), None, "hé 👋".into()),
            ServerEvent::error(&BrokerError::validation("bad frame")),
        ];
        for event in events {
            let decoded = ServerEvent::decode(&event.encode().unwrap()).unwrap();
            assert_eq!(decoded, event, "{}", event.event_type());
        }
    }
}
