use crate::protocol::FrameError;

/// Error taxonomy for broker operations.
///
/// Validation and protocol-state errors are reported to the offending
/// connection as an `ERROR` frame and leave the session untouched. Transport
/// errors end the connection. `NotFound` only surfaces through the HTTP API.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    ProtocolState(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl BrokerError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn protocol_state(msg: impl Into<String>) -> Self {
        Self::ProtocolState(msg.into())
    }

    /// Wire code carried by the `ERROR` event.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::ProtocolState(_) => "PROTOCOL_STATE_ERROR",
            Self::Transport(_) => "TRANSPORT_ERROR",
            Self::NotFound(_) => "NOT_FOUND",
        }
    }

    /// Errors caused by what the client sent, as opposed to a broken transport.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::ProtocolState(_))
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::ProtocolState(_) => "protocol_state",
            Self::Transport(_) => "transport",
            Self::NotFound(_) => "not_found",
        }
    }
}

impl From<FrameError> for BrokerError {
    fn from(e: FrameError) -> Self {
        Self::Validation(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_error_classification() {
        assert!(BrokerError::validation("bad").is_client_error());
        assert!(BrokerError::protocol_state("not joined").is_client_error());
        assert!(!BrokerError::Transport("reset".into()).is_client_error());
        assert!(!BrokerError::NotFound("room r1".into()).is_client_error());
    }

    #[test]
    fn wire_codes() {
        assert_eq!(BrokerError::validation("x").code(), "VALIDATION_ERROR");
        assert_eq!(BrokerError::protocol_state("x").code(), "PROTOCOL_STATE_ERROR");
    }

    #[test]
    fn display_is_the_bare_message_for_client_errors() {
        let e = BrokerError::protocol_state("Join a room before sending messages");
        assert_eq!(e.to_string(), "Join a room before sending messages");
    }

    #[test]
    fn frame_errors_become_validation() {
        let e: BrokerError = FrameError::UnknownType("PING".into()).into();
        assert_eq!(e.error_kind(), "validation");
        assert!(e.to_string().contains("PING"));
    }
}
