//! Error types and error codes for the sync core.

use std::time::Duration;

/// Every failure the sync core can surface to a caller.
///
/// None of these are fatal: session-level errors tear local state down to
/// "no session", everything else is reported at the call site only.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    #[error("not connected to the relay")]
    NotConnected,

    #[error("no reply to {event} within {}ms", .timeout.as_millis())]
    AckTimeout {
        event: &'static str,
        timeout: Duration,
    },

    #[error("session {code} expired")]
    SessionExpired { code: String },

    #[error("session {code} not found")]
    SessionNotFound { code: String },

    #[error("{0}")]
    RoomCreateRejected(String),

    #[error("{event} rejected: {message}")]
    ServerRejected {
        event: &'static str,
        message: String,
    },

    #[error("no active session")]
    NoSession,

    #[error("invalid session code: {0}")]
    InvalidCode(String),

    #[error("malformed payload: {0}")]
    Protocol(String),

    #[error("existence check failed: {0}")]
    ExistenceCheck(String),

    #[error("sync client shut down")]
    Shutdown,
}

impl SyncError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::NotConnected => "not_connected",
            Self::AckTimeout { .. } => "ack_timeout",
            Self::SessionExpired { .. } => "session_expired",
            Self::SessionNotFound { .. } => "session_not_found",
            Self::RoomCreateRejected(_) => "room_create_rejected",
            Self::ServerRejected { .. } => "server_rejected",
            Self::NoSession => "no_session",
            Self::InvalidCode(_) => "invalid_code",
            Self::Protocol(_) => "protocol",
            Self::ExistenceCheck(_) => "existence_check",
            Self::Shutdown => "shutdown",
        }
    }

    /// Errors after which the client no longer holds a usable session.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            Self::SessionExpired { .. } | Self::SessionNotFound { .. }
        )
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(err.to_string())
    }
}

pub type Result<T, E = SyncError> = std::result::Result<T, E>;
