//! Centralized error types for Huddle.
//!
//! Uses `thiserror` for ergonomic error definitions. Wire-facing errors carry
//! a stable code string so clients can handle them programmatically.

/// Core application error type used across all Huddle crates.
#[derive(Debug, thiserror::Error)]
pub enum HuddleError {
    // === Gateway errors ===
    /// The credential presented at connection time was missing, malformed,
    /// or expired. Terminal for the connection attempt; no session exists.
    #[error("Authentication failed: {reason}")]
    AuthenticationFailure { reason: String },

    // === Relay errors ===
    /// A targeted relay message referenced a connection that is not live.
    /// Never surfaced to the sender — signaling races are expected.
    #[error("Target connection {connection_id} is not live")]
    InvalidTarget { connection_id: String },

    /// An attempt to mutate presence state owned by another session.
    #[error("State update rejected: session {connection_id} is not owned by the caller")]
    StateConflict { connection_id: String },

    // === Client-local errors ===
    /// Microphone or display capture was denied or is unsupported.
    /// Surfaced to the local user only; never sent over the wire.
    #[error("Media acquisition failed: {reason}")]
    MediaAcquisition { reason: String },

    /// Transport-level failure of a single peer link. Recovered locally via
    /// reconnect; invisible to other links.
    #[error("Peer link to {connection_id} failed")]
    PeerLinkFailure { connection_id: String },

    // === Infrastructure errors ===
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl HuddleError {
    /// Error code string for programmatic handling by clients.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::AuthenticationFailure { .. } => "AUTHENTICATION_FAILURE",
            Self::InvalidTarget { .. } => "INVALID_TARGET",
            Self::StateConflict { .. } => "STATE_CONFLICT",
            Self::MediaAcquisition { .. } => "MEDIA_ACQUISITION",
            Self::PeerLinkFailure { .. } => "PEER_LINK_FAILURE",
            Self::WebSocket(_) => "WEBSOCKET_ERROR",
            Self::Json(_) => "PROTOCOL_ERROR",
            Self::Config(_) => "CONFIG_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Numeric close/error code sent on the wire; application-level errors
    /// use the 4xxx range.
    pub fn wire_code(&self) -> u16 {
        match self {
            Self::AuthenticationFailure { .. } => 4001,
            Self::StateConflict { .. } => 4003,
            Self::Json(_) => 4000,
            _ => 4999,
        }
    }
}

/// Convenience type alias for Results using HuddleError.
pub type HuddleResult<T> = Result<T, HuddleError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_failure_maps_to_stable_code() {
        let err = HuddleError::AuthenticationFailure {
            reason: "token expired".into(),
        };
        assert_eq!(err.error_code(), "AUTHENTICATION_FAILURE");
        assert_eq!(err.wire_code(), 4001);
    }

    #[test]
    fn display_includes_context() {
        let err = HuddleError::InvalidTarget {
            connection_id: "abc".into(),
        };
        assert!(err.to_string().contains("abc"));
    }
}
