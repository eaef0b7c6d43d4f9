//! The signaling protocol — every frame exchanged between a client and the
//! relay is one variant of [`SignalMessage`].
//!
//! The protocol is deliberately closed: dynamic payloads are only allowed
//! inside the targeted handshake variants (`Offer`/`Answer`/`IceCandidate`),
//! whose `payload` the relay forwards verbatim without inspection. Everything
//! else is validated at the boundary by serde.

use serde::{Deserialize, Serialize};

/// Opaque per-connection identifier, unique for the lifetime of a connection.
pub type ConnectionId = String;

/// Voice room identifier.
pub type RoomId = String;

/// A room member as seen by other members: identity plus the transient flags.
///
/// The flags here are eventually-consistent replicas; the owning session's
/// registry record is the authority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub connection_id: ConnectionId,
    pub user_id: String,
    pub display_name: String,
    pub muted: bool,
    pub deafened: bool,
    pub screen_sharing: bool,
}

/// Partial update to a session's own transient state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub muted: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deafened: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screen_sharing: Option<bool>,
}

impl StatePatch {
    pub fn is_empty(&self) -> bool {
        self.muted.is_none() && self.deafened.is_none() && self.screen_sharing.is_none()
    }
}

/// ICE server configuration sent to clients in the members snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServerConfig {
    /// Default STUN servers (free, public).
    /// In production, add TURN servers for NAT traversal.
    pub fn defaults() -> Vec<Self> {
        vec![
            Self {
                urls: vec![
                    "stun:stun.l.google.com:19302".into(),
                    "stun:stun1.l.google.com:19302".into(),
                ],
                username: None,
                credential: None,
            },
            Self {
                urls: vec!["stun:stun.cloudflare.com:3478".into()],
                username: None,
                credential: None,
            },
        ]
    }
}

/// Signaling messages between client and relay.
///
/// Targeted variants carry both endpoints: the client fills `to`, and the
/// relay substitutes the sender's real connection id into `from` before
/// forwarding — a client cannot spoof its origin.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", content = "d")]
pub enum SignalMessage {
    // === Client → Server ===
    /// Authenticate with an access token. Must be the first frame.
    Identify { token: String },

    /// Join a voice room (implicitly leaves the current one).
    JoinRoom { room_id: RoomId },

    /// Leave a voice room.
    LeaveRoom { room_id: RoomId },

    /// Update own mute/deafen/screen-share flags.
    StateUpdate(StatePatch),

    /// Request a fresh members snapshot (reconciliation fallback).
    GetMembers { room_id: RoomId },

    // === Server → Client ===
    /// First frame after the upgrade; prompts the client to Identify.
    Hello { heartbeat_interval_ms: u64 },

    /// Authentication succeeded; the session now exists.
    Ready {
        connection_id: ConnectionId,
        user_id: String,
        display_name: String,
    },

    /// Another member joined the caller's room.
    MemberJoined { member: Member },

    /// A member left the caller's room (leave or disconnect).
    MemberLeft { connection_id: ConnectionId },

    /// Unicast room snapshot: sent on join and on GetMembers.
    MembersSnapshot {
        room_id: RoomId,
        members: Vec<Member>,
        ice_servers: Vec<IceServerConfig>,
    },

    /// A member's flags changed.
    MemberState {
        connection_id: ConnectionId,
        muted: bool,
        deafened: bool,
        screen_sharing: bool,
    },

    /// Application-level error. The connection stays open unless the error
    /// is terminal (authentication).
    Error { code: u16, message: String },

    // === Bidirectional ===
    /// Keepalive ping/pong.
    Heartbeat { timestamp: i64 },
    HeartbeatAck { timestamp: i64 },

    /// SDP offer, relayed verbatim to `to`.
    Offer {
        from: ConnectionId,
        to: ConnectionId,
        payload: serde_json::Value,
    },

    /// SDP answer, relayed verbatim to `to`.
    Answer {
        from: ConnectionId,
        to: ConnectionId,
        payload: serde_json::Value,
    },

    /// Trickle ICE candidate, relayed verbatim to `to`.
    IceCandidate {
        from: ConnectionId,
        to: ConnectionId,
        payload: serde_json::Value,
    },

    /// Track-renegotiation notice: the sender is about to re-offer with a
    /// changed track set (screen share started/stopped).
    Renegotiate {
        from: ConnectionId,
        to: ConnectionId,
    },
}

impl SignalMessage {
    /// For targeted handshake variants, the destination connection id.
    pub fn target(&self) -> Option<&ConnectionId> {
        match self {
            Self::Offer { to, .. }
            | Self::Answer { to, .. }
            | Self::IceCandidate { to, .. }
            | Self::Renegotiate { to, .. } => Some(to),
            _ => None,
        }
    }

    /// Rewrite the `from` field with the sender's authenticated connection
    /// id. No-op for non-targeted variants.
    pub fn with_sender(mut self, sender: &ConnectionId) -> Self {
        match &mut self {
            Self::Offer { from, .. }
            | Self::Answer { from, .. }
            | Self::IceCandidate { from, .. }
            | Self::Renegotiate { from, .. } => {
                *from = sender.clone();
            }
            _ => {}
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_format_uses_op_and_d() {
        let msg = SignalMessage::JoinRoom {
            room_id: "general-voice".into(),
        };
        let json = serde_json::to_value(&msg).expect("serialize");
        assert_eq!(json["op"], "JoinRoom");
        assert_eq!(json["d"]["room_id"], "general-voice");
    }

    #[test]
    fn state_patch_omits_unset_fields() {
        let msg = SignalMessage::StateUpdate(StatePatch {
            muted: Some(true),
            ..Default::default()
        });
        let json = serde_json::to_value(&msg).expect("serialize");
        assert_eq!(json["d"]["muted"], true);
        assert!(json["d"].get("deafened").is_none());
    }

    #[test]
    fn offer_payload_survives_verbatim() {
        let sdp = serde_json::json!({"type": "offer", "sdp": "v=0\r\no=- 42 2 IN IP4 127.0.0.1"});
        let msg = SignalMessage::Offer {
            from: "a".into(),
            to: "b".into(),
            payload: sdp.clone(),
        };
        let round: SignalMessage =
            serde_json::from_str(&serde_json::to_string(&msg).expect("serialize"))
                .expect("deserialize");
        match round {
            SignalMessage::Offer { payload, .. } => assert_eq!(payload, sdp),
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn with_sender_overwrites_claimed_origin() {
        let msg = SignalMessage::Offer {
            from: "spoofed".into(),
            to: "b".into(),
            payload: serde_json::Value::Null,
        };
        let rewritten = msg.with_sender(&"real".to_string());
        match rewritten {
            SignalMessage::Offer { from, .. } => assert_eq!(from, "real"),
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn target_is_none_for_room_scoped_messages() {
        let msg = SignalMessage::LeaveRoom {
            room_id: "r".into(),
        };
        assert!(msg.target().is_none());
    }

    #[test]
    fn unknown_op_is_rejected() {
        let raw = r#"{"op":"SelfDestruct","d":{}}"#;
        assert!(serde_json::from_str::<SignalMessage>(raw).is_err());
    }
}
