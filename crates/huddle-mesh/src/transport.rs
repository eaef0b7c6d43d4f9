//! The transport seam between the mesh manager and the WebRTC stack.
//!
//! The manager drives negotiation and owns the link lifecycle; everything
//! media-level (peer connections, tracks, rendering) sits behind these two
//! traits. [`crate::rtc`] provides the production implementation on the
//! `webrtc` crate; tests substitute scripted mocks.

use async_trait::async_trait;
use huddle_common::HuddleResult;
use huddle_common::protocol::{ConnectionId, IceServerConfig};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Connection state reported by the underlying transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Events a link transport pushes up to the manager.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// A locally gathered ICE candidate, ready to relay to the remote side.
    LocalCandidate {
        remote: ConnectionId,
        candidate: Value,
    },
    /// The transport's connection state changed.
    StateChanged {
        remote: ConnectionId,
        state: TransportState,
    },
}

/// What attaching the screen track did on a given link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackChange {
    /// An existing outbound video sender was retargeted — no renegotiation
    /// needed.
    Replaced,
    /// A new outbound video track was added — the link must renegotiate.
    Added,
}

/// One peer connection. Offer/answer payloads are opaque JSON; the manager
/// relays them without interpretation, exactly like the server side.
#[async_trait]
pub trait LinkTransport: Send + Sync {
    /// Produce a local offer (local description is set as a side effect).
    async fn create_offer(&self) -> HuddleResult<Value>;

    /// Apply a remote offer and produce the answer.
    async fn accept_offer(&self, offer: Value) -> HuddleResult<Value>;

    /// Apply the remote answer to a previously created offer.
    async fn accept_answer(&self, answer: Value) -> HuddleResult<()>;

    /// Apply a remote ICE candidate. Only valid once a remote description
    /// is set; the manager buffers until then.
    async fn add_remote_candidate(&self, candidate: Value) -> HuddleResult<()>;

    /// Enable/disable the outbound audio track (mute).
    async fn set_outbound_audio_enabled(&self, enabled: bool);

    /// Enable/disable inbound audio handling (deafen). Disabling also
    /// silences audio that is already being rendered, not only future
    /// samples.
    async fn set_inbound_audio_enabled(&self, enabled: bool);

    /// Attach the shared screen track, replacing an existing outbound video
    /// sender when there is one.
    async fn start_screen_track(&self) -> HuddleResult<TrackChange>;

    /// Detach the outbound video track.
    async fn stop_screen_track(&self) -> HuddleResult<()>;

    /// Close the peer connection and release per-link resources.
    async fn close(&self);
}

/// Creates link transports and owns the local media they share.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Acquire the local microphone. Called before joining a room; failure
    /// aborts the join and is surfaced to the local user only.
    async fn acquire_microphone(&self) -> HuddleResult<()>;

    /// Acquire a display-capture stream for screen sharing.
    async fn acquire_display(&self) -> HuddleResult<()>;

    /// Stop and release the display-capture stream.
    async fn release_display(&self);

    /// Release all local media (called on leave/disconnect).
    async fn release_all(&self);

    /// Adopt the STUN/TURN set the relay advertised in a members snapshot.
    /// Applies to links created afterwards.
    async fn set_ice_servers(&self, servers: Vec<IceServerConfig>);

    /// Create a transport for one remote peer. The transport reports
    /// candidates and state changes through `events`, and must stop
    /// reporting once [`LinkTransport::close`] has run — the manager may
    /// already have replaced it.
    async fn create_link(
        &self,
        remote: &ConnectionId,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> HuddleResult<Arc<dyn LinkTransport>>;
}
