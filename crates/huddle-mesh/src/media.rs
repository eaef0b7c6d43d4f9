//! Local media seams.
//!
//! Device capture (microphone, display) and playback (remote audio, remote
//! screen video) belong to the embedding application — a desktop client
//! wires its audio stack in here. The mesh itself only needs the WebRTC
//! track objects and the enable/disable gates.

use async_trait::async_trait;
use huddle_common::HuddleResult;
use huddle_common::protocol::ConnectionId;
use std::sync::Arc;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

/// Produces the local outbound tracks.
///
/// Implementations own the capture devices and the loops that push samples
/// into the returned tracks. Denied or unsupported capture surfaces as
/// [`huddle_common::HuddleError::MediaAcquisition`], which the mesh shows to
/// the local user and never sends over the wire.
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Open the microphone and return the outbound audio track.
    async fn open_microphone(&self) -> HuddleResult<Arc<TrackLocalStaticSample>>;

    /// Gate outbound microphone samples (mute). The track is shared across
    /// all peer links, so this silences every link at once.
    async fn set_microphone_enabled(&self, enabled: bool);

    /// Open display capture and return the outbound video track.
    async fn open_display(&self) -> HuddleResult<Arc<TrackLocalStaticSample>>;

    /// Stop display capture.
    async fn close_display(&self);

    /// Release every capture device.
    async fn close(&self);
}

/// Renders remote media.
#[async_trait]
pub trait MediaRenderer: Send + Sync {
    /// Start rendering a remote track (audio, or video for screen share).
    async fn play(&self, remote: &ConnectionId, track: Arc<TrackRemote>);

    /// Gate a remote's audio output (deafen). Disabling silences audio that
    /// is already playing, not only future samples.
    async fn set_remote_enabled(&self, remote: &ConnectionId, enabled: bool);

    /// Drop everything rendered for a remote (its link closed).
    async fn stop(&self, remote: &ConnectionId);
}
