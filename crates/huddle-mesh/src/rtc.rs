//! WebRTC-backed transport: the production implementation of the
//! [`TransportFactory`]/[`LinkTransport`] seam on the `webrtc` crate.
//!
//! One `RTCPeerConnection` per remote peer, trickle ICE (candidates relayed
//! as they gather, no blocking on gathering completion), shared local tracks
//! across all links. The factory owns the microphone and screen tracks; a
//! link only holds its own connection and video sender.

use crate::media::{MediaRenderer, MediaSource};
use crate::transport::{LinkEvent, LinkTransport, TrackChange, TransportFactory, TransportState};
use async_trait::async_trait;
use huddle_common::protocol::{ConnectionId, IceServerConfig};
use huddle_common::{HuddleError, HuddleResult};
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{RwLock, mpsc};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

fn rtc_err(e: webrtc::Error) -> HuddleError {
    HuddleError::Internal(anyhow::Error::from(e))
}

fn to_rtc_ice(servers: &[IceServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|s| RTCIceServer {
            urls: s.urls.clone(),
            username: s.username.clone().unwrap_or_default(),
            credential: s.credential.clone().unwrap_or_default(),
            ..Default::default()
        })
        .collect()
}

/// Factory for WebRTC peer links.
pub struct RtcFactory {
    api: API,
    ice_servers: RwLock<Vec<RTCIceServer>>,
    source: Arc<dyn MediaSource>,
    renderer: Arc<dyn MediaRenderer>,
    microphone: Arc<RwLock<Option<Arc<TrackLocalStaticSample>>>>,
    screen: Arc<RwLock<Option<Arc<TrackLocalStaticSample>>>>,
}

impl RtcFactory {
    pub fn new(
        source: Arc<dyn MediaSource>,
        renderer: Arc<dyn MediaRenderer>,
    ) -> HuddleResult<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(rtc_err)?;
        let registry =
            register_default_interceptors(Registry::new(), &mut media_engine).map_err(rtc_err)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self {
            api,
            ice_servers: RwLock::new(to_rtc_ice(&IceServerConfig::defaults())),
            source,
            renderer,
            microphone: Arc::new(RwLock::new(None)),
            screen: Arc::new(RwLock::new(None)),
        })
    }
}

#[async_trait]
impl TransportFactory for RtcFactory {
    async fn acquire_microphone(&self) -> HuddleResult<()> {
        let mut slot = self.microphone.write().await;
        if slot.is_none() {
            *slot = Some(self.source.open_microphone().await?);
        }
        Ok(())
    }

    async fn acquire_display(&self) -> HuddleResult<()> {
        let mut slot = self.screen.write().await;
        if slot.is_none() {
            *slot = Some(self.source.open_display().await?);
        }
        Ok(())
    }

    async fn release_display(&self) {
        self.screen.write().await.take();
        self.source.close_display().await;
    }

    async fn release_all(&self) {
        self.microphone.write().await.take();
        self.screen.write().await.take();
        self.source.close().await;
    }

    async fn set_ice_servers(&self, servers: Vec<IceServerConfig>) {
        *self.ice_servers.write().await = to_rtc_ice(&servers);
    }

    async fn create_link(
        &self,
        remote: &ConnectionId,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> HuddleResult<Arc<dyn LinkTransport>> {
        let config = RTCConfiguration {
            ice_servers: self.ice_servers.read().await.clone(),
            ..Default::default()
        };
        let pc = Arc::new(self.api.new_peer_connection(config).await.map_err(rtc_err)?);
        let closed = Arc::new(AtomicBool::new(false));

        {
            let events = events.clone();
            let remote = remote.clone();
            let closed = closed.clone();
            pc.on_peer_connection_state_change(Box::new(move |s| {
                let events = events.clone();
                let remote = remote.clone();
                let closed = closed.clone();
                Box::pin(async move {
                    if closed.load(Ordering::SeqCst) {
                        return;
                    }
                    let state = match s {
                        RTCPeerConnectionState::Connected => TransportState::Connected,
                        RTCPeerConnectionState::Disconnected => TransportState::Disconnected,
                        RTCPeerConnectionState::Failed => TransportState::Failed,
                        RTCPeerConnectionState::Closed => TransportState::Closed,
                        _ => TransportState::Connecting,
                    };
                    let _ = events.send(LinkEvent::StateChanged { remote, state });
                })
            }));
        }

        {
            let events = events.clone();
            let remote = remote.clone();
            let closed = closed.clone();
            pc.on_ice_candidate(Box::new(move |candidate| {
                let events = events.clone();
                let remote = remote.clone();
                let closed = closed.clone();
                Box::pin(async move {
                    if closed.load(Ordering::SeqCst) {
                        return;
                    }
                    let Some(candidate) = candidate else { return };
                    match candidate.to_json() {
                        Ok(init) => {
                            if let Ok(payload) = serde_json::to_value(&init) {
                                let _ = events.send(LinkEvent::LocalCandidate {
                                    remote,
                                    candidate: payload,
                                });
                            }
                        }
                        Err(e) => {
                            tracing::debug!(remote = %remote, error = %e, "candidate serialization failed");
                        }
                    }
                })
            }));
        }

        {
            let renderer = self.renderer.clone();
            let remote = remote.clone();
            let closed = closed.clone();
            pc.on_track(Box::new(move |track, _receiver, _transceiver| {
                let renderer = renderer.clone();
                let remote = remote.clone();
                let closed = closed.clone();
                Box::pin(async move {
                    if closed.load(Ordering::SeqCst) {
                        return;
                    }
                    tracing::debug!(remote = %remote, kind = %track.kind(), "remote track");
                    renderer.play(&remote, track).await;
                })
            }));
        }

        // Current local tracks go on the new connection; a link created
        // mid-screen-share carries the screen track from the start.
        if let Some(mic) = self.microphone.read().await.clone() {
            pc.add_track(mic as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(rtc_err)?;
        }
        let video_sender = match self.screen.read().await.clone() {
            Some(screen) => Some(
                pc.add_track(screen as Arc<dyn TrackLocal + Send + Sync>)
                    .await
                    .map_err(rtc_err)?,
            ),
            None => None,
        };

        Ok(Arc::new(RtcLink {
            remote: remote.clone(),
            pc,
            source: self.source.clone(),
            renderer: self.renderer.clone(),
            screen: self.screen.clone(),
            video_sender: RwLock::new(video_sender),
            closed,
        }))
    }
}

/// One peer connection to one remote member.
pub struct RtcLink {
    remote: ConnectionId,
    pc: Arc<RTCPeerConnection>,
    source: Arc<dyn MediaSource>,
    renderer: Arc<dyn MediaRenderer>,
    /// The factory's shared screen track slot.
    screen: Arc<RwLock<Option<Arc<TrackLocalStaticSample>>>>,
    video_sender: RwLock<Option<Arc<RTCRtpSender>>>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl LinkTransport for RtcLink {
    async fn create_offer(&self) -> HuddleResult<Value> {
        let offer = self.pc.create_offer(None).await.map_err(rtc_err)?;
        self.pc.set_local_description(offer).await.map_err(rtc_err)?;
        let desc = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| HuddleError::PeerLinkFailure {
                connection_id: self.remote.clone(),
            })?;
        Ok(serde_json::to_value(&desc)?)
    }

    async fn accept_offer(&self, offer: Value) -> HuddleResult<Value> {
        let desc: RTCSessionDescription = serde_json::from_value(offer)?;
        self.pc.set_remote_description(desc).await.map_err(rtc_err)?;
        let answer = self.pc.create_answer(None).await.map_err(rtc_err)?;
        self.pc
            .set_local_description(answer)
            .await
            .map_err(rtc_err)?;
        let desc = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| HuddleError::PeerLinkFailure {
                connection_id: self.remote.clone(),
            })?;
        Ok(serde_json::to_value(&desc)?)
    }

    async fn accept_answer(&self, answer: Value) -> HuddleResult<()> {
        let desc: RTCSessionDescription = serde_json::from_value(answer)?;
        self.pc.set_remote_description(desc).await.map_err(rtc_err)
    }

    async fn add_remote_candidate(&self, candidate: Value) -> HuddleResult<()> {
        let init: RTCIceCandidateInit = serde_json::from_value(candidate)?;
        self.pc.add_ice_candidate(init).await.map_err(rtc_err)
    }

    async fn set_outbound_audio_enabled(&self, enabled: bool) {
        // The microphone track is shared by every link, so muting gates the
        // capture side rather than a per-link sender.
        self.source.set_microphone_enabled(enabled).await;
    }

    async fn set_inbound_audio_enabled(&self, enabled: bool) {
        self.renderer.set_remote_enabled(&self.remote, enabled).await;
    }

    async fn start_screen_track(&self) -> HuddleResult<TrackChange> {
        let Some(screen) = self.screen.read().await.clone() else {
            return Err(HuddleError::MediaAcquisition {
                reason: "display capture is not active".into(),
            });
        };
        let mut slot = self.video_sender.write().await;
        match slot.as_ref() {
            Some(sender) => {
                sender
                    .replace_track(Some(screen as Arc<dyn TrackLocal + Send + Sync>))
                    .await
                    .map_err(rtc_err)?;
                Ok(TrackChange::Replaced)
            }
            None => {
                let sender = self
                    .pc
                    .add_track(screen as Arc<dyn TrackLocal + Send + Sync>)
                    .await
                    .map_err(rtc_err)?;
                *slot = Some(sender);
                Ok(TrackChange::Added)
            }
        }
    }

    async fn stop_screen_track(&self) -> HuddleResult<()> {
        if let Some(sender) = self.video_sender.write().await.take() {
            self.pc.remove_track(&sender).await.map_err(rtc_err)?;
        }
        Ok(())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.renderer.stop(&self.remote).await;
        if let Err(e) = self.pc.close().await {
            tracing::debug!(remote = %self.remote, error = %e, "peer connection close failed");
        }
    }
}
