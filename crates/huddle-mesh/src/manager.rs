//! The peer-mesh manager: one link per remote room member.
//!
//! The manager is the single place that reacts to both remote signaling and
//! local actions. It runs as one event loop — link handshakes are
//! event-driven and interleave freely, but no two handlers touch the link
//! table concurrently.
//!
//! Glare rule: for any pair of members, the side with the lexicographically
//! lower connection id produces the offer. The one exception is reconnect
//! repair, where the failure observer re-offers regardless of order; a
//! collision there resolves the same way (the lower id's offer survives).

use crate::link::{LinkPhase, PeerLink};
use crate::transport::{LinkEvent, TrackChange, TransportFactory};
use huddle_common::protocol::{ConnectionId, Member, RoomId, SignalMessage, StatePatch};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Tunables for the mesh. Library crates take configuration by value.
#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// Fixed delay before a failed link is re-offered.
    pub reconnect_backoff: Duration,
    /// How often the authoritative member list is re-requested. This is a
    /// safety net for missed events, not the primary update path.
    pub reconcile_interval: Duration,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            reconnect_backoff: Duration::from_secs(3),
            reconcile_interval: Duration::from_millis(500),
        }
    }
}

/// Local actions, usually wired to UI controls.
#[derive(Debug)]
pub enum MeshCommand {
    JoinRoom { room_id: RoomId },
    LeaveRoom,
    SetMuted(bool),
    SetDeafened(bool),
    StartScreenShare,
    StopScreenShare,
    Shutdown,
}

/// What the application observes.
#[derive(Debug, Clone)]
pub enum MeshEvent {
    RoomJoined { room_id: RoomId },
    RoomLeft { room_id: RoomId },
    MemberAdded(Member),
    MemberRemoved(ConnectionId),
    MemberUpdated(Member),
    LinkPhaseChanged { remote: ConnectionId, phase: LinkPhase },
    /// Local media problem (microphone/display denied). Never sent on the
    /// wire — the rest of the room is unaffected.
    MediaError(String),
}

enum TimerEvent {
    ReconnectDue { remote: ConnectionId },
}

pub struct MeshManager {
    connection_id: ConnectionId,
    config: MeshConfig,
    factory: Arc<dyn TransportFactory>,
    signal_tx: mpsc::UnboundedSender<SignalMessage>,
    events_tx: mpsc::UnboundedSender<MeshEvent>,

    room_id: Option<RoomId>,
    members: HashMap<ConnectionId, Member>,
    links: HashMap<ConnectionId, PeerLink>,
    muted: bool,
    deafened: bool,
    screen_sharing: bool,

    link_events_tx: mpsc::UnboundedSender<LinkEvent>,
    link_events_rx: Option<mpsc::UnboundedReceiver<LinkEvent>>,
    timer_tx: mpsc::UnboundedSender<TimerEvent>,
    timer_rx: Option<mpsc::UnboundedReceiver<TimerEvent>>,
}

impl MeshManager {
    /// `connection_id` is the id the relay assigned in its Ready frame.
    /// Outbound signaling goes to `signal_tx`; observable state changes to
    /// `events_tx`.
    pub fn new(
        connection_id: ConnectionId,
        signal_tx: mpsc::UnboundedSender<SignalMessage>,
        events_tx: mpsc::UnboundedSender<MeshEvent>,
        factory: Arc<dyn TransportFactory>,
        config: MeshConfig,
    ) -> Self {
        let (link_events_tx, link_events_rx) = mpsc::unbounded_channel();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        Self {
            connection_id,
            config,
            factory,
            signal_tx,
            events_tx,
            room_id: None,
            members: HashMap::new(),
            links: HashMap::new(),
            muted: false,
            deafened: false,
            screen_sharing: false,
            link_events_tx,
            link_events_rx: Some(link_events_rx),
            timer_tx,
            timer_rx: Some(timer_rx),
        }
    }

    /// Drive the mesh until shutdown. `signal_rx` carries frames from the
    /// relay connection; `command_rx` carries local actions.
    pub async fn run(
        mut self,
        mut signal_rx: mpsc::UnboundedReceiver<SignalMessage>,
        mut command_rx: mpsc::UnboundedReceiver<MeshCommand>,
    ) {
        let (Some(mut link_rx), Some(mut timer_rx)) =
            (self.link_events_rx.take(), self.timer_rx.take())
        else {
            return;
        };

        let mut reconcile = tokio::time::interval_at(
            tokio::time::Instant::now() + self.config.reconcile_interval,
            self.config.reconcile_interval,
        );
        reconcile.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                maybe_cmd = command_rx.recv() => match maybe_cmd {
                    Some(MeshCommand::Shutdown) | None => break,
                    Some(cmd) => self.handle_command(cmd).await,
                },
                maybe_frame = signal_rx.recv() => match maybe_frame {
                    Some(frame) => self.handle_signal(frame).await,
                    // Relay connection gone; nothing left to orchestrate.
                    None => break,
                },
                Some(event) = link_rx.recv() => self.handle_link_event(event).await,
                Some(event) = timer_rx.recv() => self.handle_timer(event).await,
                _ = reconcile.tick() => self.reconcile(),
            }
        }

        self.leave_room().await;
    }

    // ── Local actions ────────────────────────────────────────────────────

    async fn handle_command(&mut self, cmd: MeshCommand) {
        match cmd {
            MeshCommand::JoinRoom { room_id } => self.join_room(room_id).await,
            MeshCommand::LeaveRoom => self.leave_room().await,
            MeshCommand::SetMuted(muted) => self.set_muted(muted).await,
            MeshCommand::SetDeafened(deafened) => self.set_deafened(deafened).await,
            MeshCommand::StartScreenShare => self.start_screen_share().await,
            MeshCommand::StopScreenShare => self.stop_screen_share().await,
            MeshCommand::Shutdown => {}
        }
    }

    async fn join_room(&mut self, room_id: RoomId) {
        if self.room_id.as_ref() == Some(&room_id) {
            // Idempotent: refresh the snapshot, nothing else.
            self.send_signal(SignalMessage::JoinRoom { room_id });
            return;
        }

        // No microphone, no join — mirrors what the user expects from a
        // voice room.
        if let Err(e) = self.factory.acquire_microphone().await {
            self.emit(MeshEvent::MediaError(e.to_string()));
            return;
        }

        if self.room_id.is_some() {
            // Links belong to the old room; the relay announces our
            // departure to its members.
            self.teardown_links().await;
            self.members.clear();
        }

        self.room_id = Some(room_id.clone());
        self.muted = false;
        self.deafened = false;
        self.screen_sharing = false;
        self.send_signal(SignalMessage::JoinRoom {
            room_id: room_id.clone(),
        });
        self.emit(MeshEvent::RoomJoined { room_id });
    }

    async fn leave_room(&mut self) {
        let Some(room_id) = self.room_id.take() else {
            return;
        };
        // Departing links are closed outright; no renegotiation.
        self.teardown_links().await;
        self.members.clear();
        self.screen_sharing = false;
        self.factory.release_all().await;
        self.send_signal(SignalMessage::LeaveRoom {
            room_id: room_id.clone(),
        });
        self.emit(MeshEvent::RoomLeft { room_id });
    }

    async fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
        for link in self.links.values() {
            link.transport.set_outbound_audio_enabled(!muted).await;
        }
        self.publish_state(StatePatch {
            muted: Some(muted),
            ..Default::default()
        });
    }

    async fn set_deafened(&mut self, deafened: bool) {
        self.deafened = deafened;
        // Deafen gates inbound handling on every link, independent of mute,
        // and the transport also silences audio already being rendered.
        for link in self.links.values() {
            link.transport.set_inbound_audio_enabled(!deafened).await;
        }
        self.publish_state(StatePatch {
            deafened: Some(deafened),
            ..Default::default()
        });
    }

    async fn start_screen_share(&mut self) {
        if self.room_id.is_none() {
            self.emit(MeshEvent::MediaError(
                "join a voice room before sharing your screen".into(),
            ));
            return;
        }
        if self.screen_sharing {
            return;
        }
        if let Err(e) = self.factory.acquire_display().await {
            self.emit(MeshEvent::MediaError(e.to_string()));
            return;
        }
        self.screen_sharing = true;

        let remotes: Vec<ConnectionId> = self.links.keys().cloned().collect();
        for remote in remotes {
            self.attach_screen(&remote).await;
        }
        self.publish_state(StatePatch {
            screen_sharing: Some(true),
            ..Default::default()
        });
    }

    /// Attach the screen track on one link; a brand-new sender means the
    /// link must renegotiate, a retargeted one does not.
    async fn attach_screen(&self, remote: &ConnectionId) {
        let Some(link) = self.links.get(remote) else {
            return;
        };
        match link.transport.start_screen_track().await {
            Ok(TrackChange::Replaced) => {}
            Ok(TrackChange::Added) => {
                self.send_signal(SignalMessage::Renegotiate {
                    from: self.connection_id.clone(),
                    to: remote.clone(),
                });
                match link.transport.create_offer().await {
                    Ok(offer) => self.send_signal(SignalMessage::Offer {
                        from: self.connection_id.clone(),
                        to: remote.clone(),
                        payload: offer,
                    }),
                    Err(e) => {
                        tracing::warn!(remote = %remote, error = %e, "renegotiation offer failed");
                    }
                }
            }
            Err(e) => {
                tracing::warn!(remote = %remote, error = %e, "screen track attach failed");
            }
        }
    }

    async fn stop_screen_share(&mut self) {
        if !self.screen_sharing {
            return;
        }
        self.screen_sharing = false;
        for link in self.links.values() {
            if let Err(e) = link.transport.stop_screen_track().await {
                tracing::debug!(remote = %link.remote, error = %e, "screen track removal failed");
            }
        }
        self.factory.release_display().await;
        self.publish_state(StatePatch {
            screen_sharing: Some(false),
            ..Default::default()
        });
    }

    // ── Relay events ─────────────────────────────────────────────────────

    async fn handle_signal(&mut self, frame: SignalMessage) {
        match frame {
            SignalMessage::MembersSnapshot {
                room_id,
                members,
                ice_servers,
            } => {
                if !ice_servers.is_empty() {
                    self.factory.set_ice_servers(ice_servers).await;
                }
                self.apply_snapshot(room_id, members).await;
            }
            SignalMessage::MemberJoined { member } => self.member_joined(member).await,
            SignalMessage::MemberLeft { connection_id } => self.member_left(&connection_id).await,
            SignalMessage::MemberState {
                connection_id,
                muted,
                deafened,
                screen_sharing,
            } => self.member_state(&connection_id, muted, deafened, screen_sharing),
            SignalMessage::Offer { from, payload, .. } => self.inbound_offer(from, payload).await,
            SignalMessage::Answer { from, payload, .. } => {
                self.inbound_answer(&from, payload).await;
            }
            SignalMessage::IceCandidate { from, payload, .. } => {
                self.inbound_candidate(&from, payload).await;
            }
            SignalMessage::Renegotiate { from, .. } => {
                // The re-offer that follows carries the actual change.
                tracing::debug!(remote = %from, "peer announced track renegotiation");
            }
            SignalMessage::Error { code, message } => {
                tracing::warn!(code, message, "relay reported an error");
            }
            _ => {}
        }
    }

    /// Fold an authoritative snapshot into the member and link tables. Used
    /// both for the join seed and the periodic reconciliation poll.
    async fn apply_snapshot(&mut self, room_id: RoomId, members: Vec<Member>) {
        if self.room_id.as_ref() != Some(&room_id) {
            return; // stale snapshot from a room we already left
        }

        let fresh: HashMap<ConnectionId, Member> = members
            .into_iter()
            .filter(|m| m.connection_id != self.connection_id)
            .map(|m| (m.connection_id.clone(), m))
            .collect();

        let stale: Vec<ConnectionId> = self
            .members
            .keys()
            .filter(|id| !fresh.contains_key(*id))
            .cloned()
            .collect();
        for id in stale {
            self.member_left(&id).await;
        }

        for (id, member) in fresh {
            match self.members.get(&id) {
                None => self.member_joined(member).await,
                Some(existing) if *existing != member => {
                    self.members.insert(id, member.clone());
                    self.emit(MeshEvent::MemberUpdated(member));
                }
                Some(_) => {}
            }
        }
    }

    async fn member_joined(&mut self, member: Member) {
        let remote = member.connection_id.clone();
        if remote == self.connection_id {
            return;
        }
        self.members.insert(remote.clone(), member.clone());
        self.emit(MeshEvent::MemberAdded(member));

        // Only the lower connection id offers; the other side waits for it.
        if self.connection_id < remote && !self.links.contains_key(&remote) {
            self.initiate_link(remote).await;
        }
    }

    async fn member_left(&mut self, remote: &ConnectionId) {
        if self.members.remove(remote).is_some() {
            self.emit(MeshEvent::MemberRemoved(remote.clone()));
        }
        if let Some(link) = self.links.remove(remote) {
            link.transport.close().await;
            self.emit(MeshEvent::LinkPhaseChanged {
                remote: remote.clone(),
                phase: LinkPhase::Closed,
            });
        }
    }

    fn member_state(
        &mut self,
        remote: &ConnectionId,
        muted: bool,
        deafened: bool,
        screen_sharing: bool,
    ) {
        if let Some(member) = self.members.get_mut(remote) {
            member.muted = muted;
            member.deafened = deafened;
            member.screen_sharing = screen_sharing;
            let member = member.clone();
            self.emit(MeshEvent::MemberUpdated(member));
        }
    }

    // ── Handshake ────────────────────────────────────────────────────────

    async fn initiate_link(&mut self, remote: ConnectionId) {
        let transport = match self
            .factory
            .create_link(&remote, self.link_events_tx.clone())
            .await
        {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!(remote = %remote, error = %e, "failed to create peer link");
                return;
            }
        };
        self.apply_local_flags(transport.as_ref()).await;

        let link = PeerLink::new(remote.clone(), transport, true);
        match link.transport.create_offer().await {
            Ok(offer) => {
                self.send_signal(SignalMessage::Offer {
                    from: self.connection_id.clone(),
                    to: remote.clone(),
                    payload: offer,
                });
                self.links.insert(remote.clone(), link);
                self.emit(MeshEvent::LinkPhaseChanged {
                    remote,
                    phase: LinkPhase::Negotiating,
                });
            }
            Err(e) => {
                tracing::warn!(remote = %remote, error = %e, "offer creation failed");
                link.transport.close().await;
            }
        }
    }

    async fn inbound_offer(&mut self, from: ConnectionId, payload: Value) {
        if self.room_id.is_none() {
            return; // offer for a room we already left
        }

        enum Disposition {
            Renegotiate,
            IgnoreGlare,
            Replace,
            Fresh,
        }

        let disposition = match self.links.get(&from) {
            Some(link)
                if link.remote_described
                    && matches!(link.phase, LinkPhase::Connected | LinkPhase::Reconnecting) =>
            {
                Disposition::Renegotiate
            }
            // Glare: both sides produced an offer. Ours survives iff we are
            // the designated offerer (lower id).
            Some(link) if link.initiator && self.connection_id < from => Disposition::IgnoreGlare,
            Some(_) => Disposition::Replace,
            None => Disposition::Fresh,
        };

        match disposition {
            Disposition::Renegotiate => {
                let Some(transport) = self.links.get(&from).map(|l| l.transport.clone()) else {
                    return;
                };
                match transport.accept_offer(payload).await {
                    Ok(answer) => self.send_signal(SignalMessage::Answer {
                        from: self.connection_id.clone(),
                        to: from,
                        payload: answer,
                    }),
                    Err(e) => {
                        tracing::warn!(remote = %from, error = %e, "renegotiation offer failed to apply");
                    }
                }
            }
            Disposition::IgnoreGlare => {
                tracing::debug!(remote = %from, "dropping colliding offer from higher id");
            }
            Disposition::Replace => {
                if let Some(old) = self.links.remove(&from) {
                    old.transport.close().await;
                }
                self.answer_link(from, payload).await;
            }
            Disposition::Fresh => self.answer_link(from, payload).await,
        }
    }

    async fn answer_link(&mut self, from: ConnectionId, payload: Value) {
        let transport = match self
            .factory
            .create_link(&from, self.link_events_tx.clone())
            .await
        {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!(remote = %from, error = %e, "failed to create peer link");
                return;
            }
        };
        self.apply_local_flags(transport.as_ref()).await;

        let mut link = PeerLink::new(from.clone(), transport, false);
        match link.transport.accept_offer(payload).await {
            Ok(answer) => {
                link.mark_remote_described();
                self.send_signal(SignalMessage::Answer {
                    from: self.connection_id.clone(),
                    to: from.clone(),
                    payload: answer,
                });
                self.links.insert(from.clone(), link);
                self.emit(MeshEvent::LinkPhaseChanged {
                    remote: from,
                    phase: LinkPhase::Negotiating,
                });
            }
            Err(e) => {
                tracing::warn!(remote = %from, error = %e, "failed to apply remote offer");
                link.transport.close().await;
            }
        }
    }

    async fn inbound_answer(&mut self, from: &ConnectionId, payload: Value) {
        let Some(link) = self.links.get_mut(from) else {
            tracing::debug!(remote = %from, "answer for a link that no longer exists");
            return;
        };
        let transport = link.transport.clone();
        match transport.accept_answer(payload).await {
            Ok(()) => {
                for candidate in link.mark_remote_described() {
                    if let Err(e) = transport.add_remote_candidate(candidate).await {
                        tracing::debug!(remote = %from, error = %e, "buffered candidate rejected");
                    }
                }
            }
            Err(e) => tracing::warn!(remote = %from, error = %e, "failed to apply answer"),
        }
    }

    async fn inbound_candidate(&mut self, from: &ConnectionId, payload: Value) {
        let Some(link) = self.links.get_mut(from) else {
            tracing::debug!(remote = %from, "candidate for a link that no longer exists");
            return;
        };
        if link.remote_described {
            let transport = link.transport.clone();
            if let Err(e) = transport.add_remote_candidate(payload).await {
                // A candidate that never applies is not fatal.
                tracing::debug!(remote = %from, error = %e, "candidate did not apply");
            }
        } else {
            link.buffer_candidate(payload);
        }
    }

    // ── Transport events & repair ────────────────────────────────────────

    async fn handle_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::LocalCandidate { remote, candidate } => {
                if self.links.contains_key(&remote) {
                    self.send_signal(SignalMessage::IceCandidate {
                        from: self.connection_id.clone(),
                        to: remote,
                        payload: candidate,
                    });
                }
            }
            LinkEvent::StateChanged { remote, state } => {
                let phase = match self.links.get_mut(&remote) {
                    Some(link) => link.on_transport_state(state),
                    None => None,
                };
                let Some(phase) = phase else {
                    return;
                };
                self.emit(MeshEvent::LinkPhaseChanged {
                    remote: remote.clone(),
                    phase,
                });
                if phase == LinkPhase::Failed {
                    self.schedule_reconnect(remote).await;
                }
            }
        }
    }

    async fn schedule_reconnect(&mut self, remote: ConnectionId) {
        // Repair only links whose peer the room still lists.
        if !self.members.contains_key(&remote) {
            if let Some(link) = self.links.remove(&remote) {
                link.transport.close().await;
            }
            return;
        }
        if let Some(link) = self.links.get_mut(&remote) {
            link.phase = LinkPhase::Reconnecting;
            self.emit(MeshEvent::LinkPhaseChanged {
                remote: remote.clone(),
                phase: LinkPhase::Reconnecting,
            });
        }
        self.arm_reconnect_timer(remote);
    }

    fn arm_reconnect_timer(&self, remote: ConnectionId) {
        let timer_tx = self.timer_tx.clone();
        let backoff = self.config.reconnect_backoff;
        tokio::spawn(async move {
            tokio::time::sleep(backoff).await;
            let _ = timer_tx.send(TimerEvent::ReconnectDue { remote });
        });
    }

    async fn handle_timer(&mut self, event: TimerEvent) {
        match event {
            TimerEvent::ReconnectDue { remote } => {
                let due = self
                    .links
                    .get(&remote)
                    .is_some_and(|l| l.phase == LinkPhase::Reconnecting);
                // The link may have been repaired or torn down meanwhile,
                // or the peer may have left: then the timer is stale.
                if due && self.members.contains_key(&remote) {
                    self.reconnect(remote).await;
                }
            }
        }
    }

    /// Best-effort repair: tear the old transport down and run a full
    /// re-offer. Retried on every subsequent failure for as long as the
    /// room membership still contains the peer.
    async fn reconnect(&mut self, remote: ConnectionId) {
        if let Some(link) = self.links.get(&remote) {
            link.transport.close().await;
        } else {
            return;
        }

        let transport = match self
            .factory
            .create_link(&remote, self.link_events_tx.clone())
            .await
        {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!(remote = %remote, error = %e, "reconnect transport failed; retrying");
                self.arm_reconnect_timer(remote);
                return;
            }
        };
        self.apply_local_flags(transport.as_ref()).await;

        let offer = match transport.create_offer().await {
            Ok(offer) => offer,
            Err(e) => {
                tracing::warn!(remote = %remote, error = %e, "reconnect offer failed; retrying");
                transport.close().await;
                self.arm_reconnect_timer(remote);
                return;
            }
        };

        if let Some(link) = self.links.get_mut(&remote) {
            link.replace_transport(transport);
        }
        tracing::info!(remote = %remote, "re-offering failed peer link");
        self.send_signal(SignalMessage::Offer {
            from: self.connection_id.clone(),
            to: remote,
            payload: offer,
        });
    }

    // ── Helpers ──────────────────────────────────────────────────────────

    async fn apply_local_flags(&self, transport: &dyn crate::transport::LinkTransport) {
        if self.muted {
            transport.set_outbound_audio_enabled(false).await;
        }
        if self.deafened {
            transport.set_inbound_audio_enabled(false).await;
        }
    }

    async fn teardown_links(&mut self) {
        for (_, link) in self.links.drain() {
            link.transport.close().await;
        }
    }

    fn reconcile(&self) {
        if let Some(room_id) = &self.room_id {
            self.send_signal(SignalMessage::GetMembers {
                room_id: room_id.clone(),
            });
        }
    }

    fn publish_state(&self, patch: StatePatch) {
        if self.room_id.is_some() {
            self.send_signal(SignalMessage::StateUpdate(patch));
        }
    }

    fn send_signal(&self, frame: SignalMessage) {
        if self.signal_tx.send(frame).is_err() {
            tracing::warn!("signaling channel closed; frame dropped");
        }
    }

    fn emit(&self, event: MeshEvent) {
        let _ = self.events_tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{LinkTransport, TransportState};
    use async_trait::async_trait;
    use huddle_common::{HuddleError, HuddleResult};
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::mpsc::UnboundedReceiver;

    #[derive(Default)]
    struct MockLinkState {
        accepted_offers: Vec<Value>,
        accepted_answers: Vec<Value>,
        candidates: Vec<Value>,
        outbound_audio: Option<bool>,
        inbound_audio: Option<bool>,
        screen_started: usize,
        screen_stopped: usize,
        closed: bool,
    }

    struct MockLinkShared {
        state: StdMutex<MockLinkState>,
        events: mpsc::UnboundedSender<LinkEvent>,
        remote: ConnectionId,
    }

    impl MockLinkShared {
        fn fire(&self, state: TransportState) {
            let _ = self.events.send(LinkEvent::StateChanged {
                remote: self.remote.clone(),
                state,
            });
        }

        fn fire_candidate(&self, candidate: Value) {
            let _ = self.events.send(LinkEvent::LocalCandidate {
                remote: self.remote.clone(),
                candidate,
            });
        }
    }

    struct MockLink {
        shared: Arc<MockLinkShared>,
        track_change: TrackChange,
    }

    #[async_trait]
    impl LinkTransport for MockLink {
        async fn create_offer(&self) -> HuddleResult<Value> {
            Ok(serde_json::json!({"type": "offer"}))
        }
        async fn accept_offer(&self, offer: Value) -> HuddleResult<Value> {
            self.shared.state.lock().unwrap().accepted_offers.push(offer);
            Ok(serde_json::json!({"type": "answer"}))
        }
        async fn accept_answer(&self, answer: Value) -> HuddleResult<()> {
            self.shared.state.lock().unwrap().accepted_answers.push(answer);
            Ok(())
        }
        async fn add_remote_candidate(&self, candidate: Value) -> HuddleResult<()> {
            self.shared.state.lock().unwrap().candidates.push(candidate);
            Ok(())
        }
        async fn set_outbound_audio_enabled(&self, enabled: bool) {
            self.shared.state.lock().unwrap().outbound_audio = Some(enabled);
        }
        async fn set_inbound_audio_enabled(&self, enabled: bool) {
            self.shared.state.lock().unwrap().inbound_audio = Some(enabled);
        }
        async fn start_screen_track(&self) -> HuddleResult<TrackChange> {
            self.shared.state.lock().unwrap().screen_started += 1;
            Ok(self.track_change)
        }
        async fn stop_screen_track(&self) -> HuddleResult<()> {
            self.shared.state.lock().unwrap().screen_stopped += 1;
            Ok(())
        }
        async fn close(&self) {
            self.shared.state.lock().unwrap().closed = true;
        }
    }

    #[derive(Default)]
    struct MockFactory {
        mic_fails: AtomicBool,
        display_fails: AtomicBool,
        mic_acquired: AtomicUsize,
        display_acquired: AtomicUsize,
        display_released: AtomicUsize,
        released_all: AtomicUsize,
        links: StdMutex<Vec<Arc<MockLinkShared>>>,
        track_changes: StdMutex<HashMap<ConnectionId, TrackChange>>,
        ice_servers: StdMutex<Vec<huddle_common::protocol::IceServerConfig>>,
    }

    impl MockFactory {
        /// The most recent link created for `remote`.
        fn link(&self, remote: &str) -> Arc<MockLinkShared> {
            self.links
                .lock()
                .unwrap()
                .iter()
                .rev()
                .find(|l| l.remote == remote)
                .cloned()
                .unwrap_or_else(|| panic!("no link created for {remote}"))
        }

        fn created_for(&self, remote: &str) -> usize {
            self.links
                .lock()
                .unwrap()
                .iter()
                .filter(|l| l.remote == remote)
                .count()
        }
    }

    #[async_trait]
    impl TransportFactory for MockFactory {
        async fn acquire_microphone(&self) -> HuddleResult<()> {
            if self.mic_fails.load(Ordering::SeqCst) {
                return Err(HuddleError::MediaAcquisition {
                    reason: "microphone access denied".into(),
                });
            }
            self.mic_acquired.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn acquire_display(&self) -> HuddleResult<()> {
            if self.display_fails.load(Ordering::SeqCst) {
                return Err(HuddleError::MediaAcquisition {
                    reason: "display capture denied".into(),
                });
            }
            self.display_acquired.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn release_display(&self) {
            self.display_released.fetch_add(1, Ordering::SeqCst);
        }
        async fn release_all(&self) {
            self.released_all.fetch_add(1, Ordering::SeqCst);
        }
        async fn set_ice_servers(&self, servers: Vec<huddle_common::protocol::IceServerConfig>) {
            *self.ice_servers.lock().unwrap() = servers;
        }
        async fn create_link(
            &self,
            remote: &ConnectionId,
            events: mpsc::UnboundedSender<LinkEvent>,
        ) -> HuddleResult<Arc<dyn LinkTransport>> {
            let shared = Arc::new(MockLinkShared {
                state: StdMutex::default(),
                events,
                remote: remote.clone(),
            });
            self.links.lock().unwrap().push(shared.clone());
            let track_change = self
                .track_changes
                .lock()
                .unwrap()
                .get(remote)
                .copied()
                .unwrap_or(TrackChange::Replaced);
            Ok(Arc::new(MockLink {
                shared,
                track_change,
            }))
        }
    }

    struct Harness {
        factory: Arc<MockFactory>,
        signal_out: UnboundedReceiver<SignalMessage>,
        signal_in: mpsc::UnboundedSender<SignalMessage>,
        commands: mpsc::UnboundedSender<MeshCommand>,
        events: UnboundedReceiver<MeshEvent>,
    }

    fn spawn_manager(local_id: &str, config: MeshConfig) -> Harness {
        let factory = Arc::new(MockFactory::default());
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (ev_tx, ev_rx) = mpsc::unbounded_channel();
        let manager = MeshManager::new(
            local_id.into(),
            out_tx,
            ev_tx,
            factory.clone(),
            config,
        );
        tokio::spawn(manager.run(in_rx, cmd_rx));
        Harness {
            factory,
            signal_out: out_rx,
            signal_in: in_tx,
            commands: cmd_tx,
            events: ev_rx,
        }
    }

    /// Quiet config: reconciliation effectively disabled so frame
    /// assertions stay deterministic.
    fn quiet() -> MeshConfig {
        MeshConfig {
            reconnect_backoff: Duration::from_secs(3),
            reconcile_interval: Duration::from_secs(3600),
        }
    }

    /// Let the manager task drain its queues without letting the paused
    /// clock auto-advance.
    async fn settle() {
        for _ in 0..64 {
            tokio::task::yield_now().await;
        }
    }

    fn drain<T>(rx: &mut UnboundedReceiver<T>) -> Vec<T> {
        let mut out = Vec::new();
        while let Ok(item) = rx.try_recv() {
            out.push(item);
        }
        out
    }

    fn member(id: &str) -> Member {
        Member {
            connection_id: id.into(),
            user_id: format!("user-{id}"),
            display_name: id.into(),
            muted: false,
            deafened: false,
            screen_sharing: false,
        }
    }

    async fn join(h: &mut Harness, room: &str) {
        h.commands
            .send(MeshCommand::JoinRoom {
                room_id: room.into(),
            })
            .expect("send join");
        settle().await;
        drain(&mut h.signal_out);
        drain(&mut h.events);
    }

    fn snapshot(room: &str, members: Vec<Member>) -> SignalMessage {
        SignalMessage::MembersSnapshot {
            room_id: room.into(),
            members,
            ice_servers: Vec::new(),
        }
    }

    fn offers_to(frames: &[SignalMessage], remote: &str) -> usize {
        frames
            .iter()
            .filter(|f| matches!(f, SignalMessage::Offer { to, .. } if to == remote))
            .count()
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_seeds_offers_to_higher_ids_only() {
        let mut h = spawn_manager("m", quiet());
        join(&mut h, "room").await;

        h.signal_in
            .send(snapshot("room", vec![member("a"), member("z")]))
            .expect("send snapshot");
        settle().await;

        let frames = drain(&mut h.signal_out);
        // "m" offers to "z" (m < z) and waits for "a" (a < m).
        assert_eq!(offers_to(&frames, "z"), 1);
        assert_eq!(offers_to(&frames, "a"), 0);
        assert_eq!(h.factory.created_for("z"), 1);
        assert_eq!(h.factory.created_for("a"), 0);

        let added = drain(&mut h.events)
            .into_iter()
            .filter(|e| matches!(e, MeshEvent::MemberAdded(_)))
            .count();
        assert_eq!(added, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn inbound_offer_creates_answering_link() {
        let mut h = spawn_manager("m", quiet());
        join(&mut h, "room").await;
        h.signal_in
            .send(SignalMessage::MemberJoined { member: member("a") })
            .expect("announce");
        settle().await;
        drain(&mut h.signal_out);

        h.signal_in
            .send(SignalMessage::Offer {
                from: "a".into(),
                to: "m".into(),
                payload: serde_json::json!({"type": "offer", "sdp": "v=0"}),
            })
            .expect("offer");
        settle().await;

        let frames = drain(&mut h.signal_out);
        let answers: Vec<_> = frames
            .iter()
            .filter(|f| matches!(f, SignalMessage::Answer { to, .. } if to == "a"))
            .collect();
        assert_eq!(answers.len(), 1);
        match answers[0] {
            SignalMessage::Answer { from, .. } => assert_eq!(from, "m"),
            _ => unreachable!(),
        }
        let link = h.factory.link("a");
        assert_eq!(link.state.lock().unwrap().accepted_offers.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn candidates_buffer_until_the_answer_applies() {
        let mut h = spawn_manager("m", quiet());
        join(&mut h, "room").await;
        h.signal_in
            .send(SignalMessage::MemberJoined { member: member("z") })
            .expect("announce");
        settle().await;
        drain(&mut h.signal_out);

        // Candidate arrives before the answer: must not reach the transport.
        h.signal_in
            .send(SignalMessage::IceCandidate {
                from: "z".into(),
                to: "m".into(),
                payload: serde_json::json!({"candidate": "early"}),
            })
            .expect("candidate");
        settle().await;
        {
            let link = h.factory.link("z");
            assert!(link.state.lock().unwrap().candidates.is_empty());
        }

        h.signal_in
            .send(SignalMessage::Answer {
                from: "z".into(),
                to: "m".into(),
                payload: serde_json::json!({"type": "answer"}),
            })
            .expect("answer");
        settle().await;

        let link = h.factory.link("z");
        let state = link.state.lock().unwrap();
        assert_eq!(state.accepted_answers.len(), 1);
        assert_eq!(state.candidates.len(), 1);
        assert_eq!(state.candidates[0]["candidate"], "early");
    }

    #[tokio::test(start_paused = true)]
    async fn colliding_offer_from_higher_id_is_ignored() {
        let mut h = spawn_manager("m", quiet());
        join(&mut h, "room").await;
        h.signal_in
            .send(SignalMessage::MemberJoined { member: member("z") })
            .expect("announce");
        settle().await;
        drain(&mut h.signal_out);

        // We already offered to z; z's own offer loses the tie-break.
        h.signal_in
            .send(SignalMessage::Offer {
                from: "z".into(),
                to: "m".into(),
                payload: serde_json::json!({"type": "offer"}),
            })
            .expect("offer");
        settle().await;

        let frames = drain(&mut h.signal_out);
        assert!(frames.iter().all(|f| !matches!(f, SignalMessage::Answer { .. })));
        assert_eq!(h.factory.created_for("z"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn member_left_tears_the_link_down() {
        let mut h = spawn_manager("m", quiet());
        join(&mut h, "room").await;
        h.signal_in
            .send(SignalMessage::MemberJoined { member: member("z") })
            .expect("announce");
        settle().await;

        h.signal_in
            .send(SignalMessage::MemberLeft {
                connection_id: "z".into(),
            })
            .expect("left");
        settle().await;

        let link = h.factory.link("z");
        assert!(link.state.lock().unwrap().closed);
        let events = drain(&mut h.events);
        assert!(events.iter().any(|e| matches!(
            e,
            MeshEvent::MemberRemoved(id) if id == "z"
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_link_reoffers_after_the_fixed_backoff() {
        let mut h = spawn_manager("m", quiet());
        join(&mut h, "room").await;
        h.signal_in
            .send(SignalMessage::MemberJoined { member: member("z") })
            .expect("announce");
        settle().await;
        drain(&mut h.signal_out);

        h.factory.link("z").fire(TransportState::Connected);
        settle().await;
        h.factory.link("z").fire(TransportState::Failed);
        settle().await;

        // Inside the backoff window: no repair yet.
        tokio::time::advance(Duration::from_millis(2900)).await;
        settle().await;
        assert_eq!(offers_to(&drain(&mut h.signal_out), "z"), 0);
        assert_eq!(h.factory.created_for("z"), 1);

        // Backoff elapsed: fresh transport, fresh offer, no user action.
        tokio::time::advance(Duration::from_millis(200)).await;
        settle().await;
        assert_eq!(offers_to(&drain(&mut h.signal_out), "z"), 1);
        assert_eq!(h.factory.created_for("z"), 2);

        let phases: Vec<LinkPhase> = drain(&mut h.events)
            .into_iter()
            .filter_map(|e| match e {
                MeshEvent::LinkPhaseChanged { phase, .. } => Some(phase),
                _ => None,
            })
            .collect();
        assert!(phases.contains(&LinkPhase::Failed));
        assert!(phases.contains(&LinkPhase::Reconnecting));
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_is_not_attempted_for_a_departed_peer() {
        let mut h = spawn_manager("m", quiet());
        join(&mut h, "room").await;
        h.signal_in
            .send(SignalMessage::MemberJoined { member: member("z") })
            .expect("announce");
        settle().await;

        h.factory.link("z").fire(TransportState::Connected);
        settle().await;
        h.signal_in
            .send(SignalMessage::MemberLeft {
                connection_id: "z".into(),
            })
            .expect("left");
        settle().await;
        h.factory.link("z").fire(TransportState::Failed);
        settle().await;

        tokio::time::advance(Duration::from_secs(4)).await;
        settle().await;
        assert_eq!(h.factory.created_for("z"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn leave_room_closes_links_and_releases_media() {
        let mut h = spawn_manager("m", quiet());
        join(&mut h, "room").await;
        h.signal_in
            .send(snapshot("room", vec![member("y"), member("z")]))
            .expect("snapshot");
        settle().await;
        drain(&mut h.signal_out);

        h.commands.send(MeshCommand::LeaveRoom).expect("leave");
        settle().await;

        for remote in ["y", "z"] {
            assert!(h.factory.link(remote).state.lock().unwrap().closed);
        }
        assert_eq!(h.factory.released_all.load(Ordering::SeqCst), 1);
        let frames = drain(&mut h.signal_out);
        assert!(frames.iter().any(|f| matches!(
            f,
            SignalMessage::LeaveRoom { room_id } if room_id == "room"
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn mute_and_deafen_gate_tracks_and_publish_state() {
        let mut h = spawn_manager("m", quiet());
        join(&mut h, "room").await;
        h.signal_in
            .send(snapshot("room", vec![member("z")]))
            .expect("snapshot");
        settle().await;
        drain(&mut h.signal_out);

        h.commands.send(MeshCommand::SetMuted(true)).expect("mute");
        h.commands
            .send(MeshCommand::SetDeafened(true))
            .expect("deafen");
        settle().await;

        {
            let link = h.factory.link("z");
            let state = link.state.lock().unwrap();
            assert_eq!(state.outbound_audio, Some(false));
            assert_eq!(state.inbound_audio, Some(false));
        }

        let frames = drain(&mut h.signal_out);
        assert!(frames.iter().any(|f| matches!(
            f,
            SignalMessage::StateUpdate(p) if p.muted == Some(true)
        )));
        assert!(frames.iter().any(|f| matches!(
            f,
            SignalMessage::StateUpdate(p) if p.deafened == Some(true)
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn local_flags_apply_to_links_created_later() {
        let mut h = spawn_manager("m", quiet());
        join(&mut h, "room").await;
        h.commands.send(MeshCommand::SetMuted(true)).expect("mute");
        settle().await;

        h.signal_in
            .send(SignalMessage::MemberJoined { member: member("z") })
            .expect("announce");
        settle().await;

        let link = h.factory.link("z");
        assert_eq!(link.state.lock().unwrap().outbound_audio, Some(false));
    }

    #[tokio::test(start_paused = true)]
    async fn screen_share_renegotiates_only_added_tracks() {
        let mut h = spawn_manager("m", quiet());
        join(&mut h, "room").await;
        h.factory
            .track_changes
            .lock()
            .unwrap()
            .insert("y".into(), TrackChange::Replaced);
        h.factory
            .track_changes
            .lock()
            .unwrap()
            .insert("z".into(), TrackChange::Added);
        h.signal_in
            .send(snapshot("room", vec![member("y"), member("z")]))
            .expect("snapshot");
        settle().await;
        drain(&mut h.signal_out);

        h.commands
            .send(MeshCommand::StartScreenShare)
            .expect("share");
        settle().await;

        let frames = drain(&mut h.signal_out);
        // The replaced sender needs no renegotiation; the added one does.
        assert_eq!(offers_to(&frames, "y"), 0);
        assert_eq!(offers_to(&frames, "z"), 1);
        assert!(frames.iter().any(|f| matches!(
            f,
            SignalMessage::Renegotiate { to, .. } if to == "z"
        )));
        assert!(frames.iter().any(|f| matches!(
            f,
            SignalMessage::StateUpdate(p) if p.screen_sharing == Some(true)
        )));
        for remote in ["y", "z"] {
            assert_eq!(
                h.factory.link(remote).state.lock().unwrap().screen_started,
                1
            );
        }

        h.commands
            .send(MeshCommand::StopScreenShare)
            .expect("stop");
        settle().await;

        for remote in ["y", "z"] {
            assert_eq!(
                h.factory.link(remote).state.lock().unwrap().screen_stopped,
                1
            );
        }
        assert_eq!(h.factory.display_released.load(Ordering::SeqCst), 1);
        let frames = drain(&mut h.signal_out);
        assert!(frames.iter().any(|f| matches!(
            f,
            SignalMessage::StateUpdate(p) if p.screen_sharing == Some(false)
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn microphone_failure_aborts_the_join() {
        let mut h = spawn_manager("m", quiet());
        h.factory.mic_fails.store(true, Ordering::SeqCst);

        h.commands
            .send(MeshCommand::JoinRoom {
                room_id: "room".into(),
            })
            .expect("join");
        settle().await;

        let frames = drain(&mut h.signal_out);
        assert!(frames.iter().all(|f| !matches!(f, SignalMessage::JoinRoom { .. })));
        let events = drain(&mut h.events);
        assert!(events.iter().any(|e| matches!(e, MeshEvent::MediaError(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn screen_share_outside_a_room_is_a_local_error() {
        let mut h = spawn_manager("m", quiet());
        h.commands
            .send(MeshCommand::StartScreenShare)
            .expect("share");
        settle().await;

        assert!(drain(&mut h.signal_out).is_empty());
        let events = drain(&mut h.events);
        assert!(events.iter().any(|e| matches!(e, MeshEvent::MediaError(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn reconciliation_snapshot_drops_stale_links() {
        let mut h = spawn_manager("m", quiet());
        join(&mut h, "room").await;
        h.signal_in
            .send(snapshot("room", vec![member("y"), member("z")]))
            .expect("snapshot");
        settle().await;
        drain(&mut h.events);

        // The next authoritative list no longer contains z.
        h.signal_in
            .send(snapshot("room", vec![member("y")]))
            .expect("snapshot");
        settle().await;

        assert!(h.factory.link("z").state.lock().unwrap().closed);
        let events = drain(&mut h.events);
        assert!(events.iter().any(|e| matches!(
            e,
            MeshEvent::MemberRemoved(id) if id == "z"
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn reconciliation_polls_the_member_list() {
        let mut h = spawn_manager("m", MeshConfig::default());
        join(&mut h, "room").await;

        for _ in 0..4 {
            tokio::time::advance(Duration::from_millis(500)).await;
            settle().await;
        }

        let polls = drain(&mut h.signal_out)
            .into_iter()
            .filter(|f| matches!(f, SignalMessage::GetMembers { .. }))
            .count();
        assert!(polls >= 3, "expected at least 3 polls, saw {polls}");
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_ice_servers_reach_the_transport_factory() {
        let mut h = spawn_manager("m", quiet());
        join(&mut h, "room").await;

        h.signal_in
            .send(SignalMessage::MembersSnapshot {
                room_id: "room".into(),
                members: Vec::new(),
                ice_servers: huddle_common::protocol::IceServerConfig::defaults(),
            })
            .expect("snapshot");
        settle().await;

        assert!(!h.factory.ice_servers.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn frames_for_unknown_links_are_ignored() {
        let mut h = spawn_manager("m", quiet());
        join(&mut h, "room").await;

        h.signal_in
            .send(SignalMessage::Answer {
                from: "ghost".into(),
                to: "m".into(),
                payload: Value::Null,
            })
            .expect("answer");
        h.signal_in
            .send(SignalMessage::IceCandidate {
                from: "ghost".into(),
                to: "m".into(),
                payload: Value::Null,
            })
            .expect("candidate");
        settle().await;

        assert!(drain(&mut h.signal_out).is_empty());
        assert!(h.factory.links.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn local_candidates_are_relayed_to_the_peer() {
        let mut h = spawn_manager("m", quiet());
        join(&mut h, "room").await;
        h.signal_in
            .send(SignalMessage::MemberJoined { member: member("z") })
            .expect("announce");
        settle().await;
        drain(&mut h.signal_out);

        h.factory
            .link("z")
            .fire_candidate(serde_json::json!({"candidate": "local-1"}));
        settle().await;

        let frames = drain(&mut h.signal_out);
        assert!(frames.iter().any(|f| matches!(
            f,
            SignalMessage::IceCandidate { to, from, .. } if to == "z" && from == "m"
        )));
    }
}
