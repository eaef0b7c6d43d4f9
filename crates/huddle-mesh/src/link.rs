//! Per-peer link bookkeeping: negotiation phase, candidate buffering, and
//! the offerer/answerer role.
//!
//! A link exists only while both sides share a room. Lifecycle:
//! `Negotiating → Connected → Failed → Reconnecting → Connected | Closed`,
//! with `Closed` terminal.

use crate::transport::{LinkTransport, TransportState};
use huddle_common::protocol::ConnectionId;
use serde_json::Value;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkPhase {
    /// Offer/answer exchange in progress.
    Negotiating,
    /// The transport reported a working connection.
    Connected,
    /// The transport failed or dropped; a reconnect is not yet armed.
    Failed,
    /// Waiting out the backoff, or re-negotiating after it elapsed.
    Reconnecting,
    /// Torn down; the entry only lingers until the manager drops it.
    Closed,
}

/// Client-local state for one remote peer.
pub struct PeerLink {
    pub remote: ConnectionId,
    pub phase: LinkPhase,
    /// True when this side produced the offer (the glare winner).
    pub initiator: bool,
    /// Set once a remote description has been applied; gates candidates.
    pub remote_described: bool,
    pending_candidates: Vec<Value>,
    pub transport: Arc<dyn LinkTransport>,
}

impl PeerLink {
    pub fn new(remote: ConnectionId, transport: Arc<dyn LinkTransport>, initiator: bool) -> Self {
        Self {
            remote,
            phase: LinkPhase::Negotiating,
            initiator,
            remote_described: false,
            pending_candidates: Vec::new(),
            transport,
        }
    }

    /// Hold a candidate that arrived before the remote description.
    pub fn buffer_candidate(&mut self, candidate: Value) {
        self.pending_candidates.push(candidate);
    }

    /// Record that a remote description applied and drain anything buffered.
    pub fn mark_remote_described(&mut self) -> Vec<Value> {
        self.remote_described = true;
        std::mem::take(&mut self.pending_candidates)
    }

    /// Swap in a fresh transport for a reconnect attempt. The old
    /// negotiation's buffered candidates are meaningless for the new one.
    pub fn replace_transport(&mut self, transport: Arc<dyn LinkTransport>) {
        self.transport = transport;
        self.initiator = true;
        self.remote_described = false;
        self.pending_candidates.clear();
    }

    /// Fold a transport state report into the phase. Returns the new phase
    /// when it changed.
    pub fn on_transport_state(&mut self, state: TransportState) -> Option<LinkPhase> {
        if self.phase == LinkPhase::Closed {
            return None;
        }
        let next = match state {
            TransportState::Connected => LinkPhase::Connected,
            TransportState::Failed | TransportState::Disconnected => {
                // A reconnect is already pending; further failure reports
                // from the dying transport change nothing.
                if self.phase == LinkPhase::Reconnecting {
                    return None;
                }
                LinkPhase::Failed
            }
            TransportState::Closed => LinkPhase::Closed,
            TransportState::Connecting => return None,
        };
        if next == self.phase {
            return None;
        }
        self.phase = next;
        Some(next)
    }
}
