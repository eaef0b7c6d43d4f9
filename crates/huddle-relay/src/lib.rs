//! # huddle-relay
//!
//! Real-time presence and signaling relay for Huddle voice rooms. Handles:
//! - Client connections with authentication (Connection Gateway)
//! - Room membership as the single source of truth (Presence Registry)
//! - Handshake relay and room-scoped fan-out (Signaling Relay)
//! - Heartbeat/keepalive
//!
//! The relay is a pure router: it never inspects offer/answer/candidate
//! payloads, and media never touches it — once a pair of members finishes
//! signaling, their audio and video flow peer to peer.

pub mod auth;
pub mod registry;

use auth::Authenticator;
use axum::{
    Router,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
    routing::get,
};
use futures_util::{SinkExt, StreamExt};
use huddle_common::HuddleError;
use huddle_common::protocol::{ConnectionId, IceServerConfig, RoomId, SignalMessage, StatePatch};
use registry::PresenceRegistry;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Shared relay state — one per process.
#[derive(Clone)]
pub struct RelayState {
    pub registry: PresenceRegistry,
    authenticator: Arc<dyn Authenticator>,
    heartbeat_interval_ms: u64,
}

impl RelayState {
    pub fn new(authenticator: Arc<dyn Authenticator>, heartbeat_interval_ms: u64) -> Self {
        Self {
            registry: PresenceRegistry::new(),
            authenticator,
            heartbeat_interval_ms,
        }
    }

    /// Route one authenticated frame. Errors are reported back to the
    /// offending connection only; the room never sees them.
    pub async fn handle_frame(&self, connection_id: &ConnectionId, frame: SignalMessage) {
        match frame {
            SignalMessage::JoinRoom { room_id } => self.join_room(connection_id, room_id).await,
            SignalMessage::LeaveRoom { room_id } => self.leave_room(connection_id, &room_id).await,
            SignalMessage::StateUpdate(patch) => self.update_state(connection_id, patch).await,
            SignalMessage::GetMembers { room_id } => {
                self.send_snapshot(connection_id, room_id, None).await;
            }
            frame @ (SignalMessage::Offer { .. }
            | SignalMessage::Answer { .. }
            | SignalMessage::IceCandidate { .. }
            | SignalMessage::Renegotiate { .. }) => {
                self.relay_targeted(connection_id, frame).await;
            }
            SignalMessage::Heartbeat { .. } => {
                self.registry
                    .unicast(
                        connection_id,
                        SignalMessage::HeartbeatAck {
                            timestamp: chrono::Utc::now().timestamp_millis(),
                        },
                    )
                    .await;
            }
            // Everything else is a server→client frame or a duplicate
            // Identify: not valid from an authenticated client.
            _ => {
                self.registry
                    .unicast(
                        connection_id,
                        SignalMessage::Error {
                            code: 4000,
                            message: "invalid opcode".into(),
                        },
                    )
                    .await;
            }
        }
    }

    async fn join_room(&self, connection_id: &ConnectionId, room_id: RoomId) {
        let outcome = match self.registry.join(connection_id, room_id.clone()).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.send_error(connection_id, &e).await;
                return;
            }
        };

        // The join may have vacated a previous room; its members hear a
        // plain departure.
        if let Some((old_room, remaining)) = outcome.vacated {
            tracing::debug!(session = %connection_id, room = %old_room, "implicit leave");
            for peer in remaining {
                self.registry
                    .unicast(
                        &peer.connection_id,
                        SignalMessage::MemberLeft {
                            connection_id: connection_id.clone(),
                        },
                    )
                    .await;
            }
        }

        // An already-announced member is never re-announced; the snapshot
        // below still refreshes the caller.
        if !outcome.already_member {
            self.registry
                .broadcast(
                    &room_id,
                    Some(connection_id),
                    &SignalMessage::MemberJoined {
                        member: outcome.member,
                    },
                )
                .await;
        }

        self.registry
            .unicast(
                connection_id,
                SignalMessage::MembersSnapshot {
                    room_id,
                    members: outcome.others,
                    ice_servers: IceServerConfig::defaults(),
                },
            )
            .await;
    }

    async fn leave_room(&self, connection_id: &ConnectionId, room_id: &RoomId) {
        // No-op (and no announcement) unless the session was a member.
        if let Some(remaining) = self.registry.leave(connection_id, room_id).await {
            for peer in remaining {
                self.registry
                    .unicast(
                        &peer.connection_id,
                        SignalMessage::MemberLeft {
                            connection_id: connection_id.clone(),
                        },
                    )
                    .await;
            }
        }
    }

    async fn update_state(&self, connection_id: &ConnectionId, patch: StatePatch) {
        match self.registry.update_state(connection_id, patch).await {
            Ok(outcome) => {
                let update = SignalMessage::MemberState {
                    connection_id: outcome.member.connection_id.clone(),
                    muted: outcome.member.muted,
                    deafened: outcome.member.deafened,
                    screen_sharing: outcome.member.screen_sharing,
                };
                for peer in outcome.peers {
                    self.registry
                        .unicast(&peer.connection_id, update.clone())
                        .await;
                }
            }
            Err(e) => self.send_error(connection_id, &e).await,
        }
    }

    /// Forward a targeted handshake frame verbatim, substituting the
    /// sender's real connection id into `from`. A dead target is a silent
    /// drop — signaling races are expected and non-fatal.
    async fn relay_targeted(&self, connection_id: &ConnectionId, frame: SignalMessage) {
        let frame = frame.with_sender(connection_id);
        let Some(target) = frame.target().cloned() else {
            return;
        };
        if !self.registry.unicast(&target, frame).await {
            tracing::debug!(
                from = %connection_id,
                to = %target,
                "dropped targeted frame for dead connection"
            );
        }
    }

    /// Unicast a fresh members snapshot. Unlike the join snapshot, a
    /// reconciliation snapshot includes the caller itself.
    async fn send_snapshot(
        &self,
        connection_id: &ConnectionId,
        room_id: RoomId,
        exclude: Option<&ConnectionId>,
    ) {
        let members = self.registry.members(&room_id, exclude).await;
        self.registry
            .unicast(
                connection_id,
                SignalMessage::MembersSnapshot {
                    room_id,
                    members,
                    ice_servers: IceServerConfig::defaults(),
                },
            )
            .await;
    }

    /// Disconnect cleanup. Runs on every connection exit path, graceful or
    /// abrupt.
    pub async fn disconnect(&self, connection_id: &ConnectionId) {
        if let Some((room_id, remaining)) = self.registry.remove(connection_id).await {
            tracing::debug!(session = %connection_id, room = %room_id, "disconnect vacated room");
            for peer in remaining {
                self.registry
                    .unicast(
                        &peer.connection_id,
                        SignalMessage::MemberLeft {
                            connection_id: connection_id.clone(),
                        },
                    )
                    .await;
            }
        }
    }

    async fn send_error(&self, connection_id: &ConnectionId, err: &HuddleError) {
        self.registry
            .unicast(
                connection_id,
                SignalMessage::Error {
                    code: err.wire_code(),
                    message: err.to_string(),
                },
            )
            .await;
    }
}

/// Build the relay WebSocket router.
pub fn build_router(state: RelayState) -> Router {
    Router::new()
        .route("/signal", get(ws_handler))
        .with_state(Arc::new(state))
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<RelayState>>) -> Response {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

/// Handle a single relay connection: Hello → Identify → room traffic.
async fn handle_connection(socket: WebSocket, state: Arc<RelayState>) {
    let (mut sink, mut stream) = socket.split();

    // Outbound queue for this connection. The registry holds the sender so
    // fan-out from other connections' tasks lands here too.
    let (tx, mut rx) = mpsc::unbounded_channel::<SignalMessage>();

    let _ = tx.send(SignalMessage::Hello {
        heartbeat_interval_ms: state.heartbeat_interval_ms,
    });

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let Ok(json) = serde_json::to_string(&msg) else {
                continue;
            };
            if sink.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    // None until Identify succeeds; no room operation is possible before.
    let mut connection_id: Option<ConnectionId> = None;

    while let Some(Ok(msg)) = stream.next().await {
        match msg {
            Message::Text(text) => {
                let frame = match serde_json::from_str::<SignalMessage>(&text) {
                    Ok(frame) => frame,
                    Err(e) => {
                        let _ = tx.send(SignalMessage::Error {
                            code: 4000,
                            message: format!("invalid frame: {e}"),
                        });
                        continue;
                    }
                };

                if let Some(id) = connection_id.clone() {
                    state.handle_frame(&id, frame).await;
                    continue;
                }

                match frame {
                    SignalMessage::Identify { token } => {
                        match state.authenticator.authenticate(&token).await {
                            Ok(identity) => {
                                let id = uuid::Uuid::new_v4().to_string();
                                state
                                    .registry
                                    .register(
                                        id.clone(),
                                        identity.user_id.clone(),
                                        identity.display_name.clone(),
                                        tx.clone(),
                                    )
                                    .await;
                                let _ = tx.send(SignalMessage::Ready {
                                    connection_id: id.clone(),
                                    user_id: identity.user_id,
                                    display_name: identity.display_name.clone(),
                                });
                                tracing::info!(
                                    session = %id,
                                    user = %identity.display_name,
                                    "relay session ready"
                                );
                                connection_id = Some(id);
                            }
                            Err(e) => {
                                let _ = tx.send(SignalMessage::Error {
                                    code: e.wire_code(),
                                    message: e.to_string(),
                                });
                                // Terminal: no session was created and no
                                // retry happens here — the client decides
                                // whether to reconnect with a fresh token.
                                break;
                            }
                        }
                    }
                    SignalMessage::Heartbeat { .. } => {
                        let _ = tx.send(SignalMessage::HeartbeatAck {
                            timestamp: chrono::Utc::now().timestamp_millis(),
                        });
                    }
                    _ => {
                        let _ = tx.send(SignalMessage::Error {
                            code: 4003,
                            message: "not authenticated".into(),
                        });
                    }
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    // Cleanup must run even if the client vanished mid-handshake.
    if let Some(id) = connection_id {
        state.disconnect(&id).await;
        tracing::info!(session = %id, "relay session closed");
    }

    // Dropping the last sender ends the send task once the queue (which may
    // hold a final error frame) has drained.
    drop(tx);
    let _ = send_task.await;
}
