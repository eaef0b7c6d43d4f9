//! Presence registry — the authoritative store of which connections occupy
//! which room, and with what transient state.
//!
//! Sessions and the room index live behind a single lock so every
//! read-modify-write sequence is atomic with respect to concurrent
//! invocations. The room index is a materialized view of the sessions map:
//! `rooms[r] == { s.connection_id | s.room_id == Some(r) }` holds after every
//! operation.

use chrono::{DateTime, Utc};
use huddle_common::protocol::{ConnectionId, Member, RoomId, SignalMessage, StatePatch};
use huddle_common::{HuddleError, HuddleResult};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{RwLock, mpsc};

/// Outbound handle for one connection. Unbounded so a slow recipient never
/// blocks the registry or delivery to other recipients.
pub type EventSender = mpsc::UnboundedSender<SignalMessage>;

/// One authenticated connection. Created by the gateway after the credential
/// resolves, destroyed on disconnect.
#[derive(Debug, Clone)]
pub struct Session {
    pub connection_id: ConnectionId,
    pub user_id: String,
    pub display_name: String,
    pub room_id: Option<RoomId>,
    pub muted: bool,
    pub deafened: bool,
    pub screen_sharing: bool,
    pub connected_at: DateTime<Utc>,
    sender: EventSender,
}

impl Session {
    /// The member record other room occupants see.
    pub fn member(&self) -> Member {
        Member {
            connection_id: self.connection_id.clone(),
            user_id: self.user_id.clone(),
            display_name: self.display_name.clone(),
            muted: self.muted,
            deafened: self.deafened,
            screen_sharing: self.screen_sharing,
        }
    }
}

/// Result of a join: what the relay needs to announce.
#[derive(Debug)]
pub struct JoinOutcome {
    /// The session was already a member of the target room; the relay must
    /// not re-announce it.
    pub already_member: bool,
    /// The joiner's member record as the room will see it.
    pub member: Member,
    /// Members of the target room before the join, excluding the joiner.
    pub others: Vec<Member>,
    /// When the join implied leaving a previous room: that room and its
    /// remaining members.
    pub vacated: Option<(RoomId, Vec<Member>)>,
}

/// Result of a state update: the new flags and who should hear about them.
#[derive(Debug)]
pub struct StateOutcome {
    pub member: Member,
    /// Other members of the caller's current room; empty when roomless.
    pub peers: Vec<Member>,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<ConnectionId, Session>,
    /// Materialized view: room id → member connection ids.
    rooms: HashMap<RoomId, HashSet<ConnectionId>>,
}

impl Inner {
    fn members_of(&self, room_id: &RoomId, exclude: Option<&ConnectionId>) -> Vec<Member> {
        self.rooms
            .get(room_id)
            .map(|ids| {
                ids.iter()
                    .filter(|id| exclude != Some(*id))
                    .filter_map(|id| self.sessions.get(id))
                    .map(Session::member)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Detach a session from its current room. Returns the vacated room and
    /// its remaining members, or None if the session was roomless.
    fn detach(&mut self, connection_id: &ConnectionId) -> Option<(RoomId, Vec<Member>)> {
        let session = self.sessions.get_mut(connection_id)?;
        let room_id = session.room_id.take()?;

        if let Some(members) = self.rooms.get_mut(&room_id) {
            members.remove(connection_id);
            if members.is_empty() {
                self.rooms.remove(&room_id);
            }
        }
        let remaining = self.members_of(&room_id, None);
        Some((room_id, remaining))
    }
}

/// Shared presence store. Cheap to clone; all clones see the same state.
#[derive(Clone, Default)]
pub struct PresenceRegistry {
    inner: Arc<RwLock<Inner>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a session for a freshly authenticated connection.
    pub async fn register(
        &self,
        connection_id: ConnectionId,
        user_id: String,
        display_name: String,
        sender: EventSender,
    ) {
        let session = Session {
            connection_id: connection_id.clone(),
            user_id,
            display_name,
            room_id: None,
            muted: false,
            deafened: false,
            screen_sharing: false,
            connected_at: Utc::now(),
            sender,
        };
        self.inner
            .write()
            .await
            .sessions
            .insert(connection_id, session);
    }

    /// Move a session into `room_id`, implicitly leaving any previous room.
    /// Re-joining the current room is idempotent.
    pub async fn join(
        &self,
        connection_id: &ConnectionId,
        room_id: RoomId,
    ) -> HuddleResult<JoinOutcome> {
        let mut inner = self.inner.write().await;

        let current = inner
            .sessions
            .get(connection_id)
            .ok_or_else(|| HuddleError::StateConflict {
                connection_id: connection_id.clone(),
            })?;

        if current.room_id.as_ref() == Some(&room_id) {
            let member = current.member();
            return Ok(JoinOutcome {
                already_member: true,
                member,
                others: inner.members_of(&room_id, Some(connection_id)),
                vacated: None,
            });
        }

        let vacated = inner.detach(connection_id);
        let others = inner.members_of(&room_id, Some(connection_id));

        // A fresh room entry starts with default flags, same as a fresh
        // session.
        let Some(session) = inner.sessions.get_mut(connection_id) else {
            return Err(HuddleError::StateConflict {
                connection_id: connection_id.clone(),
            });
        };
        session.room_id = Some(room_id.clone());
        session.muted = false;
        session.deafened = false;
        session.screen_sharing = false;
        let member = session.member();

        inner
            .rooms
            .entry(room_id.clone())
            .or_default()
            .insert(connection_id.clone());

        tracing::info!(session = %connection_id, room = %room_id, "session joined room");

        Ok(JoinOutcome {
            already_member: false,
            member,
            others,
            vacated,
        })
    }

    /// Remove a session from `room_id`. Returns the remaining members, or
    /// None if the session was not a member (no-op, nothing to announce).
    pub async fn leave(
        &self,
        connection_id: &ConnectionId,
        room_id: &RoomId,
    ) -> Option<Vec<Member>> {
        let mut inner = self.inner.write().await;

        let in_room = inner
            .sessions
            .get(connection_id)
            .is_some_and(|s| s.room_id.as_ref() == Some(room_id));
        if !in_room {
            return None;
        }

        let (vacated_room, remaining) = inner.detach(connection_id)?;
        tracing::info!(session = %connection_id, room = %vacated_room, "session left room");
        Some(remaining)
    }

    /// Apply a partial flag update to the caller's own session.
    pub async fn update_state(
        &self,
        connection_id: &ConnectionId,
        patch: StatePatch,
    ) -> HuddleResult<StateOutcome> {
        let mut inner = self.inner.write().await;

        let session =
            inner
                .sessions
                .get_mut(connection_id)
                .ok_or_else(|| HuddleError::StateConflict {
                    connection_id: connection_id.clone(),
                })?;

        if let Some(m) = patch.muted {
            session.muted = m;
        }
        if let Some(d) = patch.deafened {
            session.deafened = d;
        }
        if let Some(s) = patch.screen_sharing {
            session.screen_sharing = s;
        }

        let member = session.member();
        let peers = match session.room_id.clone() {
            Some(room_id) => inner.members_of(&room_id, Some(connection_id)),
            None => Vec::new(),
        };
        Ok(StateOutcome { member, peers })
    }

    /// Disconnect cleanup: leave whatever room the session occupies, then
    /// destroy it. Returns the vacated room and its remaining members so the
    /// relay can announce the departure. Idempotent.
    pub async fn remove(&self, connection_id: &ConnectionId) -> Option<(RoomId, Vec<Member>)> {
        let mut inner = self.inner.write().await;
        let vacated = inner.detach(connection_id);
        if inner.sessions.remove(connection_id).is_some() {
            tracing::info!(session = %connection_id, "session removed");
        }
        vacated
    }

    /// Members of a room, optionally excluding one connection.
    pub async fn members(&self, room_id: &RoomId, exclude: Option<&ConnectionId>) -> Vec<Member> {
        self.inner.read().await.members_of(room_id, exclude)
    }

    /// Fire-and-forget unicast. Returns false when the target is not a live
    /// connection — the caller decides whether that is worth logging.
    pub async fn unicast(&self, connection_id: &ConnectionId, msg: SignalMessage) -> bool {
        let inner = self.inner.read().await;
        match inner.sessions.get(connection_id) {
            Some(session) => session.sender.send(msg).is_ok(),
            None => false,
        }
    }

    /// Fire-and-forget fan-out to every member of `room_id` except
    /// `exclude`. A closed or slow recipient never blocks the others.
    pub async fn broadcast(
        &self,
        room_id: &RoomId,
        exclude: Option<&ConnectionId>,
        msg: &SignalMessage,
    ) {
        let inner = self.inner.read().await;
        let Some(ids) = inner.rooms.get(room_id) else {
            return;
        };
        for id in ids {
            if exclude == Some(id) {
                continue;
            }
            if let Some(session) = inner.sessions.get(id) {
                let _ = session.sender.send(msg.clone());
            }
        }
    }

    pub async fn session_count(&self) -> usize {
        self.inner.read().await.sessions.len()
    }

    /// Check the materialized-view invariant: the room index equals the
    /// membership recomputed from live sessions. Test support.
    #[cfg(test)]
    pub async fn is_consistent(&self) -> bool {
        let inner = self.inner.read().await;
        let mut recomputed: HashMap<RoomId, HashSet<ConnectionId>> = HashMap::new();
        for session in inner.sessions.values() {
            if let Some(room_id) = &session.room_id {
                recomputed
                    .entry(room_id.clone())
                    .or_default()
                    .insert(session.connection_id.clone());
            }
        }
        recomputed == inner.rooms
    }
}
