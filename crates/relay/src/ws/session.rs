// Session registry: live connections, their identity, and room subscriptions.

use std::{
    collections::{BTreeSet, HashMap, HashSet},
    net::SocketAddr,
    sync::Arc,
};

use chrono::{DateTime, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use parley_common::{
    protocol::ws::ServerEvent,
    types::{ConnectionId, GroupId, UserId},
};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    error::RealtimeError,
    metrics,
    presence::{PresenceTracker, PresenceTransition},
};

/// Events a connection may have queued but not yet written to its socket.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendFailure {
    Closed,
    Overflow,
}

/// Bounded handle to one connection's outbound queue.
///
/// A full queue means the peer stopped draining its socket. The first
/// overflow cancels `overflow`, which the socket task treats as a dead peer.
#[derive(Debug, Clone)]
pub struct OutboundSender {
    queue: mpsc::Sender<ServerEvent>,
    overflow: CancellationToken,
}

impl OutboundSender {
    pub fn new(queue: mpsc::Sender<ServerEvent>, overflow: CancellationToken) -> Self {
        Self { queue, overflow }
    }

    pub fn send(&self, event: ServerEvent) -> Result<(), SendFailure> {
        match self.queue.try_send(event) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.overflow.cancel();
                Err(SendFailure::Overflow)
            }
            Err(TrySendError::Closed(_)) => Err(SendFailure::Closed),
        }
    }
}

#[cfg(test)]
pub(crate) fn outbound_channel(
    overflow: CancellationToken,
) -> (OutboundSender, mpsc::Receiver<ServerEvent>) {
    let (queue, receiver) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
    (OutboundSender::new(queue, overflow), receiver)
}

/// Transport details captured at handshake time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionMeta {
    pub remote_addr: Option<SocketAddr>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub connection_id: ConnectionId,
    pub user_id: UserId,
    pub username: String,
    pub meta: ConnectionMeta,
    pub connected_at: DateTime<Utc>,
}

/// A connection's membership in one room, as seen by fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoomMember {
    pub connection_id: ConnectionId,
    pub user_id: UserId,
}

/// What `unregister` tore down.
#[derive(Debug, Clone)]
pub struct Departure {
    pub connection: ConnectionInfo,
    /// Rooms the connection had joined, captured before they were cleared.
    pub rooms: BTreeSet<GroupId>,
    pub presence: PresenceTransition,
}

/// Which connections a room broadcast skips.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exclude {
    Nobody,
    Connection(ConnectionId),
    User(UserId),
}

impl Exclude {
    fn skips(self, connection_id: ConnectionId, user_id: UserId) -> bool {
        match self {
            Self::Nobody => false,
            Self::Connection(excluded) => excluded == connection_id,
            Self::User(excluded) => excluded == user_id,
        }
    }
}

#[derive(Debug)]
struct ConnectionEntry {
    info: ConnectionInfo,
    rooms: HashSet<GroupId>,
    outbound: OutboundSender,
}

#[derive(Debug, Clone)]
struct RoomSlot {
    user_id: UserId,
    outbound: OutboundSender,
}

/// Authoritative connection -> identity and room -> connections mapping.
///
/// Lock order is always a `connections` entry before a `rooms` entry. Room
/// slots are mutated only while the owning connection entry is held, so a
/// room's connection set is never observed half-updated and a join that
/// races a broadcast is either fully in or fully out of its recipient list.
#[derive(Debug)]
pub struct SessionRegistry {
    connections: DashMap<ConnectionId, ConnectionEntry>,
    rooms: DashMap<GroupId, HashMap<ConnectionId, RoomSlot>>,
    presence: Arc<PresenceTracker>,
}

impl SessionRegistry {
    pub fn new(presence: Arc<PresenceTracker>) -> Self {
        Self { connections: DashMap::new(), rooms: DashMap::new(), presence }
    }

    pub fn presence(&self) -> &Arc<PresenceTracker> {
        &self.presence
    }

    /// Registers a freshly authenticated connection and bumps the owning
    /// user's connection count in the same critical section.
    pub fn register(
        &self,
        connection_id: ConnectionId,
        user_id: UserId,
        username: &str,
        meta: ConnectionMeta,
        outbound: OutboundSender,
    ) -> Result<PresenceTransition, RealtimeError> {
        match self.connections.entry(connection_id) {
            Entry::Occupied(_) => Err(RealtimeError::DuplicateRegistration { connection_id }),
            Entry::Vacant(vacant) => {
                let transition = self.presence.connection_opened(user_id);
                vacant.insert(ConnectionEntry {
                    info: ConnectionInfo {
                        connection_id,
                        user_id,
                        username: username.to_owned(),
                        meta,
                        connected_at: Utc::now(),
                    },
                    rooms: HashSet::new(),
                    outbound,
                });
                Ok(transition)
            }
        }
    }

    /// Removes a connection and clears its room slots. Unknown ids are a
    /// no-op so duplicate disconnect paths are harmless.
    pub fn unregister(&self, connection_id: ConnectionId) -> Option<Departure> {
        let (_, entry) = self.connections.remove(&connection_id)?;

        for group_id in &entry.rooms {
            self.remove_room_slot(*group_id, connection_id);
        }
        let presence = self.presence.connection_closed(entry.info.user_id);

        Some(Departure { connection: entry.info, rooms: entry.rooms.into_iter().collect(), presence })
    }

    /// Idempotent. Returns whether the room was newly joined.
    pub fn add_room(
        &self,
        connection_id: ConnectionId,
        group_id: GroupId,
    ) -> Result<bool, RealtimeError> {
        let mut entry = self
            .connections
            .get_mut(&connection_id)
            .ok_or(RealtimeError::UnknownConnection { connection_id })?;
        if !entry.rooms.insert(group_id) {
            return Ok(false);
        }

        self.rooms.entry(group_id).or_default().insert(
            connection_id,
            RoomSlot { user_id: entry.info.user_id, outbound: entry.outbound.clone() },
        );
        Ok(true)
    }

    /// Idempotent. Returns whether the room was actually left.
    pub fn remove_room(
        &self,
        connection_id: ConnectionId,
        group_id: GroupId,
    ) -> Result<bool, RealtimeError> {
        let mut entry = self
            .connections
            .get_mut(&connection_id)
            .ok_or(RealtimeError::UnknownConnection { connection_id })?;
        if !entry.rooms.remove(&group_id) {
            return Ok(false);
        }

        self.remove_room_slot(group_id, connection_id);
        Ok(true)
    }

    fn remove_room_slot(&self, group_id: GroupId, connection_id: ConnectionId) {
        if let Some(mut slots) = self.rooms.get_mut(&group_id) {
            slots.remove(&connection_id);
        }
        self.rooms.remove_if(&group_id, |_, slots| slots.is_empty());
    }

    pub fn connections_in_room(&self, group_id: GroupId) -> BTreeSet<RoomMember> {
        self.rooms
            .get(&group_id)
            .map(|slots| {
                slots
                    .iter()
                    .map(|(connection_id, slot)| RoomMember {
                        connection_id: *connection_id,
                        user_id: slot.user_id,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn is_in_room(&self, connection_id: ConnectionId, group_id: GroupId) -> bool {
        self.connections.get(&connection_id).is_some_and(|entry| entry.rooms.contains(&group_id))
    }

    pub fn rooms_of(&self, connection_id: ConnectionId) -> Option<BTreeSet<GroupId>> {
        self.connections.get(&connection_id).map(|entry| entry.rooms.iter().copied().collect())
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn connections_for_user(&self, user_id: UserId) -> Vec<ConnectionId> {
        self.connections
            .iter()
            .filter(|entry| entry.info.user_id == user_id)
            .map(|entry| *entry.key())
            .collect()
    }

    pub fn send_to(&self, connection_id: ConnectionId, event: ServerEvent) -> bool {
        let Some(outbound) = self.connections.get(&connection_id).map(|e| e.outbound.clone())
        else {
            return false;
        };
        match outbound.send(event) {
            Ok(()) => true,
            Err(failure) => {
                if failure == SendFailure::Overflow {
                    warn!(%connection_id, "outbound queue full, dropping connection");
                }
                false
            }
        }
    }

    /// Queues `event` to every connection in the room except those
    /// `exclude` names. The recipient list is snapshotted under the room
    /// lock and sends happen after it is released; a closed or overflowing
    /// recipient is skipped without affecting the rest. Returns the number of
    /// connections the event was queued to.
    pub fn broadcast_to_room(&self, group_id: GroupId, event: &ServerEvent, exclude: Exclude) -> usize {
        let recipients: Vec<(ConnectionId, OutboundSender)> = match self.rooms.get(&group_id) {
            Some(slots) => slots
                .iter()
                .filter(|(connection_id, slot)| !exclude.skips(**connection_id, slot.user_id))
                .map(|(connection_id, slot)| (*connection_id, slot.outbound.clone()))
                .collect(),
            None => return 0,
        };

        deliver(recipients, event)
    }

    /// Queues one copy of `event` per connection that shares at least one
    /// of `groups`, skipping every connection owned by `exclude_user`.
    pub fn broadcast_to_rooms_once(
        &self,
        groups: &BTreeSet<GroupId>,
        event: &ServerEvent,
        exclude_user: UserId,
    ) -> usize {
        let mut recipients: HashMap<ConnectionId, OutboundSender> = HashMap::new();
        for group_id in groups {
            if let Some(slots) = self.rooms.get(group_id) {
                for (connection_id, slot) in slots.iter() {
                    if slot.user_id != exclude_user {
                        recipients.entry(*connection_id).or_insert_with(|| slot.outbound.clone());
                    }
                }
            }
        }

        deliver(recipients, event)
    }
}

fn deliver(
    recipients: impl IntoIterator<Item = (ConnectionId, OutboundSender)>,
    event: &ServerEvent,
) -> usize {
    let mut delivered = 0;
    let mut dropped = 0;
    for (connection_id, outbound) in recipients {
        match outbound.send(event.clone()) {
            Ok(()) => delivered += 1,
            Err(SendFailure::Closed) => {
                dropped += 1;
                debug!(%connection_id, event = event.kind(), "recipient closed during fan-out");
            }
            Err(SendFailure::Overflow) => {
                dropped += 1;
                warn!(%connection_id, event = event.kind(), "outbound queue full, dropping connection");
            }
        }
    }
    metrics::record_fanout(delivered, dropped);
    delivered
}
