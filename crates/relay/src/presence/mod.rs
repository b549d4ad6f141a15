// Presence tracking: per-user online state derived from live connection
// counts.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parley_common::types::UserId;
use tokio::sync::Mutex;
use tracing::debug;

use crate::gateway::PersistenceGateway;

/// Result of applying a connect or disconnect to a user's connection count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceTransition {
    /// 0 -> 1 connections.
    WentOnline,
    /// 1 -> 0 connections.
    WentOffline,
    Unchanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceSnapshot {
    pub user_id: UserId,
    pub online: bool,
    pub connections: usize,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug)]
struct PresenceRecord {
    connections: usize,
    last_seen: DateTime<Utc>,
    persist_lock: Arc<Mutex<()>>,
}

impl PresenceRecord {
    fn new() -> Self {
        Self { connections: 0, last_seen: Utc::now(), persist_lock: Arc::new(Mutex::new(())) }
    }
}

/// Source of truth for "is this user online" during the process lifetime.
///
/// Each user's counter lives in its own map entry, so an increment or
/// decrement and the threshold check happen under the same shard lock and
/// two devices disconnecting together produce exactly one offline
/// transition. Unrelated users never contend beyond a shard.
#[derive(Debug, Default)]
pub struct PresenceTracker {
    users: DashMap<UserId, PresenceRecord>,
}

impl PresenceTracker {
    pub fn connection_opened(&self, user_id: UserId) -> PresenceTransition {
        let mut record = self.users.entry(user_id).or_insert_with(PresenceRecord::new);
        record.connections += 1;
        record.last_seen = Utc::now();
        if record.connections == 1 {
            PresenceTransition::WentOnline
        } else {
            PresenceTransition::Unchanged
        }
    }

    pub fn connection_closed(&self, user_id: UserId) -> PresenceTransition {
        let Some(mut record) = self.users.get_mut(&user_id) else {
            return PresenceTransition::Unchanged;
        };
        if record.connections == 0 {
            return PresenceTransition::Unchanged;
        }
        record.connections -= 1;
        record.last_seen = Utc::now();
        if record.connections == 0 {
            PresenceTransition::WentOffline
        } else {
            PresenceTransition::Unchanged
        }
    }

    pub fn is_online(&self, user_id: UserId) -> bool {
        self.users.get(&user_id).is_some_and(|record| record.connections > 0)
    }

    pub fn connection_count(&self, user_id: UserId) -> usize {
        self.users.get(&user_id).map_or(0, |record| record.connections)
    }

    pub fn snapshot(&self, user_id: UserId) -> Option<PresenceSnapshot> {
        self.users.get(&user_id).map(|record| PresenceSnapshot {
            user_id,
            online: record.connections > 0,
            connections: record.connections,
            last_seen: record.last_seen,
        })
    }

    pub fn tracked_user_count(&self) -> usize {
        self.users.len()
    }

    pub fn online_user_count(&self) -> usize {
        self.users.iter().filter(|record| record.connections > 0).count()
    }

    /// Writes the user's current online flag through the gateway.
    ///
    /// Writes for one user are serialized and always read the state after
    /// acquiring the lock, so a connect racing a disconnect cannot leave a
    /// stale flag behind. Once `online=false` is stored the record is
    /// dropped, unless another write for the user is still queued on its
    /// lock. Returns the value that was persisted.
    pub async fn sync_persisted(
        &self,
        user_id: UserId,
        gateway: &PersistenceGateway,
    ) -> anyhow::Result<bool> {
        let lock = self
            .users
            .entry(user_id)
            .or_insert_with(PresenceRecord::new)
            .persist_lock
            .clone();
        let _guard = lock.lock().await;

        let online = self.is_online(user_id);
        gateway.set_user_online(user_id, online).await?;
        debug!(user_id, online, "persisted user presence");

        if !online {
            // The map and this call hold the only handles on an idle lock.
            self.users.remove_if(&user_id, |_, record| {
                record.connections == 0
                    && Arc::ptr_eq(&record.persist_lock, &lock)
                    && Arc::strong_count(&lock) == 2
            });
        }
        Ok(online)
    }
}
