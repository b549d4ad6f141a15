// Message persistence gateway.
//
// The chat service's durable store owns messages, groups and membership.
// The realtime core only needs the narrow slice below; every call may be
// slow and may fail, and callers treat failures as transient.

use std::{
    collections::{BTreeSet, HashMap, HashSet},
    net::IpAddr,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use parley_common::types::{ConnectionId, GroupId, MessageId, MessageStatus, UserId};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::db::{
    migrations::run_migrations,
    pool::{check_pool_health, create_pg_pool, PoolConfig},
};

/// Bookkeeping row for one live socket, mirrored into `user_sessions`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    pub connection_id: ConnectionId,
    pub user_id: UserId,
    pub user_agent: Option<String>,
    pub ip_address: Option<IpAddr>,
    pub connected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistedPresence {
    pub online: bool,
    pub last_seen: DateTime<Utc>,
}

#[derive(Clone)]
pub enum PersistenceGateway {
    Postgres(sqlx::PgPool),
    Memory(Arc<MemoryGateway>),
}

impl PersistenceGateway {
    /// Connects to PostgreSQL when a URL is configured, otherwise falls back
    /// to the in-process store.
    pub async fn connect(database_url: Option<&str>) -> anyhow::Result<Self> {
        let Some(database_url) = database_url else {
            warn!("no database configured; using in-memory persistence gateway");
            return Ok(Self::memory());
        };

        let pool = create_pg_pool(database_url, PoolConfig::from_env())
            .await
            .context("failed to initialize relay PostgreSQL pool")?;
        check_pool_health(&pool).await?;
        run_migrations(&pool).await?;
        info!("persistence gateway connected to PostgreSQL");

        Ok(Self::Postgres(pool))
    }

    pub fn memory() -> Self {
        Self::Memory(Arc::new(MemoryGateway::default()))
    }

    pub fn backend_name(&self) -> &'static str {
        match self {
            Self::Postgres(_) => "postgres",
            Self::Memory(_) => "memory",
        }
    }

    pub async fn is_member(&self, user_id: UserId, group_id: GroupId) -> anyhow::Result<bool> {
        match self {
            Self::Postgres(pool) => sqlx::query_scalar::<_, bool>(
                "SELECT EXISTS (SELECT 1 FROM group_members WHERE group_id = $1 AND user_id = $2)",
            )
            .bind(group_id)
            .bind(user_id)
            .fetch_one(pool)
            .await
            .context("failed to query group membership"),
            Self::Memory(store) => {
                store.check_available().await?;
                Ok(store.state.read().await.memberships.contains(&(user_id, group_id)))
            }
        }
    }

    pub async fn list_group_ids(&self, user_id: UserId) -> anyhow::Result<BTreeSet<GroupId>> {
        match self {
            Self::Postgres(pool) => {
                let rows = sqlx::query_scalar::<_, GroupId>(
                    "SELECT group_id FROM group_members WHERE user_id = $1",
                )
                .bind(user_id)
                .fetch_all(pool)
                .await
                .context("failed to list groups for user")?;
                Ok(rows.into_iter().collect())
            }
            Self::Memory(store) => {
                store.check_available().await?;
                Ok(store
                    .state
                    .read()
                    .await
                    .memberships
                    .iter()
                    .filter(|(member, _)| *member == user_id)
                    .map(|(_, group_id)| *group_id)
                    .collect())
            }
        }
    }

    /// Latest write wins; a (message, user) pair never has more than one row.
    pub async fn upsert_message_status(
        &self,
        message_id: MessageId,
        user_id: UserId,
        status: MessageStatus,
    ) -> anyhow::Result<()> {
        match self {
            Self::Postgres(pool) => {
                sqlx::query(
                    r#"
                    INSERT INTO message_status (message_id, user_id, status, updated_at)
                    VALUES ($1, $2, $3, now())
                    ON CONFLICT (message_id, user_id)
                    DO UPDATE SET status = EXCLUDED.status, updated_at = EXCLUDED.updated_at
                    "#,
                )
                .bind(message_id)
                .bind(user_id)
                .bind(status.as_str())
                .execute(pool)
                .await
                .context("failed to upsert message status")?;
                Ok(())
            }
            Self::Memory(store) => {
                store.check_available().await?;
                store.state.write().await.statuses.insert((message_id, user_id), status);
                Ok(())
            }
        }
    }

    /// Persists the presence flag and stamps `last_seen`.
    pub async fn set_user_online(&self, user_id: UserId, online: bool) -> anyhow::Result<()> {
        match self {
            Self::Postgres(pool) => {
                sqlx::query("UPDATE users SET is_online = $2, last_seen = now() WHERE id = $1")
                    .bind(user_id)
                    .bind(online)
                    .execute(pool)
                    .await
                    .context("failed to update user presence")?;
                Ok(())
            }
            Self::Memory(store) => {
                store.check_available().await?;
                store
                    .state
                    .write()
                    .await
                    .presence
                    .insert(user_id, PersistedPresence { online, last_seen: Utc::now() });
                Ok(())
            }
        }
    }

    pub async fn record_session(&self, record: &SessionRecord) -> anyhow::Result<()> {
        match self {
            Self::Postgres(pool) => {
                sqlx::query(
                    r#"
                    INSERT INTO user_sessions (connection_id, user_id, user_agent, ip_address, connected_at)
                    VALUES ($1, $2, $3, $4, $5)
                    ON CONFLICT (connection_id) DO NOTHING
                    "#,
                )
                .bind(record.connection_id)
                .bind(record.user_id)
                .bind(record.user_agent.as_deref())
                .bind(record.ip_address.map(|ip| ip.to_string()))
                .bind(record.connected_at)
                .execute(pool)
                .await
                .context("failed to record user session")?;
                Ok(())
            }
            Self::Memory(store) => {
                store.check_available().await?;
                store.state.write().await.sessions.insert(record.connection_id, record.clone());
                Ok(())
            }
        }
    }

    pub async fn remove_session(&self, connection_id: ConnectionId) -> anyhow::Result<()> {
        match self {
            Self::Postgres(pool) => {
                sqlx::query("DELETE FROM user_sessions WHERE connection_id = $1")
                    .bind(connection_id)
                    .execute(pool)
                    .await
                    .context("failed to remove user session")?;
                Ok(())
            }
            Self::Memory(store) => {
                store.check_available().await?;
                store.state.write().await.sessions.remove(&connection_id);
                Ok(())
            }
        }
    }
}

#[derive(Default)]
struct MemoryState {
    memberships: HashSet<(UserId, GroupId)>,
    statuses: HashMap<(MessageId, UserId), MessageStatus>,
    presence: HashMap<UserId, PersistedPresence>,
    sessions: HashMap<ConnectionId, SessionRecord>,
}

/// In-process backend for development without a database and for tests.
/// Supports injected latency and outages so callers can be exercised
/// against a slow or failing store.
#[derive(Default)]
pub struct MemoryGateway {
    state: RwLock<MemoryState>,
    unavailable: AtomicBool,
    latency_ms: AtomicU64,
}

impl MemoryGateway {
    async fn check_available(&self) -> anyhow::Result<()> {
        let latency_ms = self.latency_ms.load(Ordering::Relaxed);
        if latency_ms > 0 {
            tokio::time::sleep(Duration::from_millis(latency_ms)).await;
        }
        if self.unavailable.load(Ordering::Relaxed) {
            bail!("in-memory persistence gateway is unavailable");
        }
        Ok(())
    }

    pub async fn grant_membership(&self, user_id: UserId, group_id: GroupId) {
        self.state.write().await.memberships.insert((user_id, group_id));
    }

    pub async fn revoke_membership(&self, user_id: UserId, group_id: GroupId) {
        self.state.write().await.memberships.remove(&(user_id, group_id));
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Relaxed);
    }

    pub fn set_latency(&self, latency: Duration) {
        let millis = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.latency_ms.store(millis, Ordering::Relaxed);
    }

    pub async fn message_status(
        &self,
        message_id: MessageId,
        user_id: UserId,
    ) -> Option<MessageStatus> {
        self.state.read().await.statuses.get(&(message_id, user_id)).copied()
    }

    pub async fn status_row_count(&self) -> usize {
        self.state.read().await.statuses.len()
    }

    pub async fn persisted_presence(&self, user_id: UserId) -> Option<PersistedPresence> {
        self.state.read().await.presence.get(&user_id).copied()
    }

    pub async fn sessions_for_user(&self, user_id: UserId) -> Vec<SessionRecord> {
        self.state
            .read()
            .await
            .sessions
            .values()
            .filter(|record| record.user_id == user_id)
            .cloned()
            .collect()
    }
}
