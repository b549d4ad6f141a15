// Broadcast engine: inbound event dispatch and room fan-out.
//
// The engine is transport agnostic. A connection is an outbound queue plus a
// cancellation token; the websocket layer owns the socket and feeds decoded
// events in arrival order.

use std::{collections::BTreeSet, future::Future, sync::Arc, time::Instant};

use anyhow::anyhow;
use parley_common::{
    protocol::ws::{ClientEvent, MessageRecord, ServerEvent},
    types::{ConnectionId, GroupId, MessageId, MessageStatus, UserId},
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    auth::middleware::AuthenticatedUser,
    error::RealtimeError,
    gateway::{PersistenceGateway, SessionRecord},
    membership::RoomMembershipResolver,
    metrics,
    presence::{PresenceTracker, PresenceTransition},
    ws::{
        protocol::invalid_event_error,
        session::{ConnectionMeta, Departure, Exclude, OutboundSender, SessionRegistry},
    },
};

/// Per-connection handle passed to every engine call.
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    pub connection_id: ConnectionId,
    pub user_id: UserId,
    pub username: String,
    cancel: CancellationToken,
}

impl ConnectionContext {
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

pub struct BroadcastEngine {
    registry: Arc<SessionRegistry>,
    resolver: RoomMembershipResolver,
    gateway: PersistenceGateway,
    heartbeat_interval_ms: u64,
}

impl BroadcastEngine {
    pub fn new(gateway: PersistenceGateway, heartbeat_interval_ms: u64) -> Self {
        let presence = Arc::new(PresenceTracker::default());
        Self {
            registry: Arc::new(SessionRegistry::new(presence)),
            resolver: RoomMembershipResolver::new(gateway.clone()),
            gateway,
            heartbeat_interval_ms,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn presence(&self) -> &Arc<PresenceTracker> {
        self.registry.presence()
    }

    pub fn gateway(&self) -> &PersistenceGateway {
        &self.gateway
    }

    /// Registers an authenticated connection, acknowledges it, joins it to
    /// its persisted groups, and announces the user if this is their first
    /// live connection.
    ///
    /// `connected` is queued before any room is joined so it is always the
    /// first event the connection sees.
    pub async fn connect(
        &self,
        user: AuthenticatedUser,
        meta: ConnectionMeta,
        outbound: mpsc::Sender<ServerEvent>,
    ) -> Result<ConnectionContext, RealtimeError> {
        let connection_id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let transition = self.registry.register(
            connection_id,
            user.user_id,
            &user.username,
            meta.clone(),
            OutboundSender::new(outbound, cancel.clone()),
        )?;
        metrics::record_connection_opened();
        let ctx = ConnectionContext {
            connection_id,
            user_id: user.user_id,
            username: user.username,
            cancel,
        };

        let mut rooms = match self.resolver.persisted_groups(ctx.user_id).await {
            Ok(rooms) => rooms,
            Err(error) => {
                error!(%connection_id, user_id = ctx.user_id, %error, "failed to look up groups");
                BTreeSet::new()
            }
        };

        self.registry.send_to(
            connection_id,
            ServerEvent::Connected {
                connection_id,
                user_id: ctx.user_id,
                username: ctx.username.clone(),
                group_ids: rooms.iter().copied().collect(),
                heartbeat_interval_ms: self.heartbeat_interval_ms,
            },
        );

        if let Err(error) = self.resolver.seed_rooms(&self.registry, connection_id, &rooms) {
            error!(%connection_id, user_id = ctx.user_id, %error, "failed to seed rooms");
            rooms = self.registry.rooms_of(connection_id).unwrap_or_default();
        }

        let record = SessionRecord {
            connection_id,
            user_id: ctx.user_id,
            user_agent: meta.user_agent,
            ip_address: meta.remote_addr.map(|addr| addr.ip()),
            connected_at: chrono::Utc::now(),
        };
        if let Err(error) = self.gateway.record_session(&record).await {
            warn!(%connection_id, user_id = ctx.user_id, error = %format!("{error:#}"), "failed to record session");
        }

        if transition == PresenceTransition::WentOnline {
            self.persist_presence(ctx.user_id).await;
            let delivered = self.registry.broadcast_to_rooms_once(
                &rooms,
                &ServerEvent::UserOnline { user_id: ctx.user_id, username: ctx.username.clone() },
                ctx.user_id,
            );
            debug!(user_id = ctx.user_id, delivered, "announced user online");
        }
        metrics::set_online_users(self.presence().online_user_count());

        info!(%connection_id, user_id = ctx.user_id, rooms = rooms.len(), "connection registered");
        Ok(ctx)
    }

    /// Answers a frame that did not decode, in order with the connection's
    /// other replies.
    pub fn reject_frame(&self, ctx: &ConnectionContext, reason: &str) {
        if ctx.is_closed() {
            return;
        }
        metrics::record_ws_event("invalid", true, 0);
        self.registry.send_to(ctx.connection_id, invalid_event_error(reason));
    }

    /// Handles one inbound event. Failures are converted into at most one
    /// `error` event to the originating connection; best-effort events fail
    /// silently.
    pub async fn dispatch(&self, ctx: &ConnectionContext, event: ClientEvent) {
        if ctx.is_closed() {
            return;
        }

        let started_at = Instant::now();
        let kind = event.kind();
        let group_id = event.group_id();
        let reports_errors = !matches!(
            event,
            ClientEvent::TypingStart { .. }
                | ClientEvent::TypingStop { .. }
                | ClientEvent::MessageDelivered { .. }
        );

        let result = self.handle(ctx, event).await;
        let is_error = result.is_err();
        if let Err(error) = result {
            match &error {
                RealtimeError::NotAMember { .. } => {}
                RealtimeError::Gateway(_) if reports_errors => {
                    error!(connection_id = %ctx.connection_id, user_id = ctx.user_id, event = kind, ?group_id, %error, "gateway failure while handling event");
                }
                _ => {
                    debug!(connection_id = %ctx.connection_id, user_id = ctx.user_id, event = kind, ?group_id, %error, "event dropped");
                }
            }
            if reports_errors {
                self.registry.send_to(ctx.connection_id, error.to_event(group_id));
            }
        }

        metrics::record_ws_event(kind, is_error, started_at.elapsed().as_millis() as u64);
    }

    async fn handle(&self, ctx: &ConnectionContext, event: ClientEvent) -> Result<(), RealtimeError> {
        match event {
            ClientEvent::JoinGroup { group_id } => self.join_group(ctx, group_id).await,
            ClientEvent::LeaveGroup { group_id } => self.leave_group(ctx, group_id),
            ClientEvent::TypingStart { group_id } => {
                self.relay_typing(ctx, group_id, true);
                Ok(())
            }
            ClientEvent::TypingStop { group_id } => {
                self.relay_typing(ctx, group_id, false);
                Ok(())
            }
            ClientEvent::MessageRead { message_id, group_id } => {
                self.record_status(ctx, message_id, group_id, MessageStatus::Read).await
            }
            ClientEvent::MessageDelivered { message_id, group_id } => {
                self.record_status(ctx, message_id, group_id, MessageStatus::Delivered).await
            }
            ClientEvent::Ping => {
                self.registry.send_to(ctx.connection_id, ServerEvent::Pong);
                Ok(())
            }
        }
    }

    async fn join_group(&self, ctx: &ConnectionContext, group_id: GroupId) -> Result<(), RealtimeError> {
        let user_id = ctx.user_id;
        let Some(authorized) = self.authorize(ctx, group_id).await else {
            return Ok(());
        };
        authorized?;

        let newly_joined = self.registry.add_room(ctx.connection_id, group_id)?;
        let delivered = self.registry.broadcast_to_room(
            group_id,
            &ServerEvent::UserJoinedGroup { user_id, username: ctx.username.clone(), group_id },
            Exclude::Connection(ctx.connection_id),
        );
        info!(connection_id = %ctx.connection_id, user_id, group_id, newly_joined, delivered, "joined group");
        Ok(())
    }

    fn leave_group(&self, ctx: &ConnectionContext, group_id: GroupId) -> Result<(), RealtimeError> {
        let was_joined = self.registry.remove_room(ctx.connection_id, group_id)?;
        let delivered = self.registry.broadcast_to_room(
            group_id,
            &ServerEvent::UserLeftGroup {
                user_id: ctx.user_id,
                username: ctx.username.clone(),
                group_id,
            },
            Exclude::Connection(ctx.connection_id),
        );
        info!(connection_id = %ctx.connection_id, user_id = ctx.user_id, group_id, was_joined, delivered, "left group");
        Ok(())
    }

    fn relay_typing(&self, ctx: &ConnectionContext, group_id: GroupId, started: bool) {
        if !self.registry.is_in_room(ctx.connection_id, group_id) {
            debug!(connection_id = %ctx.connection_id, group_id, "typing event for unjoined room dropped");
            return;
        }

        let (user_id, username) = (ctx.user_id, ctx.username.clone());
        let event = if started {
            ServerEvent::UserTyping { user_id, username, group_id }
        } else {
            ServerEvent::UserStopTyping { user_id, username, group_id }
        };
        self.registry.broadcast_to_room(group_id, &event, Exclude::Connection(ctx.connection_id));
    }

    async fn record_status(
        &self,
        ctx: &ConnectionContext,
        message_id: MessageId,
        group_id: GroupId,
        status: MessageStatus,
    ) -> Result<(), RealtimeError> {
        let user_id = ctx.user_id;
        let Some(authorized) = self.authorize(ctx, group_id).await else {
            return Ok(());
        };
        authorized?;

        let gateway = self.gateway.clone();
        let Some(written) = self
            .gateway_task(ctx, async move {
                Ok(gateway.upsert_message_status(message_id, user_id, status).await?)
            })
            .await
        else {
            return Ok(());
        };
        written?;

        let delivered = self.registry.broadcast_to_room(
            group_id,
            &ServerEvent::MessageStatusUpdate { message_id, user_id, status },
            Exclude::Connection(ctx.connection_id),
        );
        debug!(connection_id = %ctx.connection_id, user_id, group_id, message_id, %status, delivered, "message status recorded");
        Ok(())
    }

    /// Persisted membership check, not just "currently joined".
    async fn authorize(
        &self,
        ctx: &ConnectionContext,
        group_id: GroupId,
    ) -> Option<Result<(), RealtimeError>> {
        let resolver = self.resolver.clone();
        let user_id = ctx.user_id;
        self.gateway_task(ctx, async move { resolver.authorize(user_id, group_id).await }).await
    }

    /// Runs a gateway call on its own task so it completes even if the
    /// connection goes away. Returns `None` when the connection was torn
    /// down before the call finished.
    async fn gateway_task<T, F>(
        &self,
        ctx: &ConnectionContext,
        call: F,
    ) -> Option<Result<T, RealtimeError>>
    where
        F: Future<Output = Result<T, RealtimeError>> + Send + 'static,
        T: Send + 'static,
    {
        let handle = tokio::spawn(call);
        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => {
                debug!(connection_id = %ctx.connection_id, "connection closed while waiting on gateway");
                None
            }
            joined = handle => Some(match joined {
                Ok(result) => result,
                Err(join_error) => Err(RealtimeError::Gateway(anyhow!("gateway task failed: {join_error}"))),
            }),
        }
    }

    async fn persist_presence(&self, user_id: UserId) {
        let presence = Arc::clone(self.presence());
        let gateway = self.gateway.clone();
        let write =
            tokio::spawn(async move { presence.sync_persisted(user_id, &gateway).await });
        match write.await {
            Ok(Ok(_)) => {}
            Ok(Err(error)) => {
                error!(user_id, error = %format!("{error:#}"), "failed to persist presence");
            }
            Err(join_error) => error!(user_id, %join_error, "presence write task failed"),
        }
    }

    /// Tears a connection down. Safe to call from every exit path; only the
    /// first call for a connection has any effect.
    pub async fn disconnect(&self, ctx: &ConnectionContext) -> Option<Departure> {
        ctx.cancel.cancel();
        let departure = self.registry.unregister(ctx.connection_id)?;
        metrics::record_connection_closed();

        let gateway = self.gateway.clone();
        let connection_id = ctx.connection_id;
        tokio::spawn(async move {
            if let Err(error) = gateway.remove_session(connection_id).await {
                warn!(%connection_id, error = %format!("{error:#}"), "failed to remove session");
            }
        });

        if departure.presence == PresenceTransition::WentOffline {
            self.persist_presence(ctx.user_id).await;
            for group_id in &departure.rooms {
                self.registry.broadcast_to_room(
                    *group_id,
                    &ServerEvent::UserDisconnected {
                        user_id: ctx.user_id,
                        username: ctx.username.clone(),
                        group_id: *group_id,
                    },
                    Exclude::Nobody,
                );
            }
        }
        metrics::set_online_users(self.presence().online_user_count());

        info!(
            connection_id = %ctx.connection_id,
            user_id = ctx.user_id,
            rooms = departure.rooms.len(),
            went_offline = departure.presence == PresenceTransition::WentOffline,
            "connection closed"
        );
        Some(departure)
    }

    /// Fans a freshly persisted message out to every connection in the
    /// group, the author's own connections included.
    pub fn broadcast_new_message(&self, group_id: GroupId, message: MessageRecord) -> usize {
        let delivered = self.registry.broadcast_to_room(
            group_id,
            &ServerEvent::NewMessage { message },
            Exclude::Nobody,
        );
        debug!(group_id, delivered, "broadcast new message");
        delivered
    }

    pub fn broadcast_message_updated(&self, group_id: GroupId, message: MessageRecord) -> usize {
        self.registry.broadcast_to_room(
            group_id,
            &ServerEvent::MessageUpdated { message },
            Exclude::Nobody,
        )
    }

    pub fn broadcast_message_deleted(
        &self,
        group_id: GroupId,
        message_id: MessageId,
        deleted_by: UserId,
    ) -> usize {
        self.registry.broadcast_to_room(
            group_id,
            &ServerEvent::MessageDeleted { message_id, group_id, deleted_by },
            Exclude::Nobody,
        )
    }

    pub fn broadcast_status_update(
        &self,
        group_id: GroupId,
        message_id: MessageId,
        user_id: UserId,
        status: MessageStatus,
    ) -> usize {
        self.registry.broadcast_to_room(
            group_id,
            &ServerEvent::MessageStatusUpdate { message_id, user_id, status },
            Exclude::Nobody,
        )
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use parley_common::{
        protocol::ws::{ClientEvent, MessageRecord, ServerEvent},
        types::MessageStatus,
    };
    use serde_json::json;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    use super::{BroadcastEngine, ConnectionContext};
    use crate::{
        auth::middleware::AuthenticatedUser,
        gateway::{MemoryGateway, PersistenceGateway},
        ws::session::{ConnectionMeta, RoomMember, OUTBOUND_QUEUE_CAPACITY},
    };

    const G1: i64 = 1;
    const G2: i64 = 2;

    struct Client {
        ctx: ConnectionContext,
        rx: mpsc::Receiver<ServerEvent>,
    }

    impl Client {
        fn drain(&mut self) -> Vec<ServerEvent> {
            let mut events = Vec::new();
            while let Ok(event) = self.rx.try_recv() {
                events.push(event);
            }
            events
        }

        fn drain_kinds(&mut self) -> Vec<&'static str> {
            self.drain().iter().map(ServerEvent::kind).collect()
        }
    }

    async fn fixture() -> (Arc<BroadcastEngine>, Arc<MemoryGateway>) {
        let store = Arc::new(MemoryGateway::default());
        store.grant_membership(1, G1).await;
        store.grant_membership(2, G1).await;
        store.grant_membership(3, G2).await;
        let engine =
            Arc::new(BroadcastEngine::new(PersistenceGateway::Memory(Arc::clone(&store)), 15_000));
        (engine, store)
    }

    async fn connect(engine: &BroadcastEngine, user_id: i64) -> Client {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let ctx = engine
            .connect(
                AuthenticatedUser { user_id, username: format!("user{user_id}") },
                ConnectionMeta::default(),
                tx,
            )
            .await
            .expect("connect should succeed");
        Client { ctx, rx }
    }

    fn message(id: i64, group_id: i64) -> MessageRecord {
        let mut record = MessageRecord::new();
        record.insert("id".into(), json!(id));
        record.insert("group_id".into(), json!(group_id));
        record.insert("content".into(), json!("hello"));
        record
    }

    fn error_events(events: &[ServerEvent]) -> Vec<&ServerEvent> {
        events.iter().filter(|event| matches!(event, ServerEvent::Error { .. })).collect()
    }

    #[tokio::test]
    async fn connect_acknowledges_with_seeded_groups() {
        let (engine, store) = fixture().await;
        let mut u1 = connect(&engine, 1).await;

        match u1.drain().first() {
            Some(ServerEvent::Connected { connection_id, user_id, group_ids, .. }) => {
                assert_eq!(*connection_id, u1.ctx.connection_id);
                assert_eq!(*user_id, 1);
                assert_eq!(group_ids, &vec![G1]);
            }
            other => panic!("expected connected event first, got {other:?}"),
        }
        assert_eq!(store.sessions_for_user(1).await.len(), 1);
        assert_eq!(store.persisted_presence(1).await.map(|p| p.online), Some(true));
    }

    #[tokio::test]
    async fn scenario_a_user_online_excludes_self_and_joins_room() {
        let (engine, _store) = fixture().await;
        let mut u2 = connect(&engine, 2).await;
        u2.drain();

        let mut u1 = connect(&engine, 1).await;
        engine.dispatch(&u1.ctx, ClientEvent::JoinGroup { group_id: G1 }).await;

        let own = u1.drain_kinds();
        assert!(!own.contains(&"user_online"), "user must not see their own online event");
        assert!(engine
            .registry()
            .connections_in_room(G1)
            .contains(&RoomMember { connection_id: u1.ctx.connection_id, user_id: 1 }));

        let peer = u2.drain();
        assert_eq!(
            peer.iter().filter(|e| matches!(e, ServerEvent::UserOnline { user_id: 1, .. })).count(),
            1
        );
    }

    #[tokio::test]
    async fn scenario_b_new_message_reaches_every_room_connection_once() {
        let (engine, _store) = fixture().await;
        let mut u1 = connect(&engine, 1).await;
        let mut u2 = connect(&engine, 2).await;
        let mut outsider = connect(&engine, 3).await;
        u1.drain();
        u2.drain();
        outsider.drain();

        let record = message(99, G1);
        assert_eq!(engine.broadcast_new_message(G1, record.clone()), 2);

        let expected = vec![ServerEvent::NewMessage { message: record }];
        assert_eq!(u1.drain(), expected);
        assert_eq!(u2.drain(), expected);
        assert!(outsider.drain().is_empty());
    }

    #[tokio::test]
    async fn scenario_c_non_member_join_yields_single_error() {
        let (engine, _store) = fixture().await;
        let mut u1 = connect(&engine, 1).await;
        let mut u3 = connect(&engine, 3).await;
        u1.drain();
        u3.drain();

        engine.dispatch(&u1.ctx, ClientEvent::JoinGroup { group_id: G2 }).await;

        let events = u1.drain();
        assert_eq!(
            events,
            vec![ServerEvent::Error {
                code: "NOT_A_MEMBER".into(),
                message: "Not a member of this group".into(),
                retryable: false,
                group_id: Some(G2),
            }]
        );
        assert!(u3.drain().is_empty(), "no user_joined_group may reach the room");
        assert!(!engine.registry().is_in_room(u1.ctx.connection_id, G2));
    }

    #[tokio::test]
    async fn scenario_d_offline_only_after_last_device_disconnects() {
        let (engine, store) = fixture().await;
        let phone = connect(&engine, 1).await;
        let laptop = connect(&engine, 1).await;
        let mut u2 = connect(&engine, 2).await;
        u2.drain();

        engine.disconnect(&phone.ctx).await.expect("first teardown should run");
        assert!(engine.presence().is_online(1));
        assert!(u2.drain().is_empty());

        engine.disconnect(&laptop.ctx).await.expect("second teardown should run");
        assert!(!engine.presence().is_online(1));
        assert_eq!(
            u2.drain(),
            vec![ServerEvent::UserDisconnected { user_id: 1, username: "user1".into(), group_id: G1 }]
        );
        assert_eq!(store.persisted_presence(1).await.map(|p| p.online), Some(false));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(store.sessions_for_user(1).await.is_empty());

        assert!(engine.disconnect(&laptop.ctx).await.is_none(), "teardown runs exactly once");
        assert!(u2.drain().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn scenario_d_simultaneous_teardown_announces_once_per_room() {
        let (engine, store) = fixture().await;
        let phone = connect(&engine, 1).await;
        let laptop = connect(&engine, 1).await;
        let mut u2 = connect(&engine, 2).await;
        u2.drain();

        let teardowns = [phone.ctx.clone(), laptop.ctx.clone()].map(|ctx| {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.disconnect(&ctx).await })
        });
        for teardown in teardowns {
            teardown.await.expect("teardown task should join").expect("each teardown should run");
        }

        assert!(!engine.presence().is_online(1));
        assert_eq!(
            u2.drain(),
            vec![ServerEvent::UserDisconnected { user_id: 1, username: "user1".into(), group_id: G1 }]
        );
        assert_eq!(store.persisted_presence(1).await.map(|p| p.online), Some(false));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn interleaved_connects_and_disconnects_keep_presence_consistent() {
        let (engine, store) = fixture().await;

        let churn = (0..24)
            .map(|round| {
                let engine = Arc::clone(&engine);
                tokio::spawn(async move {
                    let client = connect(&engine, 1).await;
                    tokio::task::yield_now().await;
                    if round % 4 == 0 {
                        Some(client)
                    } else {
                        engine.disconnect(&client.ctx).await.expect("teardown should run");
                        None
                    }
                })
            })
            .collect::<Vec<_>>();
        let mut survivors = Vec::new();
        for task in churn {
            if let Some(client) = task.await.expect("churn task should join") {
                survivors.push(client);
            }
        }

        assert_eq!(survivors.len(), 6);
        assert_eq!(engine.presence().connection_count(1), 6);
        assert_eq!(engine.registry().connections_for_user(1).len(), 6);
        assert!(engine.presence().is_online(1));
        assert_eq!(store.persisted_presence(1).await.map(|p| p.online), Some(true));

        let closes = survivors
            .into_iter()
            .map(|client| {
                let engine = Arc::clone(&engine);
                tokio::spawn(async move { engine.disconnect(&client.ctx).await })
            })
            .collect::<Vec<_>>();
        for close in closes {
            close.await.expect("close task should join").expect("teardown should run");
        }

        assert_eq!(engine.presence().connection_count(1), 0);
        assert!(!engine.presence().is_online(1));
        assert_eq!(store.persisted_presence(1).await.map(|p| p.online), Some(false));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn connected_precedes_room_traffic_during_handshake() {
        let (engine, store) = fixture().await;
        store.set_latency(Duration::from_millis(30));

        let stop = CancellationToken::new();
        let broadcaster = {
            let engine = Arc::clone(&engine);
            let stop = stop.clone();
            tokio::spawn(async move {
                while !stop.is_cancelled() {
                    engine.broadcast_message_deleted(G1, 9, 2);
                    tokio::time::sleep(Duration::from_millis(2)).await;
                }
            })
        };

        let mut u1 = connect(&engine, 1).await;
        stop.cancel();
        broadcaster.await.expect("broadcaster should join");

        let events = u1.drain_kinds();
        assert_eq!(events.first(), Some(&"connected"));
        assert!(
            events[1..].contains(&"message_deleted"),
            "room traffic during the handshake should arrive after the acknowledgement"
        );
    }

    #[tokio::test]
    async fn rejected_frames_are_queued_behind_earlier_replies() {
        let (engine, _store) = fixture().await;
        let mut u1 = connect(&engine, 1).await;
        u1.drain();

        engine.dispatch(&u1.ctx, ClientEvent::Ping).await;
        engine.reject_frame(&u1.ctx, "expected value at line 1 column 1");
        let events = u1.drain();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], ServerEvent::Pong);
        assert!(matches!(&events[1], ServerEvent::Error { code, .. } if code == "INVALID_EVENT"));

        engine.disconnect(&u1.ctx).await.expect("teardown should run");
        engine.reject_frame(&u1.ctx, "late frame");
        assert!(u1.drain().is_empty());
    }

    #[tokio::test]
    async fn scenario_e_repeated_read_keeps_one_row_and_broadcasts_each_time() {
        let (engine, store) = fixture().await;
        let mut u1 = connect(&engine, 1).await;
        let mut u2 = connect(&engine, 2).await;
        u1.drain();
        u2.drain();

        for _ in 0..2 {
            engine.dispatch(&u1.ctx, ClientEvent::MessageRead { message_id: 123, group_id: G1 }).await;
        }

        assert_eq!(store.message_status(123, 1).await, Some(MessageStatus::Read));
        assert_eq!(store.status_row_count().await, 1);
        let update =
            ServerEvent::MessageStatusUpdate { message_id: 123, user_id: 1, status: MessageStatus::Read };
        assert_eq!(u2.drain(), vec![update.clone(), update]);
        assert!(u1.drain().is_empty(), "reader is excluded from its own status update");
    }

    #[tokio::test]
    async fn typing_is_ordered_and_dropped_for_unjoined_rooms() {
        let (engine, _store) = fixture().await;
        let mut u1 = connect(&engine, 1).await;
        let mut u2 = connect(&engine, 2).await;
        u1.drain();
        u2.drain();

        engine.dispatch(&u1.ctx, ClientEvent::TypingStart { group_id: G1 }).await;
        engine.dispatch(&u1.ctx, ClientEvent::TypingStop { group_id: G1 }).await;
        engine.dispatch(&u1.ctx, ClientEvent::TypingStart { group_id: G2 }).await;

        assert_eq!(u2.drain_kinds(), vec!["user_typing", "user_stop_typing"]);
        assert!(u1.drain().is_empty(), "typing never errors and never echoes");
    }

    #[tokio::test]
    async fn join_and_leave_are_idempotent() {
        let (engine, _store) = fixture().await;
        let mut u1 = connect(&engine, 1).await;
        let mut u2 = connect(&engine, 2).await;
        u1.drain();
        u2.drain();

        engine.dispatch(&u1.ctx, ClientEvent::JoinGroup { group_id: G1 }).await;
        engine.dispatch(&u1.ctx, ClientEvent::JoinGroup { group_id: G1 }).await;
        assert_eq!(engine.registry().connections_in_room(G1).len(), 2);
        assert_eq!(u2.drain_kinds(), vec!["user_joined_group", "user_joined_group"]);

        engine.dispatch(&u1.ctx, ClientEvent::LeaveGroup { group_id: G1 }).await;
        engine.dispatch(&u1.ctx, ClientEvent::LeaveGroup { group_id: G1 }).await;
        assert_eq!(engine.registry().connections_in_room(G1).len(), 1);
        assert_eq!(u2.drain_kinds(), vec!["user_left_group", "user_left_group"]);
        assert!(error_events(&u1.drain()).is_empty());
    }

    #[tokio::test]
    async fn ping_is_answered_with_pong() {
        let (engine, _store) = fixture().await;
        let mut u1 = connect(&engine, 1).await;
        u1.drain();

        engine.dispatch(&u1.ctx, ClientEvent::Ping).await;
        assert_eq!(u1.drain(), vec![ServerEvent::Pong]);
    }

    #[tokio::test]
    async fn gateway_failures_follow_error_policy() {
        let (engine, store) = fixture().await;
        let mut u1 = connect(&engine, 1).await;
        let mut u2 = connect(&engine, 2).await;
        u1.drain();
        u2.drain();
        store.set_unavailable(true);

        engine.dispatch(&u1.ctx, ClientEvent::MessageRead { message_id: 5, group_id: G1 }).await;
        let events = u1.drain();
        assert_eq!(events.len(), 1);
        match &events[0] {
            ServerEvent::Error { code, retryable, .. } => {
                assert_eq!(code, "INTERNAL_ERROR");
                assert!(*retryable);
            }
            other => panic!("expected error event, got {other:?}"),
        }

        engine
            .dispatch(&u1.ctx, ClientEvent::MessageDelivered { message_id: 5, group_id: G1 })
            .await;
        assert!(u1.drain().is_empty(), "delivery acks fail silently");
        assert!(u2.drain().is_empty());
    }

    #[tokio::test]
    async fn delivered_from_non_member_is_silent() {
        let (engine, store) = fixture().await;
        let mut u3 = connect(&engine, 3).await;
        u3.drain();

        engine
            .dispatch(&u3.ctx, ClientEvent::MessageDelivered { message_id: 5, group_id: G1 })
            .await;
        assert!(u3.drain().is_empty());
        assert_eq!(store.message_status(5, 3).await, None);
    }

    #[tokio::test]
    async fn in_flight_status_write_completes_after_disconnect() {
        let (engine, store) = fixture().await;
        let u1 = connect(&engine, 1).await;
        let mut u2 = connect(&engine, 2).await;
        u2.drain();
        store.set_latency(Duration::from_millis(200));

        let dispatch = {
            let engine = Arc::clone(&engine);
            let ctx = u1.ctx.clone();
            tokio::spawn(async move {
                engine.dispatch(&ctx, ClientEvent::MessageRead { message_id: 77, group_id: G1 }).await
            })
        };

        tokio::time::sleep(Duration::from_millis(300)).await;
        store.set_latency(Duration::ZERO);
        engine.disconnect(&u1.ctx).await.expect("teardown should run");
        dispatch.await.expect("dispatch should finish once cancelled");

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(store.message_status(77, 1).await, Some(MessageStatus::Read));
        assert!(
            !u2.drain().iter().any(|e| matches!(e, ServerEvent::MessageStatusUpdate { .. })),
            "a torn down connection must not fan out further events"
        );
    }

    #[tokio::test]
    async fn events_after_disconnect_are_ignored() {
        let (engine, store) = fixture().await;
        let u1 = connect(&engine, 1).await;
        engine.disconnect(&u1.ctx).await.expect("teardown should run");

        engine.dispatch(&u1.ctx, ClientEvent::MessageRead { message_id: 8, group_id: G1 }).await;
        assert_eq!(store.message_status(8, 1).await, None);
    }

    #[tokio::test]
    async fn gateway_broadcasts_reach_the_whole_room() {
        let (engine, _store) = fixture().await;
        let mut u1 = connect(&engine, 1).await;
        let mut u2 = connect(&engine, 2).await;
        u1.drain();
        u2.drain();

        engine.broadcast_message_updated(G1, message(9, G1));
        engine.broadcast_message_deleted(G1, 9, 1);
        engine.broadcast_status_update(G1, 9, 2, MessageStatus::Delivered);

        let expected = vec!["message_updated", "message_deleted", "message_status_update"];
        assert_eq!(u1.drain_kinds(), expected);
        assert_eq!(u2.drain_kinds(), expected);
    }
}
