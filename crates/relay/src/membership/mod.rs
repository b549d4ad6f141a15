// Room membership resolution against persisted group membership.

use std::collections::BTreeSet;

use parley_common::types::{ConnectionId, GroupId, UserId};
use tracing::{debug, info};

use crate::{error::RealtimeError, gateway::PersistenceGateway, ws::session::SessionRegistry};

#[derive(Clone)]
pub struct RoomMembershipResolver {
    gateway: PersistenceGateway,
}

impl RoomMembershipResolver {
    pub fn new(gateway: PersistenceGateway) -> Self {
        Self { gateway }
    }

    pub async fn persisted_groups(
        &self,
        user_id: UserId,
    ) -> Result<BTreeSet<GroupId>, RealtimeError> {
        Ok(self.gateway.list_group_ids(user_id).await?)
    }

    /// Joins a new connection to the groups returned by `persisted_groups`.
    pub fn seed_rooms(
        &self,
        registry: &SessionRegistry,
        connection_id: ConnectionId,
        group_ids: &BTreeSet<GroupId>,
    ) -> Result<(), RealtimeError> {
        for group_id in group_ids {
            registry.add_room(connection_id, *group_id)?;
        }
        debug!(%connection_id, rooms = group_ids.len(), "seeded rooms");
        Ok(())
    }

    /// Fails with `NotAMember` unless the store confirms current membership.
    pub async fn authorize(&self, user_id: UserId, group_id: GroupId) -> Result<(), RealtimeError> {
        if self.gateway.is_member(user_id, group_id).await? {
            Ok(())
        } else {
            info!(user_id, group_id, "rejected access to group without membership");
            Err(RealtimeError::NotAMember { group_id })
        }
    }
}
