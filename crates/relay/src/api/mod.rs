// Internal broadcast intake for the out-of-process message service.
//
// The HTTP message path persists a message first and then posts it here so
// the engine can fan it out to the group's room.

use std::sync::Arc;

use axum::{
    extract::{
        rejection::JsonRejection,
        Json, Path, Request, State,
    },
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::post,
    Router,
};
use parley_common::{
    protocol::ws::MessageRecord,
    types::{GroupId, MessageId, MessageStatus, UserId},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    engine::BroadcastEngine,
    error::{ErrorCode, RelayError},
};

pub const INTERNAL_TOKEN_HEADER: &str = "x-parley-internal-token";

#[derive(Clone)]
struct IntakeState {
    engine: Arc<BroadcastEngine>,
    internal_token: Arc<str>,
}

/// A persisted change announced by the message service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayBroadcast {
    NewMessage { message: MessageRecord },
    MessageUpdated { message: MessageRecord },
    MessageDeleted { message_id: MessageId, deleted_by: UserId },
    MessageStatusUpdate { message_id: MessageId, user_id: UserId, status: MessageStatus },
}

impl GatewayBroadcast {
    const fn kind(&self) -> &'static str {
        match self {
            Self::NewMessage { .. } => "new_message",
            Self::MessageUpdated { .. } => "message_updated",
            Self::MessageDeleted { .. } => "message_deleted",
            Self::MessageStatusUpdate { .. } => "message_status_update",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct BroadcastAccepted {
    pub delivered: usize,
}

pub fn router(engine: Arc<BroadcastEngine>, internal_token: &str) -> Router {
    let state = IntakeState { engine, internal_token: Arc::from(internal_token) };
    let token_layer = middleware::from_fn_with_state(state.clone(), require_internal_token);

    Router::new()
        .route(
            "/internal/v1/groups/{group_id}/broadcasts",
            post(accept_broadcast).route_layer(token_layer),
        )
        .with_state(state)
}

async fn require_internal_token(
    State(state): State<IntakeState>,
    request: Request,
    next: Next,
) -> Response {
    let presented =
        request.headers().get(INTERNAL_TOKEN_HEADER).and_then(|value| value.to_str().ok());

    match presented {
        Some(token) if token_matches(token, &state.internal_token) => next.run(request).await,
        Some(_) => {
            info!("rejected internal broadcast with wrong token");
            RelayError::new(ErrorCode::AuthInvalidToken, "invalid internal token").into_response()
        }
        None => {
            RelayError::new(ErrorCode::AuthInvalidToken, "missing internal token").into_response()
        }
    }
}

fn token_matches(presented: &str, expected: &str) -> bool {
    presented.len() == expected.len()
        && presented.bytes().zip(expected.bytes()).fold(0u8, |acc, (a, b)| acc | (a ^ b)) == 0
}

async fn accept_broadcast(
    State(state): State<IntakeState>,
    Path(group_id): Path<GroupId>,
    payload: Result<Json<GatewayBroadcast>, JsonRejection>,
) -> Response {
    let Json(broadcast) = match payload {
        Ok(payload) => payload,
        Err(rejection) => {
            return RelayError::new(ErrorCode::ValidationFailed, rejection.body_text())
                .into_response();
        }
    };

    let kind = broadcast.kind();
    let delivered = match broadcast {
        GatewayBroadcast::NewMessage { message } => {
            state.engine.broadcast_new_message(group_id, message)
        }
        GatewayBroadcast::MessageUpdated { message } => {
            state.engine.broadcast_message_updated(group_id, message)
        }
        GatewayBroadcast::MessageDeleted { message_id, deleted_by } => {
            state.engine.broadcast_message_deleted(group_id, message_id, deleted_by)
        }
        GatewayBroadcast::MessageStatusUpdate { message_id, user_id, status } => {
            state.engine.broadcast_status_update(group_id, message_id, user_id, status)
        }
    };
    debug!(group_id, kind, delivered, "accepted internal broadcast");

    (StatusCode::ACCEPTED, Json(BroadcastAccepted { delivered })).into_response()
}
