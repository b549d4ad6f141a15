// WebSocket transport: upgrade authentication and per-connection tasks.

pub mod handler;
pub mod protocol;
pub mod session;

use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{ws::WebSocketUpgrade, ConnectInfo, Query, State},
    http::{header, Extensions, HeaderMap},
    response::IntoResponse,
    routing::get,
    Router,
};
use serde::Deserialize;
use tracing::info;

use self::{
    handler::{handle_socket, Liveness},
    protocol::MAX_FRAME_BYTES,
    session::ConnectionMeta,
};
use crate::{
    auth::{jwt::JwtAccessTokenService, middleware::authenticate_upgrade},
    cors,
    engine::BroadcastEngine,
    error::{
        current_request_id, request_id_from_headers_or_generate, with_request_id_scope, ErrorCode,
        RelayError,
    },
};

#[derive(Clone)]
pub struct WsRouterState {
    pub engine: Arc<BroadcastEngine>,
    pub jwt_service: Arc<JwtAccessTokenService>,
    pub allowed_origins: Option<Arc<str>>,
    pub liveness: Liveness,
}

#[derive(Debug, Default, Deserialize)]
pub struct UpgradeQuery {
    pub token: Option<String>,
}

pub fn router(state: WsRouterState) -> Router {
    Router::new().route("/v1/ws", get(ws_upgrade)).with_state(state)
}

pub async fn ws_upgrade(
    State(state): State<WsRouterState>,
    Query(query): Query<UpgradeQuery>,
    headers: HeaderMap,
    extensions: Extensions,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    if let Some(origin) = headers.get(header::ORIGIN) {
        let origin = origin.to_str().unwrap_or_default();
        if !cors::origin_allowed(state.allowed_origins.as_deref(), origin) {
            info!(origin, "rejected websocket upgrade from disallowed origin");
            return RelayError::new(ErrorCode::AuthForbidden, "origin not allowed").into_response();
        }
    }

    let user = match authenticate_upgrade(&state.jwt_service, &headers, query.token.as_deref()) {
        Ok(user) => user,
        Err(error) => {
            info!(%error, "rejected websocket upgrade");
            return RelayError::from(error).into_response();
        }
    };

    let meta = ConnectionMeta {
        remote_addr: extensions.get::<ConnectInfo<SocketAddr>>().map(|info| info.0),
        user_agent: headers
            .get(header::USER_AGENT)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned),
    };
    let request_id =
        current_request_id().unwrap_or_else(|| request_id_from_headers_or_generate(&headers));
    let engine = Arc::clone(&state.engine);
    let liveness = state.liveness;

    ws.max_frame_size(MAX_FRAME_BYTES as usize)
        .max_message_size(MAX_FRAME_BYTES as usize)
        .on_upgrade(move |socket| async move {
            with_request_id_scope(request_id, handle_socket(engine, liveness, user, meta, socket))
                .await;
        })
}
