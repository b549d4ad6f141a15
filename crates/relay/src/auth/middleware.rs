use crate::{
    auth::jwt::{JwtAccessTokenService, UserIdentity},
    error::RealtimeError,
};
use axum::http::header::{HeaderMap, AUTHORIZATION};
use parley_common::types::UserId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser {
    pub user_id: UserId,
    pub username: String,
}

impl From<UserIdentity> for AuthenticatedUser {
    fn from(identity: UserIdentity) -> Self {
        Self { user_id: identity.user_id, username: identity.username }
    }
}

/// Authenticates a WebSocket upgrade. Browsers cannot attach headers to the
/// upgrade request, so a `token` query parameter is accepted as a fallback.
pub fn authenticate_upgrade(
    jwt_service: &JwtAccessTokenService,
    headers: &HeaderMap,
    query_token: Option<&str>,
) -> Result<AuthenticatedUser, RealtimeError> {
    let token = bearer_from_headers(headers)
        .or_else(|| query_token.map(str::trim).filter(|token| !token.is_empty()))
        .ok_or(RealtimeError::Authentication { reason: "missing bearer token" })?;

    jwt_service
        .validate_user_token(token)
        .map(AuthenticatedUser::from)
        .map_err(|_| RealtimeError::Authentication { reason: "invalid bearer token" })
}

fn bearer_from_headers(headers: &HeaderMap) -> Option<&str> {
    headers.get(AUTHORIZATION).and_then(|value| value.to_str().ok()).and_then(extract_bearer_token)
}

fn extract_bearer_token(value: &str) -> Option<&str> {
    let (scheme, token) = value.split_once(' ')?;

    if !scheme.eq_ignore_ascii_case("Bearer") {
        return None;
    }

    let token = token.trim();
    if token.is_empty() {
        return None;
    }

    Some(token)
}
