use std::future::Future;

use axum::{
    http::{header::HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use parley_common::{
    protocol::ws::ServerEvent,
    types::{ConnectionId, GroupId},
};
use serde_json::json;
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

tokio::task_local! {
    static REQUEST_ID: String;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    ValidationFailed,
    AuthInvalidToken,
    AuthForbidden,
    NotFound,
    NotAMember,
    InvalidEvent,
    PayloadTooLarge,
    InternalError,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ValidationFailed => "VALIDATION_FAILED",
            Self::AuthInvalidToken => "AUTH_INVALID_TOKEN",
            Self::AuthForbidden => "AUTH_FORBIDDEN",
            Self::NotFound => "NOT_FOUND",
            Self::NotAMember => "NOT_A_MEMBER",
            Self::InvalidEvent => "INVALID_EVENT",
            Self::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }

    pub const fn status(self) -> StatusCode {
        match self {
            Self::ValidationFailed | Self::InvalidEvent => StatusCode::BAD_REQUEST,
            Self::AuthInvalidToken => StatusCode::UNAUTHORIZED,
            Self::AuthForbidden | Self::NotAMember => StatusCode::FORBIDDEN,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub const fn retryable(self) -> bool {
        matches!(self, Self::InternalError)
    }

    pub const fn default_message(self) -> &'static str {
        match self {
            Self::ValidationFailed => "request validation failed",
            Self::AuthInvalidToken => "invalid authentication token",
            Self::AuthForbidden => "caller lacks required permission",
            Self::NotFound => "requested resource not found",
            Self::NotAMember => "Not a member of this group",
            Self::InvalidEvent => "event could not be decoded",
            Self::PayloadTooLarge => "payload exceeds maximum allowed size",
            Self::InternalError => "internal server error",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RelayError {
    code: ErrorCode,
    message: String,
    request_id: Option<String>,
}

impl RelayError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), request_id: None }
    }

    pub fn from_code(code: ErrorCode) -> Self {
        Self::new(code, code.default_message())
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let request_id = self.request_id.or_else(current_request_id);

        let mut response = (
            self.code.status(),
            Json(json!({
                "error": {
                    "code": self.code.as_str(),
                    "message": self.message,
                    "retryable": self.code.retryable(),
                    "request_id": request_id.clone(),
                    "details": {},
                }
            })),
        )
            .into_response();

        if let Some(request_id) = request_id {
            attach_request_id_header(&mut response, &request_id);
        }

        response
    }
}

/// Failures raised by the realtime core while handling a connection or one
/// of its events.
#[derive(Debug, thiserror::Error)]
pub enum RealtimeError {
    #[error("authentication failed: {reason}")]
    Authentication { reason: &'static str },
    #[error("user is not a member of group {group_id}")]
    NotAMember { group_id: GroupId },
    #[error("connection {connection_id} is already registered")]
    DuplicateRegistration { connection_id: ConnectionId },
    #[error("connection {connection_id} is not registered")]
    UnknownConnection { connection_id: ConnectionId },
    #[error("persistence gateway failure: {0:#}")]
    Gateway(#[from] anyhow::Error),
}

impl RealtimeError {
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Authentication { .. } => ErrorCode::AuthInvalidToken,
            Self::NotAMember { .. } => ErrorCode::NotAMember,
            Self::DuplicateRegistration { .. }
            | Self::UnknownConnection { .. }
            | Self::Gateway(_) => ErrorCode::InternalError,
        }
    }

    /// Client-facing `error` event for this failure. Internal details stay in
    /// the logs; the client only sees the registry message.
    pub fn to_event(&self, group_id: Option<GroupId>) -> ServerEvent {
        let code = self.code();
        ServerEvent::Error {
            code: code.as_str().to_owned(),
            message: code.default_message().to_owned(),
            retryable: code.retryable(),
            group_id,
        }
    }
}

impl From<RealtimeError> for RelayError {
    fn from(error: RealtimeError) -> Self {
        let code = error.code();
        match error {
            RealtimeError::Authentication { reason } => Self::new(code, reason),
            _ => Self::from_code(code),
        }
    }
}

pub async fn with_request_id_scope<F>(request_id: String, future: F) -> F::Output
where
    F: Future,
{
    REQUEST_ID.scope(request_id, future).await
}

pub fn current_request_id() -> Option<String> {
    REQUEST_ID.try_with(Clone::clone).ok()
}

pub fn request_id_from_headers_or_generate(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.trim().is_empty())
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

pub fn attach_request_id_header(response: &mut Response, request_id: &str) {
    if let Ok(header) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, header);
    }
}
