use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use parley_common::protocol::ws::{
    decode_client_event, encode_server_event, ClientEvent, ServerEvent,
};

use crate::error::ErrorCode;

/// Largest inbound frame the relay accepts before closing with 1009.
pub const MAX_FRAME_BYTES: u32 = 262_144;

pub fn decode_frame(raw: &str) -> Result<ClientEvent, serde_json::Error> {
    decode_client_event(raw)
}

/// Error event sent back when a text frame does not decode to a client event.
pub fn invalid_event_error(reason: impl std::fmt::Display) -> ServerEvent {
    ServerEvent::Error {
        code: ErrorCode::InvalidEvent.as_str().to_string(),
        message: format!("invalid event payload: {reason}"),
        retryable: false,
        group_id: None,
    }
}

pub async fn send_event(socket: &mut WebSocket, event: &ServerEvent) -> Result<(), ()> {
    let encoded = encode_server_event(event).map_err(|_| ())?;
    socket.send(Message::Text(encoded.into())).await.map_err(|_| ())
}

pub fn frame_size_exceeded_reason() -> String {
    format!("websocket frame exceeds maximum size of {MAX_FRAME_BYTES} bytes")
}

pub fn is_frame_size_violation(error: &axum::Error) -> bool {
    let message = error.to_string().to_ascii_lowercase();
    message.contains("message too long")
        || message.contains("frame too long")
        || message.contains("too large")
        || message.contains("too big")
        || message.contains("size limit")
}

pub async fn close_frame_too_large(socket: &mut WebSocket) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: close_code::SIZE,
            reason: frame_size_exceeded_reason().into(),
        })))
        .await;
}
