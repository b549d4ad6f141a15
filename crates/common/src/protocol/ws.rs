// WebSocket event types for the parley-realtime.v1 protocol.

use serde::{Deserialize, Serialize};

use crate::types::{ConnectionId, GroupId, MessageId, MessageStatus, UserId};

/// A persisted chat message as produced by the message store. The relay
/// never inspects it; it is forwarded to clients field for field.
pub type MessageRecord = serde_json::Map<String, serde_json::Value>;

/// Client -> Server events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    JoinGroup { group_id: GroupId },
    LeaveGroup { group_id: GroupId },
    TypingStart { group_id: GroupId },
    TypingStop { group_id: GroupId },
    MessageRead { message_id: MessageId, group_id: GroupId },
    MessageDelivered { message_id: MessageId, group_id: GroupId },
    Ping,
}

impl ClientEvent {
    /// Stable label used for logs and metrics.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::JoinGroup { .. } => "join_group",
            Self::LeaveGroup { .. } => "leave_group",
            Self::TypingStart { .. } => "typing_start",
            Self::TypingStop { .. } => "typing_stop",
            Self::MessageRead { .. } => "message_read",
            Self::MessageDelivered { .. } => "message_delivered",
            Self::Ping => "ping",
        }
    }

    pub const fn group_id(&self) -> Option<GroupId> {
        match self {
            Self::JoinGroup { group_id }
            | Self::LeaveGroup { group_id }
            | Self::TypingStart { group_id }
            | Self::TypingStop { group_id }
            | Self::MessageRead { group_id, .. }
            | Self::MessageDelivered { group_id, .. } => Some(*group_id),
            Self::Ping => None,
        }
    }
}

/// Server -> Client events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Handshake acknowledgement, sent once right after the upgrade.
    Connected {
        connection_id: ConnectionId,
        user_id: UserId,
        username: String,
        group_ids: Vec<GroupId>,
        heartbeat_interval_ms: u64,
    },

    NewMessage {
        #[serde(flatten)]
        message: MessageRecord,
    },

    MessageUpdated {
        #[serde(flatten)]
        message: MessageRecord,
    },

    MessageDeleted {
        message_id: MessageId,
        group_id: GroupId,
        deleted_by: UserId,
    },

    MessageStatusUpdate {
        message_id: MessageId,
        user_id: UserId,
        status: MessageStatus,
    },

    UserJoinedGroup {
        user_id: UserId,
        username: String,
        group_id: GroupId,
    },

    UserLeftGroup {
        user_id: UserId,
        username: String,
        group_id: GroupId,
    },

    UserTyping {
        user_id: UserId,
        username: String,
        group_id: GroupId,
    },

    UserStopTyping {
        user_id: UserId,
        username: String,
        group_id: GroupId,
    },

    UserOnline {
        user_id: UserId,
        username: String,
    },

    UserDisconnected {
        user_id: UserId,
        username: String,
        group_id: GroupId,
    },

    Error {
        code: String,
        message: String,
        retryable: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        group_id: Option<GroupId>,
    },

    Pong,
}

impl ServerEvent {
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::NewMessage { .. } => "new_message",
            Self::MessageUpdated { .. } => "message_updated",
            Self::MessageDeleted { .. } => "message_deleted",
            Self::MessageStatusUpdate { .. } => "message_status_update",
            Self::UserJoinedGroup { .. } => "user_joined_group",
            Self::UserLeftGroup { .. } => "user_left_group",
            Self::UserTyping { .. } => "user_typing",
            Self::UserStopTyping { .. } => "user_stop_typing",
            Self::UserOnline { .. } => "user_online",
            Self::UserDisconnected { .. } => "user_disconnected",
            Self::Error { .. } => "error",
            Self::Pong => "pong",
        }
    }
}

pub fn decode_client_event(raw: &str) -> Result<ClientEvent, serde_json::Error> {
    serde_json::from_str::<ClientEvent>(raw)
}

pub fn encode_server_event(event: &ServerEvent) -> Result<String, serde_json::Error> {
    serde_json::to_string(event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn client_events_decode_from_tagged_json() {
        assert_eq!(
            decode_client_event(r#"{"type":"join_group","group_id":7}"#).unwrap(),
            ClientEvent::JoinGroup { group_id: 7 }
        );
        assert_eq!(
            decode_client_event(r#"{"type":"message_read","message_id":123,"group_id":7}"#)
                .unwrap(),
            ClientEvent::MessageRead { message_id: 123, group_id: 7 }
        );
        assert_eq!(decode_client_event(r#"{"type":"ping"}"#).unwrap(), ClientEvent::Ping);
    }

    #[test]
    fn unknown_or_malformed_client_events_are_rejected() {
        assert!(decode_client_event(r#"{"type":"new_message","group_id":7}"#).is_err());
        assert!(decode_client_event(r#"{"type":"join_group"}"#).is_err());
        assert!(decode_client_event(r#"{"type":"join_group","group_id":"seven"}"#).is_err());
        assert!(decode_client_event("not json").is_err());
    }

    #[test]
    fn new_message_flattens_the_record_into_the_frame() {
        let mut message = MessageRecord::new();
        message.insert("id".into(), json!(42));
        message.insert("group_id".into(), json!(7));
        message.insert("content".into(), json!("hello"));
        message.insert("username".into(), json!("alice"));

        let encoded = serde_json::to_value(ServerEvent::NewMessage { message: message.clone() })
            .expect("new_message should serialize");
        assert_eq!(encoded["type"], "new_message");
        assert_eq!(encoded["id"], 42);
        assert_eq!(encoded["content"], "hello");
        assert!(encoded.get("message").is_none());

        let decoded: ServerEvent = serde_json::from_value(encoded).expect("should decode");
        assert_eq!(decoded, ServerEvent::NewMessage { message });
    }

    #[test]
    fn error_omits_absent_group_id() {
        let encoded = serde_json::to_value(ServerEvent::Error {
            code: "NOT_A_MEMBER".into(),
            message: "Not a member of this group".into(),
            retryable: false,
            group_id: None,
        })
        .unwrap();
        assert!(encoded.get("group_id").is_none());
    }

    #[test]
    fn kinds_match_serialized_type_tags() {
        let events = [
            ServerEvent::Pong,
            ServerEvent::UserOnline { user_id: 1, username: "alice".into() },
            ServerEvent::MessageStatusUpdate {
                message_id: 1,
                user_id: 2,
                status: MessageStatus::Read,
            },
        ];
        for event in events {
            let encoded = serde_json::to_value(&event).unwrap();
            assert_eq!(encoded["type"], event.kind());
        }

        let inbound = ClientEvent::TypingStop { group_id: 3 };
        assert_eq!(serde_json::to_value(&inbound).unwrap()["type"], inbound.kind());
    }
}
