// Identifiers and enums shared by the relay and its clients.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Persisted user key (`users.id`).
pub type UserId = i64;

/// Persisted group key (`groups.id`). A group is also the realtime "room".
pub type GroupId = i64;

/// Persisted message key (`messages.id`).
pub type MessageId = i64;

/// Server-assigned identifier of one live WebSocket connection.
pub type ConnectionId = Uuid;

/// Per-recipient delivery state of a message, stored in `message_status`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Sent,
    Delivered,
    Read,
}

impl MessageStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Read => "read",
        }
    }

    pub fn from_db_value(value: &str) -> Option<Self> {
        match value {
            "sent" => Some(Self::Sent),
            "delivered" => Some(Self::Delivered),
            "read" => Some(Self::Read),
            _ => None,
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
