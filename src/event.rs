//! Typed event model
//!
//! Events are a closed tagged union rather than stringly-typed event names:
//! every kind the subsystem can emit or accept is a variant, so a typo in an
//! event name is a compile error instead of a silently-dead subscription.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Rejection;

/// Outbound event kinds emitted to clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    Message,
    TypingStart,
    TypingStop,
    ReadReceipt,
    PresenceList,
    Announcement,
    NotificationCount,
    LiveClassStarted,
    LiveClassEnded,
    Rejected,
}

impl EventKind {
    /// Whether the originating connection is excluded from the fan-out.
    ///
    /// Typing indicators never echo to the typer. Messages and read receipts
    /// do echo, so the sender's other open tabs stay in sync.
    pub fn echo_suppressed(&self) -> bool {
        matches!(self, Self::TypingStart | Self::TypingStop)
    }

    /// Whether the event may be shed for a saturated connection.
    ///
    /// Latest-state-wins kinds (typing, presence, counters) are droppable;
    /// everything else must be queued or the connection torn down.
    pub fn droppable(&self) -> bool {
        matches!(
            self,
            Self::TypingStart | Self::TypingStop | Self::PresenceList | Self::NotificationCount
        )
    }
}

/// An outbound event, constructed and consumed within a single dispatch
///
/// Wire shape: `{kind, roomId|userId, payload, serverTimestamp}` with the
/// timestamp in UTC epoch milliseconds.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub kind: EventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub payload: Value,
    pub server_timestamp: i64,
}

impl Event {
    fn new(kind: EventKind, room_id: Option<String>, user_id: Option<String>, payload: Value) -> Self {
        Self {
            kind,
            room_id,
            user_id,
            payload,
            server_timestamp: Utc::now().timestamp_millis(),
        }
    }

    pub fn message(room_id: impl Into<String>, user_id: impl Into<String>, payload: Value) -> Self {
        Self::new(EventKind::Message, Some(room_id.into()), Some(user_id.into()), payload)
    }

    pub fn typing_start(
        room_id: impl Into<String>,
        user_id: impl Into<String>,
        display_name: impl Into<String>,
    ) -> Self {
        Self::new(
            EventKind::TypingStart,
            Some(room_id.into()),
            Some(user_id.into()),
            serde_json::json!({ "displayName": display_name.into() }),
        )
    }

    pub fn typing_stop(room_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self::new(EventKind::TypingStop, Some(room_id.into()), Some(user_id.into()), Value::Null)
    }

    pub fn read_receipt(room_id: impl Into<String>, user_id: impl Into<String>, payload: Value) -> Self {
        Self::new(EventKind::ReadReceipt, Some(room_id.into()), Some(user_id.into()), payload)
    }

    pub fn presence_list(room_id: impl Into<String>, online_user_ids: Vec<String>) -> Self {
        Self::new(
            EventKind::PresenceList,
            Some(room_id.into()),
            None,
            serde_json::json!({ "online": online_user_ids }),
        )
    }

    pub fn announcement(room_id: impl Into<String>, payload: Value) -> Self {
        Self::new(EventKind::Announcement, Some(room_id.into()), None, payload)
    }

    pub fn notification_count(user_id: impl Into<String>, count: u64) -> Self {
        Self::new(
            EventKind::NotificationCount,
            None,
            Some(user_id.into()),
            serde_json::json!({ "count": count }),
        )
    }

    pub fn live_class_started(room_id: impl Into<String>, payload: Value) -> Self {
        Self::new(EventKind::LiveClassStarted, Some(room_id.into()), None, payload)
    }

    pub fn live_class_ended(room_id: impl Into<String>, payload: Value) -> Self {
        Self::new(EventKind::LiveClassEnded, Some(room_id.into()), None, payload)
    }

    pub fn rejected(room_id: Option<String>, rejection: &Rejection) -> Self {
        Self::new(
            EventKind::Rejected,
            room_id,
            None,
            serde_json::json!({ "code": rejection.code, "reason": rejection.reason }),
        )
    }
}

/// Where a dispatch fans out to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Every member connection of a room
    Room(String),
    /// Every live connection of a user
    User(String),
    /// One explicit connection
    Connection(String),
    /// Every registered connection
    All,
}

/// Inbound events parsed off a client connection
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientEvent {
    Join { room_id: String },
    Leave { room_id: String },
    Message { room_id: String, payload: Value },
    TypingStart { room_id: String, display_name: String },
    TypingStop { room_id: String },
    ReadReceipt { room_id: String, payload: Value },
}
