use serde::Serialize;

/// The main error type for classwire operations
///
/// Per-target delivery failures (`DeliveryTimeout`, `QueueOverflow`) are
/// isolated inside the router and never propagate out of a dispatch; the
/// variants exist so they can be logged and counted uniformly. Rejections
/// (`ForbiddenRoom`, `NotAMember`, `BadEvent`) are surfaced to the offending
/// client as a `rejected` event, never as a disconnect.
#[derive(Debug, thiserror::Error)]
pub enum ClasswireError {
    /// Operation referenced a connection id that is no longer registered.
    /// Expected under disconnect races; treated as a no-op by callers.
    #[error("Unknown connection: {0}")]
    UnknownConnection(String),

    /// Room join rejected by the authorization collaborator
    #[error("Forbidden room {room_id} for user {user_id}")]
    ForbiddenRoom { user_id: String, room_id: String },

    /// Dispatch attempted for a room the source connection never joined
    #[error("Connection {conn_id} is not a member of room {room_id}")]
    NotAMember { conn_id: String, room_id: String },

    /// A single target connection write exceeded its timeout
    #[error("Delivery to connection {0} timed out")]
    DeliveryTimeout(String),

    /// A connection's bounded outbound queue is full for a non-droppable event
    #[error("Outbound queue overflow for connection {0}")]
    QueueOverflow(String),

    /// Malformed or unrecognized client event (bad JSON, unknown room prefix)
    #[error("Bad event: {0}")]
    BadEvent(String),

    /// Registration refused because the connection cap was reached
    #[error("Capacity exceeded: {0}")]
    Capacity(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl ClasswireError {
    pub fn unknown_connection(conn_id: impl Into<String>) -> Self {
        Self::UnknownConnection(conn_id.into())
    }

    pub fn forbidden_room(user_id: impl Into<String>, room_id: impl Into<String>) -> Self {
        Self::ForbiddenRoom {
            user_id: user_id.into(),
            room_id: room_id.into(),
        }
    }

    pub fn not_a_member(conn_id: impl Into<String>, room_id: impl Into<String>) -> Self {
        Self::NotAMember {
            conn_id: conn_id.into(),
            room_id: room_id.into(),
        }
    }

    pub fn delivery_timeout(conn_id: impl Into<String>) -> Self {
        Self::DeliveryTimeout(conn_id.into())
    }

    pub fn queue_overflow(conn_id: impl Into<String>) -> Self {
        Self::QueueOverflow(conn_id.into())
    }

    pub fn bad_event(msg: impl Into<String>) -> Self {
        Self::BadEvent(msg.into())
    }

    pub fn capacity(msg: impl Into<String>) -> Self {
        Self::Capacity(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Short machine-readable code used in `rejected` events sent to clients
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownConnection(_) => "unknown-connection",
            Self::ForbiddenRoom { .. } => "forbidden-room",
            Self::NotAMember { .. } => "not-a-member",
            Self::DeliveryTimeout(_) => "delivery-timeout",
            Self::QueueOverflow(_) => "queue-overflow",
            Self::BadEvent(_) => "bad-event",
            Self::Capacity(_) => "capacity",
            Self::Internal(_) | Self::Anyhow(_) => "internal",
        }
    }

    /// Whether this error should be reported back to the offending client
    /// as a `rejected` event (as opposed to being swallowed as a benign race
    /// or handled entirely server-side)
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::ForbiddenRoom { .. } | Self::NotAMember { .. } | Self::BadEvent(_)
        )
    }

    /// Payload body for a `rejected` event
    pub fn rejection(&self) -> Rejection {
        Rejection {
            code: self.code().to_string(),
            reason: self.to_string(),
        }
    }

    /// Room id to echo back in a rejection event, when the error names one
    pub fn room_id(&self) -> Option<String> {
        match self {
            Self::ForbiddenRoom { room_id, .. } | Self::NotAMember { room_id, .. } => {
                Some(room_id.clone())
            }
            _ => None,
        }
    }
}

/// Client-facing rejection payload
#[derive(Debug, Clone, Serialize)]
pub struct Rejection {
    pub code: String,
    pub reason: String,
}

/// Result type alias for classwire operations
pub type Result<T> = std::result::Result<T, ClasswireError>;

impl From<serde_json::Error> for ClasswireError {
    fn from(err: serde_json::Error) -> Self {
        ClasswireError::BadEvent(format!("JSON error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_connection() {
        let err = ClasswireError::unknown_connection("conn-1");
        assert!(matches!(err, ClasswireError::UnknownConnection(_)));
        assert_eq!(err.to_string(), "Unknown connection: conn-1");
        assert_eq!(err.code(), "unknown-connection");
        assert!(!err.is_rejection());
    }

    #[test]
    fn test_forbidden_room() {
        let err = ClasswireError::forbidden_room("user-1", "conv:7");
        assert_eq!(err.to_string(), "Forbidden room conv:7 for user user-1");
        assert_eq!(err.code(), "forbidden-room");
        assert!(err.is_rejection());
    }

    #[test]
    fn test_not_a_member() {
        let err = ClasswireError::not_a_member("conn-1", "conv:7");
        assert_eq!(err.code(), "not-a-member");
        assert!(err.is_rejection());
    }

    #[test]
    fn test_delivery_failures_are_not_rejections() {
        assert!(!ClasswireError::delivery_timeout("conn-1").is_rejection());
        assert!(!ClasswireError::queue_overflow("conn-1").is_rejection());
        assert!(!ClasswireError::internal("oops").is_rejection());
    }

    #[test]
    fn test_rejection_payload() {
        let rejection = ClasswireError::bad_event("unknown room prefix").rejection();
        assert_eq!(rejection.code, "bad-event");
        assert!(rejection.reason.contains("unknown room prefix"));
    }

    #[test]
    fn test_from_serde_json_error() {
        let result: std::result::Result<serde_json::Value, _> = serde_json::from_str("{ nope");
        let err: ClasswireError = result.unwrap_err().into();
        assert!(matches!(err, ClasswireError::BadEvent(_)));
    }
}
