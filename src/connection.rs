//! Connection handle
//!
//! A `Connection` pairs a pre-authenticated identity with the bounded
//! outbound queue feeding that client's socket. Identity never changes after
//! the handshake, so the struct is immutable and shared as `Arc<Connection>`;
//! room membership lives solely in the `RoomManager`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};

use crate::error::{ClasswireError, Result};

/// Identity context attached to a connection by the platform's auth layer
///
/// The subsystem trusts this without re-validating credentials.
#[derive(Debug, Clone)]
pub struct ConnectionIdentity {
    pub user_id: String,
    pub tenant_id: String,
    pub role: String,
}

impl ConnectionIdentity {
    pub fn new(
        user_id: impl Into<String>,
        tenant_id: impl Into<String>,
        role: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            tenant_id: tenant_id.into(),
            role: role.into(),
        }
    }
}

/// Items carried on a connection's outbound queue
///
/// The transport pump drains these into the actual socket. `Frame` carries an
/// already-serialized event; control items exist so heartbeats and forced
/// closes flow through the same ordered queue as events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// A serialized outbound event (JSON text frame)
    Frame(String),
    /// Heartbeat ping
    Ping(Vec<u8>),
    /// Reply to a client ping
    Pong(Vec<u8>),
    /// Terminate the connection
    Close,
}

/// A live client connection
pub struct Connection {
    id: String,
    user_id: String,
    tenant_id: String,
    role: String,
    sender: mpsc::Sender<Outbound>,
    closed: AtomicBool,
}

impl Connection {
    pub(crate) fn new(id: String, identity: ConnectionIdentity, sender: mpsc::Sender<Outbound>) -> Self {
        Self {
            id,
            user_id: identity.user_id,
            tenant_id: identity.tenant_id,
            role: identity.role,
            sender,
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    /// Enqueue without waiting. Used for droppable (latest-state-wins) events
    /// and control frames: a full queue sheds the item instead of buffering.
    pub(crate) fn try_send(&self, item: Outbound) -> Result<()> {
        if self.is_closed() {
            return Err(ClasswireError::unknown_connection(&self.id));
        }
        self.sender.try_send(item).map_err(|e| match e {
            TrySendError::Full(_) => ClasswireError::queue_overflow(&self.id),
            TrySendError::Closed(_) => ClasswireError::unknown_connection(&self.id),
        })
    }

    /// Enqueue a non-droppable item, waiting up to `timeout` for queue space.
    ///
    /// A queue that stays saturated for the whole timeout is a
    /// `QueueOverflow`; the caller is expected to disconnect the consumer.
    pub(crate) async fn send_timeout(&self, item: Outbound, timeout: Duration) -> Result<()> {
        if self.is_closed() {
            return Err(ClasswireError::unknown_connection(&self.id));
        }
        self.sender
            .send_timeout(item, timeout)
            .await
            .map_err(|e| match e {
                SendTimeoutError::Timeout(_) => ClasswireError::queue_overflow(&self.id),
                SendTimeoutError::Closed(_) => ClasswireError::unknown_connection(&self.id),
            })
    }

    /// Mark the connection closed and ask the transport pump to terminate.
    ///
    /// Idempotent; the close control frame is best-effort.
    pub(crate) fn close(&self) {
        if self.closed.swap(true, Ordering::Relaxed) {
            return;
        }
        let _ = self.sender.try_send(Outbound::Close);
    }
}
