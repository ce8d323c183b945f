//! Connection registry
//!
//! Tracks every live connection and per-user presence. A user may hold
//! several connections at once (tabs, devices); presence is a connection
//! count, not a boolean. Going offline is debounced by a grace window so a
//! quick reconnect never flaps the user's presence.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::RealtimeConfig;
use crate::connection::{Connection, ConnectionIdentity, Outbound};
use crate::error::{ClasswireError, Result};
use crate::rooms::RoomManager;

/// A user's presence transition, emitted after grace-window settling
#[derive(Debug, Clone)]
pub struct PresenceChange {
    pub user_id: String,
    pub tenant_id: String,
    pub online: bool,
}

struct PresenceEntry {
    tenant_id: String,
    conn_ids: HashSet<String>,
    last_seen: DateTime<Utc>,
}

/// Outcome of a deregistration, for callers that need to follow up
/// (typing cleanup happens only when the user's last connection went away)
#[derive(Debug, Clone)]
pub struct Deregistered {
    pub user_id: String,
    pub tenant_id: String,
    /// True if this was the user's last live connection
    pub last_connection: bool,
}

/// Registry metrics for monitoring
#[derive(Debug, Clone)]
pub struct RegistryMetrics {
    /// Current number of live connections
    pub active_connections: usize,
    /// Maximum connections allowed (0 = unlimited)
    pub max_connections: usize,
    /// Total connections ever registered
    pub total_registered: u64,
    /// Users currently considered online (grace window included)
    pub online_users: usize,
}

/// Tracks live connections and user presence
///
/// The registry is the only writer of connection and presence state. It owns
/// the grace timers and is the sole producer of [`PresenceChange`] signals;
/// the presence broadcaster consumes them on the receiver returned by
/// [`ConnectionRegistry::new`].
pub struct ConnectionRegistry {
    connections: Arc<DashMap<String, Arc<Connection>>>,
    presence: Arc<DashMap<String, PresenceEntry>>,
    grace_timers: Arc<DashMap<String, JoinHandle<()>>>,
    rooms: Arc<RoomManager>,
    presence_tx: mpsc::UnboundedSender<PresenceChange>,
    config: RealtimeConfig,
    total_registered: AtomicU64,
}

impl ConnectionRegistry {
    /// Create a registry and the receiving end of its presence signals
    pub fn new(
        config: RealtimeConfig,
        rooms: Arc<RoomManager>,
    ) -> (Self, mpsc::UnboundedReceiver<PresenceChange>) {
        let (presence_tx, presence_rx) = mpsc::unbounded_channel();
        (
            Self {
                connections: Arc::new(DashMap::new()),
                presence: Arc::new(DashMap::new()),
                grace_timers: Arc::new(DashMap::new()),
                rooms,
                presence_tx,
                config,
                total_registered: AtomicU64::new(0),
            },
            presence_rx,
        )
    }

    /// Register a new connection for an authenticated identity.
    ///
    /// Returns the shared connection handle and the receiving end of its
    /// bounded outbound queue (consumed by the transport pump).
    ///
    /// If the user's presence count transitions 0→1 a presence-changed
    /// signal is emitted, unless the user was still inside the offline
    /// grace window. In that case the pending timer is cancelled and no
    /// signal is sent at all (the user never appeared offline).
    pub fn register(
        &self,
        identity: ConnectionIdentity,
    ) -> Result<(Arc<Connection>, mpsc::Receiver<Outbound>)> {
        if self.config.max_connections > 0 && self.connections.len() >= self.config.max_connections {
            return Err(ClasswireError::capacity(format!(
                "maximum connection limit ({}) reached",
                self.config.max_connections
            )));
        }

        let conn_id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::channel(self.config.message_queue_limit);
        let conn = Arc::new(Connection::new(conn_id.clone(), identity.clone(), tx));

        self.connections.insert(conn_id.clone(), conn.clone());
        self.total_registered.fetch_add(1, Ordering::Relaxed);

        let was_present = {
            let mut entry = self
                .presence
                .entry(identity.user_id.clone())
                .or_insert_with(|| PresenceEntry {
                    tenant_id: identity.tenant_id.clone(),
                    conn_ids: HashSet::new(),
                    last_seen: Utc::now(),
                });
            let was_present = !entry.conn_ids.is_empty();
            entry.conn_ids.insert(conn_id.clone());
            entry.last_seen = Utc::now();
            was_present
        };

        let had_pending_grace = match self.grace_timers.remove(&identity.user_id) {
            Some((_, timer)) => {
                timer.abort();
                true
            }
            None => false,
        };

        if !was_present && !had_pending_grace {
            tracing::debug!(user_id = %identity.user_id, "user online");
            let _ = self.presence_tx.send(PresenceChange {
                user_id: identity.user_id.clone(),
                tenant_id: identity.tenant_id.clone(),
                online: true,
            });
        }

        tracing::debug!(
            conn_id = %conn_id,
            user_id = %identity.user_id,
            tenant_id = %identity.tenant_id,
            "connection registered"
        );
        Ok((conn, rx))
    }

    /// Remove a connection.
    ///
    /// Idempotent: deregistering an id that is already gone is a benign race
    /// under concurrent disconnects, logged at debug and otherwise a no-op.
    /// Removes the connection from every room, and arms the offline grace
    /// timer when this was the user's last connection.
    pub fn deregister(&self, conn_id: &str) -> Option<Deregistered> {
        let (_, conn) = match self.connections.remove(conn_id) {
            Some(removed) => removed,
            None => {
                tracing::debug!(conn_id = %conn_id, "deregister of unknown connection");
                return None;
            }
        };

        conn.close();
        self.rooms.leave_all(conn_id);

        let user_id = conn.user_id().to_string();
        let tenant_id = conn.tenant_id().to_string();

        let went_empty = match self.presence.get_mut(&user_id) {
            Some(mut entry) => {
                entry.conn_ids.remove(conn_id);
                entry.last_seen = Utc::now();
                entry.conn_ids.is_empty()
            }
            None => false,
        };

        if went_empty {
            self.arm_grace_timer(&user_id, &tenant_id);
        }

        tracing::debug!(conn_id = %conn_id, user_id = %user_id, "connection deregistered");
        Some(Deregistered {
            user_id,
            tenant_id,
            last_connection: went_empty,
        })
    }

    /// Start (or restart) the offline grace timer for a user.
    ///
    /// When the timer fires and the user still has no connections, the
    /// presence entry is deleted and a single offline signal is emitted.
    /// A re-register in the meantime aborts the timer (see `register`).
    fn arm_grace_timer(&self, user_id: &str, tenant_id: &str) {
        let user = user_id.to_string();
        let tenant = tenant_id.to_string();
        let presence = self.presence.clone();
        let timers = self.grace_timers.clone();
        let tx = self.presence_tx.clone();
        let grace = self.config.presence_grace();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(grace).await;

            let still_offline = presence
                .remove_if(&user, |_, entry| entry.conn_ids.is_empty())
                .is_some();
            if still_offline {
                tracing::debug!(user_id = %user, "user offline after grace window");
                let _ = tx.send(PresenceChange {
                    user_id: user.clone(),
                    tenant_id: tenant,
                    online: false,
                });
            }
            timers.remove(&user);
        });

        if let Some(previous) = self.grace_timers.insert(user_id.to_string(), handle) {
            previous.abort();
        }
    }

    /// Get a connection by id
    pub fn get(&self, conn_id: &str) -> Option<Arc<Connection>> {
        self.connections.get(conn_id).map(|entry| entry.clone())
    }

    /// All live connection ids for a user (used for user-targeted delivery)
    pub fn connections_of(&self, user_id: &str) -> Vec<String> {
        self.presence
            .get(user_id)
            .map(|entry| entry.conn_ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether a user currently counts as online.
    ///
    /// A user inside the grace window is still online; that is what absorbs
    /// reconnect flapping.
    pub fn is_online(&self, user_id: &str) -> bool {
        self.presence.contains_key(user_id)
    }

    /// When the user's presence last changed (connect or disconnect)
    pub fn last_seen(&self, user_id: &str) -> Option<DateTime<Utc>> {
        self.presence.get(user_id).map(|entry| entry.last_seen)
    }

    /// Online user ids for one tenant. Never crosses tenants.
    pub fn online_users(&self, tenant_id: &str) -> Vec<String> {
        self.presence
            .iter()
            .filter(|entry| entry.tenant_id == tenant_id)
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Every registered connection id (global broadcast read path)
    pub fn all_connection_ids(&self) -> Vec<String> {
        self.connections.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn metrics(&self) -> RegistryMetrics {
        RegistryMetrics {
            active_connections: self.connections.len(),
            max_connections: self.config.max_connections,
            total_registered: self.total_registered.load(Ordering::Relaxed),
            online_users: self.presence.len(),
        }
    }
}
