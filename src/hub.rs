//! Hub: wiring and orchestration
//!
//! The hub is the explicitly-constructed, dependency-injected root of the
//! subsystem. Nothing here is process-global: a test run can hold several
//! independent hubs side by side. It owns the component graph, spawns the
//! background tasks (typing sweeper, presence broadcaster), applies inbound
//! client events, and exposes the server-side emit API used by the rest of
//! the platform (announcements, notification counters, live-class events).

use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::config::RealtimeConfig;
use crate::connection::{ConnectionIdentity, Outbound};
use crate::error::{ClasswireError, Result};
use crate::event::{ClientEvent, Event, Target};
use crate::presence::{role_room, tenant_room, BroadcasterHandle, PresenceBroadcaster};
use crate::registry::ConnectionRegistry;
use crate::rooms::{RoomKind, RoomManager};
use crate::router::{DispatchOutcome, EventRouter};
use crate::traits::{AllowAll, JoinPolicy, MessageStore};
use crate::typing::{SweeperHandle, TypingTracker};

/// Root of one realtime subsystem instance
pub struct Hub {
    config: RealtimeConfig,
    registry: Arc<ConnectionRegistry>,
    rooms: Arc<RoomManager>,
    router: Arc<EventRouter>,
    typing: Arc<TypingTracker>,
    policy: Arc<dyn JoinPolicy>,
    store: Option<Arc<dyn MessageStore>>,
    sweeper: StdMutex<Option<SweeperHandle>>,
    broadcaster: StdMutex<Option<BroadcasterHandle>>,
}

impl Hub {
    /// Create a hub builder with default configuration
    pub fn builder() -> HubBuilder {
        HubBuilder::new()
    }

    /// Register a connection for an authenticated identity.
    ///
    /// The connection auto-joins its tenant and role broadcast rooms
    /// (derived from the trusted identity, so no policy consult) and
    /// immediately receives the current presence snapshot for its tenant.
    /// Returns the connection id and the outbound queue for the transport
    /// pump.
    pub async fn connect(
        &self,
        identity: ConnectionIdentity,
    ) -> Result<(String, mpsc::Receiver<Outbound>)> {
        let (conn, rx) = self.registry.register(identity)?;
        let conn_id = conn.id().to_string();

        let tenant = tenant_room(conn.tenant_id());
        let role = role_room(conn.tenant_id(), conn.role());
        self.rooms
            .join(conn.user_id(), &conn_id, &tenant, RoomKind::TenantBroadcast, true)?;
        self.rooms
            .join(conn.user_id(), &conn_id, &role, RoomKind::RoleBroadcast, true)?;

        let online = self.registry.online_users(conn.tenant_id());
        let _ = self
            .router
            .dispatch_from_server(
                Target::Connection(conn_id.clone()),
                Event::presence_list(tenant, online),
            )
            .await;

        Ok((conn_id, rx))
    }

    /// Tear down a connection. Idempotent.
    ///
    /// Room membership and presence are handled by the registry; typing
    /// entries are cleared (with their `typing-stop` broadcast) when this
    /// was the user's last connection.
    pub async fn disconnect(&self, conn_id: &str) {
        if let Some(outcome) = self.registry.deregister(conn_id) {
            if outcome.last_connection {
                self.typing.clear_user(&outcome.user_id).await;
            }
        }
    }

    /// Join a room on behalf of a connection, consulting the policy
    /// collaborator.
    pub async fn join_room(&self, conn_id: &str, room_id: &str) -> Result<()> {
        let conn = self
            .registry
            .get(conn_id)
            .ok_or_else(|| ClasswireError::unknown_connection(conn_id))?;

        let kind = RoomKind::parse(room_id)
            .ok_or_else(|| ClasswireError::bad_event(format!("unknown room id format: {}", room_id)))?;

        let allowed = self
            .policy
            .can_join(conn.user_id(), conn.role(), conn.tenant_id(), room_id)
            .await;

        self.rooms
            .join(conn.user_id(), conn_id, room_id, kind, allowed)?;

        // A deregister may have raced the insert; a dead connection must
        // never linger in a member set
        if self.registry.get(conn_id).is_none() {
            self.rooms.leave(conn_id, room_id);
            return Err(ClasswireError::unknown_connection(conn_id));
        }
        Ok(())
    }

    /// Leave a room. Idempotent; unknown rooms and non-members are no-ops.
    pub fn leave_room(&self, conn_id: &str, room_id: &str) {
        self.rooms.leave(conn_id, room_id);
    }

    /// Apply one inbound client event.
    ///
    /// Rejection-class failures (forbidden room, not a member, malformed
    /// event) are reported back to the offending connection as a `rejected`
    /// event; benign races are logged and swallowed. Nothing that happens
    /// here can take down other connections.
    pub async fn handle_client_event(&self, conn_id: &str, event: ClientEvent) {
        if let Err(err) = self.apply_client_event(conn_id, &event).await {
            match err {
                ClasswireError::UnknownConnection(_) => {
                    tracing::debug!(conn_id = %conn_id, error = %err, "event for stale connection");
                }
                err if err.is_rejection() => {
                    tracing::debug!(conn_id = %conn_id, error = %err, "client event rejected");
                    self.send_rejection(conn_id, err.room_id(), &err).await;
                }
                err => {
                    tracing::warn!(conn_id = %conn_id, error = %err, "client event failed");
                    self.send_rejection(conn_id, None, &err).await;
                }
            }
        }
    }

    async fn apply_client_event(&self, conn_id: &str, event: &ClientEvent) -> Result<()> {
        match event {
            ClientEvent::Join { room_id } => self.join_room(conn_id, room_id).await,
            ClientEvent::Leave { room_id } => {
                self.leave_room(conn_id, room_id);
                Ok(())
            }
            ClientEvent::Message { room_id, payload } => {
                let conn = self
                    .registry
                    .get(conn_id)
                    .ok_or_else(|| ClasswireError::unknown_connection(conn_id))?;
                let user_id = conn.user_id().to_string();

                // Persist before fan-out; the store owns message history
                if let Some(store) = &self.store {
                    store.persist(room_id, &user_id, payload).await?;
                }

                self.router
                    .dispatch(
                        conn_id,
                        Target::Room(room_id.clone()),
                        Event::message(room_id, user_id, payload.clone()),
                    )
                    .await?;
                Ok(())
            }
            ClientEvent::TypingStart {
                room_id,
                display_name,
            } => {
                let conn = self
                    .registry
                    .get(conn_id)
                    .ok_or_else(|| ClasswireError::unknown_connection(conn_id))?;
                if !self.rooms.is_member(room_id, conn_id) {
                    return Err(ClasswireError::not_a_member(conn_id, room_id));
                }
                self.typing
                    .start_typing(room_id, conn.user_id(), display_name, conn_id)
                    .await
            }
            ClientEvent::TypingStop { room_id } => {
                let conn = self
                    .registry
                    .get(conn_id)
                    .ok_or_else(|| ClasswireError::unknown_connection(conn_id))?;
                self.typing
                    .stop_typing(room_id, conn.user_id(), conn_id)
                    .await
            }
            ClientEvent::ReadReceipt { room_id, payload } => {
                let conn = self
                    .registry
                    .get(conn_id)
                    .ok_or_else(|| ClasswireError::unknown_connection(conn_id))?;
                self.router
                    .dispatch(
                        conn_id,
                        Target::Room(room_id.clone()),
                        Event::read_receipt(room_id, conn.user_id(), payload.clone()),
                    )
                    .await?;
                Ok(())
            }
        }
    }

    /// Send a `rejected` event to one connection
    pub async fn send_rejection(
        &self,
        conn_id: &str,
        room_id: Option<String>,
        err: &ClasswireError,
    ) {
        let _ = self
            .router
            .dispatch_from_server(
                Target::Connection(conn_id.to_string()),
                Event::rejected(room_id, &err.rejection()),
            )
            .await;
    }

    /// Broadcast an announcement into a room (tenant-wide, role-wide, or a
    /// class section). Server-side API for the surrounding platform.
    pub async fn announce(&self, room_id: &str, payload: Value) -> Result<DispatchOutcome> {
        self.router
            .dispatch_from_server(
                Target::Room(room_id.to_string()),
                Event::announcement(room_id, payload),
            )
            .await
    }

    /// Push an unread-notification counter to all of a user's connections
    pub async fn notification_count(&self, user_id: &str, count: u64) -> Result<DispatchOutcome> {
        self.router
            .dispatch_from_server(
                Target::User(user_id.to_string()),
                Event::notification_count(user_id, count),
            )
            .await
    }

    /// Announce a live class starting in a class-section room
    pub async fn live_class_started(&self, room_id: &str, payload: Value) -> Result<DispatchOutcome> {
        self.router
            .dispatch_from_server(
                Target::Room(room_id.to_string()),
                Event::live_class_started(room_id, payload),
            )
            .await
    }

    /// Announce a live class ending
    pub async fn live_class_ended(&self, room_id: &str, payload: Value) -> Result<DispatchOutcome> {
        self.router
            .dispatch_from_server(
                Target::Room(room_id.to_string()),
                Event::live_class_ended(room_id, payload),
            )
            .await
    }

    pub fn config(&self) -> &RealtimeConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn rooms(&self) -> &Arc<RoomManager> {
        &self.rooms
    }

    pub fn router(&self) -> &Arc<EventRouter> {
        &self.router
    }

    pub fn typing(&self) -> &Arc<TypingTracker> {
        &self.typing
    }

    /// Stop the background tasks gracefully
    pub async fn shutdown(&self) {
        let sweeper = self.sweeper.lock().ok().and_then(|mut guard| guard.take());
        if let Some(handle) = sweeper {
            handle.shutdown().await;
        }
        let broadcaster = self.broadcaster.lock().ok().and_then(|mut guard| guard.take());
        if let Some(handle) = broadcaster {
            handle.shutdown().await;
        }
    }
}

/// Builder for [`Hub`]
#[must_use = "builder does nothing until you call build()"]
pub struct HubBuilder {
    config: RealtimeConfig,
    policy: Arc<dyn JoinPolicy>,
    store: Option<Arc<dyn MessageStore>>,
}

impl HubBuilder {
    pub fn new() -> Self {
        Self {
            config: RealtimeConfig::default(),
            policy: Arc::new(AllowAll),
            store: None,
        }
    }

    pub fn with_config(mut self, config: RealtimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_policy(mut self, policy: Arc<dyn JoinPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_message_store(mut self, store: Arc<dyn MessageStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Build the hub, wiring components and spawning the background tasks.
    /// Must run inside a tokio runtime.
    pub fn build(self) -> Arc<Hub> {
        let rooms = Arc::new(RoomManager::new());
        let (registry, presence_rx) = ConnectionRegistry::new(self.config.clone(), rooms.clone());
        let registry = Arc::new(registry);
        let router = Arc::new(EventRouter::new(
            self.config.clone(),
            registry.clone(),
            rooms.clone(),
        ));
        let typing = Arc::new(TypingTracker::new(self.config.clone(), router.clone()));

        let sweeper = typing.start_sweeper();
        let broadcaster =
            PresenceBroadcaster::new(self.config.clone(), registry.clone(), router.clone())
                .start(presence_rx);

        Arc::new(Hub {
            config: self.config,
            registry,
            rooms,
            router,
            typing,
            policy: self.policy,
            store: self.store,
            sweeper: StdMutex::new(Some(sweeper)),
            broadcaster: StdMutex::new(Some(broadcaster)),
        })
    }
}

impl Default for HubBuilder {
    fn default() -> Self {
        Self::new()
    }
}
