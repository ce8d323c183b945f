//! Presence broadcaster
//!
//! Consumes presence-changed signals from the registry and publishes the
//! tenant-scoped online-user list into that tenant's broadcast room. Bursts
//! of signals (bulk reconnects after a server restart) are coalesced into a
//! single broadcast reflecting the final state.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::RealtimeConfig;
use crate::event::{Event, Target};
use crate::registry::{ConnectionRegistry, PresenceChange};
use crate::router::EventRouter;

/// Room id carrying a tenant's broadcasts (presence lists, announcements)
pub fn tenant_room(tenant_id: &str) -> String {
    format!("tenant:{}", tenant_id)
}

/// Room id for a tenant's role-wide broadcasts
pub fn role_room(tenant_id: &str, role: &str) -> String {
    format!("role:{}:{}", tenant_id, role)
}

/// Publishes online-user lists on presence transitions
pub struct PresenceBroadcaster {
    registry: Arc<ConnectionRegistry>,
    router: Arc<EventRouter>,
    config: RealtimeConfig,
}

impl PresenceBroadcaster {
    pub fn new(
        config: RealtimeConfig,
        registry: Arc<ConnectionRegistry>,
        router: Arc<EventRouter>,
    ) -> Self {
        Self {
            registry,
            router,
            config,
        }
    }

    /// Spawn the broadcast loop consuming the registry's signal channel.
    pub fn start(self, mut signals: mpsc::UnboundedReceiver<PresenceChange>) -> BroadcasterHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let handle = tokio::spawn(async move {
            tracing::debug!("presence broadcaster started");
            loop {
                let first = tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    signal = signals.recv() => match signal {
                        Some(signal) => signal,
                        None => break,
                    },
                };

                // Coalesce: wait a short window and fold in everything that
                // arrived meanwhile, then broadcast the final state once per
                // affected tenant.
                tokio::time::sleep(self.config.presence_coalesce()).await;

                let mut tenants: HashSet<String> = HashSet::new();
                tenants.insert(first.tenant_id);
                while let Ok(more) = signals.try_recv() {
                    tenants.insert(more.tenant_id);
                }

                for tenant_id in tenants {
                    self.broadcast_tenant(&tenant_id).await;
                }
            }
            tracing::debug!("presence broadcaster stopped");
        });

        BroadcasterHandle {
            shutdown_tx,
            handle,
        }
    }

    async fn broadcast_tenant(&self, tenant_id: &str) {
        let online = self.registry.online_users(tenant_id);
        let room_id = tenant_room(tenant_id);
        tracing::debug!(tenant_id = %tenant_id, online = online.len(), "broadcasting presence list");

        let _ = self
            .router
            .dispatch_from_server(
                Target::Room(room_id.clone()),
                Event::presence_list(room_id, online),
            )
            .await;
    }
}

/// Handle for stopping the presence broadcaster
pub struct BroadcasterHandle {
    shutdown_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

impl BroadcasterHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
        let _ = self.handle.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionIdentity, Outbound};
    use crate::rooms::{RoomKind, RoomManager};
    use tokio::time::{sleep, timeout, Duration};

    fn frames_of_kind(rx: &mut mpsc::Receiver<Outbound>, kind: &str) -> Vec<serde_json::Value> {
        let mut found = Vec::new();
        while let Ok(item) = rx.try_recv() {
            if let Outbound::Frame(text) = item {
                let value: serde_json::Value = serde_json::from_str(&text).unwrap();
                if value["kind"] == kind {
                    found.push(value);
                }
            }
        }
        found
    }

    #[tokio::test]
    async fn test_coalesced_presence_broadcast() {
        let config = RealtimeConfig::builder()
            .presence_grace_ms(10)
            .presence_coalesce_ms(40)
            .build()
            .unwrap();
        let rooms = Arc::new(RoomManager::new());
        let (registry, presence_rx) = ConnectionRegistry::new(config.clone(), rooms.clone());
        let registry = Arc::new(registry);
        let router = Arc::new(EventRouter::new(config.clone(), registry.clone(), rooms.clone()));

        let broadcaster = PresenceBroadcaster::new(config, registry.clone(), router);
        let handle = broadcaster.start(presence_rx);

        // Observer joined to the tenant broadcast room
        let (observer, mut observer_rx) = registry
            .register(ConnectionIdentity::new("observer", "tenant-1", "teacher"))
            .unwrap();
        rooms
            .join(
                "observer",
                observer.id(),
                &tenant_room("tenant-1"),
                RoomKind::TenantBroadcast,
                true,
            )
            .unwrap();

        // A burst of connects inside one coalesce window
        registry
            .register(ConnectionIdentity::new("user-a", "tenant-1", "student"))
            .unwrap();
        registry
            .register(ConnectionIdentity::new("user-b", "tenant-1", "student"))
            .unwrap();
        registry
            .register(ConnectionIdentity::new("user-c", "tenant-1", "student"))
            .unwrap();

        // Wait out the coalesce window plus slack
        sleep(Duration::from_millis(120)).await;

        let lists = frames_of_kind(&mut observer_rx, "presence-list");
        // One coalesced broadcast (the observer's own connect may have
        // produced an earlier one before the burst)
        assert!(!lists.is_empty() && lists.len() <= 2);
        let last = lists.last().unwrap();
        let online: Vec<String> = last["payload"]["online"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap().to_string())
            .collect();
        for user in ["observer", "user-a", "user-b", "user-c"] {
            assert!(online.contains(&user.to_string()), "missing {}", user);
        }

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_offline_broadcast_after_grace() {
        let config = RealtimeConfig::builder()
            .presence_grace_ms(30)
            .presence_coalesce_ms(10)
            .build()
            .unwrap();
        let rooms = Arc::new(RoomManager::new());
        let (registry, presence_rx) = ConnectionRegistry::new(config.clone(), rooms.clone());
        let registry = Arc::new(registry);
        let router = Arc::new(EventRouter::new(config.clone(), registry.clone(), rooms.clone()));

        let broadcaster = PresenceBroadcaster::new(config, registry.clone(), router);
        let handle = broadcaster.start(presence_rx);

        let (observer, mut observer_rx) = registry
            .register(ConnectionIdentity::new("observer", "tenant-1", "teacher"))
            .unwrap();
        rooms
            .join(
                "observer",
                observer.id(),
                &tenant_room("tenant-1"),
                RoomKind::TenantBroadcast,
                true,
            )
            .unwrap();

        let (conn, _queue) = registry
            .register(ConnectionIdentity::new("user-a", "tenant-1", "student"))
            .unwrap();
        sleep(Duration::from_millis(60)).await;
        let _ = frames_of_kind(&mut observer_rx, "presence-list");

        registry.deregister(conn.id());
        // Grace + coalesce + slack
        let deadline = Duration::from_millis(200);
        let offline_list = timeout(deadline, async {
            loop {
                if let Some(Outbound::Frame(text)) = observer_rx.recv().await {
                    let value: serde_json::Value = serde_json::from_str(&text).unwrap();
                    if value["kind"] == "presence-list" {
                        return value;
                    }
                }
            }
        })
        .await
        .unwrap();

        let online = offline_list["payload"]["online"].as_array().unwrap();
        assert!(!online.iter().any(|v| v == "user-a"));

        handle.shutdown().await;
    }
}
