//! Typing-state tracker
//!
//! Ephemeral per-(room, user) state machine: `ABSENT → TYPING → ABSENT`.
//! Entries expire on a fixed deadline. Expiry is enforced at read time:
//! an entry past its deadline is invisible even before the background sweep
//! physically removes it and broadcasts the missing `typing-stop`.

use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::RealtimeConfig;
use crate::error::Result;
use crate::event::{Event, Target};
use crate::router::EventRouter;

struct TypingState {
    display_name: String,
    deadline: Instant,
}

/// A user currently typing in a room, as seen by readers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingUser {
    pub user_id: String,
    pub display_name: String,
}

/// Tracks who is typing in which room
///
/// The tracker is the only writer of typing state. Broadcasts flow through
/// the router: `typing-start` is echo-suppressed for the typer, and the
/// sweeper emits server-originated `typing-stop` events for entries that
/// expired without an explicit stop (client crash, dropped connection).
pub struct TypingTracker {
    entries: DashMap<(String, String), TypingState>,
    router: Arc<EventRouter>,
    config: RealtimeConfig,
}

impl TypingTracker {
    pub fn new(config: RealtimeConfig, router: Arc<EventRouter>) -> Self {
        Self {
            entries: DashMap::new(),
            router,
            config,
        }
    }

    /// Insert or refresh a typing entry and broadcast `typing-start` to the
    /// rest of the room (never echoed to the typer's own connection).
    pub async fn start_typing(
        &self,
        room_id: &str,
        user_id: &str,
        display_name: &str,
        source_conn_id: &str,
    ) -> Result<()> {
        self.entries.insert(
            (room_id.to_string(), user_id.to_string()),
            TypingState {
                display_name: display_name.to_string(),
                deadline: Instant::now() + self.config.typing_expiry(),
            },
        );

        self.router
            .dispatch(
                source_conn_id,
                Target::Room(room_id.to_string()),
                Event::typing_start(room_id, user_id, display_name),
            )
            .await?;
        Ok(())
    }

    /// Remove a typing entry and broadcast `typing-stop`. No-op if the user
    /// was not typing in that room.
    pub async fn stop_typing(&self, room_id: &str, user_id: &str, source_conn_id: &str) -> Result<()> {
        let removed = self
            .entries
            .remove(&(room_id.to_string(), user_id.to_string()))
            .is_some();
        if !removed {
            return Ok(());
        }

        self.router
            .dispatch(
                source_conn_id,
                Target::Room(room_id.to_string()),
                Event::typing_stop(room_id, user_id),
            )
            .await?;
        Ok(())
    }

    /// Who is typing in a room right now.
    ///
    /// Filters out entries past their deadline even if the sweep has not run
    /// yet; physical cleanup remains the sweeper's job.
    pub fn typing_in(&self, room_id: &str) -> Vec<TypingUser> {
        let now = Instant::now();
        self.entries
            .iter()
            .filter(|entry| entry.key().0 == room_id && entry.deadline > now)
            .map(|entry| TypingUser {
                user_id: entry.key().1.clone(),
                display_name: entry.display_name.clone(),
            })
            .collect()
    }

    /// Clear every typing entry for a user whose last connection went away,
    /// broadcasting the `typing-stop` the client never got to send.
    pub async fn clear_user(&self, user_id: &str) {
        let rooms: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.key().1 == user_id)
            .map(|entry| entry.key().0.clone())
            .collect();

        for room_id in rooms {
            if self
                .entries
                .remove(&(room_id.clone(), user_id.to_string()))
                .is_some()
            {
                let _ = self
                    .router
                    .dispatch_from_server(
                        Target::Room(room_id.clone()),
                        Event::typing_stop(&room_id, user_id),
                    )
                    .await;
            }
        }
    }

    /// One sweep pass: remove expired entries and broadcast their
    /// `typing-stop`. Returns how many entries were swept.
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<(String, String)> = self
            .entries
            .iter()
            .filter(|entry| entry.deadline <= now)
            .map(|entry| entry.key().clone())
            .collect();

        let mut swept = 0;
        for key in expired {
            // Re-check under the entry lock: the user may have refreshed
            // between the scan and now
            if self
                .entries
                .remove_if(&key, |_, state| state.deadline <= Instant::now())
                .is_some()
            {
                swept += 1;
                let (room_id, user_id) = key;
                tracing::debug!(room_id = %room_id, user_id = %user_id, "typing entry expired");
                let _ = self
                    .router
                    .dispatch_from_server(
                        Target::Room(room_id.clone()),
                        Event::typing_stop(&room_id, &user_id),
                    )
                    .await;
            }
        }
        swept
    }

    /// Spawn the background sweeper. Runs until shut down via the returned
    /// handle.
    pub fn start_sweeper(self: &Arc<Self>) -> SweeperHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let tracker = self.clone();
        let interval = self.config.typing_sweep_interval();

        let handle = tokio::spawn(async move {
            tracing::debug!("typing sweeper started");
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately; skip it
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = ticker.tick() => {
                        tracker.sweep().await;
                    }
                }
            }
            tracing::debug!("typing sweeper stopped");
        });

        SweeperHandle {
            shutdown_tx,
            handle,
        }
    }
}

/// Handle for stopping the background sweeper
pub struct SweeperHandle {
    shutdown_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

impl SweeperHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
        let _ = self.handle.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionIdentity, Outbound};
    use crate::registry::ConnectionRegistry;
    use crate::rooms::{RoomKind, RoomManager};
    use tokio::time::{sleep, Duration};

    struct Fixture {
        registry: Arc<ConnectionRegistry>,
        rooms: Arc<RoomManager>,
        tracker: Arc<TypingTracker>,
    }

    fn fixture(expiry_ms: u64, sweep_ms: u64) -> Fixture {
        let config = RealtimeConfig::builder()
            .presence_grace_ms(10)
            .typing_expiry_ms(expiry_ms)
            .typing_sweep_interval_ms(sweep_ms)
            .build()
            .unwrap();
        let rooms = Arc::new(RoomManager::new());
        let (registry, _presence_rx) = ConnectionRegistry::new(config.clone(), rooms.clone());
        let registry = Arc::new(registry);
        let router = Arc::new(EventRouter::new(config.clone(), registry.clone(), rooms.clone()));
        let tracker = Arc::new(TypingTracker::new(config, router));
        Fixture {
            registry,
            rooms,
            tracker,
        }
    }

    impl Fixture {
        fn member(&self, user: &str, room: &str) -> (String, mpsc::Receiver<Outbound>) {
            let (conn, rx) = self
                .registry
                .register(ConnectionIdentity::new(user, "tenant-1", "student"))
                .unwrap();
            self.rooms
                .join(user, conn.id(), room, RoomKind::Conversation, true)
                .unwrap();
            (conn.id().to_string(), rx)
        }
    }

    fn frame_kind(item: &Outbound) -> String {
        match item {
            Outbound::Frame(text) => {
                let value: serde_json::Value = serde_json::from_str(text).unwrap();
                value["kind"].as_str().unwrap().to_string()
            }
            other => panic!("expected frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_start_typing_broadcasts_to_others_only() {
        let fx = fixture(1000, 100);
        let (conn_x, mut rx_x) = fx.member("user-x", "conv:7");
        let (_conn_y, mut rx_y) = fx.member("user-y", "conv:7");

        fx.tracker
            .start_typing("conv:7", "user-x", "Xavier", &conn_x)
            .await
            .unwrap();

        assert_eq!(frame_kind(&rx_y.recv().await.unwrap()), "typing-start");
        assert!(rx_x.try_recv().is_err());

        let typing = fx.tracker.typing_in("conv:7");
        assert_eq!(typing.len(), 1);
        assert_eq!(typing[0].user_id, "user-x");
        assert_eq!(typing[0].display_name, "Xavier");
    }

    #[tokio::test]
    async fn test_stop_typing_removes_and_broadcasts() {
        let fx = fixture(1000, 100);
        let (conn_x, _rx_x) = fx.member("user-x", "conv:7");
        let (_conn_y, mut rx_y) = fx.member("user-y", "conv:7");

        fx.tracker
            .start_typing("conv:7", "user-x", "Xavier", &conn_x)
            .await
            .unwrap();
        fx.tracker
            .stop_typing("conv:7", "user-x", &conn_x)
            .await
            .unwrap();

        assert_eq!(frame_kind(&rx_y.recv().await.unwrap()), "typing-start");
        assert_eq!(frame_kind(&rx_y.recv().await.unwrap()), "typing-stop");
        assert!(fx.tracker.typing_in("conv:7").is_empty());
    }

    #[tokio::test]
    async fn test_stop_typing_when_absent_is_noop() {
        let fx = fixture(1000, 100);
        let (conn_x, _rx_x) = fx.member("user-x", "conv:7");
        let (_conn_y, mut rx_y) = fx.member("user-y", "conv:7");

        fx.tracker
            .stop_typing("conv:7", "user-x", &conn_x)
            .await
            .unwrap();

        // No broadcast for a stop without a start
        assert!(rx_y.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_read_time_expiry_before_sweep() {
        let fx = fixture(30, 10_000);
        let (conn_x, _rx_x) = fx.member("user-x", "conv:7");

        fx.tracker
            .start_typing("conv:7", "user-x", "Xavier", &conn_x)
            .await
            .unwrap();
        assert_eq!(fx.tracker.typing_in("conv:7").len(), 1);

        // Past the deadline, with a sweep interval far in the future:
        // the read must already filter the entry out
        sleep(Duration::from_millis(50)).await;
        assert!(fx.tracker.typing_in("conv:7").is_empty());
    }

    #[tokio::test]
    async fn test_refresh_extends_deadline() {
        let fx = fixture(60, 10_000);
        let (conn_x, _rx_x) = fx.member("user-x", "conv:7");

        fx.tracker
            .start_typing("conv:7", "user-x", "Xavier", &conn_x)
            .await
            .unwrap();
        sleep(Duration::from_millis(40)).await;
        fx.tracker
            .start_typing("conv:7", "user-x", "Xavier", &conn_x)
            .await
            .unwrap();
        sleep(Duration::from_millis(40)).await;

        // 80ms after the first start but only 40ms after the refresh
        assert_eq!(fx.tracker.typing_in("conv:7").len(), 1);
    }

    #[tokio::test]
    async fn test_sweep_broadcasts_missed_stop() {
        let fx = fixture(30, 10_000);
        let (conn_x, _rx_x) = fx.member("user-x", "conv:7");
        let (_conn_y, mut rx_y) = fx.member("user-y", "conv:7");

        fx.tracker
            .start_typing("conv:7", "user-x", "Xavier", &conn_x)
            .await
            .unwrap();
        assert_eq!(frame_kind(&rx_y.recv().await.unwrap()), "typing-start");

        sleep(Duration::from_millis(50)).await;
        let swept = fx.tracker.sweep().await;
        assert_eq!(swept, 1);
        assert_eq!(frame_kind(&rx_y.recv().await.unwrap()), "typing-stop");
    }

    #[tokio::test]
    async fn test_sweeper_task_stops_expired_entries() {
        let fx = fixture(30, 20);
        let (conn_x, _rx_x) = fx.member("user-x", "conv:7");
        let (_conn_y, mut rx_y) = fx.member("user-y", "conv:7");

        let sweeper = fx.tracker.start_sweeper();
        fx.tracker
            .start_typing("conv:7", "user-x", "Xavier", &conn_x)
            .await
            .unwrap();
        assert_eq!(frame_kind(&rx_y.recv().await.unwrap()), "typing-start");

        // Within expiry + one sweep interval the stop must arrive
        let stop = tokio::time::timeout(Duration::from_millis(200), rx_y.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame_kind(&stop), "typing-stop");

        sweeper.shutdown().await;
    }

    #[tokio::test]
    async fn test_clear_user_broadcasts_stop_for_every_room() {
        let fx = fixture(10_000, 10_000);
        let (conn_x, _rx_x) = fx.member("user-x", "conv:7");
        fx.rooms
            .join("user-x", &conn_x, "conv:8", RoomKind::Conversation, true)
            .unwrap();
        let (_conn_y, mut rx_y) = fx.member("user-y", "conv:7");
        let (_conn_z, mut rx_z) = fx.member("user-z", "conv:8");

        fx.tracker
            .start_typing("conv:7", "user-x", "Xavier", &conn_x)
            .await
            .unwrap();
        fx.tracker
            .start_typing("conv:8", "user-x", "Xavier", &conn_x)
            .await
            .unwrap();
        assert_eq!(frame_kind(&rx_y.recv().await.unwrap()), "typing-start");
        assert_eq!(frame_kind(&rx_z.recv().await.unwrap()), "typing-start");

        fx.tracker.clear_user("user-x").await;

        assert_eq!(frame_kind(&rx_y.recv().await.unwrap()), "typing-stop");
        assert_eq!(frame_kind(&rx_z.recv().await.unwrap()), "typing-stop");
        assert!(fx.tracker.typing_in("conv:7").is_empty());
        assert!(fx.tracker.typing_in("conv:8").is_empty());
    }
}
