//! Event router
//!
//! The router owns no persistent state: it resolves a target selector
//! against the room manager and connection registry, then fans the event out
//! to every resolved connection. Delivery is best-effort per target: one
//! dead or slow connection never aborts delivery to the rest, and never
//! surfaces as a dispatch failure.
//!
//! Ordering: dispatches to the same room are serialized on a per-room
//! sequencing lock, so two events sent by one connection into one room reach
//! every member in dispatch order. Different rooms proceed fully in
//! parallel.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::config::RealtimeConfig;
use crate::connection::Outbound;
use crate::error::{ClasswireError, Result};
use crate::event::{Event, EventKind, Target};
use crate::registry::ConnectionRegistry;
use crate::rooms::RoomManager;

/// Per-dispatch delivery summary
///
/// Purely observational: dropped and failed targets have already been logged
/// and (for fatal overflows) disconnected by the time this is returned.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    /// Targets the event was enqueued for
    pub delivered: usize,
    /// Droppable events shed for saturated connections
    pub dropped: usize,
    /// Targets that could not be written (gone mid-dispatch, or overflowed)
    pub failed: usize,
}

/// Routes events from sources to target connection sets
pub struct EventRouter {
    registry: Arc<ConnectionRegistry>,
    rooms: Arc<RoomManager>,
    /// Per-room sequencing locks guarding the enqueue phase of a dispatch
    sequencers: DashMap<String, Arc<Mutex<()>>>,
    config: RealtimeConfig,
    total_dispatches: AtomicU64,
}

impl EventRouter {
    pub fn new(
        config: RealtimeConfig,
        registry: Arc<ConnectionRegistry>,
        rooms: Arc<RoomManager>,
    ) -> Self {
        Self {
            registry,
            rooms,
            sequencers: DashMap::new(),
            config,
            total_dispatches: AtomicU64::new(0),
        }
    }

    /// Dispatch an event originating from a client connection.
    ///
    /// Message-kind events require the source to be a member of the target
    /// room. Echo suppression excludes the source connection for the kinds
    /// that declare it; everything else (including messages) is delivered to
    /// all of the sender's own connections so other open tabs stay in sync.
    pub async fn dispatch(
        &self,
        source_conn_id: &str,
        target: Target,
        event: Event,
    ) -> Result<DispatchOutcome> {
        if self.registry.get(source_conn_id).is_none() {
            return Err(ClasswireError::unknown_connection(source_conn_id));
        }

        if event.kind == EventKind::Message {
            if let Target::Room(ref room_id) = target {
                if !self.rooms.is_member(room_id, source_conn_id) {
                    return Err(ClasswireError::not_a_member(source_conn_id, room_id));
                }
            }
        }

        let exclude = event.kind.echo_suppressed().then(|| source_conn_id.to_string());
        self.deliver(target, event, exclude.as_deref()).await
    }

    /// Dispatch a server-originated event (sweeper timeouts, presence lists,
    /// announcements). No source connection, no membership check, no echo
    /// suppression.
    pub async fn dispatch_from_server(&self, target: Target, event: Event) -> Result<DispatchOutcome> {
        self.deliver(target, event, None).await
    }

    pub fn total_dispatches(&self) -> u64 {
        self.total_dispatches.load(Ordering::Relaxed)
    }

    async fn deliver(
        &self,
        target: Target,
        event: Event,
        exclude: Option<&str>,
    ) -> Result<DispatchOutcome> {
        self.total_dispatches.fetch_add(1, Ordering::Relaxed);

        let frame = serde_json::to_string(&event)
            .map_err(|e| ClasswireError::internal(format!("event serialization failed: {}", e)))?;

        // Hold the room's sequencing lock across the enqueue loop so that
        // same-room dispatches cannot interleave their enqueues.
        let sequencer = match target {
            Target::Room(ref room_id) => Some(self.room_sequencer(room_id)),
            _ => None,
        };
        let _guard = match sequencer {
            Some(ref seq) => Some(seq.lock().await),
            None => None,
        };

        let target_ids: Vec<String> = match target {
            Target::Room(ref room_id) => {
                let members = self.rooms.members_of(room_id);
                if members.is_empty() {
                    self.sequencers.remove(room_id);
                }
                members
            }
            Target::User(ref user_id) => self.registry.connections_of(user_id),
            Target::Connection(ref conn_id) => vec![conn_id.clone()],
            Target::All => self.registry.all_connection_ids(),
        };

        let mut outcome = DispatchOutcome::default();
        let mut overflowed: Vec<String> = Vec::new();

        for conn_id in target_ids {
            if exclude == Some(conn_id.as_str()) {
                continue;
            }

            let conn = match self.registry.get(&conn_id) {
                Some(conn) => conn,
                None => {
                    // Disconnected mid-dispatch; expected race
                    tracing::debug!(conn_id = %conn_id, "target gone during dispatch");
                    outcome.failed += 1;
                    continue;
                }
            };

            if event.kind.droppable() {
                match conn.try_send(Outbound::Frame(frame.clone())) {
                    Ok(()) => outcome.delivered += 1,
                    Err(ClasswireError::QueueOverflow(_)) => {
                        // Latest-state-wins: shed for the slow consumer
                        tracing::debug!(conn_id = %conn_id, kind = ?event.kind, "dropped event for saturated connection");
                        outcome.dropped += 1;
                    }
                    Err(_) => outcome.failed += 1,
                }
            } else {
                match conn
                    .send_timeout(Outbound::Frame(frame.clone()), self.config.connection_write_timeout())
                    .await
                {
                    Ok(()) => outcome.delivered += 1,
                    Err(ClasswireError::QueueOverflow(_)) => {
                        tracing::warn!(conn_id = %conn_id, kind = ?event.kind, "outbound queue overflow, disconnecting");
                        outcome.failed += 1;
                        overflowed.push(conn_id);
                    }
                    Err(_) => {
                        tracing::debug!(conn_id = %conn_id, "target closed during dispatch");
                        outcome.failed += 1;
                    }
                }
            }
        }

        drop(_guard);

        // Overflow on a non-droppable event is fatal for that one connection
        for conn_id in overflowed {
            self.registry.deregister(&conn_id);
        }

        Ok(outcome)
    }

    fn room_sequencer(&self, room_id: &str) -> Arc<Mutex<()>> {
        self.sequencers
            .entry(room_id.to_string())
            .or_default()
            .clone()
    }
}
