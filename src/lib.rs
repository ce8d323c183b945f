//! Classwire - real-time presence and fan-out for school platforms
//!
//! Classwire is the realtime layer of a multi-tenant school-management
//! platform, built on Axum and Tokio: it tracks which users are connected,
//! routes per-conversation events (messages, typing, read receipts) to the
//! right connections, and broadcasts class-wide and tenant-wide events
//! (announcements, live-class notifications, presence lists).
//!
//! # Features
//!
//! - **Connection registry**: multi-tab presence with offline grace windows
//! - **Rooms**: conversation, class-section, tenant and role broadcast scopes
//! - **Event router**: per-room FIFO ordering, echo suppression, bounded
//!   backpressure with latest-state-wins shedding for ephemeral events
//! - **Typing indicators**: automatic expiry with a background sweeper
//! - **Presence broadcasts**: tenant-scoped, coalesced online-user lists
//! - **Transport**: one Axum WebSocket route per deployment
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use classwire::{Hub, RealtimeConfig, realtime_routes};
//!
//! #[tokio::main]
//! async fn main() {
//!     // Initialize logging
//!     classwire::init_tracing();
//!
//!     let config = RealtimeConfig::from_env();
//!     let hub = Hub::builder().with_config(config).build();
//!
//!     // Mount the realtime route into the platform's router; auth
//!     // middleware inserts the ConnectionIdentity extension upstream.
//!     let app: axum::Router = realtime_routes("/realtime", hub);
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:8000").await.unwrap();
//!     axum::serve(listener, app).await.unwrap();
//! }
//! ```

mod config;
mod connection;
mod error;
mod event;
mod hub;
mod presence;
mod registry;
mod rooms;
mod router;
mod traits;
mod transport;
mod typing;
pub mod utils;

// Re-exports for public API
pub use config::{RealtimeConfig, RealtimeConfigBuilder};
pub use connection::{Connection, ConnectionIdentity, Outbound};
pub use error::{ClasswireError, Rejection, Result};
pub use event::{ClientEvent, Event, EventKind, Target};
pub use hub::{Hub, HubBuilder};
pub use presence::{role_room, tenant_room, BroadcasterHandle, PresenceBroadcaster};
pub use registry::{ConnectionRegistry, Deregistered, PresenceChange, RegistryMetrics};
pub use rooms::{RoomKind, RoomManager};
pub use router::{DispatchOutcome, EventRouter};
pub use traits::{AllowAll, JoinPolicy, MessageStore};
pub use transport::realtime_routes;
pub use typing::{SweeperHandle, TypingTracker, TypingUser};

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing/logging with sensible defaults
///
/// This should be called early in your application, typically in main()
/// before building the Hub.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Set log level (e.g., "info", "debug", "classwire=debug")
/// - `CLASSWIRE_LOG_JSON`: Set to "true" for JSON formatted logs
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let json_logs = std::env::var("CLASSWIRE_LOG_JSON")
        .map(|v| v.parse::<bool>().unwrap_or(false))
        .unwrap_or(false);

    if json_logs {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}
