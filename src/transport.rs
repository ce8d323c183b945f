//! WebSocket transport adapter
//!
//! Bridges one axum WebSocket upgrade to the hub: registers the connection,
//! pumps the bounded outbound queue into the socket, parses inbound frames
//! into client events, and keeps the connection honest with a ping/pong
//! heartbeat. The subsystem itself only ever sees "send event, receive
//! event, detect disconnect".
//!
//! Identity is read from request extensions; the platform's auth middleware
//! inserts a [`ConnectionIdentity`] after validating credentials upstream.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    Extension, Router,
    extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
    routing::get,
};
use futures::{SinkExt, StreamExt};
use tokio::time::Duration;

use crate::connection::{ConnectionIdentity, Outbound};
use crate::error::ClasswireError;
use crate::event::ClientEvent;
use crate::hub::Hub;

/// Create the realtime WebSocket route
///
/// # Example
///
/// ```rust,no_run
/// use classwire::{Hub, realtime_routes};
///
/// # async fn build() {
/// let hub = Hub::builder().build();
/// let app: axum::Router = realtime_routes("/realtime", hub);
/// # }
/// ```
pub fn realtime_routes(path: &str, hub: Arc<Hub>) -> Router {
    Router::new().route(
        path,
        get(
            move |upgrade: WebSocketUpgrade, Extension(identity): Extension<ConnectionIdentity>| {
                let hub = hub.clone();
                async move {
                    upgrade.on_upgrade(move |socket| handle_socket(socket, hub, identity))
                }
            },
        ),
    )
}

/// Drive one WebSocket connection for its lifetime
async fn handle_socket(socket: WebSocket, hub: Arc<Hub>, identity: ConnectionIdentity) {
    let (conn_id, mut outbound_rx) = match hub.connect(identity).await {
        Ok(registered) => registered,
        Err(e) => {
            tracing::warn!(error = %e, "connection refused");
            let mut socket = socket;
            let _ = socket.send(WsMessage::Close(None)).await;
            return;
        }
    };

    let (mut ws_sender, mut ws_receiver) = socket.split();

    let heartbeat_interval = Duration::from_secs(hub.config().heartbeat_interval_secs);
    let heartbeat_timeout = Duration::from_secs(hub.config().heartbeat_timeout_secs);
    let write_timeout = hub.config().connection_write_timeout();
    let last_pong = Arc::new(tokio::sync::RwLock::new(Instant::now()));

    // Heartbeat: ping on an interval, give up when pongs stop coming
    let heartbeat_task = {
        let hub = hub.clone();
        let conn_id = conn_id.clone();
        let last_pong = last_pong.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(heartbeat_interval);
            interval.tick().await;
            loop {
                interval.tick().await;

                if last_pong.read().await.elapsed() > heartbeat_timeout {
                    tracing::warn!(conn_id = %conn_id, "connection heartbeat timeout");
                    break;
                }

                match hub.registry().get(&conn_id) {
                    Some(conn) => {
                        let _ = conn.try_send(Outbound::Ping(Vec::new()));
                    }
                    None => break,
                }
            }
        })
    };

    // Pump the outbound queue into the socket. Writes are bounded: a socket
    // that cannot take a frame within the timeout is treated as dead.
    let send_task = {
        let conn_id = conn_id.clone();
        tokio::spawn(async move {
            while let Some(item) = outbound_rx.recv().await {
                let msg = match item {
                    Outbound::Frame(text) => WsMessage::Text(text.into()),
                    Outbound::Ping(data) => WsMessage::Ping(data.into()),
                    Outbound::Pong(data) => WsMessage::Pong(data.into()),
                    Outbound::Close => {
                        let _ = ws_sender.send(WsMessage::Close(None)).await;
                        break;
                    }
                };

                match tokio::time::timeout(write_timeout, ws_sender.send(msg)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) => break,
                    Err(_) => {
                        tracing::warn!(conn_id = %conn_id, "socket write timed out");
                        break;
                    }
                }
            }
        })
    };

    // Parse inbound frames into client events
    let recv_task = {
        let hub = hub.clone();
        let conn_id = conn_id.clone();
        let last_pong = last_pong.clone();
        tokio::spawn(async move {
            while let Some(result) = ws_receiver.next().await {
                let msg = match result {
                    Ok(msg) => msg,
                    Err(e) => {
                        tracing::debug!(conn_id = %conn_id, error = %e, "socket receive error");
                        break;
                    }
                };

                match msg {
                    WsMessage::Text(text) => match serde_json::from_str::<ClientEvent>(text.as_str()) {
                        Ok(event) => hub.handle_client_event(&conn_id, event).await,
                        Err(e) => {
                            let err: ClasswireError = e.into();
                            hub.send_rejection(&conn_id, None, &err).await;
                        }
                    },
                    WsMessage::Ping(data) => {
                        if let Some(conn) = hub.registry().get(&conn_id) {
                            let _ = conn.try_send(Outbound::Pong(data.to_vec()));
                        }
                    }
                    WsMessage::Pong(_) => {
                        *last_pong.write().await = Instant::now();
                    }
                    WsMessage::Close(_) => break,
                    // Protocol is JSON text frames
                    WsMessage::Binary(_) => {}
                }
            }
        })
    };

    // First task to finish wins; the rest are torn down with it
    tokio::pin!(send_task);
    tokio::pin!(recv_task);
    tokio::pin!(heartbeat_task);

    tokio::select! {
        _ = send_task.as_mut() => {
            recv_task.abort();
            heartbeat_task.abort();
        }
        _ = recv_task.as_mut() => {
            send_task.abort();
            heartbeat_task.abort();
        }
        _ = heartbeat_task.as_mut() => {
            send_task.abort();
            recv_task.abort();
        }
    }

    // Deregistration is idempotent, so cleanup needs no coordination beyond
    // running it exactly here on every exit path
    hub.disconnect(&conn_id).await;
}
