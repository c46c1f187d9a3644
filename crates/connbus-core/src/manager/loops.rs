//! The accept, send and receive loops.
//!
//! Each loop waits with the configured poll timeout and re-checks the shutdown
//! token between waits. A timeout is the normal idle outcome, not an error.

use super::stats::StatsCounters;
use super::Shared;
use crate::message::Message;
use crate::net::listener::accept_one;
use crate::net::Connection;
use crate::BusError;
use futures::future::{select_all, FutureExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Accept inbound connections until shutdown.
///
/// Owns the listener; it is closed when the loop returns.
pub(crate) async fn accept_loop(shared: Arc<Shared>, listener: TcpListener) {
    info!("Accept loop started");
    let config = &shared.config;

    while !shared.shutdown.is_cancelled() {
        let accepted = accept_one(
            &listener,
            config.poll_timeout,
            &config.name,
            config.codec.clone(),
            config.max_frame_size,
            config.handshake_timeout,
        )
        .await;

        match accepted {
            Ok(None) => {}
            Ok(Some(conn)) => {
                let conn = Arc::new(conn);
                match shared.registry.register(conn.clone()) {
                    Ok(_) => {
                        StatsCounters::incr(&shared.stats.connections_accepted);
                        info!(
                            peer = conn.peer_name().unwrap_or_default(),
                            addr = %conn.peer_addr(),
                            "New connection accepted"
                        );
                    }
                    Err(e) => {
                        warn!("Discarding accepted connection: {}", e);
                        conn.close().await;
                    }
                }
            }
            Err(e @ BusError::Handshake { .. }) => {
                StatsCounters::incr(&shared.stats.handshake_failures);
                warn!("Discarding inbound connection: {}", e);
            }
            Err(e) => {
                error!("Accept failed: {}", e);
                // Back off so a persistent error (e.g. out of descriptors)
                // does not spin.
                idle(&shared, config.poll_timeout).await;
            }
        }
    }

    drop(listener);
    info!("Accept loop stopped, listener closed");
}

/// Drain the outbound queue until shutdown.
pub(crate) async fn send_loop(shared: Arc<Shared>, mut outbound: mpsc::UnboundedReceiver<Message>) {
    info!("Send loop started");

    while !shared.shutdown.is_cancelled() {
        let message = match tokio::time::timeout(shared.config.poll_timeout, outbound.recv()).await {
            Ok(Some(message)) => message,
            Ok(None) => break,
            Err(_) => continue,
        };
        deliver_outbound(&shared, message).await;
    }

    info!("Send loop stopped");
}

async fn deliver_outbound(shared: &Shared, message: Message) {
    let Some(conn) = shared.registry.lookup(&message.target) else {
        StatsCounters::incr(&shared.stats.routing_failures);
        let err = BusError::Routing {
            target: message.target.clone(),
        };
        error!(id = %message.id(), "{}", err);
        return;
    };

    let write_timeout = shared.config.write_timeout;
    let result = tokio::select! {
        sent = tokio::time::timeout(write_timeout, conn.send_message(&message)) => match sent {
            Ok(result) => result,
            Err(_) => Err(BusError::Io {
                message: format!("write did not complete within {:?}", write_timeout),
                source: None,
            }),
        },
        _ = shared.shutdown.cancelled() => {
            debug!(id = %message.id(), "Send abandoned for shutdown");
            return;
        }
    };

    match result {
        Ok(()) => {
            StatsCounters::incr(&shared.stats.messages_sent);
            debug!(
                id = %message.id(),
                target = %message.target,
                queue = %message.target_qname,
                "Message sent"
            );
        }
        Err(e) => {
            StatsCounters::incr(&shared.stats.send_failures);
            warn!(id = %message.id(), target = %message.target, "Send failed, message dropped: {}", e);
            // A timed-out write may have left half a frame on the wire.
            if e.is_disconnect() {
                drop_connection(shared, &conn).await;
            }
        }
    }
}

/// Read from every registered connection until shutdown.
pub(crate) async fn receive_loop(shared: Arc<Shared>) {
    info!("Receive loop started");
    let poll = shared.config.poll_timeout;

    while !shared.shutdown.is_cancelled() {
        let connections = shared.registry.snapshot();
        if connections.is_empty() {
            idle(&shared, poll).await;
            continue;
        }

        for conn in wait_ready(&connections, poll).await {
            handle_receive(&shared, conn).await;
        }
    }

    info!("Receive loop stopped");
}

/// Wait up to `timeout` for any connection to become ready, then return all
/// that are.
async fn wait_ready(connections: &[Arc<Connection>], timeout: Duration) -> Vec<Arc<Connection>> {
    let waits = connections.iter().map(|conn| Box::pin(conn.readiness()));
    // The losing readiness futures hold their read locks; they must be dropped
    // before probing below.
    let woke = tokio::time::timeout(timeout, select_all(waits)).await.is_ok();
    if !woke {
        return Vec::new();
    }

    connections
        .iter()
        .filter(|conn| conn.readiness().now_or_never().is_some())
        .cloned()
        .collect()
}

async fn handle_receive(shared: &Shared, conn: Arc<Connection>) {
    let peer = conn.peer_name().unwrap_or_default().to_string();

    // Never waits on the peer: only bytes already received are consumed.
    let read = conn.read_available().await;

    loop {
        match conn.next_message() {
            Ok(Some(message)) => {
                StatsCounters::incr(&shared.stats.messages_received);
                debug!(
                    id = %message.id(),
                    peer = %peer,
                    queue = %message.target_qname,
                    "Message received"
                );
                shared.queues.deliver(message);
            }
            Ok(None) => break,
            Err(e) if e.is_disconnect() => {
                warn!(peer = %peer, direction = %conn.direction(), "Dropping connection: {}", e);
                drop_connection(shared, &conn).await;
                return;
            }
            Err(e) => {
                warn!(peer = %peer, "Skipping undeliverable message: {}", e);
            }
        }
    }

    match read {
        Ok(Some(_)) => {}
        Ok(None) => {
            info!(peer = %peer, direction = %conn.direction(), "Peer disconnected");
            drop_connection(shared, &conn).await;
        }
        Err(e) => {
            warn!(peer = %peer, direction = %conn.direction(), "Dropping connection: {}", e);
            drop_connection(shared, &conn).await;
        }
    }
}

async fn drop_connection(shared: &Shared, conn: &Arc<Connection>) {
    if shared.registry.remove(conn) {
        StatsCounters::incr(&shared.stats.connections_dropped);
    }
    conn.close().await;
}

/// Sleep for `duration`, returning early on shutdown.
async fn idle(shared: &Shared, duration: Duration) {
    tokio::select! {
        _ = tokio::time::sleep(duration) => {}
        _ = shared.shutdown.cancelled() => {}
    }
}
