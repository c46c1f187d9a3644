//! Outbound connection establishment.

use super::connection::{Connection, Direction};
use super::protocol::PayloadCodec;
use crate::{BusError, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

/// Dial `host:port`, wrap the socket, and complete the identity handshake.
///
/// Every failure is returned: `Connect` when the socket cannot be opened,
/// `Handshake` when the identity exchange fails.
pub async fn dial(
    host: &str,
    port: u16,
    local_name: &str,
    codec: Arc<dyn PayloadCodec>,
    max_frame_size: usize,
    handshake_timeout: Option<Duration>,
) -> Result<Connection> {
    let stream = TcpStream::connect((host, port))
        .await
        .map_err(|e| BusError::Connect {
            host: host.to_string(),
            port,
            message: e.to_string(),
            source: Some(e),
        })?;

    debug!("Dialed {}:{}", host, port);

    let conn = Connection::new(stream, local_name, Direction::Local, codec, max_frame_size)?;
    if let Err(e) = conn.handshake(handshake_timeout).await {
        conn.close().await;
        return Err(e);
    }
    Ok(conn)
}
