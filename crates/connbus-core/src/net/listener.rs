//! Listener setup and inbound connection acceptance.

use super::connection::{Connection, Direction};
use super::protocol::PayloadCodec;
use crate::{BusError, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket};
use tracing::info;

/// Resolve `host:port` and bind a listening socket with the given backlog.
pub async fn bind_listener(host: &str, port: u16, backlog: u32) -> Result<TcpListener> {
    let label = format!("{}:{}", host, port);
    let bind_error = |message: String, source: Option<std::io::Error>| BusError::Bind {
        addr: label.clone(),
        message,
        source,
    };

    let addr = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| bind_error(format!("cannot resolve host: {}", e), Some(e)))?
        .next()
        .ok_or_else(|| bind_error("host resolved to no addresses".to_string(), None))?;

    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4(),
        SocketAddr::V6(_) => TcpSocket::new_v6(),
    }
    .map_err(|e| bind_error(e.to_string(), Some(e)))?;

    socket
        .set_reuseaddr(true)
        .map_err(|e| bind_error(e.to_string(), Some(e)))?;
    socket
        .bind(addr)
        .map_err(|e| bind_error(e.to_string(), Some(e)))?;
    let listener = socket
        .listen(backlog)
        .map_err(|e| bind_error(e.to_string(), Some(e)))?;

    info!(
        "Listener bound on {}",
        listener.local_addr().map(|a| a.to_string()).unwrap_or_else(|_| label.clone())
    );
    Ok(listener)
}

/// Wait up to `timeout` for one inbound connection and identify it.
///
/// Returns `Ok(None)` when the wait times out, which is the normal idle
/// outcome. Handshake failures are returned to the caller, who discards that
/// single attempt.
pub async fn accept_one(
    listener: &TcpListener,
    timeout: Duration,
    local_name: &str,
    codec: Arc<dyn PayloadCodec>,
    max_frame_size: usize,
    handshake_timeout: Option<Duration>,
) -> Result<Option<Connection>> {
    let (stream, _peer_addr) = match tokio::time::timeout(timeout, listener.accept()).await {
        Ok(accepted) => accepted?,
        Err(_) => return Ok(None),
    };

    let conn = Connection::new(stream, local_name, Direction::Remote, codec, max_frame_size)?;
    if let Err(e) = conn.handshake(handshake_timeout).await {
        conn.close().await;
        return Err(e);
    }
    Ok(Some(conn))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::protocol::{read_str, write_str, JsonCodec};
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn test_bind_assigns_port() {
        let listener = bind_listener("127.0.0.1", 0, 5).await.unwrap();
        let addr = listener.local_addr().unwrap();
        assert!(addr.port() > 0);
        assert_eq!(addr.ip(), std::net::Ipv4Addr::LOCALHOST);
    }

    #[tokio::test]
    async fn test_bind_conflict_is_bind_error() {
        let first = bind_listener("127.0.0.1", 0, 5).await.unwrap();
        let port = first.local_addr().unwrap().port();

        let second = bind_listener("127.0.0.1", port, 5).await;
        assert!(matches!(second, Err(BusError::Bind { .. })));
    }

    #[tokio::test]
    async fn test_accept_times_out_quietly() {
        let listener = bind_listener("127.0.0.1", 0, 5).await.unwrap();
        let result = accept_one(
            &listener,
            Duration::from_millis(20),
            "remote",
            Arc::new(JsonCodec),
            1024,
            None,
        )
        .await
        .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_accept_performs_handshake() {
        let listener = bind_listener("127.0.0.1", 0, 5).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            write_str(&mut stream, "dialer").await.unwrap();
            read_str(&mut stream, 1024).await.unwrap()
        });

        let conn = accept_one(
            &listener,
            Duration::from_secs(5),
            "remote",
            Arc::new(JsonCodec),
            1024,
            None,
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(conn.peer_name(), Some("dialer"));
        assert_eq!(conn.direction(), Direction::Remote);
        assert_eq!(client.await.unwrap().as_deref(), Some("remote"));
    }

    #[tokio::test]
    async fn test_accept_reports_failed_handshake() {
        let listener = bind_listener("127.0.0.1", 0, 5).await.unwrap();
        let addr = listener.local_addr().unwrap();

        // Connect and hang up without identifying.
        drop(TcpStream::connect(addr).await.unwrap());

        let result = accept_one(
            &listener,
            Duration::from_secs(5),
            "remote",
            Arc::new(JsonCodec),
            1024,
            Some(Duration::from_secs(5)),
        )
        .await;
        assert!(matches!(result, Err(BusError::Handshake { .. })));
    }
}
