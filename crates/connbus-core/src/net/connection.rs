//! A single live peer connection.
//!
//! # Thread Safety
//!
//! The read and write halves sit behind separate tokio `Mutex`es. In a running
//! manager only the receive loop reads and only the send loop writes, so the
//! locks are uncontended; they exist so a `Connection` can be shared through an
//! `Arc` between the registry and both loops.
//!
//! Inbound bytes are reassembled in a per-connection frame buffer, so a peer
//! that stops halfway through a frame never holds up a reader.

use super::protocol::{read_str, write_frame, write_str, FrameBuffer, PayloadCodec};
use crate::message::Message;
use crate::{BusError, Result};
use std::fmt;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, OnceLock};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, trace};

const READ_CHUNK_SIZE: usize = 16 * 1024;
const READ_BUDGET: usize = 256 * 1024;

/// Which side opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Dialed by this manager via `connect`.
    Local,
    /// Accepted by this manager's listener.
    Remote,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Local => "local",
            Direction::Remote => "remote",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An identified, framed connection to one peer.
pub struct Connection {
    local_name: String,
    peer_name: OnceLock<String>,
    direction: Direction,
    peer_addr: SocketAddr,
    reader: Mutex<Option<OwnedReadHalf>>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    inbound: StdMutex<FrameBuffer>,
    closed: AtomicBool,
    codec: Arc<dyn PayloadCodec>,
    max_frame_size: usize,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("local_name", &self.local_name)
            .field("peer_name", &self.peer_name.get())
            .field("direction", &self.direction)
            .field("peer_addr", &self.peer_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Connection {
    /// Wrap a connected socket. The peer is unidentified until
    /// [`handshake`](Self::handshake) completes.
    pub fn new(
        stream: TcpStream,
        local_name: impl Into<String>,
        direction: Direction,
        codec: Arc<dyn PayloadCodec>,
        max_frame_size: usize,
    ) -> Result<Self> {
        let peer_addr = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();

        Ok(Self {
            local_name: local_name.into(),
            peer_name: OnceLock::new(),
            direction,
            peer_addr,
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
            inbound: StdMutex::new(FrameBuffer::new(max_frame_size)),
            closed: AtomicBool::new(false),
            codec,
            max_frame_size,
        })
    }

    /// Exchange identities with the peer.
    ///
    /// Sends the local name, then waits for the peer's. Both sides send
    /// first, so a dial/accept pair always completes. Without a timeout a
    /// silent peer stalls this call indefinitely.
    pub async fn handshake(&self, timeout: Option<Duration>) -> Result<&str> {
        let exchange = self.exchange_names();
        let peer_name = match timeout {
            Some(limit) => tokio::time::timeout(limit, exchange)
                .await
                .map_err(|_| self.handshake_error(format!("no identity within {:?}", limit)))??,
            None => exchange.await?,
        };

        if peer_name.is_empty() {
            return Err(self.handshake_error("peer sent an empty name"));
        }

        debug!(
            peer = %peer_name,
            addr = %self.peer_addr,
            direction = %self.direction,
            "Identity handshake complete"
        );
        Ok(self.peer_name.get_or_init(|| peer_name).as_str())
    }

    async fn exchange_names(&self) -> Result<String> {
        {
            let mut writer = self.writer.lock().await;
            let writer = writer.as_mut().ok_or(BusError::ConnectionClosed)?;
            write_str(writer, &self.local_name)
                .await
                .map_err(|e| self.handshake_error(e.to_string()))?;
        }

        let mut reader = self.reader.lock().await;
        let reader = reader.as_mut().ok_or(BusError::ConnectionClosed)?;
        match read_str(reader, self.max_frame_size).await {
            Ok(Some(name)) => Ok(name),
            Ok(None) => Err(self.handshake_error("peer closed before sending its name")),
            Err(BusError::Handshake { message, .. }) => Err(self.handshake_error(message)),
            Err(e) => Err(self.handshake_error(e.to_string())),
        }
    }

    fn handshake_error(&self, message: impl Into<String>) -> BusError {
        BusError::Handshake {
            message: message.into(),
            addr: Some(self.peer_addr),
        }
    }

    /// Encode a message and write it as one frame.
    pub async fn send_message(&self, message: &Message) -> Result<()> {
        let payload = self.codec.encode(message)?;

        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut().ok_or(BusError::ConnectionClosed)?;
        write_frame(writer, &payload).await?;

        trace!(peer = ?self.peer_name(), bytes = payload.len(), "Frame written");
        Ok(())
    }

    /// Read and decode one message, waiting as long as it takes.
    ///
    /// Returns `None` when the peer has closed the stream.
    pub async fn receive_message(&self) -> Result<Option<Message>> {
        loop {
            if let Some(message) = self.next_message()? {
                return Ok(Some(message));
            }
            match self.read_available().await? {
                None => return self.next_message(),
                Some(0) => self.readiness().await,
                Some(_) => {}
            }
        }
    }

    /// Move the bytes the socket has ready into the frame buffer without
    /// waiting for more.
    ///
    /// Returns the number of bytes taken (`Some(0)` when nothing was ready) or
    /// `None` at end-of-stream. Frames completed by the read are left for
    /// [`next_message`](Self::next_message), also after end-of-stream.
    pub async fn read_available(&self) -> Result<Option<usize>> {
        let reader = self.reader.lock().await;
        let reader = reader.as_ref().ok_or(BusError::ConnectionClosed)?;

        let mut chunk = [0u8; READ_CHUNK_SIZE];
        let mut total = 0;
        // Bounded per call so a single busy peer cannot starve the others.
        while total < READ_BUDGET {
            match reader.try_read(&mut chunk) {
                Ok(0) => {
                    let pending = self.frames().pending();
                    if pending > 0 {
                        debug!(peer = ?self.peer_name(), pending, "Peer closed mid-frame");
                    }
                    return Ok(None);
                }
                Ok(n) => {
                    self.frames().extend(&chunk[..n]);
                    total += n;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        trace!(peer = ?self.peer_name(), bytes = total, "Socket drained");
        Ok(Some(total))
    }

    /// Decode the next complete buffered message, if any.
    pub fn next_message(&self) -> Result<Option<Message>> {
        match self.frames().next_frame()? {
            Some(bytes) => self.codec.decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    fn frames(&self) -> MutexGuard<'_, FrameBuffer> {
        self.inbound.lock().expect("frame buffer lock poisoned")
    }

    /// Wait until the connection is readable, at end-of-stream, or failed.
    ///
    /// No bytes are consumed, so the future can be dropped at any point. A
    /// closed connection is reported ready immediately so that the next read
    /// observes the closure.
    pub async fn readiness(&self) {
        let mut reader = self.reader.lock().await;
        if let Some(reader) = reader.as_mut() {
            let mut probe = [0u8; 1];
            // Data, EOF (0 bytes) and errors all count as ready.
            let _ = reader.peek(&mut probe).await;
        }
    }

    /// Release the socket. Safe to call more than once.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        self.reader.lock().await.take();

        debug!(peer = ?self.peer_name(), addr = %self.peer_addr, "Connection closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Peer identity, available once the handshake has completed.
    pub fn peer_name(&self) -> Option<&str> {
        self.peer_name.get().map(String::as_str)
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::protocol::{JsonCodec, LENGTH_PREFIX_SIZE};
    use tokio::net::TcpListener;

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, server) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), server.unwrap().0)
    }

    fn wrap(stream: TcpStream, name: &str, direction: Direction) -> Connection {
        Connection::new(stream, name, direction, Arc::new(JsonCodec), 1024 * 1024).unwrap()
    }

    async fn connected_pair() -> (Connection, Connection) {
        let (a, b) = socket_pair().await;
        let local = wrap(a, "local", Direction::Local);
        let remote = wrap(b, "remote", Direction::Remote);
        let (ra, rb) = tokio::join!(local.handshake(None), remote.handshake(None));
        ra.unwrap();
        rb.unwrap();
        (local, remote)
    }

    #[tokio::test]
    async fn test_handshake_exchanges_names() {
        let (local, remote) = connected_pair().await;

        assert_eq!(local.peer_name(), Some("remote"));
        assert_eq!(remote.peer_name(), Some("local"));
        assert_eq!(local.direction(), Direction::Local);
        assert_eq!(remote.direction(), Direction::Remote);
    }

    #[tokio::test]
    async fn test_peer_name_absent_before_handshake() {
        let (a, _b) = socket_pair().await;
        let conn = wrap(a, "local", Direction::Local);
        assert!(conn.peer_name().is_none());
    }

    #[tokio::test]
    async fn test_handshake_fails_when_peer_closes() {
        let (a, b) = socket_pair().await;
        drop(b);

        let conn = wrap(a, "local", Direction::Local);
        let result = conn.handshake(Some(Duration::from_secs(5))).await;
        assert!(matches!(result, Err(BusError::Handshake { .. })));
    }

    #[tokio::test]
    async fn test_handshake_timeout() {
        let (a, _silent) = socket_pair().await;

        let conn = wrap(a, "local", Direction::Local);
        let result = conn.handshake(Some(Duration::from_millis(50))).await;
        assert!(matches!(result, Err(BusError::Handshake { .. })));
    }

    #[tokio::test]
    async fn test_message_exchange() {
        let (local, remote) = connected_pair().await;

        let msg = Message::new("remote", "Hello world").with_source("local");
        local.send_message(&msg).await.unwrap();

        let received = remote.receive_message().await.unwrap().unwrap();
        assert_eq!(received, msg);
    }

    #[tokio::test]
    async fn test_readiness_resolves_when_data_arrives() {
        let (local, remote) = connected_pair().await;

        let pending = tokio::time::timeout(Duration::from_millis(50), remote.readiness()).await;
        assert!(pending.is_err(), "no data yet");

        local
            .send_message(&Message::new("remote", 1))
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), remote.readiness())
            .await
            .expect("connection should become readable");
        // Readiness must not consume the frame.
        assert!(remote.receive_message().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_partial_frame_is_buffered_without_blocking() {
        let (a, b) = socket_pair().await;
        let (_, mut raw) = a.into_split();
        let conn = wrap(b, "remote", Direction::Remote);

        let payload = JsonCodec.encode(&Message::new("remote", "split")).unwrap();
        let mut head = (payload.len() as u64).to_le_bytes().to_vec();
        head.extend_from_slice(&payload[..3]);
        raw.write_all(&head).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), conn.readiness())
            .await
            .expect("partial frame counts as ready");
        let read = tokio::time::timeout(Duration::from_secs(1), conn.read_available())
            .await
            .expect("draining never waits for the rest of a frame");
        assert!(read.unwrap().is_some_and(|n| n > 0 && n <= LENGTH_PREFIX_SIZE + 3));
        assert!(conn.next_message().unwrap().is_none());

        raw.write_all(&payload[3..]).await.unwrap();
        let message = conn.receive_message().await.unwrap().unwrap();
        assert_eq!(message.data, serde_json::json!("split"));
    }

    #[tokio::test]
    async fn test_peer_close_is_end_of_stream() {
        let (local, remote) = connected_pair().await;
        local.close().await;

        tokio::time::timeout(Duration::from_secs(5), remote.readiness())
            .await
            .expect("EOF counts as ready");
        assert!(remote.receive_message().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_blocks_io() {
        let (local, _remote) = connected_pair().await;

        local.close().await;
        local.close().await;

        assert!(local.is_closed());
        let send = local.send_message(&Message::new("remote", 1)).await;
        assert!(matches!(send, Err(BusError::ConnectionClosed)));
        let recv = local.receive_message().await;
        assert!(matches!(recv, Err(BusError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_garbage_frame_is_deserialization_error() {
        let (a, b) = socket_pair().await;
        let (_, mut raw) = a.into_split();
        let conn = wrap(b, "remote", Direction::Remote);

        write_frame(&mut raw, b"{not json").await.unwrap();

        let result = conn.receive_message().await;
        assert!(matches!(result, Err(BusError::Deserialization { .. })));
    }
}
