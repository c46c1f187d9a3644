//! Wire framing and message serialization.
//!
//! Every frame is an 8-byte little-endian length followed by the payload:
//!
//! ```text
//! [u64 LE: len][len bytes of payload]
//! ```
//!
//! The handshake frames a UTF-8 peer name; everything after it frames an
//! encoded [`Message`]. Read helpers return `Ok(None)` when the peer closes the
//! stream, including mid-frame.

use crate::message::Message;
use crate::{BusError, Result};
use std::io::ErrorKind;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Size of the length prefix on every frame.
pub const LENGTH_PREFIX_SIZE: usize = 8;

/// Serialization of messages into frame payloads.
pub trait PayloadCodec: Send + Sync + 'static {
    /// Short name used in logs and `Debug` output.
    fn name(&self) -> &'static str;

    fn encode(&self, message: &Message) -> Result<Vec<u8>>;

    fn decode(&self, bytes: &[u8]) -> Result<Message>;
}

/// JSON message encoding.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl PayloadCodec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode(&self, message: &Message) -> Result<Vec<u8>> {
        serde_json::to_vec(message).map_err(|e| BusError::Serialization {
            message: e.to_string(),
            source: Some(e),
        })
    }

    fn decode(&self, bytes: &[u8]) -> Result<Message> {
        serde_json::from_slice(bytes).map_err(|e| BusError::Deserialization {
            message: format!("invalid message frame: {}", e),
            source: Some(e),
        })
    }
}

/// Write an 8-byte little-endian length prefix.
pub async fn write_length<W: AsyncWriteExt + Unpin>(writer: &mut W, value: u64) -> Result<()> {
    writer.write_all(&value.to_le_bytes()).await?;
    Ok(())
}

/// Read an 8-byte little-endian length prefix.
///
/// Returns `None` if the stream ends before all 8 bytes arrive.
pub async fn read_length<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<u64>> {
    let mut len_buf = [0u8; LENGTH_PREFIX_SIZE];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => Ok(Some(u64::from_le_bytes(len_buf))),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Write a length-prefixed frame and flush it.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    write_length(writer, payload.len() as u64).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame.
///
/// A declared length above `max_size` is rejected before any allocation.
/// Returns `None` on end-of-stream at any point in the frame.
pub async fn read_frame<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    max_size: usize,
) -> Result<Option<Vec<u8>>> {
    let len = match read_length(reader).await? {
        Some(len) => len,
        None => return Ok(None),
    };

    if len > max_size as u64 {
        return Err(BusError::FrameTooLarge {
            size: len,
            max: max_size,
        });
    }

    let mut payload = vec![0u8; len as usize];
    match reader.read_exact(&mut payload).await {
        Ok(_) => Ok(Some(payload)),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Write a framed UTF-8 string.
pub async fn write_str<W: AsyncWriteExt + Unpin>(writer: &mut W, value: &str) -> Result<()> {
    write_frame(writer, value.as_bytes()).await
}

/// Read a framed UTF-8 string.
pub async fn read_str<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    max_size: usize,
) -> Result<Option<String>> {
    match read_frame(reader, max_size).await? {
        Some(bytes) => String::from_utf8(bytes)
            .map(Some)
            .map_err(|_| BusError::handshake("peer name is not valid UTF-8")),
        None => Ok(None),
    }
}

/// Reassembles frames from bytes that arrive in arbitrary chunks.
///
/// TCP reads may carry part of a frame, one frame, or several frames plus the
/// start of the next. Complete frames are taken from the front and any
/// partial frame stays buffered until more bytes arrive.
#[derive(Debug)]
pub struct FrameBuffer {
    buffer: Vec<u8>,
    max_size: usize,
}

impl FrameBuffer {
    pub fn new(max_size: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_size,
        }
    }

    /// Append received bytes.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Take the next complete frame payload, if one is buffered.
    ///
    /// A declared length above the maximum is an error as soon as the prefix
    /// is seen, so the oversized payload is never buffered.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>> {
        if self.buffer.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let mut len_buf = [0u8; LENGTH_PREFIX_SIZE];
        len_buf.copy_from_slice(&self.buffer[..LENGTH_PREFIX_SIZE]);
        let len = u64::from_le_bytes(len_buf);
        if len > self.max_size as u64 {
            return Err(BusError::FrameTooLarge {
                size: len,
                max: self.max_size,
            });
        }

        let end = LENGTH_PREFIX_SIZE + len as usize;
        if self.buffer.len() < end {
            return Ok(None);
        }

        let payload = self.buffer[LENGTH_PREFIX_SIZE..end].to_vec();
        self.buffer.drain(..end);
        Ok(Some(payload))
    }

    /// Bytes of an incomplete frame still waiting for the rest.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn test_length_prefix_is_little_endian() {
        let mut buf = Vec::new();
        write_length(&mut buf, 0x0102).await.unwrap();
        assert_eq!(buf, vec![0x02, 0x01, 0, 0, 0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn test_frame_layout() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"hello").await.unwrap();

        assert_eq!(buf.len(), LENGTH_PREFIX_SIZE + 5);
        assert_eq!(&buf[..8], &5u64.to_le_bytes());
        assert_eq!(&buf[8..], b"hello");
    }

    #[tokio::test]
    async fn test_frame_read_write_roundtrip() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"first").await.unwrap();
        write_frame(&mut buf, b"").await.unwrap();
        write_frame(&mut buf, b"third").await.unwrap();

        let mut cursor = Cursor::new(buf);
        assert_eq!(read_frame(&mut cursor, 64).await.unwrap(), Some(b"first".to_vec()));
        assert_eq!(read_frame(&mut cursor, 64).await.unwrap(), Some(Vec::new()));
        assert_eq!(read_frame(&mut cursor, 64).await.unwrap(), Some(b"third".to_vec()));
        assert_eq!(read_frame(&mut cursor, 64).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_read_empty_stream_returns_none() {
        let mut cursor = Cursor::new(Vec::<u8>::new());
        assert!(read_length(&mut cursor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_truncated_length_returns_none() {
        let mut cursor = Cursor::new(vec![5u8, 0, 0]);
        assert!(read_frame(&mut cursor, 64).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_truncated_payload_returns_none() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&10u64.to_le_bytes());
        buf.extend_from_slice(b"short");

        let mut cursor = Cursor::new(buf);
        assert!(read_frame(&mut cursor, 64).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_frame_returns_error() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&u64::MAX.to_le_bytes());
        buf.extend_from_slice(&[0u8; 8]);

        let mut cursor = Cursor::new(buf);
        let result = read_frame(&mut cursor, 1024).await;
        assert!(matches!(
            result,
            Err(BusError::FrameTooLarge { size: u64::MAX, max: 1024 })
        ));
    }

    #[tokio::test]
    async fn test_string_roundtrip() {
        let mut buf = Vec::new();
        write_str(&mut buf, "nœud-α").await.unwrap();

        let mut cursor = Cursor::new(buf);
        assert_eq!(
            read_str(&mut cursor, 64).await.unwrap().as_deref(),
            Some("nœud-α")
        );
    }

    #[tokio::test]
    async fn test_invalid_utf8_is_handshake_error() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &[0xff, 0xfe]).await.unwrap();

        let mut cursor = Cursor::new(buf);
        let result = read_str(&mut cursor, 64).await;
        assert!(matches!(result, Err(BusError::Handshake { .. })));
    }

    #[tokio::test]
    async fn test_frame_buffer_reassembles_split_frames() {
        let mut wire = Vec::new();
        write_frame(&mut wire, b"first").await.unwrap();
        write_frame(&mut wire, b"second").await.unwrap();

        let mut frames = FrameBuffer::new(64);
        // Deliver one byte short of the first frame, then the rest.
        frames.extend(&wire[..12]);
        assert_eq!(frames.next_frame().unwrap(), None);
        assert_eq!(frames.pending(), 12);

        frames.extend(&wire[12..]);
        assert_eq!(frames.next_frame().unwrap(), Some(b"first".to_vec()));
        assert_eq!(frames.next_frame().unwrap(), Some(b"second".to_vec()));
        assert_eq!(frames.next_frame().unwrap(), None);
        assert_eq!(frames.pending(), 0);
    }

    #[test]
    fn test_frame_buffer_rejects_oversized_prefix() {
        let mut frames = FrameBuffer::new(16);
        frames.extend(&1000u64.to_le_bytes());
        assert!(matches!(
            frames.next_frame(),
            Err(BusError::FrameTooLarge { size: 1000, max: 16 })
        ));
    }

    #[test]
    fn test_json_codec_roundtrip() {
        let codec = JsonCodec;
        let msg = Message::new("remote", serde_json::json!({"k": [1, 2, 3]})).with_source("local");

        let bytes = codec.encode(&msg).unwrap();
        let decoded = codec.decode(&bytes).unwrap();

        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_json_codec_rejects_garbage() {
        let result = JsonCodec.decode(b"not valid json");
        assert!(matches!(result, Err(BusError::Deserialization { .. })));
    }
}
