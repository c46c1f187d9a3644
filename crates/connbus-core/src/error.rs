//! Error types for the connection bus.
//!
//! End-of-stream is deliberately absent: a peer closing its socket is the
//! normal disconnect signal and is reported as `Ok(None)` by the read paths.

use std::net::SocketAddr;
use thiserror::Error;

/// Main error type for connbus operations.
#[derive(Debug, Error)]
pub enum BusError {
    // Lifecycle errors
    #[error("Failed to bind listener on {addr}: {message}")]
    Bind {
        addr: String,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Invalid manager state: expected {expected}, found {actual}")]
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("Configuration error: {message}")]
    Config { message: String },

    // Connection errors
    #[error("Failed to connect to {host}:{port}: {message}")]
    Connect {
        host: String,
        port: u16,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Identity handshake failed{}: {message}", peer_suffix(.addr))]
    Handshake {
        message: String,
        addr: Option<SocketAddr>,
    },

    #[error("Connection is closed")]
    ConnectionClosed,

    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    // Framing and payload errors
    #[error("Frame of {size} bytes exceeds maximum {max}")]
    FrameTooLarge { size: u64, max: usize },

    #[error("Failed to decode message: {message}")]
    Deserialization {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("Failed to encode message: {message}")]
    Serialization {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Routing errors
    #[error("Could not find connected target [{target}]")]
    Routing { target: String },
}

fn peer_suffix(addr: &Option<SocketAddr>) -> String {
    match addr {
        Some(addr) => format!(" with {}", addr),
        None => String::new(),
    }
}

/// Result type alias for connbus operations.
pub type Result<T> = std::result::Result<T, BusError>;

impl From<std::io::Error> for BusError {
    fn from(err: std::io::Error) -> Self {
        BusError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for BusError {
    fn from(err: serde_json::Error) -> Self {
        BusError::Deserialization {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl BusError {
    /// Create a handshake error without a known peer address.
    pub fn handshake(message: impl Into<String>) -> Self {
        BusError::Handshake {
            message: message.into(),
            addr: None,
        }
    }

    /// Whether this error leaves a connection unusable.
    ///
    /// The send and receive loops tear a connection down on any of these.
    /// Other errors only cost the message they occurred on.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            BusError::Io { .. }
                | BusError::ConnectionClosed
                | BusError::FrameTooLarge { .. }
                | BusError::Deserialization { .. }
        )
    }
}
