//! Centralized configuration for the connection bus.
//!
//! `BusConfig` holds the compile-time defaults; `ManagerConfig` is the
//! per-manager configuration captured at construction.

use crate::error::{BusError, Result};
use crate::net::protocol::{JsonCodec, PayloadCodec};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Default values shared by every manager.
pub struct BusConfig;

impl BusConfig {
    pub const DEFAULT_LISTEN_HOST: &'static str = "127.0.0.1";
    pub const DEFAULT_LISTEN_PORT: u16 = 12222;
    pub const DEFAULT_BACKLOG: u32 = 5;
    pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(500);
    pub const DEFAULT_QUEUE_NAME: &'static str = "main";
    /// Longest a single frame write may take before the peer is dropped.
    pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

    /// Largest frame a connection will accept from a peer.
    pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024; // 16MB
}

/// Configuration for a single `ConnectionManager`.
///
/// # Example
///
/// ```
/// use connbus_core::ManagerConfig;
/// use std::time::Duration;
///
/// let config = ManagerConfig::new("remote")
///     .enable_listener(true)
///     .listen_port(0)
///     .poll_timeout(Duration::from_millis(50));
/// assert!(config.validate().is_ok());
/// ```
#[derive(Clone)]
pub struct ManagerConfig {
    /// Identity announced to peers during the handshake.
    pub name: String,
    /// Whether to bind a listener and accept inbound connections.
    pub enable_listener: bool,
    pub listen_host: String,
    pub listen_port: u16,
    pub listen_backlog: u32,
    /// Timeout for every polling wait in the manager loops.
    pub poll_timeout: Duration,
    pub max_frame_size: usize,
    /// Upper bound on writing one frame. A peer that stops reading is
    /// disconnected once its socket buffer stays full this long.
    pub write_timeout: Duration,
    /// Upper bound on the identity handshake. `None` waits indefinitely.
    pub handshake_timeout: Option<Duration>,
    /// Serialization used for message frames.
    pub codec: Arc<dyn PayloadCodec>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            name: uuid::Uuid::new_v4().to_string(),
            enable_listener: false,
            listen_host: BusConfig::DEFAULT_LISTEN_HOST.to_string(),
            listen_port: BusConfig::DEFAULT_LISTEN_PORT,
            listen_backlog: BusConfig::DEFAULT_BACKLOG,
            poll_timeout: BusConfig::DEFAULT_POLL_TIMEOUT,
            max_frame_size: BusConfig::MAX_FRAME_SIZE,
            write_timeout: BusConfig::DEFAULT_WRITE_TIMEOUT,
            handshake_timeout: None,
            codec: Arc::new(JsonCodec),
        }
    }
}

impl fmt::Debug for ManagerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagerConfig")
            .field("name", &self.name)
            .field("enable_listener", &self.enable_listener)
            .field("listen_host", &self.listen_host)
            .field("listen_port", &self.listen_port)
            .field("listen_backlog", &self.listen_backlog)
            .field("poll_timeout", &self.poll_timeout)
            .field("max_frame_size", &self.max_frame_size)
            .field("write_timeout", &self.write_timeout)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("codec", &self.codec.name())
            .finish()
    }
}

impl ManagerConfig {
    /// Create a configuration with an explicit manager name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Enable or disable the inbound listener.
    ///
    /// Default: `false`
    pub fn enable_listener(mut self, enable: bool) -> Self {
        self.enable_listener = enable;
        self
    }

    /// Host the listener binds to.
    ///
    /// Default: `127.0.0.1`
    pub fn listen_host(mut self, host: impl Into<String>) -> Self {
        self.listen_host = host.into();
        self
    }

    /// Port the listener binds to. Use `0` for an OS-assigned port.
    ///
    /// Default: `12222`
    pub fn listen_port(mut self, port: u16) -> Self {
        self.listen_port = port;
        self
    }

    /// Default: `5`
    pub fn listen_backlog(mut self, backlog: u32) -> Self {
        self.listen_backlog = backlog;
        self
    }

    /// Default: 500ms
    pub fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Default: 16MB
    pub fn max_frame_size(mut self, max: usize) -> Self {
        self.max_frame_size = max;
        self
    }

    /// Default: 5s
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Bound the identity handshake.
    ///
    /// Default: no timeout
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = Some(timeout);
        self
    }

    /// Replace the message serialization.
    ///
    /// Default: [`JsonCodec`]
    pub fn codec(mut self, codec: Arc<dyn PayloadCodec>) -> Self {
        self.codec = codec;
        self
    }

    /// Check that the configuration can drive a manager.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(BusError::Config {
                message: "manager name must not be empty".to_string(),
            });
        }
        if self.poll_timeout.is_zero() {
            return Err(BusError::Config {
                message: "poll_timeout must be greater than zero".to_string(),
            });
        }
        if self.write_timeout.is_zero() {
            return Err(BusError::Config {
                message: "write_timeout must be greater than zero".to_string(),
            });
        }
        if self.max_frame_size == 0 {
            return Err(BusError::Config {
                message: "max_frame_size must be greater than zero".to_string(),
            });
        }
        if self.enable_listener && self.listen_backlog == 0 {
            return Err(BusError::Config {
                message: "listen_backlog must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_bus_config() {
        let config = ManagerConfig::default();
        assert!(!config.enable_listener);
        assert_eq!(config.listen_host, "127.0.0.1");
        assert_eq!(config.listen_port, 12222);
        assert_eq!(config.listen_backlog, 5);
        assert_eq!(config.poll_timeout, Duration::from_millis(500));
        assert_eq!(config.write_timeout, Duration::from_secs(5));
        assert!(config.handshake_timeout.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_names_are_unique() {
        let a = ManagerConfig::default();
        let b = ManagerConfig::default();
        assert_ne!(a.name, b.name);
        assert!(uuid::Uuid::parse_str(&a.name).is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_poll_timeout() {
        let config = ManagerConfig::new("a").poll_timeout(Duration::ZERO);
        assert!(matches!(config.validate(), Err(BusError::Config { .. })));
    }

    #[test]
    fn test_validate_rejects_zero_write_timeout() {
        let config = ManagerConfig::new("a").write_timeout(Duration::ZERO);
        assert!(matches!(config.validate(), Err(BusError::Config { .. })));
    }

    #[test]
    fn test_validate_rejects_empty_name() {
        let config = ManagerConfig::new("");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backlog_only_checked_when_listening() {
        let config = ManagerConfig::new("a").listen_backlog(0);
        assert!(config.validate().is_ok());
        assert!(config.enable_listener(true).validate().is_err());
    }

    #[test]
    fn test_debug_names_codec() {
        let debug = format!("{:?}", ManagerConfig::new("a"));
        assert!(debug.contains("codec: \"json\""));
    }
}
