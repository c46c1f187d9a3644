//! TCP transport for the bus.
//!
//! Length-prefixed frames over plain TCP sockets. Every connection starts with
//! an identity handshake (each side sends its name, then reads the peer's) and
//! afterwards carries encoded messages only.
//!
//! # Architecture
//!
//! - **Protocol**: framing primitives and the pluggable payload codec
//! - **Connection**: one identified socket with framed message I/O
//! - **Listener**: binding and accepting inbound connections
//! - **Dial**: opening outbound connections

pub mod connection;
pub mod dial;
pub mod listener;
pub mod protocol;

pub use connection::{Connection, Direction};
pub use protocol::{JsonCodec, PayloadCodec};
