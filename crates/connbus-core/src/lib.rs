//! connbus core - a lightweight peer-to-peer TCP message bus.
//!
//! Every process runs a [`ConnectionManager`] that can listen for inbound
//! connections and dial outbound ones. Peers identify themselves by name in a
//! handshake, then exchange length-framed messages. Each received message is
//! placed on a local named queue chosen by the sender.
//!
//! # Example
//!
//! ```rust,ignore
//! use connbus_core::{ConnectionManager, ManagerConfig, Message};
//!
//! #[tokio::main]
//! async fn main() -> connbus_core::Result<()> {
//!     let remote = ConnectionManager::new(ManagerConfig::new("remote").enable_listener(true))?;
//!     remote.start().await?;
//!
//!     let local = ConnectionManager::new(ManagerConfig::new("local"))?;
//!     local.start().await?;
//!     local.connect("localhost", 12222).await?;
//!
//!     local.send(Message::new("remote", "Hello world"))?;
//!     let request = remote.get_queue("main").recv().await;
//!     remote.send(request.create_reply("Hello to you too!"))?;
//!
//!     let reply = local.get_queue("main").recv().await;
//!     println!("{}", reply.data);
//!
//!     local.stop().await;
//!     remote.stop().await;
//!     Ok(())
//! }
//! ```

pub mod cancel;
pub mod config;
pub mod error;
pub mod manager;
pub mod message;
pub mod net;
pub mod queue;
pub mod registry;

// Re-export commonly used types
pub use config::{BusConfig, ManagerConfig};
pub use error::{BusError, Result};
pub use manager::stats::ManagerStats;
pub use manager::{ConnectionManager, ManagerState};
pub use message::Message;
pub use net::{Connection, Direction, JsonCodec, PayloadCodec};
pub use queue::MessageQueue;
pub use registry::PeerInfo;
