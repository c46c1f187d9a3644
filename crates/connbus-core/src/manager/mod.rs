//! Connection manager: lifecycle, routing and the application-facing API.
//!
//! A manager moves through `Created → Initialized → Active → Stopped`:
//!
//! - `init()` binds the listener (when enabled). A bind failure leaves the
//!   manager in `Created`.
//! - `start()` runs `init()` and then spawns the accept (listener only), send
//!   and receive loops.
//! - `stop()` signals the loops, waits for them, and closes the listener and
//!   every connection. `Stopped` is terminal.
//!
//! # Thread Safety
//!
//! The registry, queue table and outbound channel are internally
//! synchronized and shared with the loops through an `Arc`. Lifecycle
//! transitions are serialized by an async mutex.

mod loops;
pub mod stats;

use crate::cancel::CancellationToken;
use crate::config::ManagerConfig;
use crate::message::Message;
use crate::net::dial::dial;
use crate::net::listener::bind_listener;
use crate::net::Connection;
use crate::queue::{MessageQueue, QueueTable};
use crate::registry::{ConnectionRegistry, PeerInfo};
use crate::{BusError, Result};
use stats::{ManagerStats, StatsCounters};
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock, RwLock};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, warn, Instrument};

/// Lifecycle state of a [`ConnectionManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    /// Configuration captured, no OS resources held.
    Created,
    /// Listener bound (or none required).
    Initialized,
    /// Loops running.
    Active,
    /// Shut down. Terminal.
    Stopped,
}

impl ManagerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ManagerState::Created => "Created",
            ManagerState::Initialized => "Initialized",
            ManagerState::Active => "Active",
            ManagerState::Stopped => "Stopped",
        }
    }
}

impl fmt::Display for ManagerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// State shared between the manager handle and its loops.
pub(crate) struct Shared {
    pub config: ManagerConfig,
    pub registry: ConnectionRegistry,
    pub queues: QueueTable,
    pub stats: StatsCounters,
    pub shutdown: CancellationToken,
}

struct LoopHandle {
    name: &'static str,
    handle: JoinHandle<()>,
}

/// Resources held between lifecycle transitions.
#[derive(Default)]
struct Lifecycle {
    listener: Option<TcpListener>,
    outbound_rx: Option<mpsc::UnboundedReceiver<Message>>,
    loops: Vec<LoopHandle>,
}

/// Owns the listener, the connection registry, the queue table and the
/// outbound queue of one bus participant.
///
/// # Example
///
/// ```rust,ignore
/// use connbus_core::{ConnectionManager, ManagerConfig, Message};
///
/// let remote = ConnectionManager::new(ManagerConfig::new("remote").enable_listener(true))?;
/// remote.start().await?;
///
/// let local = ConnectionManager::new(ManagerConfig::new("local"))?;
/// local.start().await?;
/// local.connect("127.0.0.1", 12222).await?;
///
/// local.send(Message::new("remote", "Hello world"))?;
/// let received = remote.get_queue("main").recv().await;
/// ```
pub struct ConnectionManager {
    shared: Arc<Shared>,
    outbound_tx: mpsc::UnboundedSender<Message>,
    lifecycle: Mutex<Lifecycle>,
    state: RwLock<ManagerState>,
    local_addr: OnceLock<SocketAddr>,
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("name", &self.name())
            .field("state", &self.state())
            .field("local_addr", &self.local_addr())
            .finish()
    }
}

impl ConnectionManager {
    /// Capture the configuration. No sockets are opened until `init`.
    pub fn new(config: ManagerConfig) -> Result<Self> {
        config.validate()?;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            config,
            registry: ConnectionRegistry::new(),
            queues: QueueTable::new(),
            stats: StatsCounters::default(),
            shutdown: CancellationToken::new(),
        });

        Ok(Self {
            shared,
            outbound_tx,
            lifecycle: Mutex::new(Lifecycle {
                outbound_rx: Some(outbound_rx),
                ..Lifecycle::default()
            }),
            state: RwLock::new(ManagerState::Created),
            local_addr: OnceLock::new(),
        })
    }

    /// Identity announced to peers.
    pub fn name(&self) -> &str {
        &self.shared.config.name
    }

    pub fn state(&self) -> ManagerState {
        *self.state.read().expect("state lock poisoned")
    }

    fn set_state(&self, state: ManagerState) {
        *self.state.write().expect("state lock poisoned") = state;
    }

    /// Address the listener is bound to, once initialized with a listener.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    fn span(&self) -> tracing::Span {
        info_span!("connection_manager", name = %self.name())
    }

    /// Bind the listener if one is enabled.
    ///
    /// Calling `init` on an initialized manager is a no-op. On a bind failure
    /// the error is logged and returned, and the manager stays in `Created`.
    pub async fn init(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        self.init_locked(&mut lifecycle).instrument(self.span()).await
    }

    async fn init_locked(&self, lifecycle: &mut Lifecycle) -> Result<()> {
        match self.state() {
            ManagerState::Created => {}
            ManagerState::Initialized => return Ok(()),
            actual => {
                return Err(BusError::InvalidState {
                    expected: ManagerState::Created.as_str(),
                    actual: actual.as_str(),
                })
            }
        }

        info!("Initializing connection manager");
        let config = &self.shared.config;
        if config.enable_listener {
            let listener =
                match bind_listener(&config.listen_host, config.listen_port, config.listen_backlog).await {
                    Ok(listener) => listener,
                    Err(e) => {
                        error!("Could not create listener: {}", e);
                        return Err(e);
                    }
                };
            if let Ok(addr) = listener.local_addr() {
                let _ = self.local_addr.set(addr);
            }
            info!("Created listener [{}] successfully", config.name);
            lifecycle.listener = Some(listener);
        }

        self.set_state(ManagerState::Initialized);
        Ok(())
    }

    /// Initialize and launch the manager loops.
    ///
    /// If initialization fails, partially acquired resources are released and
    /// the error is returned without entering `Active`.
    pub async fn start(&self) -> Result<()> {
        let span = self.span();
        let mut lifecycle = self.lifecycle.lock().await;

        match self.state() {
            ManagerState::Created | ManagerState::Initialized => {}
            actual => {
                return Err(BusError::InvalidState {
                    expected: ManagerState::Created.as_str(),
                    actual: actual.as_str(),
                })
            }
        }

        if let Err(e) = self.init_locked(&mut lifecycle).instrument(span.clone()).await {
            self.deinit_locked(&mut lifecycle).instrument(span).await;
            return Err(e);
        }

        let _entered = span.enter();
        let outbound_rx = lifecycle
            .outbound_rx
            .take()
            .ok_or(BusError::InvalidState {
                expected: ManagerState::Initialized.as_str(),
                actual: ManagerState::Active.as_str(),
            })?;

        if let Some(listener) = lifecycle.listener.take() {
            let handle = tokio::spawn(
                loops::accept_loop(self.shared.clone(), listener)
                    .instrument(info_span!(parent: &span, "accept_loop")),
            );
            lifecycle.loops.push(LoopHandle { name: "AcceptLoop", handle });
            info!("Started [AcceptLoop] task");
        }

        let handle = tokio::spawn(
            loops::receive_loop(self.shared.clone()).instrument(info_span!(parent: &span, "receive_loop")),
        );
        lifecycle.loops.push(LoopHandle { name: "ReceiveLoop", handle });
        info!("Started [ReceiveLoop] task");

        let handle = tokio::spawn(
            loops::send_loop(self.shared.clone(), outbound_rx)
                .instrument(info_span!(parent: &span, "send_loop")),
        );
        lifecycle.loops.push(LoopHandle { name: "SendLoop", handle });
        info!("Started [SendLoop] task");

        self.set_state(ManagerState::Active);
        Ok(())
    }

    /// Stop the loops and release every socket.
    ///
    /// Waits for each loop to observe shutdown, which takes at most one poll
    /// interval plus any in-flight handshake. Idempotent.
    pub async fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        if self.state() == ManagerState::Stopped {
            return;
        }

        self.shared.shutdown.cancel();
        // Closes the outbound channel so later sends fail.
        lifecycle.outbound_rx.take();
        self.deinit_locked(&mut lifecycle).instrument(self.span()).await;
        self.set_state(ManagerState::Stopped);
    }

    async fn deinit_locked(&self, lifecycle: &mut Lifecycle) {
        info!("De-initializing connection manager");

        for LoopHandle { name, handle } in lifecycle.loops.drain(..) {
            match handle.await {
                Ok(()) => info!("[{}] task stopped successfully", name),
                Err(e) => warn!("[{}] task ended abnormally: {}", name, e),
            }
        }

        // Only present when init succeeded but the accept loop never took it.
        if lifecycle.listener.take().is_some() {
            info!("Listener closed");
        }

        let (local, remote) = self.shared.registry.counts();
        info!(local, remote, "Closing connections");
        for conn in self.shared.registry.drain() {
            conn.close().await;
        }

        if self.state() == ManagerState::Initialized {
            self.set_state(ManagerState::Created);
        }
        info!("De-initialization complete");
    }

    /// Dial a peer, complete the identity handshake, and register the
    /// connection for outbound routing.
    pub async fn connect(&self, host: &str, port: u16) -> Result<Arc<Connection>> {
        self.connect_inner(host, port).instrument(self.span()).await
    }

    async fn connect_inner(&self, host: &str, port: u16) -> Result<Arc<Connection>> {
        if self.state() == ManagerState::Stopped {
            return Err(BusError::InvalidState {
                expected: ManagerState::Active.as_str(),
                actual: ManagerState::Stopped.as_str(),
            });
        }

        let config = &self.shared.config;
        let conn = match dial(
            host,
            port,
            &config.name,
            config.codec.clone(),
            config.max_frame_size,
            config.handshake_timeout,
        )
        .await
        {
            Ok(conn) => Arc::new(conn),
            Err(e) => {
                if matches!(e, BusError::Handshake { .. }) {
                    StatsCounters::incr(&self.shared.stats.handshake_failures);
                }
                warn!("Connect to {}:{} failed: {}", host, port, e);
                return Err(e);
            }
        };

        if let Err(e) = self.shared.registry.register(conn.clone()) {
            conn.close().await;
            return Err(e);
        }

        // stop() may have drained the registry while we were dialing.
        if self.shared.shutdown.is_cancelled() {
            self.shared.registry.remove(&conn);
            conn.close().await;
            return Err(BusError::InvalidState {
                expected: ManagerState::Active.as_str(),
                actual: ManagerState::Stopped.as_str(),
            });
        }

        StatsCounters::incr(&self.shared.stats.connections_dialed);
        info!(
            peer = conn.peer_name().unwrap_or_default(),
            "Connected to {}:{}", host, port
        );
        Ok(conn)
    }

    /// Queue a message for delivery.
    ///
    /// Fills in `source` with this manager's name when it is absent. Delivery
    /// is fire-and-forget: an unknown target is logged and counted as a
    /// routing failure by the send loop. Messages queued before `start` are
    /// sent once the loops run. Fails only once the manager has stopped.
    pub fn send(&self, mut message: Message) -> Result<()> {
        if message.source.is_none() {
            message.source = Some(self.name().to_string());
        }

        self.outbound_tx.send(message).map_err(|_| BusError::InvalidState {
            expected: ManagerState::Active.as_str(),
            actual: ManagerState::Stopped.as_str(),
        })
    }

    /// Return the inbound queue called `name`, creating it if needed.
    pub fn get_queue(&self, name: &str) -> MessageQueue {
        self.shared.queues.get(name)
    }

    /// Peers currently reachable by name.
    pub fn peers(&self) -> Vec<PeerInfo> {
        self.shared.registry.peers()
    }

    pub fn is_connected(&self, name: &str) -> bool {
        self.shared.registry.contains(name)
    }

    pub fn stats(&self) -> ManagerStats {
        self.shared.stats.snapshot()
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
        for LoopHandle { handle, .. } in self.lifecycle.get_mut().loops.drain(..) {
            handle.abort();
        }
    }
}
