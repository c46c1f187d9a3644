//! Registry of live connections.
//!
//! Holds the two ownership lists (dialed and accepted connections) and the
//! name map used to route outbound messages. All three live behind a single
//! mutex so that registration from the accept loop or `connect` cannot race
//! with removal from the receive loop. The lock is never held across an await.

use crate::net::{Connection, Direction};
use crate::{BusError, Result};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tracing::warn;

/// Summary of a registered peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub name: String,
    pub direction: Direction,
    pub addr: SocketAddr,
}

#[derive(Debug, Default)]
struct RegistryInner {
    local: Vec<Arc<Connection>>,
    remote: Vec<Arc<Connection>>,
    by_name: HashMap<String, Arc<Connection>>,
}

impl RegistryInner {
    fn list_mut(&mut self, direction: Direction) -> &mut Vec<Arc<Connection>> {
        match direction {
            Direction::Local => &mut self.local,
            Direction::Remote => &mut self.remote,
        }
    }
}

/// Thread-safe connection registry.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    inner: Mutex<RegistryInner>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an identified connection to its list and the name map.
    ///
    /// If another connection already answers to the same peer name, the name
    /// map is pointed at the new one and the displaced connection is returned.
    /// It stays in its list until the receive loop sees it close.
    pub fn register(&self, conn: Arc<Connection>) -> Result<Option<Arc<Connection>>> {
        let name = conn
            .peer_name()
            .ok_or_else(|| BusError::handshake("cannot register a connection before its handshake"))?
            .to_string();

        let mut inner = self.inner.lock().expect("registry lock poisoned");
        inner.list_mut(conn.direction()).push(conn.clone());
        let displaced = inner.by_name.insert(name.clone(), conn);

        if displaced.is_some() {
            warn!(peer = %name, "Peer name already registered, routing to the newest connection");
        }
        Ok(displaced)
    }

    /// Look up the connection that outbound messages for `name` use.
    pub fn lookup(&self, name: &str) -> Option<Arc<Connection>> {
        let inner = self.inner.lock().expect("registry lock poisoned");
        inner.by_name.get(name).cloned()
    }

    /// Remove a connection from its list and, if it still owns it, its name
    /// map entry.
    ///
    /// Returns `false` if the connection was not registered.
    pub fn remove(&self, conn: &Arc<Connection>) -> bool {
        let mut inner = self.inner.lock().expect("registry lock poisoned");

        let list = inner.list_mut(conn.direction());
        let before = list.len();
        list.retain(|c| !Arc::ptr_eq(c, conn));
        let removed = list.len() != before;

        if let Some(name) = conn.peer_name() {
            if inner
                .by_name
                .get(name)
                .is_some_and(|mapped| Arc::ptr_eq(mapped, conn))
            {
                inner.by_name.remove(name);
            }
        }

        removed
    }

    /// All registered connections, dialed first.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        let inner = self.inner.lock().expect("registry lock poisoned");
        inner
            .local
            .iter()
            .chain(inner.remote.iter())
            .cloned()
            .collect()
    }

    /// Empty the registry, returning every connection it held.
    pub fn drain(&self) -> Vec<Arc<Connection>> {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        inner.by_name.clear();
        let mut all = std::mem::take(&mut inner.local);
        all.append(&mut inner.remote);
        all
    }

    /// Peers currently reachable by name.
    pub fn peers(&self) -> Vec<PeerInfo> {
        let inner = self.inner.lock().expect("registry lock poisoned");
        let mut peers: Vec<PeerInfo> = inner
            .by_name
            .iter()
            .map(|(name, conn)| PeerInfo {
                name: name.clone(),
                direction: conn.direction(),
                addr: conn.peer_addr(),
            })
            .collect();
        peers.sort_by(|a, b| a.name.cmp(&b.name));
        peers
    }

    pub fn contains(&self, name: &str) -> bool {
        let inner = self.inner.lock().expect("registry lock poisoned");
        inner.by_name.contains_key(name)
    }

    /// Number of registered connections in `(local, remote)` lists.
    pub fn counts(&self) -> (usize, usize) {
        let inner = self.inner.lock().expect("registry lock poisoned");
        (inner.local.len(), inner.remote.len())
    }
}
