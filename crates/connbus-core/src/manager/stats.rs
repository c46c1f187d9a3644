//! Delivery and connection counters for a manager.
//!
//! Per-message failures never surface as return values (sending is
//! fire-and-forget), so these counters are how callers observe them besides
//! the logs.

use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time copy of a manager's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ManagerStats {
    /// Messages written to a peer by the send loop.
    pub messages_sent: u64,
    /// Messages read by the receive loop and delivered to a queue.
    pub messages_received: u64,
    /// Messages dropped because no connection answered to their target.
    pub routing_failures: u64,
    /// Messages dropped because the write to their target failed.
    pub send_failures: u64,
    pub connections_accepted: u64,
    pub connections_dialed: u64,
    /// Connections torn down after end-of-stream or a read error.
    pub connections_dropped: u64,
    /// Inbound or outbound attempts discarded during the identity handshake.
    pub handshake_failures: u64,
}

#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    pub messages_sent: AtomicU64,
    pub messages_received: AtomicU64,
    pub routing_failures: AtomicU64,
    pub send_failures: AtomicU64,
    pub connections_accepted: AtomicU64,
    pub connections_dialed: AtomicU64,
    pub connections_dropped: AtomicU64,
    pub handshake_failures: AtomicU64,
}

impl StatsCounters {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ManagerStats {
        ManagerStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            routing_failures: self.routing_failures.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_dialed: self.connections_dialed.load(Ordering::Relaxed),
            connections_dropped: self.connections_dropped.load(Ordering::Relaxed),
            handshake_failures: self.handshake_failures.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_increments() {
        let counters = StatsCounters::default();
        StatsCounters::incr(&counters.messages_sent);
        StatsCounters::incr(&counters.messages_sent);
        StatsCounters::incr(&counters.routing_failures);

        let stats = counters.snapshot();
        assert_eq!(stats.messages_sent, 2);
        assert_eq!(stats.routing_failures, 1);
        assert_eq!(stats.messages_received, 0);
    }
}
