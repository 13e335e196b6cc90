//! Health-check bookkeeping.
//!
//! Outstanding PINGs are tracked by nonce; a PONG that echoes a known nonce
//! yields an RTT sample, and probes that outlive their deadline count as
//! failures.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::wire::NodeId;

/// One outstanding probe.
#[derive(Debug, Clone, Copy)]
struct Probe {
    node_id: NodeId,
    sent_at: Instant,
    deadline: Instant,
}

/// Tracks outstanding health-check probes by nonce.
#[derive(Debug, Default)]
pub struct PingTracker {
    pending: HashMap<u32, Probe>,
}

impl PingTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a sent PING. `deadline` is `3 * SRTT` or the configured
    /// floor.
    pub fn register(&mut self, nonce: u32, node_id: NodeId, deadline: Duration) {
        let now = Instant::now();
        self.pending.insert(
            nonce,
            Probe {
                node_id,
                sent_at: now,
                deadline: now + deadline,
            },
        );
    }

    /// Process a PONG. Returns the probed peer and the RTT sample when the
    /// nonce matches an outstanding probe from that peer.
    pub fn on_pong(&mut self, nonce: u32, from: NodeId) -> Option<(NodeId, Duration)> {
        let probe = *self.pending.get(&nonce)?;
        if probe.node_id != from {
            return None;
        }
        self.pending.remove(&nonce);
        Some((probe.node_id, probe.sent_at.elapsed()))
    }

    /// Drain probes whose deadline has passed, returning the failed peers.
    pub fn expired(&mut self) -> Vec<NodeId> {
        let now = Instant::now();
        let expired: Vec<u32> = self
            .pending
            .iter()
            .filter(|(_, probe)| now >= probe.deadline)
            .map(|(&nonce, _)| nonce)
            .collect();
        expired
            .into_iter()
            .filter_map(|nonce| self.pending.remove(&nonce))
            .map(|probe| probe.node_id)
            .collect()
    }

    /// Outstanding probe count.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pong_matches_nonce_and_peer() {
        let mut tracker = PingTracker::new();
        tracker.register(42, NodeId(1), Duration::from_secs(2));

        // Wrong peer echoing the right nonce does not count.
        assert!(tracker.on_pong(42, NodeId(2)).is_none());
        assert_eq!(tracker.pending_count(), 1);

        let (node_id, rtt) = tracker.on_pong(42, NodeId(1)).unwrap();
        assert_eq!(node_id, NodeId(1));
        assert!(rtt < Duration::from_secs(1));
        assert_eq!(tracker.pending_count(), 0);
    }

    #[test]
    fn test_unknown_nonce_ignored() {
        let mut tracker = PingTracker::new();
        assert!(tracker.on_pong(7, NodeId(1)).is_none());
    }

    #[test]
    fn test_expiry() {
        let mut tracker = PingTracker::new();
        tracker.register(1, NodeId(1), Duration::ZERO);
        tracker.register(2, NodeId(2), Duration::from_secs(60));
        let expired = tracker.expired();
        assert_eq!(expired, vec![NodeId(1)]);
        assert_eq!(tracker.pending_count(), 1);
    }
}
