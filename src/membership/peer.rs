//! Per-peer state and reliability scoring.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::core::{RELIABILITY_ALPHA, RELIABILITY_BETA, UNREACHABLE_AFTER_FAILURES};
use crate::wire::{NodeId, PeerEntry};

/// SRTT smoothing factor for gossip-level RTT samples (1/8, as in the
/// transfer-path estimator).
const SRTT_GAIN: f64 = 0.125;

/// A peer known to the membership layer.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    /// Opaque node identifier.
    pub node_id: NodeId,
    /// Last known endpoint.
    pub addr: SocketAddr,
    /// When this peer was last heard from, directly or via gossip.
    pub last_seen: Instant,
    /// Smoothed round-trip estimate from health checks.
    pub srtt: Option<Duration>,
    /// Consecutive failed interactions.
    pub consecutive_failures: u32,
    /// Reliability score in [0, 1].
    pub reliability: f64,
    /// Set after three consecutive health-check failures.
    pub unreachable: bool,
}

impl PeerRecord {
    /// Create a record for a newly learned peer.
    pub fn new(node_id: NodeId, addr: SocketAddr) -> Self {
        Self {
            node_id,
            addr,
            last_seen: Instant::now(),
            srtt: None,
            consecutive_failures: 0,
            reliability: 0.5,
            unreachable: false,
        }
    }

    /// Record a successful interaction: `R <- R + alpha * (1 - R)`.
    pub fn record_success(&mut self) {
        self.reliability += RELIABILITY_ALPHA * (1.0 - self.reliability);
        self.reliability = self.reliability.clamp(0.0, 1.0);
        self.consecutive_failures = 0;
        self.unreachable = false;
        self.last_seen = Instant::now();
    }

    /// Record a failed interaction: `R <- R - beta * R`.
    pub fn record_failure(&mut self) {
        self.reliability -= RELIABILITY_BETA * self.reliability;
        self.reliability = self.reliability.clamp(0.0, 1.0);
        self.consecutive_failures += 1;
        if self.consecutive_failures >= UNREACHABLE_AFTER_FAILURES {
            self.unreachable = true;
        }
    }

    /// Fold an RTT sample into the smoothed estimate.
    pub fn observe_rtt(&mut self, sample: Duration) {
        self.srtt = Some(match self.srtt {
            None => sample,
            Some(srtt) => {
                let secs =
                    (1.0 - SRTT_GAIN) * srtt.as_secs_f64() + SRTT_GAIN * sample.as_secs_f64();
                Duration::from_secs_f64(secs)
            }
        });
    }

    /// Deadline for a health-check reply: `3 * SRTT`, floored when SRTT is
    /// undefined.
    pub fn ping_deadline(&self, floor: Duration) -> Duration {
        match self.srtt {
            Some(srtt) => (srtt * 3).max(floor),
            None => floor,
        }
    }

    /// Whether this peer should be dropped from the table.
    pub fn is_evictable(&self, floor: f64, horizon: Duration) -> bool {
        self.reliability < floor && self.last_seen.elapsed() > horizon
    }

    /// Convert to a wire entry, with last-seen expressed as an age.
    pub fn to_entry(&self) -> PeerEntry {
        PeerEntry {
            node_id: self.node_id,
            addr: self.addr,
            reliability: self.reliability,
            last_seen_ms: self.last_seen.elapsed().as_millis().min(u32::MAX as u128) as u32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> PeerRecord {
        PeerRecord::new(NodeId(1), "127.0.0.1:7000".parse().unwrap())
    }

    #[test]
    fn test_reliability_stays_in_unit_interval() {
        let mut peer = record();
        for _ in 0..100 {
            peer.record_success();
            assert!((0.0..=1.0).contains(&peer.reliability));
        }
        for _ in 0..100 {
            peer.record_failure();
            assert!((0.0..=1.0).contains(&peer.reliability));
        }
    }

    #[test]
    fn test_decay_curve() {
        // Five consecutive failures from R = 1.0 leave R = 0.8^5, still
        // above the 0.1 eviction floor.
        let mut peer = record();
        peer.reliability = 1.0;
        for _ in 0..5 {
            peer.record_failure();
        }
        assert!((peer.reliability - 0.8f64.powi(5)).abs() < 1e-9);
        assert!(peer.reliability > 0.1);
        peer.record_failure();
        assert!((peer.reliability - 0.8f64.powi(6)).abs() < 1e-9);
        assert!(peer.reliability > 0.1);
    }

    #[test]
    fn test_unreachable_after_three_failures() {
        let mut peer = record();
        peer.record_failure();
        peer.record_failure();
        assert!(!peer.unreachable);
        peer.record_failure();
        assert!(peer.unreachable);
        peer.record_success();
        assert!(!peer.unreachable);
    }

    #[test]
    fn test_ping_deadline() {
        let mut peer = record();
        let floor = Duration::from_secs(2);
        assert_eq!(peer.ping_deadline(floor), floor);
        peer.observe_rtt(Duration::from_millis(900));
        assert_eq!(peer.ping_deadline(floor), Duration::from_millis(2700));
        let mut quick = record();
        quick.observe_rtt(Duration::from_millis(100));
        assert_eq!(quick.ping_deadline(floor), floor);
    }

    #[test]
    fn test_rtt_smoothing_moves_toward_sample() {
        let mut peer = record();
        peer.observe_rtt(Duration::from_millis(100));
        peer.observe_rtt(Duration::from_millis(200));
        let srtt = peer.srtt.unwrap();
        assert!(srtt > Duration::from_millis(100));
        assert!(srtt < Duration::from_millis(200));
    }

    #[test]
    fn test_eviction_needs_both_conditions() {
        let mut peer = record();
        peer.reliability = 0.05;
        // Recently seen, so not evictable regardless of score.
        assert!(!peer.is_evictable(0.1, Duration::from_secs(60)));
        peer.last_seen = Instant::now() - Duration::from_secs(120);
        assert!(peer.is_evictable(0.1, Duration::from_secs(60)));
        peer.reliability = 0.9;
        assert!(!peer.is_evictable(0.1, Duration::from_secs(60)));
    }
}
