//! Transfer observation and persistence.
//!
//! Statistics are not global: the coordinator carries an injected
//! [`TransferObserver`] and reports lifecycle, chunk, and retransmission
//! events through it. [`StatsCollector`] is the stock implementation;
//! [`TransferLog`] appends one JSON line per finished session.

mod log;

pub use log::TransferLog;

use std::sync::atomic::{AtomicU64, Ordering};

use crate::session::TransferPhase;

/// Why a chunk was retransmitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetransmitReason {
    /// Triple duplicate ACK.
    FastRetransmit,
    /// Retransmission timer expiry.
    Timeout,
}

/// Observer injected into the coordinator and receiver.
///
/// All methods have empty defaults; implementors pick what they care
/// about. Calls arrive from the session task; implementations must be
/// cheap and non-blocking.
pub trait TransferObserver: Send + Sync {
    /// The session changed phase.
    fn on_phase_change(&self, _phase: TransferPhase) {}
    /// A chunk was handed to the transport.
    fn on_chunk_sent(&self, _sequence: u64, _bytes: usize) {}
    /// A new cumulative ACK arrived.
    fn on_ack(&self, _cumulative: u64) {}
    /// A chunk was retransmitted.
    fn on_retransmit(&self, _sequence: u64, _reason: RetransmitReason) {}
    /// An inbound frame failed MAC verification.
    fn on_mac_failure(&self) {}
    /// The congestion window changed.
    fn on_window_change(&self, _window: usize) {}
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl TransferObserver for NullObserver {}

/// Counting observer with a cheap snapshot.
#[derive(Debug, Default)]
pub struct StatsCollector {
    chunks_sent: AtomicU64,
    bytes_sent: AtomicU64,
    acks: AtomicU64,
    fast_retransmits: AtomicU64,
    timeout_retransmits: AtomicU64,
    mac_failures: AtomicU64,
}

/// Snapshot of a [`StatsCollector`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferStats {
    /// Chunks handed to the transport, retransmissions included.
    pub chunks_sent: u64,
    /// Bytes handed to the transport.
    pub bytes_sent: u64,
    /// New cumulative ACKs observed.
    pub acks: u64,
    /// Fast retransmissions.
    pub fast_retransmits: u64,
    /// Timer-driven retransmissions.
    pub timeout_retransmits: u64,
    /// Frames dropped for MAC failure.
    pub mac_failures: u64,
}

impl StatsCollector {
    /// Create a zeroed collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy out the current counters.
    pub fn snapshot(&self) -> TransferStats {
        TransferStats {
            chunks_sent: self.chunks_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            acks: self.acks.load(Ordering::Relaxed),
            fast_retransmits: self.fast_retransmits.load(Ordering::Relaxed),
            timeout_retransmits: self.timeout_retransmits.load(Ordering::Relaxed),
            mac_failures: self.mac_failures.load(Ordering::Relaxed),
        }
    }
}

impl TransferObserver for StatsCollector {
    fn on_chunk_sent(&self, _sequence: u64, bytes: usize) {
        self.chunks_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn on_ack(&self, _cumulative: u64) {
        self.acks.fetch_add(1, Ordering::Relaxed);
    }

    fn on_retransmit(&self, _sequence: u64, reason: RetransmitReason) {
        match reason {
            RetransmitReason::FastRetransmit => {
                self.fast_retransmits.fetch_add(1, Ordering::Relaxed)
            }
            RetransmitReason::Timeout => {
                self.timeout_retransmits.fetch_add(1, Ordering::Relaxed)
            }
        };
    }

    fn on_mac_failure(&self) {
        self.mac_failures.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collector_counts() {
        let collector = StatsCollector::new();
        collector.on_chunk_sent(0, 256);
        collector.on_chunk_sent(1, 256);
        collector.on_ack(1);
        collector.on_retransmit(2, RetransmitReason::FastRetransmit);
        collector.on_retransmit(2, RetransmitReason::Timeout);
        collector.on_mac_failure();

        let stats = collector.snapshot();
        assert_eq!(stats.chunks_sent, 2);
        assert_eq!(stats.bytes_sent, 512);
        assert_eq!(stats.acks, 1);
        assert_eq!(stats.fast_retransmits, 1);
        assert_eq!(stats.timeout_retransmits, 1);
        assert_eq!(stats.mac_failures, 1);
    }
}
