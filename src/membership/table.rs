//! Shared peer table.
//!
//! Mutation is serialized under a single writer lock; readers take
//! consistent snapshots. Sessions and the gossip service share the table
//! through `Arc<PeerTable>` and address peers by [`NodeId`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use rand::seq::SliceRandom;

use crate::wire::{NodeId, PeerEntry};

use super::peer::PeerRecord;

/// The local membership view.
#[derive(Debug, Default)]
pub struct PeerTable {
    peers: RwLock<HashMap<NodeId, PeerRecord>>,
}

impl PeerTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of known peers.
    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    /// Look up a peer by id.
    pub fn get(&self, node_id: NodeId) -> Option<PeerRecord> {
        self.peers.read().get(&node_id).cloned()
    }

    /// Consistent snapshot of all peers.
    pub fn snapshot(&self) -> Vec<PeerRecord> {
        self.peers.read().values().cloned().collect()
    }

    /// Insert or refresh a peer seen directly (HELLO source, transfer
    /// endpoint, explicit join).
    pub fn observe(&self, node_id: NodeId, addr: SocketAddr) {
        let mut peers = self.peers.write();
        let record = peers
            .entry(node_id)
            .or_insert_with(|| PeerRecord::new(node_id, addr));
        record.addr = addr;
        record.last_seen = Instant::now();
    }

    /// Merge a gossiped entry. New peers are created; known peers refresh
    /// last-seen when the gossiped sighting is fresher than ours.
    pub fn merge_entry(&self, entry: &PeerEntry, self_id: NodeId) {
        if entry.node_id == self_id {
            return;
        }
        let age = Duration::from_millis(u64::from(entry.last_seen_ms));
        let gossiped_seen = Instant::now().checked_sub(age).unwrap_or_else(Instant::now);
        let mut peers = self.peers.write();
        match peers.get_mut(&entry.node_id) {
            Some(record) => {
                record.addr = entry.addr;
                if gossiped_seen > record.last_seen {
                    record.last_seen = gossiped_seen;
                }
            }
            None => {
                let mut record = PeerRecord::new(entry.node_id, entry.addr);
                record.reliability = entry.reliability;
                record.last_seen = gossiped_seen;
                peers.insert(entry.node_id, record);
            }
        }
    }

    /// Record a successful interaction with a peer.
    pub fn record_success(&self, node_id: NodeId) {
        if let Some(record) = self.peers.write().get_mut(&node_id) {
            record.record_success();
        }
    }

    /// Record a failed interaction with a peer.
    pub fn record_failure(&self, node_id: NodeId) {
        if let Some(record) = self.peers.write().get_mut(&node_id) {
            record.record_failure();
        }
    }

    /// Fold an RTT sample into a peer's smoothed estimate.
    pub fn observe_rtt(&self, node_id: NodeId, sample: Duration) {
        if let Some(record) = self.peers.write().get_mut(&node_id) {
            record.observe_rtt(sample);
        }
    }

    /// Remove a peer (LEAVE).
    pub fn remove(&self, node_id: NodeId) {
        self.peers.write().remove(&node_id);
    }

    /// Drop peers whose reliability fell below `floor` and whose last
    /// sighting is older than `horizon`.
    pub fn evict(&self, floor: f64, horizon: Duration) -> usize {
        let mut peers = self.peers.write();
        let before = peers.len();
        peers.retain(|_, record| !record.is_evictable(floor, horizon));
        before - peers.len()
    }

    /// Up to `fanout` random gossip targets, excluding unreachable peers.
    pub fn random_targets(&self, fanout: usize) -> Vec<PeerRecord> {
        let mut candidates: Vec<PeerRecord> = self
            .peers
            .read()
            .values()
            .filter(|record| !record.unreachable)
            .cloned()
            .collect();
        candidates.shuffle(&mut rand::thread_rng());
        candidates.truncate(fanout);
        candidates
    }

    /// Bounded sample for a PEERS message, drawn preferentially from the
    /// highest-reliability, most recently seen peers.
    pub fn sample(&self, limit: usize) -> Vec<PeerEntry> {
        let mut records = self.snapshot();
        records.sort_by(|a, b| {
            b.reliability
                .partial_cmp(&a.reliability)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.last_seen.cmp(&a.last_seen))
        });
        records
            .iter()
            .take(limit)
            .map(PeerRecord::to_entry)
            .collect()
    }

    /// Peers currently considered reachable, best first.
    pub fn reachable(&self) -> Vec<PeerRecord> {
        let mut records: Vec<PeerRecord> = self
            .peers
            .read()
            .values()
            .filter(|record| !record.unreachable)
            .cloned()
            .collect();
        records.sort_by(|a, b| {
            b.reliability
                .partial_cmp(&a.reliability)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new("127.0.0.1".parse().unwrap(), port)
    }

    #[test]
    fn test_observe_and_snapshot() {
        let table = PeerTable::new();
        table.observe(NodeId(1), addr(7001));
        table.observe(NodeId(2), addr(7002));
        assert_eq!(table.len(), 2);
        assert_eq!(table.snapshot().len(), 2);
    }

    #[test]
    fn test_merge_skips_self() {
        let table = PeerTable::new();
        let entry = PeerEntry {
            node_id: NodeId(9),
            addr: addr(7009),
            reliability: 0.8,
            last_seen_ms: 0,
        };
        table.merge_entry(&entry, NodeId(9));
        assert!(table.is_empty());
        table.merge_entry(&entry, NodeId(1));
        assert_eq!(table.len(), 1);
        assert!((table.get(NodeId(9)).unwrap().reliability - 0.8).abs() < 1e-4);
    }

    #[test]
    fn test_merge_does_not_regress_last_seen() {
        let table = PeerTable::new();
        table.observe(NodeId(3), addr(7003));
        let fresh = table.get(NodeId(3)).unwrap().last_seen;
        // Stale gossip: sighting 60 seconds old.
        table.merge_entry(
            &PeerEntry {
                node_id: NodeId(3),
                addr: addr(7003),
                reliability: 0.1,
                last_seen_ms: 60_000,
            },
            NodeId(1),
        );
        assert!(table.get(NodeId(3)).unwrap().last_seen >= fresh);
    }

    #[test]
    fn test_sample_prefers_reliable_recent() {
        let table = PeerTable::new();
        for i in 0..10u32 {
            table.observe(NodeId(i), addr(7000 + i as u16));
        }
        for _ in 0..5 {
            table.record_success(NodeId(4));
        }
        let sample = table.sample(3);
        assert_eq!(sample.len(), 3);
        assert_eq!(sample[0].node_id, NodeId(4));
    }

    #[test]
    fn test_random_targets_bounded_and_reachable() {
        let table = PeerTable::new();
        for i in 0..6u32 {
            table.observe(NodeId(i), addr(7100 + i as u16));
        }
        for _ in 0..3 {
            table.record_failure(NodeId(0));
        }
        for _ in 0..20 {
            let targets = table.random_targets(3);
            assert!(targets.len() <= 3);
            assert!(targets.iter().all(|p| p.node_id != NodeId(0)));
        }
    }

    #[test]
    fn test_eviction() {
        let table = PeerTable::new();
        table.observe(NodeId(1), addr(7001));
        {
            let mut peers = table.peers.write();
            let record = peers.get_mut(&NodeId(1)).unwrap();
            record.reliability = 0.01;
            record.last_seen = Instant::now() - Duration::from_secs(300);
        }
        assert_eq!(table.evict(0.1, Duration::from_secs(120)), 1);
        assert!(table.is_empty());
    }
}
