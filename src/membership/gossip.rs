//! Gossip dissemination and health-check service.
//!
//! One UDP socket per member carries all gossip traffic. Each round the
//! service picks up to `gossip_fanout` random reachable peers and sends them
//! a bounded PEERS sample drawn from the most reliable, most recently seen
//! entries. Health checks ride the same socket as PING/PONG with nonce
//! matching; eviction runs once per round.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::core::{Config, MembershipError, GOSSIP_SAMPLE_SIZE, PING_TIMEOUT_FLOOR};
use crate::wire::{GossipBody, GossipMessage, NodeId, GOSSIP_HEADER_LEN, PEER_ENTRY_LEN};

use super::health::PingTracker;
use super::table::PeerTable;

/// Interval at which expired probes are swept.
const PROBE_SWEEP_INTERVAL: Duration = Duration::from_millis(250);

/// Control handle for a running [`GossipService`].
#[derive(Debug)]
pub struct GossipHandle {
    cancel: watch::Sender<bool>,
    local_addr: SocketAddr,
}

impl GossipHandle {
    /// Address the service is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Ask the service to send LEAVE and stop.
    pub fn shutdown(&self) {
        let _ = self.cancel.send(true);
    }
}

/// The gossip membership service.
#[derive(Debug)]
pub struct GossipService {
    node_id: NodeId,
    socket: UdpSocket,
    table: Arc<PeerTable>,
    config: Config,
    cancel: watch::Receiver<bool>,
}

impl GossipService {
    /// Bind the gossip socket and create the service plus its handle.
    pub async fn bind(
        node_id: NodeId,
        bind_addr: SocketAddr,
        table: Arc<PeerTable>,
        config: Config,
    ) -> std::io::Result<(Self, GossipHandle)> {
        let socket = UdpSocket::bind(bind_addr).await?;
        let local_addr = socket.local_addr()?;
        let (tx, rx) = watch::channel(false);
        Ok((
            Self {
                node_id,
                socket,
                table,
                config,
                cancel: rx,
            },
            GossipHandle {
                cancel: tx,
                local_addr,
            },
        ))
    }

    /// Peer entries that fit one datagram under the MTU floor, capped at
    /// the protocol sample bound.
    fn sample_limit(&self) -> usize {
        let budget = self.config.mtu_floor.saturating_sub(GOSSIP_HEADER_LEN + 4);
        (budget / PEER_ENTRY_LEN).min(GOSSIP_SAMPLE_SIZE)
    }

    /// Announce ourselves to a bootstrap peer.
    pub async fn join(&self, bootstrap: SocketAddr) -> Result<(), MembershipError> {
        let hello = GossipMessage {
            source: self.node_id,
            timestamp_ms: wall_ms(),
            body: GossipBody::Hello(self.table.sample(self.sample_limit())),
        };
        self.socket.send_to(&hello.encode(), bootstrap).await?;
        info!(node = %self.node_id, %bootstrap, "sent HELLO to bootstrap peer");
        Ok(())
    }

    /// Run rounds until shutdown.
    pub async fn run(self) -> Result<(), MembershipError> {
        let mut cancel = self.cancel.clone();
        let mut tracker = PingTracker::new();
        let mut gossip_tick = tokio::time::interval(self.config.gossip_interval);
        let mut health_tick = tokio::time::interval(self.config.health_check_interval);
        let mut sweep_tick = tokio::time::interval(PROBE_SWEEP_INTERVAL);
        let mut buf = vec![0u8; 64 * 1024];

        loop {
            tokio::select! {
                _ = cancel.changed() => {
                    self.broadcast_leave().await;
                    info!(node = %self.node_id, "gossip service stopped");
                    return Ok(());
                }
                _ = gossip_tick.tick(), if !self.config.disable_gossip => {
                    self.gossip_round().await;
                }
                _ = health_tick.tick() => {
                    self.health_round(&mut tracker).await;
                }
                _ = sweep_tick.tick() => {
                    for node_id in tracker.expired() {
                        debug!(node = %node_id, "health check expired");
                        self.table.record_failure(node_id);
                    }
                }
                received = self.socket.recv_from(&mut buf) => {
                    let (len, from) = received?;
                    self.handle_datagram(&buf[..len], from, &mut tracker).await;
                }
            }
        }
    }

    async fn gossip_round(&self) {
        let evicted = self
            .table
            .evict(self.config.eviction_floor, self.config.eviction_horizon);
        if evicted > 0 {
            debug!(evicted, "evicted stale peers");
        }

        let targets = self.table.random_targets(self.config.gossip_fanout);
        if targets.is_empty() {
            return;
        }
        let message = GossipMessage {
            source: self.node_id,
            timestamp_ms: wall_ms(),
            body: GossipBody::Peers(self.table.sample(self.sample_limit())),
        };
        let bytes = message.encode();
        for target in &targets {
            if let Err(error) = self.socket.send_to(&bytes, target.addr).await {
                warn!(peer = %target.node_id, %error, "gossip send failed");
                self.table.record_failure(target.node_id);
            }
        }
        debug!(targets = targets.len(), peers = self.table.len(), "gossip round");
    }

    async fn health_round(&self, tracker: &mut PingTracker) {
        for peer in self.table.snapshot() {
            let nonce: u32 = rand::random();
            let ping = GossipMessage {
                source: self.node_id,
                timestamp_ms: wall_ms(),
                body: GossipBody::Ping(nonce),
            };
            match self.socket.send_to(&ping.encode(), peer.addr).await {
                Ok(_) => {
                    tracker.register(nonce, peer.node_id, peer.ping_deadline(PING_TIMEOUT_FLOOR));
                }
                Err(error) => {
                    warn!(peer = %peer.node_id, %error, "ping send failed");
                    self.table.record_failure(peer.node_id);
                }
            }
        }
    }

    async fn handle_datagram(&self, bytes: &[u8], from: SocketAddr, tracker: &mut PingTracker) {
        let message = match GossipMessage::decode(bytes) {
            Ok(message) => message,
            Err(error) => {
                debug!(%from, %error, "dropping malformed gossip datagram");
                return;
            }
        };
        if message.source == self.node_id {
            return;
        }

        match message.body {
            GossipBody::Hello(entries) => {
                self.table.observe(message.source, from);
                for entry in &entries {
                    self.table.merge_entry(entry, self.node_id);
                }
                // Answer a joining peer with our view right away.
                let reply = GossipMessage {
                    source: self.node_id,
                    timestamp_ms: wall_ms(),
                    body: GossipBody::Peers(self.table.sample(self.sample_limit())),
                };
                if let Err(error) = self.socket.send_to(&reply.encode(), from).await {
                    warn!(%from, %error, "hello reply failed");
                }
                info!(peer = %message.source, %from, "peer joined");
            }
            GossipBody::Peers(entries) => {
                self.table.observe(message.source, from);
                for entry in &entries {
                    self.table.merge_entry(entry, self.node_id);
                }
            }
            GossipBody::Ping(nonce) => {
                self.table.observe(message.source, from);
                let pong = GossipMessage {
                    source: self.node_id,
                    timestamp_ms: wall_ms(),
                    body: GossipBody::Pong(nonce),
                };
                if let Err(error) = self.socket.send_to(&pong.encode(), from).await {
                    warn!(%from, %error, "pong send failed");
                }
            }
            GossipBody::Pong(nonce) => {
                if let Some((node_id, rtt)) = tracker.on_pong(nonce, message.source) {
                    self.table.record_success(node_id);
                    self.table.observe_rtt(node_id, rtt);
                }
            }
            GossipBody::Leave => {
                info!(peer = %message.source, "peer left");
                self.table.remove(message.source);
            }
        }
    }

    async fn broadcast_leave(&self) {
        let leave = GossipMessage {
            source: self.node_id,
            timestamp_ms: wall_ms(),
            body: GossipBody::Leave,
        };
        let bytes = leave.encode();
        for peer in self.table.reachable() {
            let _ = self.socket.send_to(&bytes, peer.addr).await;
        }
    }
}

fn wall_ms() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u32)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        Config {
            gossip_interval: Duration::from_millis(50),
            health_check_interval: Duration::from_millis(100),
            ..Config::default()
        }
    }

    async fn spawn_member(
        node_id: NodeId,
        config: Config,
    ) -> (Arc<PeerTable>, GossipHandle) {
        let table = Arc::new(PeerTable::new());
        let (service, handle) = GossipService::bind(
            node_id,
            "127.0.0.1:0".parse().unwrap(),
            Arc::clone(&table),
            config,
        )
        .await
        .unwrap();
        tokio::spawn(service.run());
        (table, handle)
    }

    #[tokio::test]
    async fn test_three_members_converge() {
        let (table_a, handle_a) = spawn_member(NodeId(1), test_config()).await;
        let (table_b, handle_b) = spawn_member(NodeId(2), test_config()).await;
        let (table_c, handle_c) = spawn_member(NodeId(3), test_config()).await;

        // B and C bootstrap off A; gossip must spread B and C to each other.
        table_b.observe(NodeId(1), handle_a.local_addr());
        table_c.observe(NodeId(1), handle_a.local_addr());

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if table_a.len() == 2 && table_b.len() == 2 && table_c.len() == 2 {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "gossip did not converge: a={} b={} c={}",
                table_a.len(),
                table_b.len(),
                table_c.len()
            );
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        handle_a.shutdown();
        handle_b.shutdown();
        handle_c.shutdown();
    }

    #[tokio::test]
    async fn test_health_check_scores_responding_peer() {
        let mut config = test_config();
        config.disable_gossip = true;
        let (table_a, handle_a) = spawn_member(NodeId(1), config.clone()).await;
        let (_table_b, handle_b) = spawn_member(NodeId(2), config).await;

        table_a.observe(NodeId(2), handle_b.local_addr());
        let baseline = table_a.get(NodeId(2)).unwrap().reliability;

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let peer = table_a.get(NodeId(2)).unwrap();
            if peer.reliability > baseline && peer.srtt.is_some() {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "health check never succeeded"
            );
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        handle_a.shutdown();
        handle_b.shutdown();
    }

    #[tokio::test]
    async fn test_silent_peer_scored_down() {
        let mut config = test_config();
        config.disable_gossip = true;
        let (table, handle) = spawn_member(NodeId(1), config).await;

        // A socket that never answers.
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        table.observe(NodeId(9), silent.local_addr().unwrap());

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let peer = table.get(NodeId(9)).unwrap();
            if peer.consecutive_failures >= 1 {
                assert!(peer.reliability < 0.5);
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "silent peer never failed a health check"
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        handle.shutdown();
    }
}
