//! Gossip datagram encoding and decoding.
//!
//! Wire format, network byte order:
//!
//! ```text
//! header (12 bytes):
//!   version(1) type(1) reserved(2) source_node_id(4) timestamp(4)
//! HELLO / PEERS body:
//!   peer_count(2) reserved(2), then 32-byte entries:
//!     node_id(4) ip(16, IPv4-mapped IPv6) port(2)
//!     reliability(2, Q0.16) last_seen_ms(4) reserved(4)
//! PING / PONG body:
//!   nonce(4)
//! LEAVE body: empty
//! ```

use std::net::{IpAddr, Ipv6Addr, SocketAddr};

use super::WireError;
use crate::PROTOCOL_VERSION;

/// Gossip header length in bytes.
pub const GOSSIP_HEADER_LEN: usize = 12;

/// Encoded peer entry length in bytes.
pub const PEER_ENTRY_LEN: usize = 32;

/// Opaque 32-bit node identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// Gossip message type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GossipType {
    /// Introduction from a joining peer.
    Hello = 0x01,
    /// Membership sample.
    Peers = 0x02,
    /// Health-check probe.
    Ping = 0x03,
    /// Health-check reply echoing the probe nonce.
    Pong = 0x04,
    /// Voluntary departure.
    Leave = 0x05,
}

impl GossipType {
    /// Parse a gossip type byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::Hello),
            0x02 => Some(Self::Peers),
            0x03 => Some(Self::Ping),
            0x04 => Some(Self::Pong),
            0x05 => Some(Self::Leave),
            _ => None,
        }
    }
}

/// One peer entry inside a HELLO or PEERS message.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PeerEntry {
    /// Peer node id.
    pub node_id: NodeId,
    /// Peer endpoint.
    pub addr: SocketAddr,
    /// Reliability score in [0, 1], carried as Q0.16.
    pub reliability: f64,
    /// Age of the entry's last sighting in milliseconds.
    pub last_seen_ms: u32,
}

impl PeerEntry {
    fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.node_id.0.to_be_bytes());
        let ip6 = match self.addr.ip() {
            IpAddr::V4(v4) => v4.to_ipv6_mapped(),
            IpAddr::V6(v6) => v6,
        };
        buf.extend_from_slice(&ip6.octets());
        buf.extend_from_slice(&self.addr.port().to_be_bytes());
        let q = (self.reliability.clamp(0.0, 1.0) * f64::from(u16::MAX)).round() as u16;
        buf.extend_from_slice(&q.to_be_bytes());
        buf.extend_from_slice(&self.last_seen_ms.to_be_bytes());
        buf.extend_from_slice(&[0u8; 4]);
    }

    fn decode(bytes: &[u8]) -> Self {
        let node_id = NodeId(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]));
        let mut octets = [0u8; 16];
        octets.copy_from_slice(&bytes[4..20]);
        let ip6 = Ipv6Addr::from(octets);
        let ip = match ip6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(ip6),
        };
        let port = u16::from_be_bytes([bytes[20], bytes[21]]);
        let q = u16::from_be_bytes([bytes[22], bytes[23]]);
        let last_seen_ms = u32::from_be_bytes([bytes[24], bytes[25], bytes[26], bytes[27]]);
        Self {
            node_id,
            addr: SocketAddr::new(ip, port),
            reliability: f64::from(q) / f64::from(u16::MAX),
            last_seen_ms,
        }
    }
}

/// Body of a gossip message, by type.
#[derive(Debug, Clone, PartialEq)]
pub enum GossipBody {
    /// Introduction carrying the sender's own entry (and optionally more).
    Hello(Vec<PeerEntry>),
    /// Membership sample.
    Peers(Vec<PeerEntry>),
    /// Probe with a nonce to be echoed.
    Ping(u32),
    /// Echo of a probe nonce.
    Pong(u32),
    /// Voluntary departure.
    Leave,
}

/// A gossip datagram.
#[derive(Debug, Clone, PartialEq)]
pub struct GossipMessage {
    /// Sender node id.
    pub source: NodeId,
    /// Sender wall-clock timestamp, milliseconds (low 32 bits).
    pub timestamp_ms: u32,
    /// Message body.
    pub body: GossipBody,
}

impl GossipMessage {
    /// Message type byte for this body.
    pub fn gossip_type(&self) -> GossipType {
        match self.body {
            GossipBody::Hello(_) => GossipType::Hello,
            GossipBody::Peers(_) => GossipType::Peers,
            GossipBody::Ping(_) => GossipType::Ping,
            GossipBody::Pong(_) => GossipType::Pong,
            GossipBody::Leave => GossipType::Leave,
        }
    }

    /// Encode to datagram bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(GOSSIP_HEADER_LEN + 32);
        buf.push(PROTOCOL_VERSION);
        buf.push(self.gossip_type() as u8);
        buf.extend_from_slice(&[0u8; 2]);
        buf.extend_from_slice(&self.source.0.to_be_bytes());
        buf.extend_from_slice(&self.timestamp_ms.to_be_bytes());

        match &self.body {
            GossipBody::Hello(entries) | GossipBody::Peers(entries) => {
                buf.extend_from_slice(&(entries.len() as u16).to_be_bytes());
                buf.extend_from_slice(&[0u8; 2]);
                for entry in entries {
                    entry.encode_into(&mut buf);
                }
            }
            GossipBody::Ping(nonce) | GossipBody::Pong(nonce) => {
                buf.extend_from_slice(&nonce.to_be_bytes());
            }
            GossipBody::Leave => {}
        }
        buf
    }

    /// Decode a datagram.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() < GOSSIP_HEADER_LEN {
            return Err(WireError::Truncated {
                expected: GOSSIP_HEADER_LEN,
                actual: bytes.len(),
            });
        }
        if bytes[0] != PROTOCOL_VERSION {
            return Err(WireError::UnsupportedVersion(bytes[0]));
        }
        let gossip_type = GossipType::from_byte(bytes[1]).ok_or(WireError::UnknownType(bytes[1]))?;
        let source = NodeId(u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]));
        let timestamp_ms = u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
        let rest = &bytes[GOSSIP_HEADER_LEN..];

        let body = match gossip_type {
            GossipType::Hello | GossipType::Peers => {
                if rest.len() < 4 {
                    return Err(WireError::Truncated {
                        expected: GOSSIP_HEADER_LEN + 4,
                        actual: bytes.len(),
                    });
                }
                let count = u16::from_be_bytes([rest[0], rest[1]]) as usize;
                let entries_bytes = &rest[4..];
                if entries_bytes.len() < count * PEER_ENTRY_LEN {
                    return Err(WireError::LengthExceedsBuffer {
                        declared: count * PEER_ENTRY_LEN,
                        bound: entries_bytes.len(),
                    });
                }
                let entries = (0..count)
                    .map(|i| PeerEntry::decode(&entries_bytes[i * PEER_ENTRY_LEN..]))
                    .collect();
                match gossip_type {
                    GossipType::Hello => GossipBody::Hello(entries),
                    _ => GossipBody::Peers(entries),
                }
            }
            GossipType::Ping | GossipType::Pong => {
                if rest.len() < 4 {
                    return Err(WireError::Truncated {
                        expected: GOSSIP_HEADER_LEN + 4,
                        actual: bytes.len(),
                    });
                }
                let nonce = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]);
                match gossip_type {
                    GossipType::Ping => GossipBody::Ping(nonce),
                    _ => GossipBody::Pong(nonce),
                }
            }
            GossipType::Leave => GossipBody::Leave,
        };

        Ok(Self {
            source,
            timestamp_ms,
            body,
        })
    }
}
