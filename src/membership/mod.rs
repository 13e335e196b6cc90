//! Gossip-based peer membership.
//!
//! A [`PeerTable`] holds the local view: peers scored by interaction
//! reliability, refreshed by a [`GossipService`] that runs periodic rounds,
//! answers health-check probes, and merges samples received from other
//! members. Sessions address peers by [`NodeId`] key, never by reference.

mod backoff;
mod gossip;
mod health;
mod peer;
mod table;

pub use backoff::Backoff;
pub use gossip::{GossipHandle, GossipService};
pub use health::PingTracker;
pub use peer::PeerRecord;
pub use table::PeerTable;

pub use crate::wire::NodeId;
