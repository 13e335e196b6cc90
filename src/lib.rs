//! # PeerCrypt
//!
//! Decentralized encrypted file transfer with an application-layer reliable
//! transport built on TCP. It provides:
//!
//! - **Chunked, acknowledged transfer**: files travel as encrypted chunks
//!   behind cumulative ACKs, reassembled byte-exact at the receiver
//! - **Pluggable transmission policies**: unconstrained, token-bucket rate
//!   limiting, AIMD congestion control, priority-weighted QoS, parallel
//!   range workers, and one-to-many multicast
//! - **AIMD congestion control**: RFC 6298 RTT estimation, timeout-based
//!   loss detection, and triple-duplicate-ACK fast retransmit
//! - **Gossip membership**: epidemic peer dissemination with reliability
//!   scoring, health checks, and retry/backoff
//!
//! ## Modules
//!
//! - [`core`]: configuration, constants, and error types
//! - [`wire`]: bit-exact frame encoding/decoding for the three frame
//!   families (transfer, gossip, control)
//! - [`crypto`]: the AES-256-CBC + HMAC-SHA-256 envelope and PBKDF2 key
//!   derivation
//! - [`membership`]: peer table, gossip service, and health checks
//! - [`policy`]: the send-side transmission policies
//! - [`session`]: transfer state machine, RTT estimation, and the session
//!   coordinator
//! - [`receiver`]: inbound session handling and reassembly
//! - [`stats`]: transfer observers and the append-only transfer log
//!
//! ## Example
//!
//! ```no_run
//! use peercrypt::core::Config;
//! use peercrypt::policy::PolicyKind;
//! use peercrypt::session::SessionCoordinator;
//!
//! # async fn run() -> Result<(), peercrypt::core::TransferError> {
//! let config = Config::default();
//! let mut coordinator = SessionCoordinator::new(config, PolicyKind::default());
//! let summary = coordinator
//!     .send_file("video.mkv".as_ref(), "192.0.2.10:7000".parse().unwrap())
//!     .await?;
//! println!("sent {} bytes in {} chunks", summary.bytes_sent, summary.chunks_sent);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod core;
pub mod crypto;
pub mod membership;
pub mod policy;
pub mod receiver;
pub mod session;
pub mod stats;
pub mod wire;

pub use crate::core::{Config, ReasonCode, TransferError};
pub use crate::policy::PolicyKind;
pub use crate::receiver::Receiver;
pub use crate::session::{SessionCoordinator, TransferPhase, TransferSummary};

/// Protocol version carried in every frame header.
pub const PROTOCOL_VERSION: u8 = 0x01;
