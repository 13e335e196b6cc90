//! Frame encoding and decoding.
//!
//! Three frame families share this module:
//!
//! - **Transfer frames** ([`frame`]): DATA/ACK and session control with a
//!   fixed header, CRC-16/IBM, and a truncated HMAC token
//! - **Gossip frames** ([`gossip`]): membership dissemination datagrams
//! - **Control frames** ([`control`]): out-of-band messages carrying a JSON
//!   parameter blob
//!
//! The codec is pure and deterministic: the same input bytes always parse to
//! the same structured frame. Validation is strict and ordered (version,
//! length bound, CRC, HMAC); partial frames on a stream are buffered without
//! consuming bytes until the full frame is present.

mod control;
mod crc;
mod frame;
mod gossip;

pub use control::{
    CongestionParams, ControlHeader, ControlMessage, ControlType, ErrorParams, FileInfo,
    ModeChange, CONTROL_HEADER_LEN,
};
pub use crc::crc16_ibm;
pub use frame::{
    Frame, FrameCodec, FrameFlags, FrameType, AUTH_TOKEN_LEN, FRAME_HEADER_LEN, MAX_PAYLOAD_LEN,
};
pub use gossip::{
    GossipBody, GossipMessage, GossipType, NodeId, PeerEntry, GOSSIP_HEADER_LEN, PEER_ENTRY_LEN,
};

use thiserror::Error;

/// Typed decode failures shared by all three frame families.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Version byte outside the supported set.
    #[error("unsupported protocol version: 0x{0:02x}")]
    UnsupportedVersion(u8),

    /// Unknown frame or message type byte.
    #[error("unknown type: 0x{0:02x}")]
    UnknownType(u8),

    /// Declared length exceeds the receive buffer bound.
    #[error("declared length {declared} exceeds buffer bound {bound}")]
    LengthExceedsBuffer {
        /// Length declared in the header.
        declared: usize,
        /// Receive buffer remainder.
        bound: usize,
    },

    /// CRC-16 over header and payload did not match.
    #[error("crc mismatch: expected 0x{expected:04x}, got 0x{got:04x}")]
    CrcMismatch {
        /// CRC declared in the header.
        expected: u16,
        /// CRC computed over the received bytes.
        got: u16,
    },

    /// Truncated HMAC authentication token did not validate.
    #[error("authentication token mismatch")]
    TokenMismatch,

    /// Reserved flag bits were set.
    #[error("invalid flags: 0x{0:04x} (reserved bits must be 0)")]
    InvalidFlags(u16),

    /// Frame shorter than its fixed header.
    #[error("truncated frame: expected at least {expected} bytes, got {actual}")]
    Truncated {
        /// Minimum byte count required.
        expected: usize,
        /// Bytes available.
        actual: usize,
    },

    /// JSON parameter blob failed to parse.
    #[error("parameter blob error: {0}")]
    BadParameters(String),
}
