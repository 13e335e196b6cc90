//! Control message encoding and decoding.
//!
//! Wire format, network byte order:
//!
//! ```text
//! header (16 bytes):
//!   version(1) type(1) message_id(2) timestamp(4) flags(2) mode(2)
//!   parameter_length(4)
//! body:
//!   JSON parameter blob of parameter_length bytes
//! ```
//!
//! The typed parameter payloads ([`FileInfo`], [`CongestionParams`],
//! [`ModeChange`], [`ErrorParams`]) serialize through `serde_json`.

use serde::{Deserialize, Serialize};

use super::WireError;
use crate::core::ReasonCode;
use crate::PROTOCOL_VERSION;

/// Control header length in bytes.
pub const CONTROL_HEADER_LEN: usize = 16;

/// Control message type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ControlType {
    /// Request a transfer-mode change.
    ModeChange = 0x01,
    /// Transfer metadata (the INIT parameter payload).
    FileInfo = 0x02,
    /// Congestion-control parameter update.
    CongestionParams = 0x03,
    /// Fatal error report.
    Error = 0xFF,
}

impl ControlType {
    /// Parse a control type byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::ModeChange),
            0x02 => Some(Self::FileInfo),
            0x03 => Some(Self::CongestionParams),
            0xFF => Some(Self::Error),
            _ => None,
        }
    }
}

/// Decoded control header fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlHeader {
    /// Message type.
    pub control_type: ControlType,
    /// Correlation id chosen by the sender.
    pub message_id: u16,
    /// Milliseconds since session start.
    pub timestamp: u32,
    /// Reserved flag bits.
    pub flags: u16,
    /// Transfer-mode discriminant for MODE_CHANGE, zero otherwise.
    pub mode: u16,
}

/// A control message with its JSON parameter blob.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlMessage {
    /// Header fields.
    pub header: ControlHeader,
    /// Parameter blob, parsed.
    pub params: serde_json::Value,
}

impl ControlMessage {
    /// Create a control message from a serializable parameter payload.
    pub fn new<P: Serialize>(
        control_type: ControlType,
        message_id: u16,
        timestamp: u32,
        params: &P,
    ) -> Self {
        Self {
            header: ControlHeader {
                control_type,
                message_id,
                timestamp,
                flags: 0,
                mode: 0,
            },
            params: serde_json::to_value(params).unwrap_or(serde_json::Value::Null),
        }
    }

    /// Encode to bytes.
    pub fn encode(&self) -> Vec<u8> {
        let blob = serde_json::to_vec(&self.params).unwrap_or_default();
        let mut buf = Vec::with_capacity(CONTROL_HEADER_LEN + blob.len());
        buf.push(PROTOCOL_VERSION);
        buf.push(self.header.control_type as u8);
        buf.extend_from_slice(&self.header.message_id.to_be_bytes());
        buf.extend_from_slice(&self.header.timestamp.to_be_bytes());
        buf.extend_from_slice(&self.header.flags.to_be_bytes());
        buf.extend_from_slice(&self.header.mode.to_be_bytes());
        buf.extend_from_slice(&(blob.len() as u32).to_be_bytes());
        buf.extend_from_slice(&blob);
        buf
    }

    /// Decode from bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() < CONTROL_HEADER_LEN {
            return Err(WireError::Truncated {
                expected: CONTROL_HEADER_LEN,
                actual: bytes.len(),
            });
        }
        if bytes[0] != PROTOCOL_VERSION {
            return Err(WireError::UnsupportedVersion(bytes[0]));
        }
        let control_type =
            ControlType::from_byte(bytes[1]).ok_or(WireError::UnknownType(bytes[1]))?;
        let message_id = u16::from_be_bytes([bytes[2], bytes[3]]);
        let timestamp = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        let flags = u16::from_be_bytes([bytes[8], bytes[9]]);
        let mode = u16::from_be_bytes([bytes[10], bytes[11]]);
        let declared =
            u32::from_be_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]) as usize;
        let blob = &bytes[CONTROL_HEADER_LEN..];
        if declared > blob.len() {
            return Err(WireError::LengthExceedsBuffer {
                declared,
                bound: blob.len(),
            });
        }
        let params = serde_json::from_slice(&blob[..declared])
            .map_err(|e| WireError::BadParameters(e.to_string()))?;
        Ok(Self {
            header: ControlHeader {
                control_type,
                message_id,
                timestamp,
                flags,
                mode,
            },
            params,
        })
    }

    /// Parse the parameter blob into a typed payload.
    pub fn parse_params<P: for<'de> Deserialize<'de>>(&self) -> Result<P, WireError> {
        serde_json::from_value(self.params.clone())
            .map_err(|e| WireError::BadParameters(e.to_string()))
    }
}

/// Transfer metadata exchanged in INIT.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    /// File name (base name only).
    pub file_name: String,
    /// Total file length in bytes.
    pub file_len: u64,
    /// Negotiated chunk size in bytes.
    pub chunk_size: u32,
    /// File-level SHA-256, hex.
    pub checksum: String,
    /// Per-session PBKDF2 salt, hex (16 bytes).
    pub salt: String,
    /// Transfer nonce shared by all sub-sessions of one transfer, hex.
    pub transfer_nonce: String,
    /// Byte offset of this sub-session's range.
    pub range_offset: u64,
    /// Byte length of this sub-session's range.
    pub range_len: u64,
    /// Zero-based index of this range.
    pub range_index: u32,
    /// Total number of ranges in the transfer.
    pub range_count: u32,
}

/// Congestion-control parameter update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CongestionParams {
    /// Initial congestion window in bytes.
    pub initial_window: u32,
    /// Window lower bound in bytes.
    pub min_window: u32,
    /// Window upper bound in bytes.
    pub max_window: u32,
    /// RTO-based loss detection enabled.
    pub timeout_detection: bool,
    /// Duplicate-ACK loss detection enabled.
    pub dupack_detection: bool,
    /// Duplicate-ACK threshold for fast retransmit.
    pub dup_ack_threshold: u32,
}

/// Transfer-mode change request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModeChange {
    /// Requested mode name.
    pub mode: String,
}

/// Fatal error report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorParams {
    /// Structured reason code.
    pub reason: ReasonCode,
    /// Human-readable detail.
    pub detail: String,
}
