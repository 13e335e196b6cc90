//! Error types.
//!
//! One enum per layer, composed into [`TransferError`] at the top. Transient
//! transport errors are absorbed by retry/backoff at the membership and
//! coordinator layers; everything else fails the session with a structured
//! [`ReasonCode`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::CryptoError;
use crate::wire::WireError;

/// Invalid state-machine transitions.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("invalid transition: {event} in {phase}")]
pub struct StateError {
    /// Phase the session was in.
    pub phase: crate::session::TransferPhase,
    /// Event that had no transition.
    pub event: crate::session::TransferEvent,
}

/// Errors in the membership layer.
#[derive(Debug, Error)]
pub enum MembershipError {
    /// Socket-level failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed gossip datagram.
    #[error("gossip decode error: {0}")]
    Decode(#[from] WireError),
}

/// Top-level transfer errors.
#[derive(Debug, Error)]
pub enum TransferError {
    /// Transport-layer failure (connect refused, reset, write failure).
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Protocol violation on the wire.
    #[error("protocol error: {0}")]
    Protocol(#[from] WireError),

    /// Envelope encryption or authentication failure.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// File-level checksum mismatch at FIN.
    #[error("integrity error: file checksum mismatch")]
    Integrity,

    /// Handshake did not complete within the connection timeout.
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// Retransmission budget or RTO discipline gave up on the session.
    #[error("session timed out waiting for acknowledgment")]
    AckTimeout,

    /// No ACK progress within max_RTO while both loss detectors are off.
    #[error("session stalled with loss detection disabled")]
    Stalled,

    /// Too many MAC failures on one session.
    #[error("MAC failure rate exceeded threshold")]
    MacFailureRate,

    /// Peer sent an ERROR or RST frame.
    #[error("peer aborted the session: {0}")]
    PeerAbort(String),

    /// Session cancelled locally.
    #[error("session cancelled")]
    Cancelled,

    /// Invalid state-machine transition.
    #[error(transparent)]
    State(#[from] StateError),

    /// Membership-layer failure.
    #[error(transparent)]
    Membership(#[from] MembershipError),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl TransferError {
    /// Structured reason code for summaries and the transfer log.
    pub fn reason_code(&self) -> ReasonCode {
        match self {
            TransferError::Transport(_) => ReasonCode::Transport,
            TransferError::Protocol(_) => ReasonCode::Protocol,
            TransferError::Crypto(_) | TransferError::MacFailureRate => ReasonCode::Crypto,
            TransferError::Integrity => ReasonCode::Integrity,
            TransferError::HandshakeTimeout
            | TransferError::AckTimeout
            | TransferError::Stalled => ReasonCode::Timeout,
            TransferError::PeerAbort(_) => ReasonCode::PeerAbort,
            TransferError::Cancelled => ReasonCode::Cancelled,
            TransferError::State(_) | TransferError::Config(_) => ReasonCode::Internal,
            TransferError::Membership(_) => ReasonCode::Transport,
        }
    }

    /// Whether retry/backoff may recover this error.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransferError::Transport(_) | TransferError::Membership(_)
        )
    }
}

/// Structured failure classification reported to the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    /// Completed without error.
    Ok,
    /// Transport-layer failure after retries.
    Transport,
    /// Protocol violation; no retry.
    Protocol,
    /// Cryptographic failure.
    Crypto,
    /// File integrity failure.
    Integrity,
    /// A timeout discipline gave up.
    Timeout,
    /// The peer aborted.
    PeerAbort,
    /// Cancelled by the operator.
    Cancelled,
    /// Internal invariant violation.
    Internal,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_codes() {
        assert_eq!(
            TransferError::Integrity.reason_code(),
            ReasonCode::Integrity
        );
        assert_eq!(TransferError::Stalled.reason_code(), ReasonCode::Timeout);
        assert_eq!(
            TransferError::Cancelled.reason_code(),
            ReasonCode::Cancelled
        );
    }

    #[test]
    fn test_transient_classification() {
        let io = std::io::Error::from(std::io::ErrorKind::ConnectionRefused);
        assert!(TransferError::Transport(io).is_transient());
        assert!(!TransferError::Integrity.is_transient());
    }
}
