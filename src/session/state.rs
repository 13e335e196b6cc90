//! Transfer session state machine.
//!
//! ```text
//!   IDLE --initiate_send--> CONNECTING --init_acked--> TRANSFER
//!   CONNECTING --timeout/reset--> ERROR
//!   TRANSFER --last_chunk_acked--> VALIDATING --passed--> COMPLETED
//!   TRANSFER --peer_error/fatal_timeout--> ERROR
//!   VALIDATING --failed--> ERROR
//!   ERROR --retry--> CONNECTING
//!   COMPLETED --new_transfer--> CONNECTING
//! ```
//!
//! Cancellation is accepted from every non-terminal state and lands in
//! ERROR. Any other (state, event) pair is a [`StateError`].

use serde::{Deserialize, Serialize};

use crate::core::StateError;

/// Session lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferPhase {
    /// No session in progress.
    Idle,
    /// INIT sent, waiting for its acknowledgment.
    Connecting,
    /// Streaming chunks.
    Transfer,
    /// FIN sent, waiting for the file-level checksum verdict.
    Validating,
    /// Transfer verified byte-exact.
    Completed,
    /// Session failed.
    Error,
}

impl std::fmt::Display for TransferPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TransferPhase::Idle => "IDLE",
            TransferPhase::Connecting => "CONNECTING",
            TransferPhase::Transfer => "TRANSFER",
            TransferPhase::Validating => "VALIDATING",
            TransferPhase::Completed => "COMPLETED",
            TransferPhase::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// Events driving the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferEvent {
    /// Operator started a send.
    InitiateSend,
    /// ACK-of-INIT arrived.
    InitAcked,
    /// Handshake timed out.
    HandshakeTimeout,
    /// RST received.
    PeerReset,
    /// The final chunk was cumulatively acknowledged.
    LastChunkAcked,
    /// ERROR frame received.
    PeerError,
    /// Unrecoverable timeout during transfer.
    FatalTimeout,
    /// File-level checksum verified.
    ValidationPassed,
    /// File-level checksum mismatched.
    ValidationFailed,
    /// Operator or automatic retry after failure.
    Retry,
    /// New transfer initiated from a terminal state.
    NewTransfer,
    /// Local cancellation.
    Cancelled,
}

impl std::fmt::Display for TransferEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TransferEvent::InitiateSend => "initiate_send",
            TransferEvent::InitAcked => "init_acked",
            TransferEvent::HandshakeTimeout => "handshake_timeout",
            TransferEvent::PeerReset => "peer_reset",
            TransferEvent::LastChunkAcked => "last_chunk_acked",
            TransferEvent::PeerError => "peer_error",
            TransferEvent::FatalTimeout => "fatal_timeout",
            TransferEvent::ValidationPassed => "validation_passed",
            TransferEvent::ValidationFailed => "validation_failed",
            TransferEvent::Retry => "retry",
            TransferEvent::NewTransfer => "new_transfer",
            TransferEvent::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// The session state machine. Owned exclusively by the coordinator.
#[derive(Debug, Clone, Copy)]
pub struct StateMachine {
    phase: TransferPhase,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    /// Create a machine in IDLE.
    pub fn new() -> Self {
        Self {
            phase: TransferPhase::Idle,
        }
    }

    /// Current phase.
    pub fn phase(&self) -> TransferPhase {
        self.phase
    }

    /// Apply an event, returning the new phase.
    pub fn apply(&mut self, event: TransferEvent) -> Result<TransferPhase, StateError> {
        use TransferEvent as E;
        use TransferPhase as P;

        let next = match (self.phase, event) {
            (P::Idle, E::InitiateSend) => P::Connecting,
            (P::Connecting, E::InitAcked) => P::Transfer,
            (P::Connecting, E::HandshakeTimeout | E::PeerReset) => P::Error,
            (P::Transfer, E::LastChunkAcked) => P::Validating,
            (P::Transfer, E::PeerError | E::FatalTimeout | E::PeerReset) => P::Error,
            (P::Validating, E::ValidationPassed) => P::Completed,
            (P::Validating, E::ValidationFailed | E::PeerError | E::PeerReset | E::FatalTimeout) => {
                P::Error
            }
            (P::Error, E::Retry) => P::Connecting,
            (P::Completed, E::NewTransfer) => P::Connecting,
            (P::Idle | P::Connecting | P::Transfer | P::Validating, E::Cancelled) => P::Error,
            (phase, event) => return Err(StateError { phase, event }),
        };
        self.phase = next;
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drive(machine: &mut StateMachine, events: &[TransferEvent]) -> TransferPhase {
        let mut phase = machine.phase();
        for &event in events {
            phase = machine.apply(event).unwrap();
        }
        phase
    }

    #[test]
    fn test_happy_path() {
        let mut machine = StateMachine::new();
        let phase = drive(
            &mut machine,
            &[
                TransferEvent::InitiateSend,
                TransferEvent::InitAcked,
                TransferEvent::LastChunkAcked,
                TransferEvent::ValidationPassed,
            ],
        );
        assert_eq!(phase, TransferPhase::Completed);
    }

    #[test]
    fn test_handshake_timeout_and_retry() {
        let mut machine = StateMachine::new();
        drive(
            &mut machine,
            &[TransferEvent::InitiateSend, TransferEvent::HandshakeTimeout],
        );
        assert_eq!(machine.phase(), TransferPhase::Error);
        assert_eq!(
            machine.apply(TransferEvent::Retry).unwrap(),
            TransferPhase::Connecting
        );
    }

    #[test]
    fn test_validation_failure() {
        let mut machine = StateMachine::new();
        let phase = drive(
            &mut machine,
            &[
                TransferEvent::InitiateSend,
                TransferEvent::InitAcked,
                TransferEvent::LastChunkAcked,
                TransferEvent::ValidationFailed,
            ],
        );
        assert_eq!(phase, TransferPhase::Error);
    }

    #[test]
    fn test_completed_allows_new_transfer() {
        let mut machine = StateMachine::new();
        drive(
            &mut machine,
            &[
                TransferEvent::InitiateSend,
                TransferEvent::InitAcked,
                TransferEvent::LastChunkAcked,
                TransferEvent::ValidationPassed,
            ],
        );
        assert_eq!(
            machine.apply(TransferEvent::NewTransfer).unwrap(),
            TransferPhase::Connecting
        );
    }

    #[test]
    fn test_invalid_transitions_rejected() {
        let mut machine = StateMachine::new();
        let error = machine.apply(TransferEvent::InitAcked).unwrap_err();
        assert_eq!(error.phase, TransferPhase::Idle);
        assert_eq!(error.event, TransferEvent::InitAcked);
        // Phase is unchanged after a rejected event.
        assert_eq!(machine.phase(), TransferPhase::Idle);
    }

    #[test]
    fn test_cancellation_from_active_states() {
        for setup in [
            vec![TransferEvent::InitiateSend],
            vec![TransferEvent::InitiateSend, TransferEvent::InitAcked],
        ] {
            let mut machine = StateMachine::new();
            drive(&mut machine, &setup);
            assert_eq!(
                machine.apply(TransferEvent::Cancelled).unwrap(),
                TransferPhase::Error
            );
        }
    }
}
