//! Transfer sessions.
//!
//! The [`SessionCoordinator`] owns a session's state machine, binds it to a
//! transmission policy, and pumps frame I/O. Parallel and multicast
//! transfers are orchestrations of several single-stream sessions.

mod coordinator;
mod sender;
mod state;
mod timing;

pub use coordinator::{CancelHandle, EndpointOutcome, SessionCoordinator, TransferSummary};
pub use state::{StateMachine, TransferEvent, TransferPhase};
pub use timing::RttEstimator;

pub(crate) use sender::read_frame_until;

use std::time::Instant;

/// Milliseconds since the session epoch, as carried in frame timestamps.
pub(crate) fn elapsed_ms(epoch: Instant) -> u32 {
    epoch.elapsed().as_millis() as u32
}

use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::io::AsyncReadExt;

use crate::wire::FrameType;

/// Reconstruct a 64-bit logical sequence from its 16-bit wire form,
/// choosing the value closest to `reference`.
pub(crate) fn unwrap_sequence(wire: u16, reference: u64) -> u64 {
    const SPAN: u64 = 1 << 16;
    let wire = u64::from(wire);
    let base = reference & !(SPAN - 1);
    let mut best = base + wire;
    for candidate in [base.checked_sub(SPAN).map(|b| b + wire), Some(base + SPAN + wire)]
        .into_iter()
        .flatten()
    {
        if candidate.abs_diff(reference) < best.abs_diff(reference) {
            best = candidate;
        }
    }
    best
}

/// Associated data authenticated by the chunk envelope: the stable header
/// prefix (version, type, sequence, timestamp).
pub(crate) fn frame_aad(frame_type: FrameType, sequence: u16, timestamp: u32) -> [u8; 8] {
    let mut aad = [0u8; 8];
    aad[0] = crate::PROTOCOL_VERSION;
    aad[1] = frame_type.as_byte();
    aad[2..4].copy_from_slice(&sequence.to_be_bytes());
    aad[4..8].copy_from_slice(&timestamp.to_be_bytes());
    aad
}

pub(crate) fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

pub(crate) fn hex_decode(text: &str) -> Option<Vec<u8>> {
    if text.len() % 2 != 0 {
        return None;
    }
    (0..text.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&text[i..i + 2], 16).ok())
        .collect()
}

/// Stream a file's SHA-256.
pub(crate) async fn file_sha256(path: &Path) -> std::io::Result<[u8; 32]> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().into())
}
