//! In-order reassembly with bounded out-of-order buffering.

use std::collections::BTreeMap;

/// Where an accepted chunk ended up.
#[derive(Debug, PartialEq, Eq)]
pub enum Placement {
    /// An in-order run starting with the accepted chunk; write these at
    /// their offsets and advance the cumulative ACK.
    Deliver(Vec<(u64, Vec<u8>)>),
    /// Sequence below next-expected (or already buffered); payload
    /// ignored, latest cumulative ACK must be re-emitted.
    Duplicate,
    /// Buffered out of order.
    Buffered,
    /// Dropped by the overflow policy (highest offset first).
    Dropped,
}

/// Reassembly state for one inbound session.
///
/// `next_expected` is strictly monotone for the lifetime of the session;
/// the out-of-order buffer is capped and sheds highest-offset chunks
/// first on overflow.
#[derive(Debug)]
pub struct Reassembler {
    next_expected: u64,
    total_chunks: u64,
    buffer: BTreeMap<u64, Vec<u8>>,
    cap: usize,
}

impl Reassembler {
    /// Create a reassembler expecting `total_chunks` chunks, buffering at
    /// most `cap` out-of-order chunks.
    pub fn new(total_chunks: u64, cap: usize) -> Self {
        Self {
            next_expected: 0,
            total_chunks,
            buffer: BTreeMap::new(),
            cap: cap.max(1),
        }
    }

    /// Accept a chunk with an unwrapped sequence.
    pub fn accept(&mut self, seq: u64, payload: Vec<u8>) -> Placement {
        if seq < self.next_expected || seq >= self.total_chunks {
            return Placement::Duplicate;
        }
        if seq == self.next_expected {
            let mut run = vec![(seq, payload)];
            self.next_expected += 1;
            while let Some(buffered) = self.buffer.remove(&self.next_expected) {
                run.push((self.next_expected, buffered));
                self.next_expected += 1;
            }
            return Placement::Deliver(run);
        }

        if self.buffer.contains_key(&seq) {
            return Placement::Duplicate;
        }
        self.buffer.insert(seq, payload);
        if self.buffer.len() > self.cap {
            // Shed the highest offset; that may be the chunk just added.
            if let Some((&highest, _)) = self.buffer.iter().next_back() {
                self.buffer.remove(&highest);
                if highest == seq {
                    return Placement::Dropped;
                }
            }
        }
        Placement::Buffered
    }

    /// Next in-order sequence expected.
    pub fn next_expected(&self) -> u64 {
        self.next_expected
    }

    /// Cumulative ACK wire value: `next_expected - 1` modulo 65536, which
    /// is 0xFFFF before any in-order delivery.
    pub fn cumulative_wire(&self) -> u16 {
        (self.next_expected.wrapping_sub(1) % 65_536) as u16
    }

    /// Whether every chunk has been delivered in order.
    pub fn is_complete(&self) -> bool {
        self.next_expected >= self.total_chunks
    }

    /// Out-of-order chunks currently held.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Buffer capacity.
    pub fn cap(&self) -> usize {
        self.cap
    }
}
