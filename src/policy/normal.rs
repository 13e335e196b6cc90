//! Unconstrained streaming behind a bounded window.

use std::time::{Duration, Instant};

use crate::session::RttEstimator;

use super::{LossAction, SendContext, SendDecision, SendPolicy};

/// Streams chunks back-to-back; a sliding window of `window_chunks`
/// outstanding ACKs bounds memory use. There is no congestion response:
/// an expired retransmission timer is terminal.
#[derive(Debug)]
pub struct NormalPolicy {
    window_chunks: usize,
    last_chunk_len: usize,
    rtt: RttEstimator,
}

impl NormalPolicy {
    /// Create a policy allowing `window_chunks` outstanding chunks.
    pub fn new(window_chunks: usize) -> Self {
        Self {
            window_chunks: window_chunks.max(1),
            last_chunk_len: 0,
            rtt: RttEstimator::new(),
        }
    }
}

impl SendPolicy for NormalPolicy {
    fn decide(&mut self, ctx: &SendContext) -> SendDecision {
        if ctx.next_chunk_len.is_none() {
            return SendDecision::Suspend;
        }
        if ctx.outstanding_chunks < self.window_chunks {
            SendDecision::Transmit
        } else {
            SendDecision::Suspend
        }
    }

    fn on_transmit(&mut self, bytes: usize, _now: Instant) {
        self.last_chunk_len = self.last_chunk_len.max(bytes);
    }

    fn on_new_ack(&mut self, _acked_bytes: usize, rtt: Option<Duration>) {
        if let Some(sample) = rtt {
            self.rtt.update(sample);
        }
    }

    fn on_dup_ack(&mut self) -> LossAction {
        LossAction::None
    }

    fn on_rto_expiry(&mut self) -> LossAction {
        LossAction::Fatal
    }

    fn rto(&self) -> Option<Duration> {
        // Without congestion response a timeout is terminal, so never run
        // the timer tighter than the initial RTO.
        Some(self.rtt.rto().max(crate::core::INITIAL_RTO))
    }

    fn window(&self) -> usize {
        self.window_chunks * self.last_chunk_len.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(outstanding_chunks: usize, next: Option<usize>) -> SendContext {
        SendContext {
            now: Instant::now(),
            outstanding_bytes: outstanding_chunks * 256,
            outstanding_chunks,
            next_chunk_len: next,
        }
    }

    #[test]
    fn test_transmits_until_window_full() {
        let mut policy = NormalPolicy::new(8);
        for outstanding in 0..8 {
            assert_eq!(
                policy.decide(&ctx(outstanding, Some(256))),
                SendDecision::Transmit
            );
        }
        assert_eq!(policy.decide(&ctx(8, Some(256))), SendDecision::Suspend);
    }

    #[test]
    fn test_suspends_when_exhausted() {
        let mut policy = NormalPolicy::new(8);
        assert_eq!(policy.decide(&ctx(0, None)), SendDecision::Suspend);
    }

    #[test]
    fn test_timeout_is_fatal() {
        let mut policy = NormalPolicy::new(8);
        assert_eq!(policy.on_rto_expiry(), LossAction::Fatal);
        assert_eq!(policy.on_dup_ack(), LossAction::None);
    }
}
