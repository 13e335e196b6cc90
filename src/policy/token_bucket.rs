//! Token-bucket rate limiting.

use std::time::{Duration, Instant};

use crate::core::DEFAULT_NORMAL_WINDOW;
use crate::session::RttEstimator;

use super::{LossAction, SendContext, SendDecision, SendPolicy};

/// Paces transmission to a long-term rate of `rate` bytes per second with
/// bursts of at most `capacity` bytes.
///
/// Tokens replenish lazily on each send decision:
/// `tokens <- min(capacity, tokens + rate * dt)`. A chunk of size `s`
/// transmits iff `s <= tokens`, consuming `s`; otherwise the send step
/// waits `(s - tokens) / rate` seconds. Reliability behaves like the
/// normal policy: bounded outstanding window, terminal timeout.
#[derive(Debug)]
pub struct TokenBucketPolicy {
    capacity: f64,
    rate: f64,
    tokens: f64,
    last_refill: Option<Instant>,
    window_chunks: usize,
    rtt: RttEstimator,
}

impl TokenBucketPolicy {
    /// Create a bucket with `capacity` bytes filling at `rate` bytes/s.
    /// The bucket starts full.
    pub fn new(capacity: usize, rate: f64) -> Self {
        let capacity = (capacity.max(1)) as f64;
        Self {
            capacity,
            rate: rate.max(f64::MIN_POSITIVE),
            tokens: capacity,
            last_refill: None,
            window_chunks: DEFAULT_NORMAL_WINDOW,
            rtt: RttEstimator::new(),
        }
    }

    fn refill(&mut self, now: Instant) {
        if let Some(last) = self.last_refill {
            let dt = now.saturating_duration_since(last).as_secs_f64();
            self.tokens = (self.tokens + self.rate * dt).min(self.capacity);
        }
        self.last_refill = Some(now);
    }

    /// Tokens currently available.
    pub fn available(&self) -> f64 {
        self.tokens
    }
}

impl SendPolicy for TokenBucketPolicy {
    fn decide(&mut self, ctx: &SendContext) -> SendDecision {
        let Some(next_len) = ctx.next_chunk_len else {
            return SendDecision::Suspend;
        };
        if ctx.outstanding_chunks >= self.window_chunks {
            return SendDecision::Suspend;
        }
        self.refill(ctx.now);
        // A chunk larger than the bucket costs a full bucket; otherwise it
        // could never transmit.
        let needed = (next_len as f64).min(self.capacity);
        if needed <= self.tokens {
            SendDecision::Transmit
        } else {
            let wait = Duration::from_secs_f64((needed - self.tokens) / self.rate);
            SendDecision::Wait(ctx.now + wait)
        }
    }

    fn on_transmit(&mut self, bytes: usize, now: Instant) {
        self.refill(now);
        self.tokens = (self.tokens - bytes as f64).max(0.0);
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
        Some(self.rtt.rto().max(crate::core::INITIAL_RTO))
    }

    fn window(&self) -> usize {
        self.capacity as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx_at(now: Instant, next: usize) -> SendContext {
        SendContext {
            now,
            outstanding_bytes: 0,
            outstanding_chunks: 0,
            next_chunk_len: Some(next),
        }
    }

    #[test]
    fn test_burst_up_to_capacity() {
        let mut policy = TokenBucketPolicy::new(1024, 1024.0);
        let now = Instant::now();
        // Four 256-byte chunks drain the initial burst allowance.
        for _ in 0..4 {
            assert_eq!(policy.decide(&ctx_at(now, 256)), SendDecision::Transmit);
            policy.on_transmit(256, now);
        }
        match policy.decide(&ctx_at(now, 256)) {
            SendDecision::Wait(until) => {
                let wait = until - now;
                // 256 tokens at 1024 B/s is 250 ms.
                assert!(wait > Duration::from_millis(200));
                assert!(wait <= Duration::from_millis(260));
            }
            other => panic!("expected Wait, got {:?}", other),
        }
    }

    #[test]
    fn test_refill_over_time() {
        let mut policy = TokenBucketPolicy::new(1000, 500.0);
        let start = Instant::now();
        policy.decide(&ctx_at(start, 1000));
        policy.on_transmit(1000, start);
        assert!(policy.available() < 1.0);

        // Two simulated seconds refill the bucket to capacity.
        let later = start + Duration::from_secs(4);
        assert_eq!(policy.decide(&ctx_at(later, 1000)), SendDecision::Transmit);
        assert!(policy.available() <= 1000.0);
    }

    #[test]
    fn test_rate_bound_over_window() {
        // Over any window T >= capacity/rate, bytes <= rate * T + capacity.
        let capacity = 512usize;
        let rate = 1024.0;
        let mut policy = TokenBucketPolicy::new(capacity, rate);
        let start = Instant::now();
        let chunk = 128usize;
        let mut sent = 0usize;
        let mut now = start;
        let horizon = Duration::from_secs(3);

        while now - start < horizon {
            match policy.decide(&ctx_at(now, chunk)) {
                SendDecision::Transmit => {
                    policy.on_transmit(chunk, now);
                    sent += chunk;
                }
                SendDecision::Wait(until) => now = until,
                SendDecision::Suspend => break,
            }
        }
        let elapsed = (now - start).as_secs_f64();
        let bound = rate * elapsed + capacity as f64;
        assert!(
            (sent as f64) <= bound + 1.0,
            "sent {} exceeds bound {}",
            sent,
            bound
        );
        // The schedule should also come close to the permitted rate.
        assert!((sent as f64) > rate * elapsed * 0.8);
    }

    #[test]
    fn test_window_still_bounds_outstanding() {
        let mut policy = TokenBucketPolicy::new(1 << 20, 1e9);
        let ctx = SendContext {
            now: Instant::now(),
            outstanding_bytes: DEFAULT_NORMAL_WINDOW * 256,
            outstanding_chunks: DEFAULT_NORMAL_WINDOW,
            next_chunk_len: Some(256),
        };
        assert_eq!(policy.decide(&ctx), SendDecision::Suspend);
    }
}
