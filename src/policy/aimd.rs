//! AIMD congestion control.
//!
//! Additive increase, multiplicative decrease over a byte-granular
//! congestion window, with two independently configurable loss detectors:
//! the retransmission timer and triple duplicate ACKs. With both detectors
//! disabled the policy degrades to window-bounded streaming and a stalled
//! session becomes fatal after the maximum RTO.

use std::time::{Duration, Instant};

use crate::core::{Config, MAX_RTO};
use crate::session::RttEstimator;

use super::{LossAction, SendContext, SendDecision, SendPolicy};

/// AIMD parameters.
#[derive(Debug, Clone)]
pub struct AimdConfig {
    /// Initial congestion window in bytes.
    pub initial_window: usize,
    /// Window lower bound in bytes.
    pub min_window: usize,
    /// Window upper bound in bytes.
    pub max_window: usize,
    /// Duplicate-ACK count that triggers fast retransmit.
    pub dup_ack_threshold: u32,
    /// RTO-based loss detection.
    pub timeout_detection: bool,
    /// Duplicate-ACK loss detection.
    pub dupack_detection: bool,
}

impl Default for AimdConfig {
    fn default() -> Self {
        Self {
            initial_window: crate::core::DEFAULT_AIMD_WINDOW,
            min_window: crate::core::DEFAULT_AIMD_MIN_WINDOW,
            max_window: crate::core::DEFAULT_AIMD_MAX_WINDOW,
            dup_ack_threshold: crate::core::DEFAULT_DUP_ACK_THRESHOLD,
            timeout_detection: true,
            dupack_detection: true,
        }
    }
}

impl AimdConfig {
    /// Build from the runtime configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            initial_window: config.aimd_window,
            min_window: config.aimd_min_window,
            max_window: config.aimd_max_window,
            dup_ack_threshold: config.dup_ack_threshold,
            timeout_detection: config.timeout_detection,
            dupack_detection: config.dupack_detection,
        }
    }
}

/// The AIMD congestion controller.
#[derive(Debug)]
pub struct AimdPolicy {
    config: AimdConfig,
    mss: usize,
    cwnd: usize,
    ssthresh: usize,
    dup_acks: u32,
    in_fast_recovery: bool,
    rtt: RttEstimator,
}

impl AimdPolicy {
    /// Create a controller with `mss` equal to the negotiated chunk size.
    pub fn new(config: AimdConfig, mss: usize) -> Self {
        let mss = mss.max(1);
        let cwnd = config
            .initial_window
            .clamp(config.min_window, config.max_window);
        let ssthresh = config.max_window;
        Self {
            config,
            mss,
            cwnd,
            ssthresh,
            dup_acks: 0,
            in_fast_recovery: false,
            rtt: RttEstimator::new(),
        }
    }

    /// Current congestion window in bytes.
    pub fn cwnd(&self) -> usize {
        self.cwnd
    }

    /// Current slow-start threshold in bytes.
    pub fn ssthresh(&self) -> usize {
        self.ssthresh
    }

    /// Smoothed RTT, if sampled.
    pub fn srtt(&self) -> Option<Duration> {
        self.rtt.srtt()
    }

    fn clamp_window(&mut self) {
        self.cwnd = self.cwnd.clamp(self.config.min_window, self.config.max_window);
    }

    /// Halve the window onto the chunk-size grid, respecting the floor.
    fn multiplicative_decrease(&mut self) -> usize {
        let half = (self.cwnd / 2) / self.mss * self.mss;
        half.max(self.config.min_window)
    }
}

impl SendPolicy for AimdPolicy {
    fn decide(&mut self, ctx: &SendContext) -> SendDecision {
        let Some(next_len) = ctx.next_chunk_len else {
            return SendDecision::Suspend;
        };
        // Always allow one chunk in flight, even when the collapsed window
        // is smaller than the chunk itself.
        if ctx.outstanding_bytes == 0 || ctx.outstanding_bytes + next_len <= self.cwnd {
            SendDecision::Transmit
        } else {
            SendDecision::Suspend
        }
    }

    fn on_transmit(&mut self, _bytes: usize, _now: Instant) {}

    fn on_new_ack(&mut self, _acked_bytes: usize, rtt: Option<Duration>) {
        if let Some(sample) = rtt {
            self.rtt.update(sample);
        }
        self.dup_acks = 0;
        self.in_fast_recovery = false;

        if self.cwnd < self.ssthresh {
            // Slow start: exponential growth, one MSS per new ACK.
            self.cwnd += self.mss;
        } else {
            // Congestion avoidance: roughly one MSS per RTT.
            self.cwnd += (self.mss * self.mss / self.cwnd).max(1);
        }
        self.clamp_window();
    }

    fn on_dup_ack(&mut self) -> LossAction {
        if !self.config.dupack_detection || self.in_fast_recovery {
            return LossAction::None;
        }
        self.dup_acks += 1;
        if self.dup_acks < self.config.dup_ack_threshold {
            return LossAction::None;
        }
        self.dup_acks = 0;
        self.in_fast_recovery = true;
        let target = self.multiplicative_decrease();
        self.ssthresh = target;
        self.cwnd = target;
        self.clamp_window();
        LossAction::Retransmit
    }

    fn on_rto_expiry(&mut self) -> LossAction {
        if !self.config.timeout_detection {
            // The timer only runs here as a stall watchdog when both
            // detectors are off.
            return if self.config.dupack_detection {
                LossAction::None
            } else {
                LossAction::Stall
            };
        }
        self.ssthresh = self.multiplicative_decrease();
        self.cwnd = self.config.min_window;
        self.clamp_window();
        self.rtt.backoff();
        LossAction::Retransmit
    }

    fn rto(&self) -> Option<Duration> {
        if self.config.timeout_detection {
            Some(self.rtt.rto())
        } else if !self.config.dupack_detection {
            Some(MAX_RTO)
        } else {
            None
        }
    }

    fn window(&self) -> usize {
        self.cwnd
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KIB: usize = 1024;

    fn config() -> AimdConfig {
        AimdConfig {
            initial_window: 16 * KIB,
            min_window: 4 * KIB,
            max_window: 64 * KIB,
            dup_ack_threshold: 3,
            timeout_detection: true,
            dupack_detection: true,
        }
    }

    fn ctx(outstanding_bytes: usize, next: Option<usize>) -> SendContext {
        SendContext {
            now: Instant::now(),
            outstanding_bytes,
            outstanding_chunks: outstanding_bytes / KIB,
            next_chunk_len: next,
        }
    }

    #[test]
    fn test_window_fills_to_cwnd() {
        let mut policy = AimdPolicy::new(config(), KIB);
        assert_eq!(policy.decide(&ctx(15 * KIB, Some(KIB))), SendDecision::Transmit);
        assert_eq!(policy.decide(&ctx(16 * KIB, Some(KIB))), SendDecision::Suspend);
    }

    #[test]
    fn test_slow_start_grows_by_mss() {
        let mut policy = AimdPolicy::new(config(), KIB);
        // cwnd (16K) < ssthresh (64K): slow start.
        policy.on_new_ack(KIB, None);
        assert_eq!(policy.cwnd(), 17 * KIB);
        policy.on_new_ack(KIB, None);
        assert_eq!(policy.cwnd(), 18 * KIB);
    }

    #[test]
    fn test_congestion_avoidance_growth() {
        let mut cfg = config();
        cfg.initial_window = 32 * KIB;
        let mut policy = AimdPolicy::new(cfg, KIB);
        // Force CA by lowering ssthresh below cwnd.
        policy.ssthresh = 16 * KIB;
        let before = policy.cwnd();
        policy.on_new_ack(KIB, None);
        assert_eq!(policy.cwnd(), before + KIB * KIB / before);
    }

    #[test]
    fn test_triple_dup_ack_halves_onto_grid() {
        let mut policy = AimdPolicy::new(config(), KIB);
        assert_eq!(policy.on_dup_ack(), LossAction::None);
        assert_eq!(policy.on_dup_ack(), LossAction::None);
        assert_eq!(policy.on_dup_ack(), LossAction::Retransmit);
        assert_eq!(policy.cwnd(), 8 * KIB);
        assert_eq!(policy.ssthresh(), 8 * KIB);
        // Further duplicates inside recovery do not retrigger.
        assert_eq!(policy.on_dup_ack(), LossAction::None);
    }

    #[test]
    fn test_halving_respects_floor() {
        let mut cfg = config();
        cfg.initial_window = 5 * KIB;
        let mut policy = AimdPolicy::new(cfg, KIB);
        for _ in 0..2 {
            policy.on_dup_ack();
        }
        assert_eq!(policy.on_dup_ack(), LossAction::Retransmit);
        assert_eq!(policy.cwnd(), 4 * KIB);
    }

    #[test]
    fn test_rto_expiry_collapses_to_min() {
        let mut policy = AimdPolicy::new(config(), KIB);
        policy.rtt.update(Duration::from_millis(100));
        let rto_before = policy.rto().unwrap();
        assert_eq!(policy.on_rto_expiry(), LossAction::Retransmit);
        assert_eq!(policy.cwnd(), 4 * KIB);
        assert_eq!(policy.ssthresh(), 8 * KIB);
        assert_eq!(policy.rto().unwrap(), (rto_before * 2).min(MAX_RTO));
    }

    #[test]
    fn test_new_ack_exits_fast_recovery() {
        let mut policy = AimdPolicy::new(config(), KIB);
        for _ in 0..3 {
            policy.on_dup_ack();
        }
        policy.on_new_ack(KIB, None);
        // A fresh loss signal can trigger again.
        for _ in 0..2 {
            assert_eq!(policy.on_dup_ack(), LossAction::None);
        }
        assert_eq!(policy.on_dup_ack(), LossAction::Retransmit);
    }

    #[test]
    fn test_window_bounds_invariant() {
        let mut policy = AimdPolicy::new(config(), KIB);
        for i in 0..500 {
            match i % 7 {
                0 => {
                    policy.on_dup_ack();
                }
                1 => {
                    policy.on_rto_expiry();
                }
                _ => policy.on_new_ack(KIB, Some(Duration::from_millis(50))),
            }
            assert!(policy.cwnd() >= 4 * KIB, "cwnd below floor at step {i}");
            assert!(policy.cwnd() <= 64 * KIB, "cwnd above cap at step {i}");
        }
    }

    #[test]
    fn test_dupack_detection_disabled() {
        let mut cfg = config();
        cfg.dupack_detection = false;
        let mut policy = AimdPolicy::new(cfg, KIB);
        for _ in 0..10 {
            assert_eq!(policy.on_dup_ack(), LossAction::None);
        }
        assert_eq!(policy.cwnd(), 16 * KIB);
    }

    #[test]
    fn test_both_detectors_off_is_stall_watchdog() {
        let mut cfg = config();
        cfg.dupack_detection = false;
        cfg.timeout_detection = false;
        let mut policy = AimdPolicy::new(cfg, KIB);
        assert_eq!(policy.rto(), Some(MAX_RTO));
        assert_eq!(policy.on_rto_expiry(), LossAction::Stall);
    }

    #[test]
    fn test_timeout_off_dupack_on_runs_no_timer() {
        let mut cfg = config();
        cfg.timeout_detection = false;
        let policy = AimdPolicy::new(cfg, KIB);
        assert_eq!(policy.rto(), None);
    }
}
