//! Priority-weighted bandwidth sharing across concurrent sessions.
//!
//! Sessions register with a process-wide [`QosScheduler`] at initiation;
//! the scheduler apportions the configured bandwidth budget proportionally
//! to priority weights (1:2:3). Each session paces its chunks to its
//! current share, so send opportunities track the weights as sessions come
//! and go. Registration order is kept, giving FIFO behavior among sessions
//! of the same level.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::core::DEFAULT_NORMAL_WINDOW;
use crate::session::RttEstimator;

use super::{LossAction, SendContext, SendDecision, SendPolicy};

/// Session priority, fixed at initiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum Priority {
    /// Weight 1.
    #[default]
    Normal = 1,
    /// Weight 2.
    High = 2,
    /// Weight 3.
    Highest = 3,
}

impl Priority {
    /// Scheduling weight.
    pub fn weight(self) -> u64 {
        self as u64
    }

    /// Parse a priority level (1, 2, or 3).
    pub fn from_level(level: u8) -> Option<Self> {
        match level {
            1 => Some(Self::Normal),
            2 => Some(Self::High),
            3 => Some(Self::Highest),
            _ => None,
        }
    }

    /// Whether frames of this session carry the high-priority flag.
    pub fn is_elevated(self) -> bool {
        !matches!(self, Self::Normal)
    }
}

/// Process-wide bandwidth apportioner.
#[derive(Debug)]
pub struct QosScheduler {
    total_bandwidth: u64,
    registrations: Mutex<Vec<(u64, Priority)>>,
    next_id: AtomicU64,
}

impl QosScheduler {
    /// Create a scheduler with a bandwidth budget in bytes per second.
    pub fn new(total_bandwidth: u64) -> Self {
        Self {
            total_bandwidth: total_bandwidth.max(1),
            registrations: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a session; its share lasts until the registration drops.
    pub fn register(self: &Arc<Self>, priority: Priority) -> QosRegistration {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.registrations.lock().push((id, priority));
        QosRegistration {
            scheduler: Arc::clone(self),
            id,
            priority,
        }
    }

    fn unregister(&self, id: u64) {
        self.registrations.lock().retain(|(rid, _)| *rid != id);
    }

    /// Bytes per second currently allocated to the given registration.
    fn share(&self, id: u64) -> u64 {
        let registrations = self.registrations.lock();
        let total_weight: u64 = registrations.iter().map(|(_, p)| p.weight()).sum();
        let weight = registrations
            .iter()
            .find(|(rid, _)| *rid == id)
            .map(|(_, p)| p.weight())
            .unwrap_or(0);
        if total_weight == 0 || weight == 0 {
            return 0;
        }
        (self.total_bandwidth * weight / total_weight).max(1)
    }

    /// Number of registered sessions.
    pub fn active(&self) -> usize {
        self.registrations.lock().len()
    }
}

/// A live claim on a bandwidth share; dropping it releases the share.
#[derive(Debug)]
pub struct QosRegistration {
    scheduler: Arc<QosScheduler>,
    id: u64,
    priority: Priority,
}

impl QosRegistration {
    /// Current allocation in bytes per second.
    pub fn bandwidth(&self) -> u64 {
        self.scheduler.share(self.id)
    }

    /// This session's priority.
    pub fn priority(&self) -> Priority {
        self.priority
    }
}

impl Drop for QosRegistration {
    fn drop(&mut self) {
        self.scheduler.unregister(self.id);
    }
}

/// Paces a session to its scheduler-allocated share.
#[derive(Debug)]
pub struct QosPolicy {
    registration: QosRegistration,
    window_chunks: usize,
    next_send_at: Option<Instant>,
    rtt: RttEstimator,
}

impl QosPolicy {
    /// Register with the scheduler and create the pacing policy.
    pub fn new(scheduler: Arc<QosScheduler>, priority: Priority) -> Self {
        Self {
            registration: scheduler.register(priority),
            window_chunks: DEFAULT_NORMAL_WINDOW,
            next_send_at: None,
            rtt: RttEstimator::new(),
        }
    }

    /// This session's priority.
    pub fn priority(&self) -> Priority {
        self.registration.priority()
    }
}

impl SendPolicy for QosPolicy {
    fn decide(&mut self, ctx: &SendContext) -> SendDecision {
        if ctx.next_chunk_len.is_none() {
            return SendDecision::Suspend;
        }
        if ctx.outstanding_chunks >= self.window_chunks {
            return SendDecision::Suspend;
        }
        match self.next_send_at {
            Some(at) if ctx.now < at => SendDecision::Wait(at),
            _ => SendDecision::Transmit,
        }
    }

    fn on_transmit(&mut self, bytes: usize, now: Instant) {
        let share = self.registration.bandwidth().max(1);
        let delay = Duration::from_secs_f64(bytes as f64 / share as f64);
        self.next_send_at = Some(now + delay);
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
        self.registration.bandwidth() as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weights_split_proportionally() {
        let scheduler = Arc::new(QosScheduler::new(600_000));
        let normal = scheduler.register(Priority::Normal);
        let high = scheduler.register(Priority::High);
        let highest = scheduler.register(Priority::Highest);

        assert_eq!(normal.bandwidth(), 100_000);
        assert_eq!(high.bandwidth(), 200_000);
        assert_eq!(highest.bandwidth(), 300_000);
    }

    #[test]
    fn test_share_grows_as_sessions_leave() {
        let scheduler = Arc::new(QosScheduler::new(600_000));
        let normal = scheduler.register(Priority::Normal);
        {
            let _high = scheduler.register(Priority::High);
            assert_eq!(normal.bandwidth(), 200_000);
        }
        // High-priority session dropped its registration.
        assert_eq!(scheduler.active(), 1);
        assert_eq!(normal.bandwidth(), 600_000);
    }

    #[test]
    fn test_pacing_delay_matches_share() {
        let scheduler = Arc::new(QosScheduler::new(100_000));
        let mut policy = QosPolicy::new(scheduler, Priority::Normal);
        let now = Instant::now();

        policy.on_transmit(10_000, now);
        let ctx = SendContext {
            now,
            outstanding_bytes: 0,
            outstanding_chunks: 0,
            next_chunk_len: Some(10_000),
        };
        match policy.decide(&ctx) {
            SendDecision::Wait(at) => {
                // 10 KB at 100 KB/s is 100 ms.
                let wait = at - now;
                assert!(wait >= Duration::from_millis(99));
                assert!(wait <= Duration::from_millis(101));
            }
            other => panic!("expected Wait, got {:?}", other),
        }
    }

    #[test]
    fn test_priority_levels() {
        assert_eq!(Priority::from_level(1), Some(Priority::Normal));
        assert_eq!(Priority::from_level(3), Some(Priority::Highest));
        assert_eq!(Priority::from_level(0), None);
        assert!(Priority::Highest.is_elevated());
        assert!(!Priority::Normal.is_elevated());
    }
}
