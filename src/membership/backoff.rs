//! Exponential backoff for connection retries.

use std::time::Duration;

use crate::core::{BACKOFF_INITIAL, BACKOFF_MULTIPLIER};

/// Retry schedule: exponential delays starting at 100 ms, doubling per
/// attempt, bounded by a total attempt budget.
#[derive(Debug, Clone)]
pub struct Backoff {
    delay: Duration,
    attempts_left: u32,
}

impl Backoff {
    /// Create a schedule allowing `max_retries` attempts.
    pub fn new(max_retries: u32) -> Self {
        Self {
            delay: BACKOFF_INITIAL,
            attempts_left: max_retries,
        }
    }

    /// Next delay to sleep before retrying, or `None` once the budget is
    /// spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts_left == 0 {
            return None;
        }
        self.attempts_left -= 1;
        let delay = self.delay;
        self.delay = self.delay.saturating_mul(BACKOFF_MULTIPLIER);
        Some(delay)
    }

    /// Attempts remaining in the budget.
    pub fn attempts_left(&self) -> u32 {
        self.attempts_left
    }
}
