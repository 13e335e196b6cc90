//! Send-side transmission policies.
//!
//! Every per-stream policy implements the same send-step contract
//! ([`SendPolicy`]): given the session's outstanding data, its window, and
//! the size of the next chunk, answer whether to transmit now, wait until a
//! wall-clock instant, or suspend until an ACK arrives. The coordinator owns
//! the I/O and calls back into the policy on ACKs and timer expiry.
//!
//! Policy parameters are a tagged variant ([`PolicyKind`]); the coordinator
//! dispatches on the tag. Parallel and multicast are orchestrations over
//! sub-sessions rather than per-stream disciplines; their parameters live
//! here, their drivers in [`crate::session`].

mod aimd;
mod normal;
mod qos;
mod token_bucket;

pub use aimd::{AimdConfig, AimdPolicy};
pub use normal::NormalPolicy;
pub use qos::{Priority, QosPolicy, QosRegistration, QosScheduler};
pub use token_bucket::TokenBucketPolicy;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::core::{Config, TransferMode, DEFAULT_NORMAL_WINDOW};

/// Everything a policy may inspect when making a send decision.
#[derive(Debug, Clone, Copy)]
pub struct SendContext {
    /// Decision time.
    pub now: Instant,
    /// Bytes transmitted but not yet cumulatively acknowledged.
    pub outstanding_bytes: usize,
    /// Chunks transmitted but not yet cumulatively acknowledged.
    pub outstanding_chunks: usize,
    /// Size of the next chunk, or `None` when the iterator is exhausted.
    pub next_chunk_len: Option<usize>,
}

/// Outcome of one send step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendDecision {
    /// Transmit the next chunk now.
    Transmit,
    /// Re-evaluate at the given instant (pacing delay).
    Wait(Instant),
    /// Yield until an ACK arrives.
    Suspend,
}

/// Loss-handling verdict from an ACK or timer event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossAction {
    /// Nothing to do.
    None,
    /// Retransmit the lowest unacknowledged chunk.
    Retransmit,
    /// The session has failed waiting for acknowledgment.
    Fatal,
    /// No loss detection is active and the session made no progress for
    /// the maximum RTO; fatal with a distinct reason.
    Stall,
}

/// The send-step contract shared by all per-stream policies.
pub trait SendPolicy: Send {
    /// Decide what the sender should do next.
    fn decide(&mut self, ctx: &SendContext) -> SendDecision;

    /// A chunk of `bytes` was handed to the transport at `now`.
    fn on_transmit(&mut self, bytes: usize, now: Instant);

    /// A new cumulative ACK advanced the left edge by `acked_bytes`.
    /// `rtt` carries the timestamp-echo sample when the acknowledged chunk
    /// was never retransmitted.
    fn on_new_ack(&mut self, acked_bytes: usize, rtt: Option<Duration>);

    /// A duplicate cumulative ACK arrived.
    fn on_dup_ack(&mut self) -> LossAction;

    /// The retransmission timer fired.
    fn on_rto_expiry(&mut self) -> LossAction;

    /// Timer duration the coordinator should arm, or `None` when this
    /// policy runs without one.
    fn rto(&self) -> Option<Duration>;

    /// Current window in bytes.
    fn window(&self) -> usize;
}

/// Tagged policy descriptor handed to the coordinator.
#[derive(Debug, Clone)]
pub enum PolicyKind {
    /// Back-to-back streaming behind a bounded chunk window.
    Normal {
        /// Maximum outstanding chunks.
        window_chunks: usize,
    },
    /// Token-bucket rate limiting.
    TokenBucket {
        /// Bucket capacity in bytes.
        capacity: usize,
        /// Fill rate in bytes per second.
        rate: f64,
    },
    /// AIMD congestion control.
    Aimd(AimdConfig),
    /// Priority-weighted bandwidth sharing.
    Qos {
        /// Fixed session priority.
        priority: Priority,
    },
    /// Split the file into worker ranges, one sub-session each.
    Parallel {
        /// Worker count.
        workers: usize,
    },
    /// Independent unicast sessions to every endpoint.
    Multicast {
        /// Destination endpoints.
        endpoints: Vec<SocketAddr>,
    },
}

impl Default for PolicyKind {
    fn default() -> Self {
        Self::Normal {
            window_chunks: DEFAULT_NORMAL_WINDOW,
        }
    }
}

impl PolicyKind {
    /// Policy for the configured `default_mode`, parameterized from the
    /// same configuration. Multicast has no default endpoint set and
    /// comes back empty; callers fill it in.
    pub fn from_config(config: &Config) -> Self {
        match config.default_mode {
            TransferMode::Normal => PolicyKind::Normal {
                window_chunks: DEFAULT_NORMAL_WINDOW,
            },
            TransferMode::TokenBucket => PolicyKind::TokenBucket {
                capacity: config.token_bucket_capacity,
                rate: config.token_bucket_rate,
            },
            TransferMode::Aimd => PolicyKind::Aimd(AimdConfig::from_config(config)),
            TransferMode::Qos => PolicyKind::Qos {
                priority: Priority::Normal,
            },
            TransferMode::Parallel => PolicyKind::Parallel {
                workers: config.parallel_threads,
            },
            TransferMode::Multicast => PolicyKind::Multicast {
                endpoints: Vec::new(),
            },
        }
    }

    /// Short name for logs and summaries.
    pub fn name(&self) -> &'static str {
        match self {
            PolicyKind::Normal { .. } => "normal",
            PolicyKind::TokenBucket { .. } => "token-bucket",
            PolicyKind::Aimd(_) => "aimd",
            PolicyKind::Qos { .. } => "qos",
            PolicyKind::Parallel { .. } => "parallel",
            PolicyKind::Multicast { .. } => "multicast",
        }
    }

    /// Build the per-stream policy for this descriptor.
    ///
    /// `Parallel` and `Multicast` fall back to the bounded-window discipline
    /// for each of their sub-sessions.
    pub fn build_stream_policy(
        &self,
        chunk_size: usize,
        scheduler: &Arc<QosScheduler>,
    ) -> Box<dyn SendPolicy> {
        match self {
            PolicyKind::Normal { window_chunks } => Box::new(NormalPolicy::new(*window_chunks)),
            PolicyKind::TokenBucket { capacity, rate } => {
                Box::new(TokenBucketPolicy::new(*capacity, *rate))
            }
            PolicyKind::Aimd(aimd) => Box::new(AimdPolicy::new(aimd.clone(), chunk_size)),
            PolicyKind::Qos { priority } => {
                Box::new(QosPolicy::new(Arc::clone(scheduler), *priority))
            }
            PolicyKind::Parallel { .. } | PolicyKind::Multicast { .. } => {
                Box::new(NormalPolicy::new(DEFAULT_NORMAL_WINDOW))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_normal() {
        assert!(matches!(
            PolicyKind::default(),
            PolicyKind::Normal { window_chunks } if window_chunks == DEFAULT_NORMAL_WINDOW
        ));
    }

    #[test]
    fn test_from_config_follows_default_mode() {
        let mut config = Config::default();
        assert_eq!(PolicyKind::from_config(&config).name(), "normal");

        config.default_mode = TransferMode::TokenBucket;
        config.token_bucket_capacity = 2048;
        config.token_bucket_rate = 4096.0;
        assert!(matches!(
            PolicyKind::from_config(&config),
            PolicyKind::TokenBucket { capacity: 2048, rate } if rate == 4096.0
        ));

        config.default_mode = TransferMode::Aimd;
        config.aimd_window = 32 * 1024;
        match PolicyKind::from_config(&config) {
            PolicyKind::Aimd(aimd) => assert_eq!(aimd.initial_window, 32 * 1024),
            other => panic!("expected Aimd, got {:?}", other),
        }

        config.default_mode = TransferMode::Parallel;
        config.parallel_threads = 8;
        assert!(matches!(
            PolicyKind::from_config(&config),
            PolicyKind::Parallel { workers: 8 }
        ));
    }
}
