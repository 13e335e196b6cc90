//! Protocol constants.
//!
//! Timing values follow RFC 6298 where applicable; window and chunk bounds
//! come from the negotiated transfer parameters.

use std::time::Duration;

/// Default chunk size in bytes (negotiated in INIT).
pub const DEFAULT_CHUNK_SIZE: usize = 4 * 1024;

/// Smallest negotiable chunk size.
pub const MIN_CHUNK_SIZE: usize = 1;

/// Largest negotiable chunk size.
pub const MAX_CHUNK_SIZE: usize = 8 * 1024;

/// Floor for the path MTU assumed by the gossip datagram layer.
pub const MTU_FLOOR: usize = 1400;

/// Initial retransmission timeout before the first RTT sample.
pub const INITIAL_RTO: Duration = Duration::from_millis(1000);

/// Minimum retransmission timeout.
pub const MIN_RTO: Duration = Duration::from_millis(200);

/// Maximum retransmission timeout.
pub const MAX_RTO: Duration = Duration::from_secs(60);

/// Alpha for SRTT smoothing (1/8).
pub const SRTT_ALPHA: f64 = 0.125;

/// Beta for RTTVAR smoothing (1/4).
pub const RTTVAR_BETA: f64 = 0.25;

/// K multiplier for RTO calculation (RFC 6298).
pub const RTO_K: f64 = 4.0;

/// Default AIMD congestion window.
pub const DEFAULT_AIMD_WINDOW: usize = 16 * 1024;

/// Default AIMD minimum window.
pub const DEFAULT_AIMD_MIN_WINDOW: usize = 4 * 1024;

/// Default AIMD maximum window.
pub const DEFAULT_AIMD_MAX_WINDOW: usize = 64 * 1024;

/// Default duplicate-ACK threshold for fast retransmit.
pub const DEFAULT_DUP_ACK_THRESHOLD: u32 = 3;

/// Default sliding window (outstanding chunks) for the normal policy.
pub const DEFAULT_NORMAL_WINDOW: usize = 8;

/// Default token-bucket burst capacity in bytes.
pub const DEFAULT_TOKEN_BUCKET_CAPACITY: usize = 64 * 1024;

/// Default token-bucket fill rate in bytes per second.
pub const DEFAULT_TOKEN_BUCKET_RATE: f64 = 1_048_576.0;

/// Default gossip round interval.
pub const DEFAULT_GOSSIP_INTERVAL: Duration = Duration::from_secs(5);

/// Default gossip fanout (peers contacted per round).
pub const DEFAULT_GOSSIP_FANOUT: usize = 3;

/// Maximum peer entries carried in one PEERS message.
pub const GOSSIP_SAMPLE_SIZE: usize = 32;

/// Default health-check interval.
pub const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// Ping deadline floor when SRTT is undefined.
pub const PING_TIMEOUT_FLOOR: Duration = Duration::from_secs(2);

/// Consecutive ping failures before a peer is marked unreachable.
pub const UNREACHABLE_AFTER_FAILURES: u32 = 3;

/// Reliability gain on a successful peer interaction.
pub const RELIABILITY_ALPHA: f64 = 0.1;

/// Reliability loss factor on a failed peer interaction.
pub const RELIABILITY_BETA: f64 = 0.2;

/// Reliability floor below which a stale peer is evicted.
pub const DEFAULT_EVICTION_FLOOR: f64 = 0.1;

/// Last-seen age beyond which a low-reliability peer is evicted.
pub const DEFAULT_EVICTION_HORIZON: Duration = Duration::from_secs(120);

/// Initial delay for connection retry backoff.
pub const BACKOFF_INITIAL: Duration = Duration::from_millis(100);

/// Backoff multiplier per failed attempt.
pub const BACKOFF_MULTIPLIER: u32 = 2;

/// Default connection attempt budget.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default handshake timeout.
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(3);

/// Default grace period for draining ACKs after cancellation.
pub const DEFAULT_CANCEL_GRACE: Duration = Duration::from_secs(1);

/// PBKDF2 iteration count for session key derivation.
pub const PBKDF2_ITERATIONS: u32 = 100_000;

/// MAC failures tolerated before the session is failed.
pub const DEFAULT_MAC_FAILURE_THRESHOLD: u32 = 8;

/// Out-of-order chunks buffered per inbound session.
pub const DEFAULT_REORDER_BUFFER_CHUNKS: usize = 64;

/// Default worker count for the parallel policy.
pub const DEFAULT_PARALLEL_THREADS: usize = 4;

/// Default process-wide bandwidth budget apportioned by the QoS scheduler,
/// in bytes per second.
pub const DEFAULT_QOS_BANDWIDTH: u64 = 1_000_000;
