//! Runtime configuration.

use std::path::PathBuf;
use std::time::Duration;

use super::constants;

/// Transfer mode selected when none is requested explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferMode {
    /// Back-to-back streaming behind a bounded window.
    #[default]
    Normal,
    /// Token-bucket rate limiting.
    TokenBucket,
    /// AIMD congestion control.
    Aimd,
    /// Priority-weighted scheduling.
    Qos,
    /// Parallel range workers.
    Parallel,
    /// One-to-many unicast fanout.
    Multicast,
}

/// Configuration for senders, receivers, and the membership layer.
///
/// `Default` holds the documented defaults; construct and override fields
/// as needed.
#[derive(Debug, Clone)]
pub struct Config {
    /// Mode used when the caller does not pick a policy explicitly.
    pub default_mode: TransferMode,
    /// Interval between gossip rounds.
    pub gossip_interval: Duration,
    /// Disable the gossip service entirely.
    pub disable_gossip: bool,
    /// Peers contacted per gossip round.
    pub gossip_fanout: usize,
    /// Initial AIMD congestion window in bytes.
    pub aimd_window: usize,
    /// AIMD window lower bound in bytes.
    pub aimd_min_window: usize,
    /// AIMD window upper bound in bytes.
    pub aimd_max_window: usize,
    /// Duplicate-ACK count that triggers fast retransmit.
    pub dup_ack_threshold: u32,
    /// Token-bucket burst capacity in bytes.
    pub token_bucket_capacity: usize,
    /// Token-bucket fill rate in bytes per second.
    pub token_bucket_rate: f64,
    /// Enable RTO-based loss detection.
    pub timeout_detection: bool,
    /// Enable duplicate-ACK loss detection.
    pub dupack_detection: bool,
    /// Worker count for the parallel policy.
    pub parallel_threads: usize,
    /// Connection attempt budget.
    pub max_retries: u32,
    /// Handshake timeout.
    pub connection_timeout: Duration,
    /// Interval between peer health checks.
    pub health_check_interval: Duration,
    /// Chunk size offered in INIT (clamped to the negotiable range).
    pub chunk_size: usize,
    /// Assumed path MTU floor for gossip datagrams.
    pub mtu_floor: usize,
    /// Shared secret for session key derivation.
    pub shared_secret: Vec<u8>,
    /// PBKDF2 iteration count.
    pub pbkdf2_iterations: u32,
    /// MAC failures tolerated before the session fails.
    pub mac_failure_threshold: u32,
    /// Out-of-order chunks buffered per inbound session.
    pub reorder_buffer_chunks: usize,
    /// Process-wide bandwidth budget for the QoS scheduler, bytes/s.
    pub qos_bandwidth: u64,
    /// Grace period for draining ACKs after cancellation.
    pub cancel_grace: Duration,
    /// Directory where received files are written.
    pub data_dir: PathBuf,
    /// Append-only JSON-lines transfer log; `None` disables logging.
    pub transfer_log: Option<PathBuf>,
    /// Reliability floor below which stale peers are evicted.
    pub eviction_floor: f64,
    /// Last-seen age beyond which low-reliability peers are evicted.
    pub eviction_horizon: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_mode: TransferMode::Normal,
            gossip_interval: constants::DEFAULT_GOSSIP_INTERVAL,
            disable_gossip: false,
            gossip_fanout: constants::DEFAULT_GOSSIP_FANOUT,
            aimd_window: constants::DEFAULT_AIMD_WINDOW,
            aimd_min_window: constants::DEFAULT_AIMD_MIN_WINDOW,
            aimd_max_window: constants::DEFAULT_AIMD_MAX_WINDOW,
            dup_ack_threshold: constants::DEFAULT_DUP_ACK_THRESHOLD,
            token_bucket_capacity: constants::DEFAULT_TOKEN_BUCKET_CAPACITY,
            token_bucket_rate: constants::DEFAULT_TOKEN_BUCKET_RATE,
            timeout_detection: true,
            dupack_detection: true,
            parallel_threads: constants::DEFAULT_PARALLEL_THREADS,
            max_retries: constants::DEFAULT_MAX_RETRIES,
            connection_timeout: constants::DEFAULT_CONNECTION_TIMEOUT,
            health_check_interval: constants::DEFAULT_HEALTH_CHECK_INTERVAL,
            chunk_size: constants::DEFAULT_CHUNK_SIZE,
            mtu_floor: constants::MTU_FLOOR,
            shared_secret: Vec::new(),
            pbkdf2_iterations: constants::PBKDF2_ITERATIONS,
            mac_failure_threshold: constants::DEFAULT_MAC_FAILURE_THRESHOLD,
            reorder_buffer_chunks: constants::DEFAULT_REORDER_BUFFER_CHUNKS,
            qos_bandwidth: constants::DEFAULT_QOS_BANDWIDTH,
            cancel_grace: constants::DEFAULT_CANCEL_GRACE,
            data_dir: PathBuf::from("."),
            transfer_log: None,
            eviction_floor: constants::DEFAULT_EVICTION_FLOOR,
            eviction_horizon: constants::DEFAULT_EVICTION_HORIZON,
        }
    }
}

impl Config {
    /// Chunk size clamped to the negotiable range.
    pub fn effective_chunk_size(&self) -> usize {
        self.chunk_size
            .clamp(constants::MIN_CHUNK_SIZE, constants::MAX_CHUNK_SIZE)
    }

    /// Validate cross-field invariants.
    pub fn validate(&self) -> Result<(), super::TransferError> {
        if self.aimd_min_window == 0 || self.aimd_min_window > self.aimd_max_window {
            return Err(super::TransferError::Config(format!(
                "aimd window bounds invalid: min {} max {}",
                self.aimd_min_window, self.aimd_max_window
            )));
        }
        if self.parallel_threads == 0 {
            return Err(super::TransferError::Config(
                "parallel_threads must be at least 1".into(),
            ));
        }
        if self.token_bucket_rate <= 0.0 || self.token_bucket_capacity == 0 {
            return Err(super::TransferError::Config(
                "token bucket needs a positive rate and capacity".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.default_mode, TransferMode::Normal);
        assert_eq!(config.gossip_interval, Duration::from_secs(5));
        assert_eq!(config.aimd_window, 16 * 1024);
        assert_eq!(config.aimd_min_window, 4 * 1024);
        assert_eq!(config.aimd_max_window, 64 * 1024);
        assert_eq!(config.parallel_threads, 4);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.connection_timeout, Duration::from_secs(3));
        assert_eq!(config.health_check_interval, Duration::from_secs(10));
        assert_eq!(config.chunk_size, 4 * 1024);
        assert_eq!(config.mtu_floor, 1400);
        assert_eq!(config.token_bucket_capacity, 64 * 1024);
        assert!((config.token_bucket_rate - 1_048_576.0).abs() < f64::EPSILON);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_chunk_size_clamped() {
        let mut config = Config::default();
        config.chunk_size = 1024 * 1024;
        assert_eq!(config.effective_chunk_size(), 8 * 1024);
        config.chunk_size = 0;
        assert_eq!(config.effective_chunk_size(), 1);
    }

    #[test]
    fn test_validate_rejects_bad_windows() {
        let mut config = Config::default();
        config.aimd_min_window = 128 * 1024;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_token_bucket() {
        let mut config = Config::default();
        config.token_bucket_rate = 0.0;
        assert!(config.validate().is_err());
        config.token_bucket_rate = 1024.0;
        config.token_bucket_capacity = 0;
        assert!(config.validate().is_err());
    }
}
