//! Session coordination and multi-session orchestration.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::core::{Config, ReasonCode, TransferError};
use crate::crypto::generate_salt;
use crate::policy::{PolicyKind, QosScheduler};
use crate::stats::{NullObserver, TransferLog, TransferObserver};
use crate::wire::FileInfo;

use super::sender::{run_sender, SessionOutcome, SessionParams};
use super::{file_sha256, hex_encode};

/// Outcome of one multicast endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointOutcome {
    /// Destination endpoint.
    pub remote: String,
    /// Structured result.
    pub outcome: ReasonCode,
    /// Wall-clock duration of this endpoint's session.
    pub duration_ms: u64,
}

/// Summary of a finished transfer, also the transfer-log record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferSummary {
    /// File base name.
    pub file_name: String,
    /// Primary destination (or "multicast" fanout size).
    pub remote: String,
    /// Policy name.
    pub policy: String,
    /// Bytes handed to the transport, retransmissions included.
    pub bytes_sent: u64,
    /// Chunks handed to the transport.
    pub chunks_sent: u64,
    /// Retransmitted chunks.
    pub retransmits: u64,
    /// Wall-clock duration.
    pub duration_ms: u64,
    /// Structured result.
    pub outcome: ReasonCode,
    /// Per-endpoint outcomes for multicast, empty otherwise.
    pub endpoints: Vec<EndpointOutcome>,
}

/// Cancels the sessions driven by one coordinator.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    /// Signal cancellation; every suspension point observes it promptly.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// Binds a transmission policy to transfer sessions and drives them.
///
/// One coordinator serves one operator-visible transfer at a time; QoS
/// coordinators sharing a process should share a [`QosScheduler`] via
/// [`SessionCoordinator::with_scheduler`].
pub struct SessionCoordinator {
    config: Config,
    policy: PolicyKind,
    observer: Arc<dyn TransferObserver>,
    scheduler: Arc<QosScheduler>,
    cancel_tx: watch::Sender<bool>,
    cancel_rx: watch::Receiver<bool>,
    log: Option<TransferLog>,
}

impl SessionCoordinator {
    /// Create a coordinator for the given policy.
    pub fn new(config: Config, policy: PolicyKind) -> Self {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let scheduler = Arc::new(QosScheduler::new(config.qos_bandwidth));
        let log = config.transfer_log.as_ref().map(TransferLog::new);
        Self {
            config,
            policy,
            observer: Arc::new(NullObserver),
            scheduler,
            cancel_tx,
            cancel_rx,
            log,
        }
    }

    /// Inject an observer for lifecycle and chunk events.
    pub fn with_observer(mut self, observer: Arc<dyn TransferObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Share a QoS scheduler with other coordinators in this process.
    pub fn with_scheduler(mut self, scheduler: Arc<QosScheduler>) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// Handle for cancelling this coordinator's sessions.
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            tx: self.cancel_tx.clone(),
        }
    }

    /// Send a file to `target` under this coordinator's policy.
    ///
    /// On failure the summary still reaches the transfer log with its
    /// reason code before the error propagates.
    pub async fn send_file(
        &mut self,
        path: &Path,
        target: SocketAddr,
    ) -> Result<TransferSummary, TransferError> {
        self.config.validate()?;
        let file_len = tokio::fs::metadata(path).await?.len();
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unnamed".into());
        let checksum = hex_encode(&file_sha256(path).await?);
        info!(file = %file_name, len = file_len, policy = self.policy.name(), "initiating transfer");

        let summary = match self.policy.clone() {
            PolicyKind::Parallel { workers } => {
                self.send_parallel(path, target, &file_name, file_len, &checksum, workers)
                    .await
            }
            PolicyKind::Multicast { endpoints } => {
                self.send_multicast(path, &file_name, file_len, &checksum, endpoints)
                    .await
            }
            policy => {
                self.send_single(path, target, &file_name, file_len, &checksum, policy)
                    .await
            }
        };

        if let Some(log) = &self.log {
            log.append_best_effort(&summary);
        }
        match summary.outcome {
            ReasonCode::Ok => Ok(summary),
            _ => Err(summary_error(&summary)),
        }
    }

    fn base_info(
        &self,
        file_name: &str,
        file_len: u64,
        checksum: &str,
        salt: &[u8],
        nonce: &[u8],
    ) -> FileInfo {
        FileInfo {
            file_name: file_name.into(),
            file_len,
            chunk_size: self.config.effective_chunk_size() as u32,
            checksum: checksum.into(),
            salt: hex_encode(salt),
            transfer_nonce: hex_encode(nonce),
            range_offset: 0,
            range_len: file_len,
            range_index: 0,
            range_count: 1,
        }
    }

    fn session_params(&self, path: &Path, target: SocketAddr, info: FileInfo) -> SessionParams {
        let high_priority = matches!(
            &self.policy,
            PolicyKind::Qos { priority } if priority.is_elevated()
        );
        SessionParams {
            config: self.config.clone(),
            path: path.to_path_buf(),
            target,
            policy: self
                .policy
                .build_stream_policy(info.chunk_size as usize, &self.scheduler),
            info,
            observer: Arc::clone(&self.observer),
            cancel: self.cancel_rx.clone(),
            high_priority,
        }
    }

    async fn send_single(
        &self,
        path: &Path,
        target: SocketAddr,
        file_name: &str,
        file_len: u64,
        checksum: &str,
        policy: PolicyKind,
    ) -> TransferSummary {
        let salt = generate_salt();
        let nonce: [u8; 16] = rand::random();
        let info = self.base_info(file_name, file_len, checksum, &salt, &nonce);
        let outcome = run_sender(self.session_params(path, target, info)).await;
        summarize(file_name, &target.to_string(), policy.name(), &[outcome])
    }

    async fn send_parallel(
        &self,
        path: &Path,
        target: SocketAddr,
        file_name: &str,
        file_len: u64,
        checksum: &str,
        workers: usize,
    ) -> TransferSummary {
        let workers = workers.max(1) as u64;
        let per_range = file_len.div_ceil(workers).max(1);
        let mut ranges = Vec::new();
        let mut offset = 0u64;
        while offset < file_len || (file_len == 0 && ranges.is_empty()) {
            let len = (file_len - offset).min(per_range);
            ranges.push((offset, len));
            offset += per_range;
        }
        let range_count = ranges.len() as u32;

        let salt = generate_salt();
        let nonce: [u8; 16] = rand::random();
        let mut handles = Vec::with_capacity(ranges.len());
        for (index, (range_offset, range_len)) in ranges.into_iter().enumerate() {
            let mut info = self.base_info(file_name, file_len, checksum, &salt, &nonce);
            info.range_offset = range_offset;
            info.range_len = range_len;
            info.range_index = index as u32;
            info.range_count = range_count;
            handles.push(tokio::spawn(run_sender(
                self.session_params(path, target, info),
            )));
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        for handle in handles {
            outcomes.push(join_outcome(handle.await));
        }
        summarize(file_name, &target.to_string(), "parallel", &outcomes)
    }

    async fn send_multicast(
        &self,
        path: &Path,
        file_name: &str,
        file_len: u64,
        checksum: &str,
        endpoints: Vec<SocketAddr>,
    ) -> TransferSummary {
        let salt = generate_salt();
        let nonce: [u8; 16] = rand::random();
        let mut handles = Vec::with_capacity(endpoints.len());
        for endpoint in &endpoints {
            let info = self.base_info(file_name, file_len, checksum, &salt, &nonce);
            handles.push((
                *endpoint,
                tokio::spawn(run_sender(self.session_params(path, *endpoint, info))),
            ));
        }

        let mut outcomes = Vec::new();
        let mut endpoint_outcomes = Vec::new();
        for (endpoint, handle) in handles {
            let outcome = join_outcome(handle.await);
            endpoint_outcomes.push(EndpointOutcome {
                remote: endpoint.to_string(),
                outcome: outcome
                    .result
                    .as_ref()
                    .map(|_| ReasonCode::Ok)
                    .unwrap_or_else(|e| e.reason_code()),
                duration_ms: outcome.duration_ms,
            });
            outcomes.push(outcome);
        }

        // One endpoint failing does not fail the others: the aggregate is
        // OK when at least one copy landed, and the per-endpoint outcomes
        // carry the details.
        let any_ok = outcomes.iter().any(|o| o.result.is_ok());
        let mut summary = summarize(
            file_name,
            &format!("multicast({})", endpoint_outcomes.len()),
            "multicast",
            &outcomes,
        );
        if any_ok {
            summary.outcome = ReasonCode::Ok;
        }
        summary.endpoints = endpoint_outcomes;
        summary
    }
}

fn join_outcome(joined: Result<SessionOutcome, tokio::task::JoinError>) -> SessionOutcome {
    match joined {
        Ok(outcome) => outcome,
        Err(error) => {
            warn!(%error, "session task failed to join");
            SessionOutcome {
                bytes_sent: 0,
                chunks_sent: 0,
                retransmits: 0,
                duration_ms: 0,
                result: Err(TransferError::Config(format!(
                    "session task failed: {error}"
                ))),
            }
        }
    }
}

fn summarize(
    file_name: &str,
    remote: &str,
    policy: &str,
    outcomes: &[SessionOutcome],
) -> TransferSummary {
    let outcome = outcomes
        .iter()
        .find_map(|o| o.result.as_ref().err().map(TransferError::reason_code))
        .unwrap_or(ReasonCode::Ok);
    TransferSummary {
        file_name: file_name.into(),
        remote: remote.into(),
        policy: policy.into(),
        bytes_sent: outcomes.iter().map(|o| o.bytes_sent).sum(),
        chunks_sent: outcomes.iter().map(|o| o.chunks_sent).sum(),
        retransmits: outcomes.iter().map(|o| o.retransmits).sum(),
        duration_ms: outcomes.iter().map(|o| o.duration_ms).max().unwrap_or(0),
        outcome,
        endpoints: Vec::new(),
    }
}

fn summary_error(summary: &TransferSummary) -> TransferError {
    match summary.outcome {
        ReasonCode::Integrity => TransferError::Integrity,
        ReasonCode::Cancelled => TransferError::Cancelled,
        ReasonCode::Timeout => TransferError::AckTimeout,
        ReasonCode::Crypto => TransferError::MacFailureRate,
        ReasonCode::PeerAbort => TransferError::PeerAbort("session failed".into()),
        _ => TransferError::Config(format!("transfer failed: {:?}", summary.outcome)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summarize_aggregates() {
        let outcomes = [
            SessionOutcome {
                bytes_sent: 100,
                chunks_sent: 2,
                retransmits: 1,
                duration_ms: 10,
                result: Ok(()),
            },
            SessionOutcome {
                bytes_sent: 200,
                chunks_sent: 3,
                retransmits: 0,
                duration_ms: 25,
                result: Ok(()),
            },
        ];
        let summary = summarize("f", "r", "parallel", &outcomes);
        assert_eq!(summary.bytes_sent, 300);
        assert_eq!(summary.chunks_sent, 5);
        assert_eq!(summary.retransmits, 1);
        assert_eq!(summary.duration_ms, 25);
        assert_eq!(summary.outcome, ReasonCode::Ok);
    }

    #[test]
    fn test_summarize_reports_first_failure() {
        let outcomes = [
            SessionOutcome {
                bytes_sent: 0,
                chunks_sent: 0,
                retransmits: 0,
                duration_ms: 5,
                result: Err(TransferError::Integrity),
            },
            SessionOutcome {
                bytes_sent: 10,
                chunks_sent: 1,
                retransmits: 0,
                duration_ms: 7,
                result: Ok(()),
            },
        ];
        let summary = summarize("f", "r", "parallel", &outcomes);
        assert_eq!(summary.outcome, ReasonCode::Integrity);
    }
}
