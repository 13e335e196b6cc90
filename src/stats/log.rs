//! Append-only transfer log.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::session::TransferSummary;

/// JSON-lines log of session summaries.
///
/// Each finished session appends one line. The log is the only state the
/// core persists besides received files; there is no cross-process session
/// resumption.
#[derive(Debug, Clone)]
pub struct TransferLog {
    path: PathBuf,
}

impl TransferLog {
    /// Create a logger writing to `path`.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Append one session summary.
    pub fn append(&self, summary: &TransferSummary) -> std::io::Result<()> {
        let line = serde_json::to_string(summary)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{line}")
    }

    /// Append, logging instead of propagating failures. Used at session
    /// teardown where the transfer outcome must not be masked by a logging
    /// error.
    pub fn append_best_effort(&self, summary: &TransferSummary) {
        if let Err(error) = self.append(summary) {
            warn!(path = %self.path.display(), %error, "transfer log append failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ReasonCode;

    fn summary(name: &str) -> TransferSummary {
        TransferSummary {
            file_name: name.into(),
            remote: "127.0.0.1:7000".into(),
            policy: "normal".into(),
            bytes_sent: 1024,
            chunks_sent: 4,
            retransmits: 0,
            duration_ms: 12,
            outcome: ReasonCode::Ok,
            endpoints: Vec::new(),
        }
    }

    #[test]
    fn test_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transfers.jsonl");
        let log = TransferLog::new(&path);

        log.append(&summary("a.bin")).unwrap();
        log.append(&summary("b.bin")).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: TransferSummary = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed.file_name, "a.bin");
        assert_eq!(parsed.outcome, ReasonCode::Ok);
    }
}
