//! Multi-session transfer bookkeeping.
//!
//! Parallel senders open one connection per range, all sharing a transfer
//! nonce. The registry creates and sizes the output file exactly once and
//! answers, per FIN, whether the whole transfer is now complete.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

/// Verdict after a range completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RangeCompletion {
    /// Other ranges are still in flight.
    MoreRemaining,
    /// Every range landed; the file is ready for checksum verification.
    AllComplete,
}

#[derive(Debug)]
struct TransferEntry {
    path: PathBuf,
    range_count: u32,
    completed: HashSet<u32>,
}

/// Registry of in-flight inbound transfers keyed by transfer nonce.
#[derive(Debug, Default)]
pub struct TransferRegistry {
    inner: Mutex<HashMap<String, TransferEntry>>,
}

impl TransferRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session for a transfer, creating and sizing the output
    /// file on first sight of the nonce. File creation happens under the
    /// registry lock so concurrent range sessions cannot race it.
    pub(crate) fn register(
        &self,
        nonce: &str,
        range_count: u32,
        path: &Path,
        file_len: u64,
    ) -> std::io::Result<()> {
        let mut inner = self.inner.lock();
        if !inner.contains_key(nonce) {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(path)?;
            file.set_len(file_len)?;
            inner.insert(
                nonce.to_string(),
                TransferEntry {
                    path: path.to_path_buf(),
                    range_count: range_count.max(1),
                    completed: HashSet::new(),
                },
            );
        }
        Ok(())
    }

    /// Mark a range complete.
    pub(crate) fn complete_range(&self, nonce: &str, index: u32) -> RangeCompletion {
        let mut inner = self.inner.lock();
        match inner.get_mut(nonce) {
            Some(entry) => {
                entry.completed.insert(index);
                if entry.completed.len() as u32 >= entry.range_count {
                    RangeCompletion::AllComplete
                } else {
                    RangeCompletion::MoreRemaining
                }
            }
            None => RangeCompletion::AllComplete,
        }
    }

    /// Drop a transfer, optionally deleting its output file.
    pub(crate) fn forget(&self, nonce: &str, delete_output: bool) {
        let entry = self.inner.lock().remove(nonce);
        if let Some(entry) = entry {
            if delete_output {
                let _ = std::fs::remove_file(&entry.path);
            }
        }
    }

    /// Transfers currently in flight.
    pub fn in_flight(&self) -> usize {
        self.inner.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_creates_and_sizes_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let registry = TransferRegistry::new();

        registry.register("n1", 4, &path, 1024).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 1024);

        // A second range session must not truncate the file.
        std::fs::write(&path, vec![7u8; 512]).unwrap();
        registry.register("n1", 4, &path, 1024).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 512);
        assert_eq!(registry.in_flight(), 1);
    }

    #[test]
    fn test_completion_counts_ranges() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let registry = TransferRegistry::new();
        registry.register("n1", 3, &path, 64).unwrap();

        assert_eq!(registry.complete_range("n1", 0), RangeCompletion::MoreRemaining);
        assert_eq!(registry.complete_range("n1", 1), RangeCompletion::MoreRemaining);
        // Duplicate completion of the same range does not finish early.
        assert_eq!(registry.complete_range("n1", 1), RangeCompletion::MoreRemaining);
        assert_eq!(registry.complete_range("n1", 2), RangeCompletion::AllComplete);
    }

    #[test]
    fn test_forget_deletes_output() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.bin");
        let registry = TransferRegistry::new();
        registry.register("n1", 1, &path, 16).unwrap();
        registry.forget("n1", true);
        assert!(!path.exists());
    }
}
