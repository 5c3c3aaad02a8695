use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlannedTransfer {
    pub source: PathBuf,
    pub file_name: String,
    /// Size recorded when the file was indexed.
    pub expected_size: u64,
    pub destination: PathBuf,
}

/// Source -> destination mapping for one run, consumed by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferPlan {
    pub dest_dir: PathBuf,
    pub entries: Vec<PlannedTransfer>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferOptions {
    pub preserve_times: bool,
    pub verify_checksum: bool,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            preserve_times: true,
            verify_checksum: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TransferErrorKind {
    CopyFailed,
    VerificationFailed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum TransferOutcome {
    Copied { destination: PathBuf, bytes: u64 },
    Failed { kind: TransferErrorKind, reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileTransferResult {
    pub source: PathBuf,
    pub file_name: String,
    pub outcome: TransferOutcome,
}

impl FileTransferResult {
    pub fn destination(&self) -> Option<&PathBuf> {
        match &self.outcome {
            TransferOutcome::Copied { destination, .. } => Some(destination),
            TransferOutcome::Failed { .. } => None,
        }
    }

    /// `name (reason)` for failed files.
    pub fn failure_line(&self) -> Option<String> {
        match &self.outcome {
            TransferOutcome::Failed { reason, .. } => Some(format!("{} ({})", self.file_name, reason)),
            TransferOutcome::Copied { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransferReport {
    pub results: Vec<FileTransferResult>,
    pub bytes_copied: u64,
    /// Cancellation was honoured between files; later entries were not attempted.
    pub cancelled: bool,
}

impl TransferReport {
    pub fn copied(&self) -> Vec<&FileTransferResult> {
        self.results
            .iter()
            .filter(|r| matches!(r.outcome, TransferOutcome::Copied { .. }))
            .collect()
    }

    pub fn failed(&self) -> Vec<&FileTransferResult> {
        self.results
            .iter()
            .filter(|r| matches!(r.outcome, TransferOutcome::Failed { .. }))
            .collect()
    }

    pub fn destinations(&self) -> Vec<PathBuf> {
        self.results
            .iter()
            .filter_map(|r| r.destination().cloned())
            .collect()
    }

    pub fn failure_lines(&self) -> Vec<String> {
        self.results.iter().filter_map(|r| r.failure_line()).collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TransferProgress {
    pub index: usize,
    pub total: usize,
    pub file_name: String,
    pub bytes_copied: u64,
    pub total_bytes: u64,
}
