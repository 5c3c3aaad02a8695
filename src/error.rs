//! Error taxonomy for a worker run.
//!
//! Every variant maps to a stable code in [`crate::error_codes`]. Messages are
//! written for the operator: they say what happened and what to do next.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::error_codes::*;
use crate::worker::RunPhase;

/// Result type used across the worker.
pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("❌ No Garmin watch detected within {waited_secs}s. Connect the watch and press Retry.")]
    DetectionTimeout { waited_secs: u64 },

    #[error("❌ {count} Garmin watches are connected ({roots}). Connect exactly one watch and press Retry.")]
    AmbiguousVolume { count: usize, roots: String },

    /// Non-fatal. Logged, never sent as an `ERROR` message.
    #[error("device descriptor unavailable, using synthesized profile: {reason}")]
    ProfileDegraded { reason: String },

    #[error("{reason}")]
    NoMatchingFiles { reason: String },

    #[error("No files could be copied: {}", .failed.join("; "))]
    TransferFailure { failed: Vec<String> },

    #[error("AUTH: {server} rejected the login. Gmail and most providers require an App Password here, not your normal password. Create one and put it in mailer.conf.json as \"password\".")]
    AuthRejected { server: String },

    #[error("Could not connect to {server}:{port} ({detail}). Check the network and the smtp_server/smtp_port in mailer.conf.json.")]
    SmtpConnectFailure {
        server: String,
        port: u16,
        detail: String,
    },

    #[error("Attachments are too large to email ({total_bytes} bytes, limit {limit_bytes} bytes). Select fewer files.")]
    AttachmentTooLarge { total_bytes: u64, limit_bytes: u64 },

    #[error("Send failed: {detail}")]
    SendFailed { detail: String },

    #[error("No file selected.")]
    SelectionCancelled,

    #[error("Cancelled by user.")]
    Cancelled,

    #[error("Config: {message}")]
    Config { message: String },

    #[error("A run is already in progress. Wait for it to finish before starting another.")]
    RunInProgress,

    #[error("internal error: invalid phase transition {from:?} -> {to:?}")]
    InvalidTransition { from: RunPhase, to: RunPhase },

    #[error("internal error: background task failed: {detail}")]
    TaskFailed { detail: String },

    #[error("{operation} failed for {}: {source}", .path.display())]
    Io {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl WorkerError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn io(operation: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            operation,
            path: path.into(),
            source,
        }
    }

    pub fn task_failed(err: tokio::task::JoinError) -> Self {
        Self::TaskFailed {
            detail: err.to_string(),
        }
    }

    /// Stable code for the presentation layer.
    pub fn code(&self) -> &'static str {
        match self {
            Self::DetectionTimeout { .. } => ERR_DETECTION_TIMEOUT,
            Self::AmbiguousVolume { .. } => ERR_AMBIGUOUS_VOLUME,
            Self::ProfileDegraded { .. } => ERR_PROFILE_DEGRADED,
            Self::NoMatchingFiles { .. } => ERR_NO_MATCHING_FILES,
            Self::TransferFailure { .. } => ERR_TRANSFER_FAILED,
            Self::AuthRejected { .. } => ERR_AUTH_REJECTED,
            Self::SmtpConnectFailure { .. } => ERR_SMTP_CONNECT,
            Self::AttachmentTooLarge { .. } => ERR_ATTACHMENT_TOO_LARGE,
            Self::SendFailed { .. } => ERR_SEND_FAILED,
            Self::SelectionCancelled => ERR_SELECTION_CANCELLED,
            Self::Cancelled => ERR_CANCELLED,
            Self::Config { .. } => ERR_CONFIG,
            Self::RunInProgress => ERR_RUN_IN_PROGRESS,
            Self::InvalidTransition { .. } => ERR_INVALID_TRANSITION,
            Self::TaskFailed { .. } => ERR_TASK_FAILED,
            Self::Io { .. } => ERR_IO,
        }
    }

    /// Whether the run ends as `CANCELLED` rather than `ERROR`.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::SelectionCancelled | Self::Cancelled)
    }
}
