//! Typed events between a run and the presentation layer.
//!
//! Each message also renders as one line of the pipe-delimited protocol
//! (`STEP|..`, `COUNT|..`, `ASK_PICK|<json>`, `ERROR|..`, `DONE|..`) so an
//! external GUI can drive the binary over stdio.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::activity_index::{ActivityFile, PromptKind};
use crate::config::RunMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ProgressHint {
    SpinOn,
    SpinOff,
    Percent(u8),
}

impl ProgressHint {
    fn field(self) -> String {
        match self {
            Self::SpinOn => "SPIN_ON".to_string(),
            Self::SpinOff => "SPIN_OFF".to_string(),
            Self::Percent(p) => p.min(100).to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SelectionRequest {
    pub kind: PromptKind,
    pub candidates: Vec<ActivityFile>,
}

#[derive(Serialize)]
struct CandidateLine<'a> {
    path: &'a PathBuf,
    name: &'a str,
    modified: String,
    size: u64,
    description: String,
}

impl SelectionRequest {
    pub fn to_json(&self) -> String {
        let files: Vec<CandidateLine<'_>> = self
            .candidates
            .iter()
            .map(|f| CandidateLine {
                path: &f.source,
                name: &f.file_name,
                modified: f.modified.format("%Y-%m-%d %H:%M").to_string(),
                size: f.size,
                description: f.describe(),
            })
            .collect();
        serde_json::json!({ "kind": self.kind, "files": files }).to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Done,
    PartialSuccess,
    Error,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum EmailOutcome {
    NotApplicable,
    NotAttempted,
    Sent { to: String, attachments: usize },
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedTransfer {
    pub file_name: String,
    pub reason: String,
}

/// Terminal outcome of a run, carried by the `Done`/`Error` message.
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub status: RunStatus,
    pub summary: String,
    pub mode: RunMode,
    pub percent: u8,
    pub destination: Option<PathBuf>,
    pub error_code: Option<&'static str>,
    pub device_id: Option<String>,
    pub label: Option<String>,
    pub transferred: Vec<PathBuf>,
    pub failed: Vec<FailedTransfer>,
    pub email: EmailOutcome,
}

impl RunResult {
    pub fn new(status: RunStatus, mode: RunMode, summary: impl Into<String>) -> Self {
        Self {
            status,
            summary: summary.into(),
            mode,
            percent: 0,
            destination: None,
            error_code: None,
            device_id: None,
            label: None,
            transferred: Vec::new(),
            failed: Vec::new(),
            email: match mode {
                RunMode::Email => EmailOutcome::NotAttempted,
                RunMode::Archive => EmailOutcome::NotApplicable,
            },
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.status, RunStatus::Done | RunStatus::PartialSuccess)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum WorkerMessage {
    Step { text: String, progress: ProgressHint },
    /// Seconds left in detection; `None` hides the countdown.
    Countdown { seconds_left: Option<u64> },
    AskPick(SelectionRequest),
    Error(RunResult),
    Done(RunResult),
}

impl WorkerMessage {
    pub fn step(text: impl Into<String>, progress: ProgressHint) -> Self {
        Self::Step {
            text: text.into(),
            progress,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Error(_) | Self::Done(_))
    }

    pub fn result(&self) -> Option<&RunResult> {
        match self {
            Self::Error(result) | Self::Done(result) => Some(result),
            _ => None,
        }
    }

    pub fn to_line(&self) -> String {
        match self {
            Self::Step { text, progress } => format!("STEP|{}|{}", clean(text), progress.field()),
            Self::Countdown {
                seconds_left: Some(secs),
            } => format!("COUNT|{secs}"),
            Self::Countdown { seconds_left: None } => "COUNT|HIDE".to_string(),
            Self::AskPick(request) => format!("ASK_PICK|{}", request.to_json()),
            Self::Error(result) => format!("ERROR|{}", clean(&result.summary)),
            Self::Done(result) => format!(
                "DONE|{}|{}|{}|MODE:{}",
                clean(&result.summary),
                result.percent,
                result
                    .destination
                    .as_ref()
                    .map(|d| clean(&d.display().to_string()))
                    .unwrap_or_default(),
                result.mode.marker()
            ),
        }
    }
}

/// Keeps a field on one line and free of the delimiter.
fn clean(field: &str) -> String {
    field
        .chars()
        .map(|c| match c {
            '|' => '/',
            '\n' | '\r' => ' ',
            other => other,
        })
        .collect()
}

/// The single reply to an `AskPick`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SelectionReply {
    Chosen(Vec<PathBuf>),
    Cancelled,
}

impl SelectionReply {
    /// Parses `PICK|["/path/a.fit", ...]` or `CANCEL`.
    pub fn from_line(line: &str) -> Result<Self, String> {
        let line = line.trim();
        if line == "CANCEL" {
            return Ok(Self::Cancelled);
        }
        let payload = line
            .strip_prefix("PICK|")
            .ok_or_else(|| format!("unrecognised reply: {line}"))?;
        let paths: Vec<PathBuf> =
            serde_json::from_str(payload).map_err(|e| format!("invalid PICK payload: {e}"))?;
        Ok(Self::Chosen(paths))
    }

    pub fn to_line(&self) -> String {
        match self {
            Self::Chosen(paths) => format!(
                "PICK|{}",
                serde_json::to_string(paths).unwrap_or_else(|_| "[]".to_string())
            ),
            Self::Cancelled => "CANCEL".to_string(),
        }
    }

    /// An empty pick counts as a cancellation.
    pub fn is_cancel(&self) -> bool {
        match self {
            Self::Chosen(paths) => paths.is_empty(),
            Self::Cancelled => true,
        }
    }
}
