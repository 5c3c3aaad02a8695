use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

/// Default maximum number of log lines to keep in memory
pub const DEFAULT_MAX_LOG_LINES: usize = 10000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: String,
    pub level: LogLevel,
    pub message: String,
    pub device_id: Option<String>,
}

/// Append-only activity log.
///
/// Entries are kept in a bounded in-memory ring and appended to the log file
/// as `YYYY-mm-dd HH:MM:SS  message`. File write failures are reported through
/// `tracing` and never interrupt a run.
pub struct LogManager {
    recent: Arc<Mutex<VecDeque<LogEntry>>>,
    max_lines: usize,
    sink: Option<PathBuf>,
}

impl LogManager {
    pub fn new(max_lines: usize) -> Self {
        Self {
            recent: Arc::new(Mutex::new(VecDeque::with_capacity(max_lines.min(1024)))),
            max_lines,
            sink: None,
        }
    }

    pub fn with_file(max_lines: usize, path: PathBuf) -> Self {
        Self {
            sink: Some(path),
            ..Self::new(max_lines)
        }
    }

    pub fn log(&self, level: LogLevel, message: &str, device_id: Option<&str>) {
        let now = chrono::Local::now();
        let entry = LogEntry {
            timestamp: now.to_rfc3339(),
            level,
            message: message.to_string(),
            device_id: device_id.map(str::to_string),
        };

        match level {
            LogLevel::Info => tracing::info!(target: "activity", "{message}"),
            LogLevel::Warning => tracing::warn!(target: "activity", "{message}"),
            LogLevel::Error => tracing::error!(target: "activity", "{message}"),
        }

        if let Some(path) = &self.sink {
            let line = format!("{}  {}\n", now.format("%Y-%m-%d %H:%M:%S"), message);
            let written = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .and_then(|mut file| file.write_all(line.as_bytes()));
            if let Err(e) = written {
                tracing::warn!("Failed to append to {}: {e}", path.display());
            }
        }

        let mut logs = self.recent.lock().unwrap_or_else(|e| e.into_inner());
        logs.push_back(entry);

        // Remove from front if full
        while logs.len() > self.max_lines {
            logs.pop_front();
        }
    }

    pub fn info(&self, message: &str, device_id: Option<&str>) {
        self.log(LogLevel::Info, message, device_id);
    }

    pub fn warn(&self, message: &str, device_id: Option<&str>) {
        self.log(LogLevel::Warning, message, device_id);
    }

    pub fn error(&self, message: &str, device_id: Option<&str>) {
        self.log(LogLevel::Error, message, device_id);
    }

    pub fn get_logs(&self, device_id: Option<&str>) -> Vec<LogEntry> {
        let logs = self.recent.lock().unwrap_or_else(|e| e.into_inner());
        match device_id {
            Some(id) => logs
                .iter()
                .filter(|l| l.device_id.as_deref() == Some(id))
                .cloned()
                .collect(),
            None => logs.iter().cloned().collect(),
        }
    }
}

/// Installs the stderr `tracing` subscriber. `RUST_LOG` overrides the level.
pub fn init_tracing(devmode: bool) {
    let default_level = if devmode { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{default_level},notify=warn")));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
