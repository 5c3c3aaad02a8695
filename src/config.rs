//! Application folders, settings, SMTP credentials and the mail template.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

pub const APP_NAME: &str = "GarminMailer";

const SETTINGS_FILE: &str = "settings.yaml";
const SMTP_FILE: &str = "mailer.conf.json";
const TEMPLATE_FILE: &str = "mail-template.txt";
const LABELS_FILE: &str = "watch-labels.csv";

pub const NAME_PLACEHOLDER: &str = "{name}";
pub const DEFAULT_TEMPLATE: &str =
    "Hi {name},\n\nAttached is the latest Garmin FIT file.\n\n- Garmin Mailer\n";

/// Operating mode of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Email,
    Archive,
}

impl RunMode {
    /// Marker used in the `DONE` line and in log lines.
    pub fn marker(self) -> &'static str {
        match self {
            RunMode::Email => "EMAIL",
            RunMode::Archive => "ARCHIVE",
        }
    }
}

/// Folder layout under `~/Documents/GarminMailer`.
#[derive(Debug, Clone)]
pub struct AppPaths {
    pub base: PathBuf,
}

impl AppPaths {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    /// `~/Documents/GarminMailer`, falling back to `$HOME/Documents`.
    pub fn default_location() -> Result<Self> {
        let documents = dirs::document_dir()
            .or_else(|| dirs::home_dir().map(|home| home.join("Documents")))
            .ok_or_else(|| anyhow!("Cannot resolve the Documents folder"))?;
        Ok(Self::new(documents.join(APP_NAME)))
    }

    pub fn sent_root(&self) -> PathBuf {
        self.base.join("sent")
    }

    pub fn archive_root(&self) -> PathBuf {
        self.base.join("archive")
    }

    pub fn devices_dir(&self) -> PathBuf {
        self.base.join("devices")
    }

    pub fn outbox_dir(&self) -> PathBuf {
        self.base.join("outbox")
    }

    pub fn labels_csv(&self) -> PathBuf {
        self.base.join(LABELS_FILE)
    }

    pub fn log_file(&self) -> PathBuf {
        self.base.join(format!("{APP_NAME}.log"))
    }

    pub fn settings_file(&self) -> PathBuf {
        self.base.join(SETTINGS_FILE)
    }

    pub fn smtp_file(&self) -> PathBuf {
        self.base.join(SMTP_FILE)
    }

    pub fn template_file(&self) -> PathBuf {
        self.base.join(TEMPLATE_FILE)
    }

    /// Dated destination folder for a mode, e.g. `archive/20260119`.
    pub fn day_dir(&self, mode: RunMode, day: &str) -> PathBuf {
        match mode {
            RunMode::Email => self.sent_root().join(day),
            RunMode::Archive => self.archive_root().join(day),
        }
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [
            self.base.clone(),
            self.sent_root(),
            self.archive_root(),
            self.devices_dir(),
        ] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub default_mode: RunMode,
    pub today_only: bool,
    pub devmode: bool,
    pub detect_timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub recent_limit: usize,
    pub unmount_after_copy: bool,
    pub verify_checksum: bool,
    pub max_attachment_bytes: u64,
    pub smtp_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            default_mode: RunMode::Email,
            today_only: true,
            devmode: false,
            detect_timeout_secs: 30,
            poll_interval_ms: 500,
            recent_limit: 5,
            unmount_after_copy: true,
            verify_checksum: false,
            max_attachment_bytes: 25 * 1024 * 1024,
            smtp_timeout_secs: 30,
        }
    }
}

impl Settings {
    /// Loads `settings.yaml`, writing the defaults on first run.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if !path.exists() {
            let settings = Self::default();
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(path, serde_yaml::to_string(&settings)?)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            return Ok(settings);
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let settings: Self = serde_yaml::from_str(&raw)
            .with_context(|| format!("Invalid settings in {}", path.display()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.detect_timeout_secs == 0 {
            anyhow::bail!("detect_timeout_secs must be greater than 0");
        }
        if self.poll_interval_ms == 0 {
            anyhow::bail!("poll_interval_ms must be greater than 0");
        }
        if self.recent_limit == 0 {
            anyhow::bail!("recent_limit must be greater than 0");
        }
        Ok(())
    }
}

/// Contents of `mailer.conf.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpSettings {
    pub smtp_server: String,
    pub smtp_port: u16,
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub from_address: Option<String>,
}

impl SmtpSettings {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            anyhow::bail!(
                "Config not found: {}\nCreate JSON with the Gmail SMTP server, port 465, your username and App Password.",
                path.display()
            );
        }
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("Invalid {}", path.display()))
    }

    pub fn sender(&self) -> &str {
        self.from_address.as_deref().unwrap_or(&self.username)
    }
}

/// Mail body template with a `{name}` placeholder.
#[derive(Debug, Clone)]
pub struct MailTemplate {
    body: String,
}

impl Default for MailTemplate {
    fn default() -> Self {
        Self {
            body: DEFAULT_TEMPLATE.to_string(),
        }
    }
}

impl MailTemplate {
    pub fn new(body: impl Into<String>) -> Self {
        Self { body: body.into() }
    }

    /// Reads the template file, creating it with the default body if absent.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if !path.exists() {
            fs::write(path, DEFAULT_TEMPLATE)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            return Ok(Self::default());
        }
        let body = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Ok(Self { body })
    }

    pub fn render(&self, name: &str) -> String {
        self.body.replace(NAME_PLACEHOLDER, name)
    }
}
