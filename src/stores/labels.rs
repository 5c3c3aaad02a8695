use std::fs;
use std::io;
use std::path::PathBuf;

use anyhow::{Context, Result};

use super::{atomic_write_file, LabelStore};

const LABELS_HEADER: &str = "# watch-labels.csv
# Format: device_id,label
# Add one line per watch to map Garmin device IDs to your workshop label numbers.
# Example:
# A1B2C3D4,21
# E7F8G9H0,7
";

/// `watch-labels.csv`: one `device_id,label` pair per line, `#` comments.
pub struct CsvLabelStore {
    path: PathBuf,
}

impl CsvLabelStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Creates the file with commented example rows if it does not exist.
    pub fn ensure_exists(&self) -> Result<()> {
        if self.path.exists() {
            return Ok(());
        }
        atomic_write_file(&self.path, LABELS_HEADER.as_bytes())
            .with_context(|| format!("Failed to create {}", self.path.display()))
    }

    /// File content; a missing file reads as the commented template without
    /// being created.
    fn read_raw(&self) -> Result<String> {
        match fs::read_to_string(&self.path) {
            Ok(raw) => Ok(raw),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(LABELS_HEADER.to_string()),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", self.path.display())),
        }
    }

    pub fn entries(&self) -> Result<Vec<(String, String)>> {
        Ok(self.read_raw()?.lines().filter_map(parse_line).collect())
    }
}

fn parse_line(raw: &str) -> Option<(String, String)> {
    let line = raw.trim();
    if line.is_empty() || line.starts_with('#') || line.to_lowercase().starts_with("device_id,") {
        return None;
    }
    let mut parts = line.split(',').map(str::trim);
    let device_id = parts.next()?;
    let label = parts.next()?;
    if device_id.is_empty() || label.is_empty() {
        return None;
    }
    Some((device_id.to_string(), label.to_string()))
}

impl LabelStore for CsvLabelStore {
    fn lookup(&self, device_id: &str) -> Result<Option<String>> {
        Ok(self
            .entries()?
            .into_iter()
            .find(|(id, _)| id == device_id)
            .map(|(_, label)| label))
    }

    fn assign(&self, device_id: &str, label: &str) -> Result<()> {
        let raw = self.read_raw()?;
        let mut lines: Vec<String> = raw
            .lines()
            .filter(|line| !matches!(parse_line(line), Some((id, _)) if id == device_id))
            .map(str::to_string)
            .collect();
        lines.push(format!("{device_id},{label}"));

        let mut content = lines.join("\n");
        content.push('\n');
        atomic_write_file(&self.path, content.as_bytes())
            .with_context(|| format!("Failed to write {}", self.path.display()))
    }
}
