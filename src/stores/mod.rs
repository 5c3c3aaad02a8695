//! Persistence collaborators: the device-label mapping and per-device profiles.
//!
//! Both stores are read while profiling and written only by the worker at
//! finalize, so a write-then-rename replace is all the coordination needed.

pub mod labels;
pub mod profiles;

use std::fs;
use std::io::Write;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;

pub use labels::CsvLabelStore;
pub use profiles::{JsonProfileStore, StoredProfile};

/// device_id -> label mapping.
pub trait LabelStore: Send + Sync {
    fn lookup(&self, device_id: &str) -> Result<Option<String>>;

    /// Records `label` for `device_id`, replacing any previous label.
    fn assign(&self, device_id: &str, label: &str) -> Result<()>;
}

/// Per-device profile blobs.
pub trait ProfileStore: Send + Sync {
    fn load(&self, device_id: &str) -> Result<Option<StoredProfile>>;

    fn save(&self, profile: &StoredProfile) -> Result<()>;
}

pub(crate) fn atomic_write_file(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| std::io::Error::other("path has no parent"))?;
    fs::create_dir_all(parent)?;

    let tmp_name = format!(
        ".{}.tmp-{}-{}",
        path.file_name().and_then(|v| v.to_str()).unwrap_or("state"),
        std::process::id(),
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0),
    );
    let tmp_path = parent.join(tmp_name);

    let written = write_new(&tmp_path, content).and_then(|()| fs::rename(&tmp_path, path));
    if let Err(e) = written {
        let _ = fs::remove_file(&tmp_path);
        return Err(e);
    }
    sync_parent_dir(parent)
}

fn write_new(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let mut file = fs::OpenOptions::new().create_new(true).write(true).open(path)?;
    file.write_all(content)?;
    file.sync_all()
}

#[cfg(unix)]
fn sync_parent_dir(parent: &Path) -> std::io::Result<()> {
    fs::File::open(parent)?.sync_all()
}

#[cfg(not(unix))]
fn sync_parent_dir(_parent: &Path) -> std::io::Result<()> {
    Ok(())
}
