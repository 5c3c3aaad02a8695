use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::{atomic_write_file, ProfileStore};

/// Persisted form of a device profile (`devices/<device_id>/profile.json`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoredProfile {
    pub device_id: String,
    pub model: Option<String>,
    pub label: Option<String>,
    pub degraded: bool,
    pub descriptor: BTreeMap<String, String>,
    pub last_action: Option<String>,
    pub last_files: Vec<String>,
    pub last_failed: Vec<String>,
    pub last_time: Option<String>,
    pub run_count: u64,
}

pub struct JsonProfileStore {
    devices_dir: PathBuf,
}

impl JsonProfileStore {
    pub fn new(devices_dir: PathBuf) -> Self {
        Self { devices_dir }
    }

    pub fn profile_path(&self, device_id: &str) -> PathBuf {
        self.devices_dir.join(escape_device_id(device_id)).join("profile.json")
    }
}

/// Folder name for a device id. ASCII letters, digits and `-` are kept and
/// every other byte becomes `%XX`, so distinct ids never share a folder.
fn escape_device_id(device_id: &str) -> String {
    if device_id.is_empty() {
        return "%".to_string();
    }
    let mut name = String::with_capacity(device_id.len());
    for byte in device_id.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' {
            name.push(byte as char);
        } else {
            name.push_str(&format!("%{byte:02X}"));
        }
    }
    name
}

impl ProfileStore for JsonProfileStore {
    fn load(&self, device_id: &str) -> Result<Option<StoredProfile>> {
        let path = self.profile_path(device_id);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let profile = serde_json::from_str(&raw)
            .with_context(|| format!("Invalid profile {}", path.display()))?;
        Ok(Some(profile))
    }

    fn save(&self, profile: &StoredProfile) -> Result<()> {
        let path = self.profile_path(&profile.device_id);
        let json = serde_json::to_vec_pretty(profile)?;
        atomic_write_file(&path, &json).with_context(|| format!("Failed to write {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_save_and_load() {
        let temp = TempDir::new().unwrap();
        let store = JsonProfileStore::new(temp.path().join("devices"));

        assert_eq!(store.load("3999999999").unwrap(), None);

        let profile = StoredProfile {
            device_id: "3999999999".to_string(),
            model: Some("Forerunner 245".to_string()),
            label: Some("21".to_string()),
            last_action: Some("archive".to_string()),
            last_files: vec!["20260119_21_A1.fit".to_string()],
            run_count: 1,
            ..Default::default()
        };
        store.save(&profile).unwrap();

        assert!(temp
            .path()
            .join("devices/3999999999/profile.json")
            .exists());
        assert_eq!(store.load("3999999999").unwrap(), Some(profile));
    }

    #[test]
    fn test_profile_path_stays_inside_devices_dir() {
        let store = JsonProfileStore::new(PathBuf::from("/tmp/devices"));
        assert_eq!(
            store.profile_path("3999999999"),
            PathBuf::from("/tmp/devices/3999999999/profile.json")
        );
        assert_eq!(
            store.profile_path("synth-9f2c"),
            PathBuf::from("/tmp/devices/synth-9f2c/profile.json")
        );
        assert_eq!(
            store.profile_path("../../etc"),
            PathBuf::from("/tmp/devices/%2E%2E%2F%2E%2E%2Fetc/profile.json")
        );
    }

    #[test]
    fn test_distinct_ids_get_distinct_folders() {
        let temp = TempDir::new().unwrap();
        let store = JsonProfileStore::new(temp.path().join("devices"));
        let ids = ["a:b", "ab", "a_b", "a%3Ab", "", "%"];

        let mut folders: Vec<PathBuf> = ids.iter().map(|id| store.profile_path(id)).collect();
        folders.sort();
        folders.dedup();
        assert_eq!(folders.len(), ids.len());

        for (count, id) in ids.iter().enumerate() {
            store
                .save(&StoredProfile {
                    device_id: id.to_string(),
                    run_count: count as u64,
                    ..Default::default()
                })
                .unwrap();
        }
        for (count, id) in ids.iter().enumerate() {
            assert_eq!(store.load(id).unwrap().unwrap().run_count, count as u64);
        }
    }
}
