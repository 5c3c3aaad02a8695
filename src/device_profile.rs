//! Device identity for a mounted watch.
//!
//! The identifier comes from `GARMIN/GarminDevice.xml`. When that file is
//! missing or unreadable the reader synthesizes a stable identifier from
//! whatever identifying fields are available, so labeling keeps working.

use std::collections::BTreeMap;
use std::hash::Hasher;
use std::path::{Path, PathBuf};

use serde::Serialize;
use twox_hash::XxHash64;

use crate::stores::LabelStore;
use crate::system_integration::{Volume, WATCH_MARKER_DIR};

pub const DEVICE_DESCRIPTOR_FILE: &str = "GarminDevice.xml";

pub const FIELD_ID: &str = "id";
pub const FIELD_MODEL: &str = "model";
pub const FIELD_PART_NUMBER: &str = "part_number";
pub const FIELD_SOFTWARE_VERSION: &str = "software_version";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceProfile {
    pub device_id: String,
    pub display_label: String,
    /// The label was generated for an unknown device and is not persisted yet.
    pub label_is_new: bool,
    pub model: Option<String>,
    pub descriptor: BTreeMap<String, String>,
    /// Why the identifier had to be synthesized, if it was.
    pub degraded_reason: Option<String>,
}

impl DeviceProfile {
    pub fn is_degraded(&self) -> bool {
        self.degraded_reason.is_some()
    }

    pub fn human_name(&self) -> String {
        format!("Garmin watch {}", self.display_label)
    }
}

pub struct DeviceProfileReader<'a> {
    labels: &'a dyn LabelStore,
}

impl<'a> DeviceProfileReader<'a> {
    pub fn new(labels: &'a dyn LabelStore) -> Self {
        Self { labels }
    }

    /// Never fails: a missing descriptor yields a degraded profile.
    pub fn read(&self, volume: &Volume) -> DeviceProfile {
        let path = descriptor_path(&volume.root);
        let parsed = std::fs::read_to_string(&path)
            .map_err(|e| format!("cannot read {}: {e}", path.display()))
            .and_then(|xml| parse_device_descriptor(&xml));

        let (descriptor, degraded_reason) = match parsed {
            Ok(fields) if fields.contains_key(FIELD_ID) => (fields, None),
            Ok(fields) => (fields, Some(format!("{DEVICE_DESCRIPTOR_FILE} has no Id"))),
            Err(reason) => (BTreeMap::new(), Some(reason)),
        };

        let device_id = match (descriptor.get(FIELD_ID), &degraded_reason) {
            (Some(id), None) => id.clone(),
            _ => synthesize_device_id(&descriptor, volume),
        };

        let (display_label, label_is_new) = match self.labels.lookup(&device_id) {
            Ok(Some(label)) => (label, false),
            Ok(None) => (placeholder_label(&device_id), true),
            Err(e) => {
                tracing::warn!("label lookup failed for {device_id}: {e:#}");
                (placeholder_label(&device_id), true)
            }
        };

        DeviceProfile {
            model: descriptor.get(FIELD_MODEL).cloned(),
            device_id,
            display_label,
            label_is_new,
            descriptor,
            degraded_reason,
        }
    }
}

pub fn descriptor_path(root: &Path) -> PathBuf {
    root.join(WATCH_MARKER_DIR).join(DEVICE_DESCRIPTOR_FILE)
}

/// Extracts the identifying fields from `GarminDevice.xml`.
///
/// Elements are matched by local name so files with or without the
/// `GarminDevice/v2` default namespace are both accepted.
pub fn parse_device_descriptor(xml: &str) -> Result<BTreeMap<String, String>, String> {
    let doc = roxmltree::Document::parse(xml)
        .map_err(|e| format!("invalid {DEVICE_DESCRIPTOR_FILE}: {e}"))?;
    let root = doc.root_element();

    let child_text = |parent: roxmltree::Node, name: &str| {
        parent
            .children()
            .find(|n| n.is_element() && n.tag_name().name() == name)
            .and_then(|n| n.text())
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
    };

    let mut fields = BTreeMap::new();
    if let Some(id) = child_text(root, "Id") {
        fields.insert(FIELD_ID.to_string(), id);
    }
    if let Some(model) = root
        .children()
        .find(|n| n.is_element() && n.tag_name().name() == "Model")
    {
        for (element, key) in [
            ("Description", FIELD_MODEL),
            ("PartNumber", FIELD_PART_NUMBER),
            ("SoftwareVersion", FIELD_SOFTWARE_VERSION),
        ] {
            if let Some(value) = child_text(model, element) {
                fields.insert(key.to_string(), value);
            }
        }
    }
    Ok(fields)
}

/// `synth-<xxhash64>` over the identifying fields that are available.
pub fn synthesize_device_id(descriptor: &BTreeMap<String, String>, volume: &Volume) -> String {
    let mut hasher = XxHash64::with_seed(0);
    let mut feed = |key: &str, value: &str| {
        hasher.write(key.as_bytes());
        hasher.write(b"=");
        hasher.write(value.as_bytes());
        hasher.write(b"\n");
    };

    for key in [FIELD_MODEL, FIELD_PART_NUMBER] {
        if let Some(value) = descriptor.get(key) {
            feed(key, value);
        }
    }
    feed("volume", &volume.name);
    if let Some(uuid) = &volume.disk_uuid {
        feed("disk_uuid", uuid);
    }

    format!("synth-{:016x}", hasher.finish())
}

/// `W-` followed by the last six alphanumerics of the id.
pub fn placeholder_label(device_id: &str) -> String {
    let tail: Vec<char> = device_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect();
    let start = tail.len().saturating_sub(6);
    let suffix: String = tail[start..].iter().collect();
    format!("W-{}", suffix.to_uppercase())
}
