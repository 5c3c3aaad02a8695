use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::activity_index::ActivityFile;
use crate::path_validation::sanitize_component;
use crate::transfer_engine::types::{PlannedTransfer, TransferPlan};

/// Upper bound on `_N` suffixes tried for one name.
const MAX_DISAMBIGUATION: u32 = 10_000;

/// Destination naming: `<day>_<label>[_<email>]_<original>`.
#[derive(Debug, Clone)]
pub struct NamingScheme {
    day: String,
    label: String,
    email: Option<String>,
}

impl NamingScheme {
    pub fn archive(day: &str, label: &str) -> Self {
        Self {
            day: day.to_string(),
            label: sanitize_component(label),
            email: None,
        }
    }

    pub fn email(day: &str, label: &str, email_local: &str) -> Self {
        Self {
            day: day.to_string(),
            label: sanitize_component(label),
            email: Some(sanitize_component(email_local)),
        }
    }

    pub fn file_name(&self, original: &str) -> String {
        let mut parts = vec![self.day.as_str()];
        if !self.label.is_empty() {
            parts.push(&self.label);
        }
        if let Some(email) = self.email.as_deref().filter(|e| !e.is_empty()) {
            parts.push(email);
        }
        parts.push(original);
        parts.join("_")
    }
}

impl TransferPlan {
    /// Assigns every file a destination that neither exists on disk nor is
    /// claimed by an earlier entry of the same plan.
    pub fn build(files: &[ActivityFile], dest_dir: &Path, scheme: &NamingScheme) -> Self {
        let mut taken = HashSet::new();
        let entries = files
            .iter()
            .map(|file| {
                let wanted = scheme.file_name(&file.file_name);
                let destination = disambiguate(dest_dir, &wanted, &taken);
                if let Some(name) = destination.file_name().and_then(|n| n.to_str()) {
                    taken.insert(name.to_string());
                }
                PlannedTransfer {
                    source: file.source.clone(),
                    file_name: file.file_name.clone(),
                    expected_size: file.size,
                    destination,
                }
            })
            .collect();

        Self {
            dest_dir: dest_dir.to_path_buf(),
            entries,
        }
    }
}

/// First of `name`, `stem_2.ext`, `stem_3.ext`, ... that is free.
pub fn disambiguate(dir: &Path, name: &str, taken: &HashSet<String>) -> PathBuf {
    let free = |candidate: &str| !taken.contains(candidate) && !dir.join(candidate).exists();

    if free(name) {
        return dir.join(name);
    }
    for n in 2..MAX_DISAMBIGUATION {
        let candidate = numbered(name, n);
        if free(&candidate) {
            return dir.join(candidate);
        }
    }
    // Pathological; the engine's create_new still refuses to overwrite.
    dir.join(numbered(name, MAX_DISAMBIGUATION))
}

pub fn numbered(name: &str, n: u32) -> String {
    match name.rfind('.') {
        Some(dot) if dot > 0 => format!("{}_{}{}", &name[..dot], n, &name[dot..]),
        _ => format!("{name}_{n}"),
    }
}
