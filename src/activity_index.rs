//! Activity file discovery on a mounted watch.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Local, NaiveDate};
use globset::{GlobBuilder, GlobMatcher};
use serde::Serialize;
use walkdir::WalkDir;

use crate::config::RunMode;
use crate::error::{WorkerError, WorkerResult};
use crate::fit_summary::{ActivitySummary, ActivitySummaryParser};
use crate::system_integration::Volume;

pub const ACTIVITY_PATTERN: &str = "*.fit";

const LIST_OPERATION: &str = "list activities";

/// Known activity folders, in priority order.
pub const ACTIVITY_LAYOUTS: [&[&str]; 2] = [&["GARMIN", "Activity"], &["Activity"]];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActivityFile {
    pub source: PathBuf,
    pub file_name: String,
    pub modified: DateTime<Local>,
    pub size: u64,
    pub summary: Option<ActivitySummary>,
}

impl ActivityFile {
    /// One-line description for pickers: `HH:MM  size  [sport duration]  name`.
    pub fn describe(&self) -> String {
        let mut line = format!(
            "{}  {:>8}  {}",
            self.modified.format("%Y-%m-%d %H:%M"),
            format_size(self.size),
            self.file_name
        );
        if let Some(summary) = &self.summary {
            line.push_str(&format!("  ({}", summary.sport));
            if let Some(secs) = summary.duration_secs {
                line.push_str(&format!(", {}h{:02}m", secs / 3600, (secs % 3600) / 60));
            }
            line.push(')');
        }
        line
    }
}

pub fn format_size(n: u64) -> String {
    if n >= 1024 * 1024 {
        format!("{:.1} MB", n as f64 / (1024.0 * 1024.0))
    } else if n >= 1024 {
        format!("{:.0} KB", n as f64 / 1024.0)
    } else {
        format!("{n} B")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PromptKind {
    AskToday,
    AskRecent,
}

#[derive(Debug, Clone, Copy)]
pub struct IndexFilter {
    pub mode: RunMode,
    pub today_only: bool,
    pub today: NaiveDate,
    pub recent_limit: usize,
}

impl IndexFilter {
    fn uses_date_filter(&self) -> bool {
        self.mode == RunMode::Email && self.today_only
    }

    pub fn prompt_kind(&self) -> PromptKind {
        if self.uses_date_filter() {
            PromptKind::AskToday
        } else {
            PromptKind::AskRecent
        }
    }
}

pub struct ActivityIndexer {
    matcher: GlobMatcher,
    summary_parser: Option<Arc<dyn ActivitySummaryParser>>,
}

impl ActivityIndexer {
    pub fn new(summary_parser: Option<Arc<dyn ActivitySummaryParser>>) -> Result<Self, globset::Error> {
        let matcher = GlobBuilder::new(ACTIVITY_PATTERN)
            .case_insensitive(true)
            .build()?
            .compile_matcher();
        Ok(Self {
            matcher,
            summary_parser,
        })
    }

    /// Candidate files for the run, newest first.
    pub fn list(&self, volume: &Volume, filter: &IndexFilter) -> WorkerResult<Vec<ActivityFile>> {
        let all = self.scan_files(&volume.root)?;
        if all.is_empty() {
            return Err(WorkerError::NoMatchingFiles {
                reason: "No .fit files found on the watch.".to_string(),
            });
        }

        let mut candidates: Vec<ActivityFile> = if filter.uses_date_filter() {
            all.into_iter()
                .filter(|f| f.modified.date_naive() == filter.today)
                .collect()
        } else {
            all.into_iter().take(filter.recent_limit).collect()
        };

        if candidates.is_empty() {
            return Err(WorkerError::NoMatchingFiles {
                reason: format!(
                    "No activities from today ({}) found on the watch.",
                    filter.today.format("%Y-%m-%d")
                ),
            });
        }

        if let Some(parser) = &self.summary_parser {
            for file in &mut candidates {
                file.summary = parser.summarize(&file.source);
            }
        }

        Ok(candidates)
    }

    /// Every activity file in the first layout that has any, newest first.
    /// A layout folder that exists but cannot be listed is an error, so a
    /// watch pulled out mid-listing is not reported as empty.
    pub fn scan_files(&self, root: &Path) -> WorkerResult<Vec<ActivityFile>> {
        for layout in ACTIVITY_LAYOUTS {
            let folder = layout.iter().fold(root.to_path_buf(), |p, part| p.join(part));
            match fs::metadata(&folder) {
                Ok(metadata) if metadata.is_dir() => {}
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(WorkerError::io(LIST_OPERATION, folder, e)),
            }

            let mut files = self.files_in(&folder)?;
            if !files.is_empty() {
                files.sort_by(|a, b| {
                    b.modified
                        .cmp(&a.modified)
                        .then_with(|| a.file_name.cmp(&b.file_name))
                });
                return Ok(files);
            }
        }
        Ok(Vec::new())
    }

    fn files_in(&self, folder: &Path) -> WorkerResult<Vec<ActivityFile>> {
        let mut files = Vec::new();
        for entry in WalkDir::new(folder).min_depth(1).max_depth(1) {
            let entry = entry.map_err(|e| WorkerError::io(LIST_OPERATION, folder, e.into()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(file_name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if file_name.starts_with('.') || file_name.starts_with('~') || !self.matcher.is_match(&file_name) {
                continue;
            }
            let metadata = entry
                .metadata()
                .map_err(|e| WorkerError::io(LIST_OPERATION, entry.path(), e.into()))?;
            let Ok(modified) = metadata.modified() else {
                tracing::debug!("no modification time for {}", entry.path().display());
                continue;
            };
            files.push(ActivityFile {
                source: entry.into_path(),
                file_name,
                modified: DateTime::<Local>::from(modified),
                size: metadata.len(),
                summary: None,
            });
        }
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fit_summary::FitSessionParser;
    use crate::system_integration::Platform;
    use chrono::Duration;
    use filetime::FileTime;
    use std::fs;
    use tempfile::TempDir;

    fn volume(root: &Path) -> Volume {
        Volume {
            root: root.to_path_buf(),
            platform: Platform::Linux,
            name: "GARMIN".to_string(),
            disk_uuid: None,
        }
    }

    fn write_at(path: &Path, when: DateTime<Local>) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"fit-bytes").unwrap();
        filetime::set_file_mtime(path, FileTime::from_unix_time(when.timestamp(), 0)).unwrap();
    }

    fn filter(mode: RunMode, today_only: bool) -> IndexFilter {
        IndexFilter {
            mode,
            today_only,
            today: Local::now().date_naive(),
            recent_limit: 5,
        }
    }

    #[test]
    fn test_archive_keeps_five_newest_regardless_of_date() {
        let temp = TempDir::new().unwrap();
        let activity = temp.path().join("GARMIN/Activity");
        let now = Local::now();
        for i in 0..7 {
            write_at(&activity.join(format!("A{i}.fit")), now - Duration::hours(10 * i));
        }

        let indexer = ActivityIndexer::new(None).unwrap();
        let files = indexer
            .list(&volume(temp.path()), &filter(RunMode::Archive, true))
            .unwrap();

        let names: Vec<&str> = files.iter().map(|f| f.file_name.as_str()).collect();
        assert_eq!(names, vec!["A0.fit", "A1.fit", "A2.fit", "A3.fit", "A4.fit"]);
    }

    #[test]
    fn test_email_today_only_filters_by_date() {
        let temp = TempDir::new().unwrap();
        let activity = temp.path().join("GARMIN/Activity");
        let now = Local::now();
        write_at(&activity.join("TODAY.FIT"), now);
        write_at(&activity.join("OLD.fit"), now - Duration::days(2));

        let indexer = ActivityIndexer::new(None).unwrap();
        let files = indexer
            .list(&volume(temp.path()), &filter(RunMode::Email, true))
            .unwrap();

        assert_eq!(files.len(), 1);
        assert_eq!(files[0].file_name, "TODAY.FIT");
        assert!(files.iter().all(|f| f.modified.date_naive() == now.date_naive()));
    }

    #[test]
    fn test_email_no_files_today_is_reported() {
        let temp = TempDir::new().unwrap();
        let now = Local::now();
        write_at(&temp.path().join("GARMIN/Activity/OLD.fit"), now - Duration::days(3));

        let indexer = ActivityIndexer::new(None).unwrap();
        let err = indexer
            .list(&volume(temp.path()), &filter(RunMode::Email, true))
            .unwrap_err();
        assert!(matches!(err, WorkerError::NoMatchingFiles { .. }));
        assert!(err.to_string().contains("today"));

        let relaxed = indexer
            .list(&volume(temp.path()), &filter(RunMode::Email, false))
            .unwrap();
        assert_eq!(relaxed.len(), 1);
    }

    #[test]
    fn test_layout_priority_and_filtering() {
        let temp = TempDir::new().unwrap();
        let now = Local::now();
        write_at(&temp.path().join("Activity/FALLBACK.fit"), now);
        fs::create_dir_all(temp.path().join("GARMIN/Activity")).unwrap();
        fs::write(temp.path().join("GARMIN/Activity/notes.txt"), b"x").unwrap();
        fs::write(temp.path().join("GARMIN/Activity/._HIDDEN.fit"), b"x").unwrap();

        let indexer = ActivityIndexer::new(None).unwrap();
        // GARMIN/Activity has no activity files, so the second layout is used
        let files = indexer.scan_files(temp.path()).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].file_name, "FALLBACK.fit");

        write_at(&temp.path().join("GARMIN/Activity/PRIMARY.fit"), now);
        let files = indexer.scan_files(temp.path()).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].file_name, "PRIMARY.fit");
    }

    #[test]
    fn test_empty_watch() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("GARMIN")).unwrap();

        let indexer = ActivityIndexer::new(None).unwrap();
        let err = indexer
            .list(&volume(temp.path()), &filter(RunMode::Archive, false))
            .unwrap_err();
        assert_eq!(err.to_string(), "No .fit files found on the watch.");
    }

    #[test]
    fn test_summary_parser_is_optional_strategy() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("GARMIN/Activity/RUN.fit");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, crate::fit_summary::tests::session_fit(1, 1_800_000)).unwrap();

        let indexer = ActivityIndexer::new(Some(Arc::new(FitSessionParser))).unwrap();
        let files = indexer
            .list(&volume(temp.path()), &filter(RunMode::Archive, false))
            .unwrap();
        let summary = files[0].summary.as_ref().unwrap();
        assert_eq!(summary.sport, "running");
        assert!(files[0].describe().contains("(running, 0h30m)"));
    }

    #[cfg(unix)]
    #[test]
    fn test_unreadable_activity_folder_is_an_io_error() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("GARMIN")).unwrap();
        // Self-referencing link: the folder exists but cannot be resolved
        std::os::unix::fs::symlink("Activity", temp.path().join("GARMIN/Activity")).unwrap();

        let indexer = ActivityIndexer::new(None).unwrap();
        let err = indexer
            .list(&volume(temp.path()), &filter(RunMode::Archive, false))
            .unwrap_err();
        assert!(matches!(err, WorkerError::Io { .. }));
        assert_eq!(err.code(), crate::error_codes::ERR_IO);
        assert!(err.to_string().starts_with("list activities failed for "));
    }

    #[test]
    fn test_prompt_kind() {
        assert_eq!(filter(RunMode::Email, true).prompt_kind(), PromptKind::AskToday);
        assert_eq!(filter(RunMode::Email, false).prompt_kind(), PromptKind::AskRecent);
        assert_eq!(filter(RunMode::Archive, true).prompt_kind(), PromptKind::AskRecent);
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2 KB");
        assert_eq!(format_size(3 * 1024 * 1024 / 2), "1.5 MB");
    }
}
