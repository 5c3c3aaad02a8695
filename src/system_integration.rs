//! 시계 볼륨 감지 및 꺼내기
//!
//! 플랫폼별 마운트 테이블을 조사하는 [`VolumeScanner`] 구현 두 가지와,
//! 제한 시간 안에 정확히 하나의 시계를 찾는 [`scan`] 루프를 제공합니다.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{WorkerError, WorkerResult};
use crate::watcher::MountWatcher;

/// Marker directory that identifies a Garmin watch volume.
pub const WATCH_MARKER_DIR: &str = "GARMIN";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    MacOs,
    Linux,
    Windows,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(target_os = "macos") {
            Platform::MacOs
        } else if cfg!(windows) {
            Platform::Windows
        } else {
            Platform::Linux
        }
    }
}

/// A mounted watch volume, discovered fresh for every run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub root: PathBuf,
    pub platform: Platform,
    /// Volume label or drive letter
    pub name: String,
    /// 파티션 UUID (포맷 후에도 유지됨). macOS에서만 조회합니다.
    pub disk_uuid: Option<String>,
}

/// Platform probe for mounted watch volumes.
pub trait VolumeScanner: Send + Sync {
    fn platform(&self) -> Platform;

    /// One pass over the mount table, returning every volume that carries
    /// the watch marker.
    fn probe(&self) -> Vec<Volume>;

    /// Directories whose changes signal a mount or unmount.
    fn watch_roots(&self) -> Vec<PathBuf> {
        Vec::new()
    }

    fn eject(&self, volume: &Volume) -> Result<()>;
}

pub fn is_watch_volume(root: &Path) -> bool {
    root.join(WATCH_MARKER_DIR).is_dir()
}

/// Picks the scanner for the platform we are running on.
pub fn platform_scanner() -> Box<dyn VolumeScanner> {
    match Platform::current() {
        Platform::Windows => Box::new(DriveLetterScanner::new()),
        Platform::MacOs => Box::new(MountDirectoryScanner::new(
            vec![PathBuf::from("/Volumes")],
            Platform::MacOs,
        )),
        Platform::Linux => Box::new(MountDirectoryScanner::new(
            linux_mount_roots(),
            Platform::Linux,
        )),
    }
}

fn linux_mount_roots() -> Vec<PathBuf> {
    let mut roots = Vec::new();
    if let Ok(user) = std::env::var("USER") {
        roots.push(PathBuf::from("/run/media").join(&user));
        roots.push(PathBuf::from("/media").join(&user));
    }
    roots.push(PathBuf::from("/media"));
    roots
}

/// Scanner for platforms that mount removable volumes as children of a
/// directory (`/Volumes` on macOS, `/media/$USER` on Linux).
pub struct MountDirectoryScanner {
    mount_roots: Vec<PathBuf>,
    platform: Platform,
}

impl MountDirectoryScanner {
    pub fn new(mount_roots: Vec<PathBuf>, platform: Platform) -> Self {
        Self {
            mount_roots,
            platform,
        }
    }

    /// Every directory under the mount roots, watch or not.
    pub fn mounted_directories(&self) -> Vec<PathBuf> {
        let mut seen = HashSet::new();
        let mut dirs = Vec::new();

        for root in &self.mount_roots {
            let Ok(entries) = std::fs::read_dir(root) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if !path.is_dir() {
                    continue;
                }
                let key = path.canonicalize().unwrap_or_else(|_| path.clone());
                if seen.insert(key) {
                    dirs.push(path);
                }
            }
        }

        dirs.sort();
        dirs
    }

    /// 마운트 포인트로부터 Disk/Partition UUID를 획득합니다.
    /// `diskutil info -plist <mount_point>` 명령을 사용합니다.
    fn get_disk_uuid(&self, mount_point: &Path) -> Option<String> {
        if self.platform != Platform::MacOs {
            return None;
        }

        let output = Command::new("diskutil")
            .arg("info")
            .arg("-plist")
            .arg(mount_point)
            .output()
            .ok()?;

        if !output.status.success() {
            return None;
        }

        parse_disk_uuid_from_plist(&output.stdout)
    }

    /// Removable 디스크를 언마운트합니다.
    fn unmount(&self, path: &Path) -> Result<()> {
        use crate::path_validation::{validate_path, verify_path_exists};
        use std::thread;

        let path_str = path
            .to_str()
            .ok_or_else(|| anyhow!("Invalid path: contains non-UTF-8 characters"))?;

        validate_path(path_str).map_err(|e| anyhow!("Path validation failed: {}", e))?;
        verify_path_exists(path).map_err(|e| anyhow!("Path verification failed: {}", e))?;

        if !self.mount_roots.iter().any(|root| path.starts_with(root)) {
            bail!("Invalid volume path: not under a mount root, got: {}", path_str);
        }

        let (program, max_retries) = match self.platform {
            Platform::MacOs => ("diskutil", 3),
            _ => ("umount", 1),
        };
        let mut last_error = String::new();

        for attempt in 1..=max_retries {
            let mut command = Command::new(program);
            if self.platform == Platform::MacOs {
                command.arg("unmount");
            }
            let output = command
                .arg(path)
                .output()
                .map_err(|e| anyhow!("{} execution failed: {}", program, e))?;

            if output.status.success() {
                return Ok(());
            }

            last_error = String::from_utf8_lossy(&output.stderr).trim().to_string();

            if attempt < max_retries {
                thread::sleep(Duration::from_secs(1));
            }
        }

        bail!("Unmount failed ({} attempts): {}", max_retries, last_error)
    }
}

impl VolumeScanner for MountDirectoryScanner {
    fn platform(&self) -> Platform {
        self.platform
    }

    fn probe(&self) -> Vec<Volume> {
        self.mounted_directories()
            .into_iter()
            .filter(|path| is_watch_volume(path))
            .map(|path| Volume {
                name: path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or("Unknown")
                    .to_string(),
                disk_uuid: self.get_disk_uuid(&path),
                platform: self.platform,
                root: path,
            })
            .collect()
    }

    fn watch_roots(&self) -> Vec<PathBuf> {
        self.mount_roots
            .iter()
            .filter(|root| root.is_dir())
            .cloned()
            .collect()
    }

    fn eject(&self, volume: &Volume) -> Result<()> {
        self.unmount(&volume.root)
    }
}

/// Scanner for drive-letter platforms (Windows).
pub struct DriveLetterScanner {
    letters: Vec<char>,
}

impl Default for DriveLetterScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl DriveLetterScanner {
    pub fn new() -> Self {
        Self {
            letters: ('A'..='Z').collect(),
        }
    }
}

impl VolumeScanner for DriveLetterScanner {
    fn platform(&self) -> Platform {
        Platform::Windows
    }

    fn probe(&self) -> Vec<Volume> {
        self.letters
            .iter()
            .map(|letter| (letter, PathBuf::from(format!("{letter}:\\"))))
            .filter(|(_, root)| root.exists() && is_watch_volume(root))
            .map(|(letter, root)| Volume {
                root,
                platform: Platform::Windows,
                name: format!("{letter}:"),
                disk_uuid: None,
            })
            .collect()
    }

    fn eject(&self, volume: &Volume) -> Result<()> {
        bail!("Eject is not supported for drive {}", volume.name)
    }
}

/// `diskutil info -plist` 출력(XML) 파싱 로직 (순수 함수)
fn parse_disk_uuid_from_plist(data: &[u8]) -> Option<String> {
    let value = plist::from_bytes::<plist::Value>(data).ok()?;
    let dict = value.as_dictionary()?;
    dict.get("DiskPartitionUUID")
        .or_else(|| dict.get("VolumeUUID"))
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

/// Detection timing for one run.
#[derive(Debug, Clone, Copy)]
pub struct ScanTiming {
    pub deadline: Instant,
    pub poll_interval: Duration,
}

impl ScanTiming {
    pub fn from_now(timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            deadline: Instant::now() + timeout,
            poll_interval,
        }
    }
}

/// Polls `scanner` until exactly one watch volume is mounted.
///
/// `tick` receives the whole seconds left whenever that number changes and a
/// final `0` on timeout. Two or more watches fail immediately with
/// `AmbiguousVolume`. Each probe runs on the blocking pool.
pub async fn scan<F>(
    scanner: &Arc<dyn VolumeScanner>,
    timing: ScanTiming,
    cancel: &CancellationToken,
    mut tick: F,
) -> WorkerResult<Volume>
where
    F: FnMut(u64),
{
    let started = Instant::now();
    let mut wakeups = MountWatcher::start(&scanner.watch_roots());
    let mut last_left = u64::MAX;

    loop {
        let now = Instant::now();
        let left = timing.deadline.saturating_duration_since(now);
        let secs_left = (left.as_millis() as u64).div_ceil(1000);
        if secs_left != last_left {
            tick(secs_left);
            last_left = secs_left;
        }

        let listing = Arc::clone(scanner);
        let mut found = tokio::task::spawn_blocking(move || listing.probe())
            .await
            .map_err(WorkerError::task_failed)?;
        match found.len() {
            0 => {}
            1 => return Ok(found.remove(0)),
            count => {
                let roots = found
                    .iter()
                    .map(|v| v.root.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", ");
                return Err(WorkerError::AmbiguousVolume { count, roots });
            }
        }

        if left.is_zero() {
            if last_left != 0 {
                tick(0);
            }
            return Err(WorkerError::DetectionTimeout {
                waited_secs: started.elapsed().as_secs(),
            });
        }

        let pause = timing.poll_interval.min(left);
        tokio::select! {
            _ = cancel.cancelled() => return Err(WorkerError::Cancelled),
            _ = tokio::time::sleep(pause) => {}
            Some(()) = async {
                match wakeups.as_mut() {
                    Some(watcher) => watcher.changed().await,
                    None => std::future::pending().await,
                }
            } => {
                tracing::debug!("mount root changed, probing early");
            }
        }
    }
}

/// Scans once without waiting; used by the auto-start loop.
pub fn find_current_volume(scanner: &dyn VolumeScanner) -> Option<Volume> {
    let mut found = scanner.probe();
    if found.len() == 1 {
        found.pop()
    } else {
        None
    }
}
