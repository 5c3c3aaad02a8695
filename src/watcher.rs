//! 마운트 루트 감시 모듈
//!
//! `/Volumes` 같은 마운트 루트의 변경을 감지해 스캔 루프를 조기에 깨웁니다.
//! 감시를 시작할 수 없으면 스캔 루프는 폴링만으로 동작합니다.

use std::path::PathBuf;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

/// Wake-up buffer; a full channel already means "probe again".
const WAKEUP_BUFFER: usize = 16;

pub struct MountWatcher {
    _watcher: RecommendedWatcher,
    rx: mpsc::Receiver<()>,
}

impl MountWatcher {
    /// 마운트 루트 감시를 시작합니다. 감시할 루트가 하나도 없으면 `None`.
    pub fn start(roots: &[PathBuf]) -> Option<Self> {
        if roots.is_empty() {
            return None;
        }

        let (tx, rx) = mpsc::channel(WAKEUP_BUFFER);

        let watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            if let Ok(event) = res {
                // 마운트/언마운트에 해당하는 이벤트만 전달
                match event.kind {
                    EventKind::Create(_) | EventKind::Remove(_) | EventKind::Modify(_) => {
                        // Full channel: a wake-up is already pending
                        let _ = tx.try_send(());
                    }
                    _ => {}
                }
            }
        });

        let mut watcher = match watcher {
            Ok(watcher) => watcher,
            Err(e) => {
                tracing::debug!("mount watcher unavailable, polling only: {e}");
                return None;
            }
        };

        let mut watching = 0;
        for root in roots {
            match watcher.watch(root, RecursiveMode::NonRecursive) {
                Ok(()) => watching += 1,
                Err(e) => tracing::debug!("cannot watch {}: {e}", root.display()),
            }
        }

        if watching == 0 {
            return None;
        }

        Some(Self {
            _watcher: watcher,
            rx,
        })
    }

    /// Waits for the next change, coalescing any burst that is already queued.
    pub async fn changed(&mut self) -> Option<()> {
        self.rx.recv().await?;
        while self.rx.try_recv().is_ok() {}
        Some(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn test_no_roots_means_no_watcher() {
        assert!(MountWatcher::start(&[]).is_none());
    }

    #[test]
    fn test_missing_root_means_no_watcher() {
        let dir = tempdir().unwrap();
        assert!(MountWatcher::start(&[dir.path().join("missing")]).is_none());
    }

    #[tokio::test]
    async fn test_wakes_on_new_mount_directory() {
        let dir = tempdir().unwrap();
        let mut watcher = MountWatcher::start(&[dir.path().to_path_buf()]).unwrap();

        for i in 0..3 {
            fs::create_dir(dir.path().join(format!("VOL_{i}"))).unwrap();
        }

        let woke = tokio::time::timeout(Duration::from_secs(2), watcher.changed()).await;
        assert_eq!(woke.unwrap(), Some(()));
    }
}
