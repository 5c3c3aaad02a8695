use crate::transfer_engine::plan::numbered;
use crate::transfer_engine::types::{
    FileTransferResult, PlannedTransfer, TransferErrorKind, TransferOptions, TransferOutcome, TransferPlan,
    TransferProgress, TransferReport,
};
use std::hash::Hasher;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

const BUFFER_SIZE: usize = 8192;

/// Attempts at finding a free name when the planned one appears after planning.
const MAX_CREATE_ATTEMPTS: u32 = 100;

pub struct TransferEngine {
    options: TransferOptions,
}

struct Failure {
    kind: TransferErrorKind,
    reason: String,
}

impl Failure {
    fn copy(reason: impl Into<String>) -> Self {
        Self {
            kind: TransferErrorKind::CopyFailed,
            reason: reason.into(),
        }
    }

    fn verification(reason: impl Into<String>) -> Self {
        Self {
            kind: TransferErrorKind::VerificationFailed,
            reason: reason.into(),
        }
    }
}

impl TransferEngine {
    pub fn new(options: TransferOptions) -> Self {
        Self { options }
    }

    async fn calculate_checksum(path: &Path) -> io::Result<String> {
        use twox_hash::XxHash64;

        let mut file = fs::File::open(path).await?;
        let mut hasher = XxHash64::with_seed(0);
        let mut buffer = [0u8; BUFFER_SIZE];

        loop {
            let n = file.read(&mut buffer).await?;
            if n == 0 {
                break;
            }
            hasher.write(&buffer[..n]);
        }

        Ok(format!("{:x}", hasher.finish()))
    }

    /// Copies every planned entry in order. Per-file failures are recorded and
    /// the remaining entries are still attempted. Cancellation is checked
    /// between files and once more after the last one.
    pub async fn copy(
        &self,
        plan: &TransferPlan,
        cancel: &CancellationToken,
        mut progress: impl FnMut(TransferProgress),
    ) -> TransferReport {
        let mut report = TransferReport::default();
        let total = plan.entries.len();
        let total_bytes: u64 = plan.entries.iter().map(|e| e.expected_size).sum();

        if let Err(e) = fs::create_dir_all(&plan.dest_dir).await {
            let reason = format!("cannot create {}: {e}", plan.dest_dir.display());
            tracing::error!("{reason}");
            report.results = plan
                .entries
                .iter()
                .map(|entry| FileTransferResult {
                    source: entry.source.clone(),
                    file_name: entry.file_name.clone(),
                    outcome: TransferOutcome::Failed {
                        kind: TransferErrorKind::CopyFailed,
                        reason: reason.clone(),
                    },
                })
                .collect();
            return report;
        }

        for (index, entry) in plan.entries.iter().enumerate() {
            if cancel.is_cancelled() {
                tracing::info!("transfer cancelled after {index} of {total} files");
                report.cancelled = true;
                break;
            }

            let outcome = match self.copy_one(entry).await {
                Ok((destination, bytes)) => {
                    report.bytes_copied += bytes;
                    tracing::debug!("copied {} -> {}", entry.source.display(), destination.display());
                    TransferOutcome::Copied { destination, bytes }
                }
                Err(failure) => {
                    tracing::warn!("failed to copy {}: {}", entry.file_name, failure.reason);
                    TransferOutcome::Failed {
                        kind: failure.kind,
                        reason: failure.reason,
                    }
                }
            };

            report.results.push(FileTransferResult {
                source: entry.source.clone(),
                file_name: entry.file_name.clone(),
                outcome,
            });

            progress(TransferProgress {
                index: index + 1,
                total,
                file_name: entry.file_name.clone(),
                bytes_copied: report.bytes_copied,
                total_bytes,
            });
        }

        // A cancel during the last file still ends the run as cancelled
        if !report.cancelled && cancel.is_cancelled() {
            tracing::info!("transfer cancelled during the last of {total} files");
            report.cancelled = true;
        }

        report
    }

    async fn copy_one(&self, entry: &PlannedTransfer) -> Result<(PathBuf, u64), Failure> {
        let mut source = fs::File::open(&entry.source)
            .await
            .map_err(|e| Failure::copy(format!("cannot open source: {e}")))?;
        let (destination, mut target) = Self::create_destination(&entry.destination).await?;

        let written = match Self::pump(&mut source, &mut target).await {
            Ok(n) => n,
            Err(e) => {
                drop(target);
                // An I/O error mid-copy leaves a truncated file; remove it
                let _ = fs::remove_file(&destination).await;
                return Err(Failure::copy(format!("copy interrupted: {e}")));
            }
        };
        drop(target);

        // A mismatch leaves the copy in place for inspection
        let on_disk = fs::metadata(&destination)
            .await
            .map_err(|e| Failure::verification(format!("cannot stat copy: {e}")))?
            .len();
        if on_disk != written || written != entry.expected_size {
            return Err(Failure::verification(format!(
                "size mismatch: expected {} bytes, wrote {written}, found {on_disk}",
                entry.expected_size
            )));
        }

        if self.options.verify_checksum {
            let (src_sum, dst_sum) = tokio::try_join!(
                Self::calculate_checksum(&entry.source),
                Self::calculate_checksum(&destination)
            )
            .map_err(|e| Failure::verification(format!("checksum failed: {e}")))?;
            if src_sum != dst_sum {
                return Err(Failure::verification(format!(
                    "checksum mismatch: {src_sum} != {dst_sum}"
                )));
            }
        }

        if self.options.preserve_times {
            if let Err(e) = Self::preserve_mtime(&entry.source, &destination).await {
                tracing::debug!("could not preserve mtime on {}: {e}", destination.display());
            }
        }

        Ok((destination, written))
    }

    /// Opens the destination exclusively. If another file took the planned
    /// name since planning, the next free `_N` name is used instead.
    async fn create_destination(planned: &Path) -> Result<(PathBuf, fs::File), Failure> {
        let dir = planned.parent().unwrap_or_else(|| Path::new("."));
        let name = planned
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Failure::copy("invalid destination name"))?;

        let mut candidate = planned.to_path_buf();
        for attempt in 2..MAX_CREATE_ATTEMPTS + 2 {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&candidate)
                .await
            {
                Ok(file) => return Ok((candidate, file)),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    candidate = dir.join(numbered(name, attempt));
                }
                Err(e) => {
                    return Err(Failure::copy(format!(
                        "cannot create {}: {e}",
                        candidate.display()
                    )))
                }
            }
        }
        Err(Failure::copy(format!("no free name for {name}")))
    }

    async fn pump(source: &mut fs::File, target: &mut fs::File) -> io::Result<u64> {
        let mut buffer = vec![0u8; BUFFER_SIZE];
        let mut written = 0u64;
        loop {
            let n = source.read(&mut buffer).await?;
            if n == 0 {
                break;
            }
            target.write_all(&buffer[..n]).await?;
            written += n as u64;
        }
        target.flush().await?;
        target.sync_all().await?;
        Ok(written)
    }

    async fn preserve_mtime(source: &Path, target: &Path) -> io::Result<()> {
        let modified = fs::metadata(source).await?.modified()?;
        filetime::set_file_mtime(target, filetime::FileTime::from_system_time(modified))
    }
}
