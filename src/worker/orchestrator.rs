use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, NaiveDate};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::activity_index::{ActivityFile, ActivityIndexer, IndexFilter};
use crate::config::RunMode;
use crate::device_profile::{DeviceProfile, DeviceProfileReader};
use crate::error::{WorkerError, WorkerResult};
use crate::error_codes::ERR_CANCELLED;
use crate::notifier::Notifier;
use crate::system_integration::{scan, ScanTiming, Volume};
use crate::transfer_engine::{
    NamingScheme, TransferEngine, TransferOptions, TransferOutcome, TransferPlan, TransferReport,
};
use crate::worker::messages::{
    EmailOutcome, FailedTransfer, ProgressHint, RunResult, RunStatus, SelectionReply, SelectionRequest, WorkerMessage,
};
use crate::worker::state::{PhaseTracker, RunPhase};
use crate::worker::{RunRequest, WorkerDeps};

const EJECTED_TEXT: &str = "Eject successful, please attach the next watch to the USB cable.";
const NOT_EJECTED_TEXT: &str = "Copy complete. Please attach the next watch.";

struct Transferred {
    report: TransferReport,
    dest_dir: PathBuf,
    total: usize,
    ejected: bool,
}

/// One single-use run: detect, profile, index, select, transfer, notify,
/// finalize. Intermediate events go to `tx`; the terminal result is returned.
pub(crate) struct Run {
    deps: WorkerDeps,
    request: RunRequest,
    tx: mpsc::UnboundedSender<WorkerMessage>,
    cancel: CancellationToken,
    phase: PhaseTracker,
    today: NaiveDate,
    profile: Option<DeviceProfile>,
}

impl Run {
    pub(crate) fn new(
        deps: WorkerDeps,
        request: RunRequest,
        tx: mpsc::UnboundedSender<WorkerMessage>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            deps,
            request,
            tx,
            cancel,
            phase: PhaseTracker::new(),
            today: Local::now().date_naive(),
            profile: None,
        }
    }

    pub(crate) async fn execute(mut self, reply_rx: oneshot::Receiver<SelectionReply>) -> RunResult {
        let mode = self.request.mode;
        self.deps
            .log
            .info(&format!("Run started mode={}", mode.marker()), None);

        let result = match self.drive(reply_rx).await {
            Ok(result) => result,
            Err(err) => self.abort(err),
        };

        self.deps.log.info(
            &format!(
                "Run finished status={:?} phase={:?} summary={}",
                result.status,
                self.phase.current(),
                result.summary
            ),
            result.device_id.as_deref(),
        );
        result
    }

    fn emit(&self, message: WorkerMessage) {
        // The presentation layer may already be gone; the run still finishes
        let _ = self.tx.send(message);
    }

    fn step(&self, text: impl Into<String>, progress: ProgressHint) {
        self.emit(WorkerMessage::step(text, progress));
    }

    fn enter(&mut self, phase: RunPhase) -> WorkerResult<()> {
        self.phase.advance(phase)
    }

    fn ensure_not_cancelled(&self) -> WorkerResult<()> {
        if self.cancel.is_cancelled() {
            return Err(WorkerError::Cancelled);
        }
        Ok(())
    }

    async fn drive(&mut self, reply_rx: oneshot::Receiver<SelectionReply>) -> WorkerResult<RunResult> {
        self.check_request()?;

        self.enter(RunPhase::Detecting)?;
        let volume = self.detect().await?;

        self.enter(RunPhase::Profiling)?;
        let profile = self.read_profile(&volume).await?;
        self.profile = Some(profile.clone());
        self.ensure_not_cancelled()?;

        self.enter(RunPhase::Indexing)?;
        let (candidates, filter) = self.index(&volume).await?;
        self.ensure_not_cancelled()?;

        self.enter(RunPhase::AwaitingSelection)?;
        let selected = self.await_selection(candidates, filter, reply_rx).await?;

        self.enter(RunPhase::Transferring)?;
        let transferred = self.transfer(&volume, &profile, &selected).await;

        self.complete(&profile, transferred).await
    }

    fn check_request(&self) -> WorkerResult<()> {
        if self.request.mode != RunMode::Email {
            return Ok(());
        }
        if self.request.recipient.is_none() {
            return Err(WorkerError::config(
                "Email Mode needs the participant's name and email address.",
            ));
        }
        if self.deps.mailer.is_none() {
            return Err(WorkerError::config(format!(
                "mail settings not found. Create {} with smtp_server, smtp_port, username and an App Password.",
                self.deps.paths.smtp_file().display()
            )));
        }
        Ok(())
    }

    async fn detect(&self) -> WorkerResult<Volume> {
        let settings = &self.deps.settings;
        let timing = ScanTiming::from_now(
            Duration::from_secs(settings.detect_timeout_secs),
            Duration::from_millis(settings.poll_interval_ms),
        );
        self.step("Waiting for the watch. Connect it with the USB cable.", ProgressHint::SpinOn);

        let tx = self.tx.clone();
        let scanned = scan(&self.deps.scanner, timing, &self.cancel, |secs| {
            let _ = tx.send(WorkerMessage::Countdown {
                seconds_left: Some(secs),
            });
        })
        .await;
        self.emit(WorkerMessage::Countdown { seconds_left: None });

        let volume = scanned?;
        self.deps
            .log
            .info(&format!("Watch detected at {}", volume.root.display()), None);
        self.step(format!("Watch detected: {}", volume.name), ProgressHint::SpinOff);
        Ok(volume)
    }

    async fn read_profile(&self, volume: &Volume) -> WorkerResult<DeviceProfile> {
        let labels = Arc::clone(&self.deps.labels);
        let root = volume.clone();
        let profile = tokio::task::spawn_blocking(move || DeviceProfileReader::new(labels.as_ref()).read(&root))
            .await
            .map_err(WorkerError::task_failed)?;

        if let Some(reason) = &profile.degraded_reason {
            let degraded = WorkerError::ProfileDegraded {
                reason: reason.clone(),
            };
            self.deps
                .log
                .warn(&degraded.to_string(), Some(&profile.device_id));
        }

        self.step(format!("{} connected", profile.human_name()), ProgressHint::SpinOff);
        Ok(profile)
    }

    async fn index(&self, volume: &Volume) -> WorkerResult<(Vec<ActivityFile>, IndexFilter)> {
        let filter = IndexFilter {
            mode: self.request.mode,
            today_only: self.request.today_only,
            today: self.today,
            recent_limit: self.deps.settings.recent_limit,
        };
        self.step("Reading activities from the watch", ProgressHint::SpinOn);

        let parser = self.deps.summary_parser.clone();
        let root = volume.clone();
        let files = tokio::task::spawn_blocking(move || {
            let indexer = ActivityIndexer::new(parser)
                .map_err(|e| WorkerError::config(format!("invalid activity pattern: {e}")))?;
            indexer.list(&root, &filter)
        })
        .await
        .map_err(WorkerError::task_failed)??;

        tracing::debug!("{} candidate activities", files.len());
        Ok((files, filter))
    }

    async fn await_selection(
        &self,
        candidates: Vec<ActivityFile>,
        filter: IndexFilter,
        reply_rx: oneshot::Receiver<SelectionReply>,
    ) -> WorkerResult<Vec<ActivityFile>> {
        self.step("Select the activities to transfer", ProgressHint::SpinOff);
        self.emit(WorkerMessage::AskPick(SelectionRequest {
            kind: filter.prompt_kind(),
            candidates: candidates.clone(),
        }));

        let reply = tokio::select! {
            _ = self.cancel.cancelled() => return Err(WorkerError::Cancelled),
            // A dropped reply handle counts as a cancellation
            reply = reply_rx => reply.unwrap_or(SelectionReply::Cancelled),
        };

        let picked = match reply {
            SelectionReply::Chosen(paths) if !paths.is_empty() => paths,
            _ => return Err(WorkerError::SelectionCancelled),
        };

        let selected: Vec<ActivityFile> = candidates
            .into_iter()
            .filter(|c| picked.contains(&c.source))
            .collect();
        if selected.len() < picked.len() {
            tracing::warn!(
                "ignoring {} selected path(s) that were not offered",
                picked.len() - selected.len()
            );
        }
        if selected.is_empty() {
            return Err(WorkerError::SelectionCancelled);
        }
        Ok(selected)
    }

    async fn transfer(&self, volume: &Volume, profile: &DeviceProfile, selected: &[ActivityFile]) -> Transferred {
        let mode = self.request.mode;
        let day = self.today.format("%Y%m%d").to_string();
        let dest_dir = self.deps.paths.day_dir(mode, &day);
        let scheme = match (&self.request.recipient, mode) {
            (Some(recipient), RunMode::Email) => {
                NamingScheme::email(&day, &profile.display_label, &recipient.local_part())
            }
            _ => NamingScheme::archive(&day, &profile.display_label),
        };
        let plan = TransferPlan::build(selected, &dest_dir, &scheme);
        let total = plan.entries.len();

        self.step(format!("Copying {total} file(s)"), ProgressHint::Percent(0));
        let engine = TransferEngine::new(TransferOptions {
            preserve_times: true,
            verify_checksum: self.deps.settings.verify_checksum,
        });
        let tx = self.tx.clone();
        let report = engine
            .copy(&plan, &self.cancel, |p| {
                let percent = (p.index * 100 / p.total.max(1)) as u8;
                let _ = tx.send(WorkerMessage::step(
                    format!("Copied {}/{}: {}", p.index, p.total, p.file_name),
                    ProgressHint::Percent(percent),
                ));
            })
            .await;

        self.log_copied(profile, selected, &report);

        let ejected = if self.request.unmount_after_copy && !report.cancelled && !report.copied().is_empty() {
            self.eject(volume).await
        } else {
            false
        };

        Transferred {
            report,
            dest_dir: plan.dest_dir,
            total,
            ejected,
        }
    }

    async fn eject(&self, volume: &Volume) -> bool {
        self.step("Ejecting the watch", ProgressHint::SpinOn);
        let scanner = Arc::clone(&self.deps.scanner);
        let target = volume.clone();
        match tokio::task::spawn_blocking(move || scanner.eject(&target)).await {
            Ok(Ok(())) => {
                self.deps
                    .log
                    .info(&format!("Ejected {}", volume.root.display()), None);
                true
            }
            Ok(Err(e)) => {
                self.deps
                    .log
                    .warn(&format!("Eject failed for {}: {e:#}", volume.root.display()), None);
                false
            }
            Err(e) => {
                tracing::warn!("eject task failed: {e}");
                false
            }
        }
    }

    fn log_copied(&self, profile: &DeviceProfile, selected: &[ActivityFile], report: &TransferReport) {
        let by_source: HashMap<&PathBuf, &ActivityFile> = selected.iter().map(|f| (&f.source, f)).collect();
        let model = profile.model.as_deref().unwrap_or("-");

        for result in report.copied() {
            let Some(destination) = result.destination() else {
                continue;
            };
            let duration = by_source
                .get(&result.source)
                .and_then(|f| f.summary.as_ref())
                .and_then(|s| s.duration_secs)
                .map(|secs| format!("{secs}s"))
                .unwrap_or_else(|| "-".to_string());
            self.deps.log.info(
                &format!(
                    "COPIED label={} file={} src={} device_id={} model={} duration={} mode={}",
                    profile.display_label,
                    file_name_of(destination),
                    result.source.display(),
                    profile.device_id,
                    model,
                    duration,
                    self.request.mode.marker()
                ),
                Some(&profile.device_id),
            );
        }
        for line in report.failure_lines() {
            self.deps
                .log
                .warn(&format!("FAILED {line}"), Some(&profile.device_id));
        }
    }

    async fn complete(&mut self, profile: &DeviceProfile, transferred: Transferred) -> WorkerResult<RunResult> {
        let mode = self.request.mode;
        let report = &transferred.report;
        let copied = report.destinations();

        let mut result = RunResult::new(RunStatus::Done, mode, String::new());
        result.destination = Some(transferred.dest_dir.clone());
        result.device_id = Some(profile.device_id.clone());
        result.label = Some(profile.display_label.clone());
        result.transferred = copied.clone();
        result.failed = report
            .failed()
            .into_iter()
            .map(|r| FailedTransfer {
                file_name: r.file_name.clone(),
                reason: match &r.outcome {
                    TransferOutcome::Failed { reason, .. } => reason.clone(),
                    TransferOutcome::Copied { .. } => String::new(),
                },
            })
            .collect();
        result.percent = (copied.len() * 100 / transferred.total.max(1)) as u8;

        // A cancel that arrived during the last file or the eject still wins over notifying
        if report.cancelled || self.cancel.is_cancelled() {
            self.enter(RunPhase::Finalizing)?;
            self.finalize(profile, report).await;
            self.enter(RunPhase::Cancelled)?;
            result.status = RunStatus::Cancelled;
            result.error_code = Some(ERR_CANCELLED);
            result.summary = format!(
                "Cancelled by user after copying {} of {} file(s) to {}.",
                copied.len(),
                transferred.total,
                transferred.dest_dir.display()
            );
            return Ok(result);
        }

        if copied.is_empty() {
            let err = WorkerError::TransferFailure {
                failed: report.failure_lines(),
            };
            self.enter(RunPhase::Finalizing)?;
            self.finalize(profile, report).await;
            self.enter(RunPhase::Error)?;
            self.deps.log.error(&err.to_string(), Some(&profile.device_id));
            result.status = RunStatus::Error;
            result.error_code = Some(err.code());
            result.summary = match mode {
                RunMode::Email => format!("{err} No email was sent."),
                RunMode::Archive => err.to_string(),
            };
            return Ok(result);
        }

        let mut send_error = None;
        if mode == RunMode::Email {
            self.enter(RunPhase::Notifying)?;
            match self.notify(profile, &copied).await {
                Ok(to) => {
                    result.email = EmailOutcome::Sent {
                        to,
                        attachments: copied.len(),
                    }
                }
                Err(err) => {
                    self.deps
                        .log
                        .error(&format!("Send failed: {err}"), Some(&profile.device_id));
                    result.email = EmailOutcome::Failed {
                        reason: err.to_string(),
                    };
                    send_error = Some(err);
                }
            }
        }

        self.enter(RunPhase::Finalizing)?;
        self.finalize(profile, report).await;

        if let Some(err) = send_error {
            self.enter(RunPhase::Error)?;
            result.status = RunStatus::Error;
            result.error_code = Some(err.code());
            result.summary = format!(
                "{err} The copied files are saved in {}.",
                transferred.dest_dir.display()
            );
            return Ok(result);
        }

        self.enter(RunPhase::Done)?;
        let eject_text = if transferred.ejected {
            EJECTED_TEXT
        } else {
            NOT_EJECTED_TEXT
        };
        let mut summary = match (&self.request.recipient, mode) {
            (Some(recipient), RunMode::Email) => format!(
                "Sent {} file(s) to {} <{}>. {eject_text}",
                copied.len(),
                recipient.name,
                recipient.email
            ),
            _ => format!(
                "Copied {} file(s) to {}. {eject_text}",
                copied.len(),
                transferred.dest_dir.display()
            ),
        };
        if !result.failed.is_empty() {
            result.status = RunStatus::PartialSuccess;
            summary.push_str(&format!(" Not copied: {}.", report.failure_lines().join("; ")));
            if mode == RunMode::Email {
                summary.push_str(" Those files were not attached.");
            }
        }
        result.summary = summary;
        Ok(result)
    }

    /// Sends the copied files and returns the recipient address.
    async fn notify(&self, profile: &DeviceProfile, attachments: &[PathBuf]) -> WorkerResult<String> {
        let recipient = self
            .request
            .recipient
            .clone()
            .ok_or_else(|| WorkerError::config("missing recipient"))?;
        let mailer = self
            .deps
            .mailer
            .clone()
            .ok_or_else(|| WorkerError::config("missing mail settings"))?;

        self.step(format!("Sending email to {}", recipient.email), ProgressHint::SpinOn);
        let notifier = Notifier::new(
            mailer,
            self.deps.template.clone(),
            self.deps.settings.max_attachment_bytes,
        );
        let files = attachments.to_vec();
        let day = self.today;
        let to = recipient.clone();
        tokio::task::spawn_blocking(move || notifier.send(&to, &files, day))
            .await
            .map_err(WorkerError::task_failed)??;

        for path in attachments {
            self.deps.log.info(
                &format!(
                    "SENT label={} name={} email={} file={} device_id={} model={} mode={}",
                    profile.display_label,
                    recipient.name,
                    recipient.email,
                    file_name_of(path),
                    profile.device_id,
                    profile.model.as_deref().unwrap_or("-"),
                    RunMode::Email.marker()
                ),
                Some(&profile.device_id),
            );
        }
        self.step("Email sent", ProgressHint::SpinOff);
        Ok(recipient.email)
    }

    /// Persists the device profile and, for a new device, its label.
    /// Failures are logged; the run outcome does not change.
    async fn finalize(&self, profile: &DeviceProfile, report: &TransferReport) {
        let profiles = Arc::clone(&self.deps.profiles);
        let labels = Arc::clone(&self.deps.labels);
        let profile = profile.clone();
        let action = self.request.mode.marker().to_lowercase();
        let files: Vec<String> = report.destinations().iter().map(|p| file_name_of(p)).collect();
        let failed: Vec<String> = report.failed().iter().map(|r| r.file_name.clone()).collect();
        let time = Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
        let device_id = profile.device_id.clone();

        let saved = tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            let mut stored = profiles.load(&profile.device_id).unwrap_or_else(|e| {
                tracing::warn!("replacing unreadable profile: {e:#}");
                None
            })
            .unwrap_or_default();

            stored.device_id = profile.device_id.clone();
            stored.model = profile.model.clone().or(stored.model);
            stored.label = Some(profile.display_label.clone());
            stored.degraded = profile.is_degraded();
            if !profile.descriptor.is_empty() {
                stored.descriptor = profile.descriptor.clone();
            }
            stored.last_action = Some(action);
            stored.last_files = files;
            stored.last_failed = failed;
            stored.last_time = Some(time);
            stored.run_count += 1;
            profiles.save(&stored)?;

            if profile.label_is_new {
                labels.assign(&profile.device_id, &profile.display_label)?;
            }
            Ok(())
        })
        .await;

        match saved {
            Ok(Ok(())) => {}
            Ok(Err(e)) => self
                .deps
                .log
                .warn(&format!("Could not save device profile: {e:#}"), Some(&device_id)),
            Err(e) => tracing::warn!("profile task failed: {e}"),
        }
    }

    fn abort(&mut self, err: WorkerError) -> RunResult {
        let (phase, status) = if err.is_cancellation() {
            (RunPhase::Cancelled, RunStatus::Cancelled)
        } else {
            (RunPhase::Error, RunStatus::Error)
        };
        if let Err(e) = self.phase.advance(phase) {
            tracing::error!("{e}");
        }

        let device_id = self.profile.as_ref().map(|p| p.device_id.clone());
        self.deps
            .log
            .error(&format!("Run failed: {err}"), device_id.as_deref());

        let mut result = RunResult::new(status, self.request.mode, err.to_string());
        result.error_code = Some(err.code());
        result.device_id = device_id;
        result.label = self.profile.as_ref().map(|p| p.display_label.clone());
        result
    }
}

fn file_name_of(path: &std::path::Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}
