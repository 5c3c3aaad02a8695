//! The background worker.
//!
//! A run is started through [`WorkerLauncher::launch`], which enforces the
//! single active run. The caller reads events from the returned
//! [`WorkerHandle`], answers the one `AskPick` with [`WorkerHandle::reply`],
//! and may cancel at any time; cancellation during a transfer takes effect
//! after the file being copied.

pub mod messages;
mod orchestrator;
pub mod state;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{AppPaths, MailTemplate, RunMode, Settings, SmtpSettings};
use crate::error::{WorkerError, WorkerResult};
use crate::fit_summary::{ActivitySummaryParser, FitSessionParser};
use crate::input_validation::Recipient;
use crate::logging::{LogManager, DEFAULT_MAX_LOG_LINES};
use crate::notifier::{Mailer, OutboxMailer, SmtpMailer};
use crate::stores::{CsvLabelStore, JsonProfileStore, LabelStore, ProfileStore};
use crate::system_integration::{platform_scanner, VolumeScanner};

pub use messages::{
    EmailOutcome, FailedTransfer, ProgressHint, RunResult, RunStatus, SelectionReply, SelectionRequest, WorkerMessage,
};
pub use state::{PhaseTracker, RunPhase};

use orchestrator::Run;

/// Sender used in devmode when no SMTP settings exist.
const DEVMODE_SENDER: &str = "garmin-mailer@localhost.localdomain";

/// Collaborators injected into every run.
#[derive(Clone)]
pub struct WorkerDeps {
    pub scanner: Arc<dyn VolumeScanner>,
    pub labels: Arc<dyn LabelStore>,
    pub profiles: Arc<dyn ProfileStore>,
    /// `None` when no mail settings exist; Email Mode runs then fail up front.
    pub mailer: Option<Arc<dyn Mailer>>,
    pub summary_parser: Option<Arc<dyn ActivitySummaryParser>>,
    pub log: Arc<LogManager>,
    pub paths: AppPaths,
    pub settings: Settings,
    pub template: MailTemplate,
}

impl WorkerDeps {
    /// Wires the file-backed stores under `paths`, the platform scanner and
    /// the mailer selected by `settings.devmode`.
    pub fn standard(paths: AppPaths, settings: Settings) -> Result<Self> {
        paths.ensure_dirs()?;

        let labels = CsvLabelStore::new(paths.labels_csv());
        labels.ensure_exists()?;
        let template = MailTemplate::load_or_create(&paths.template_file())?;

        let smtp = if paths.smtp_file().exists() {
            Some(SmtpSettings::load(&paths.smtp_file())?)
        } else {
            None
        };
        let mailer: Option<Arc<dyn Mailer>> = match (settings.devmode, smtp) {
            (true, smtp) => {
                let from = smtp
                    .as_ref()
                    .map(|s| s.sender().to_string())
                    .unwrap_or_else(|| DEVMODE_SENDER.to_string());
                Some(Arc::new(OutboxMailer::new(paths.outbox_dir(), from)) as Arc<dyn Mailer>)
            }
            (false, Some(smtp)) => Some(Arc::new(SmtpMailer::new(
                smtp,
                Duration::from_secs(settings.smtp_timeout_secs),
            )) as Arc<dyn Mailer>),
            (false, None) => None,
        };

        Ok(Self {
            scanner: Arc::from(platform_scanner()),
            labels: Arc::new(labels),
            profiles: Arc::new(JsonProfileStore::new(paths.devices_dir())),
            mailer,
            summary_parser: Some(Arc::new(FitSessionParser)),
            log: Arc::new(LogManager::with_file(DEFAULT_MAX_LOG_LINES, paths.log_file())),
            paths,
            settings,
            template,
        })
    }
}

/// Operator input for one run.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub mode: RunMode,
    pub recipient: Option<Recipient>,
    pub today_only: bool,
    pub unmount_after_copy: bool,
}

impl RunRequest {
    pub fn archive(settings: &Settings) -> Self {
        Self {
            mode: RunMode::Archive,
            recipient: None,
            today_only: settings.today_only,
            unmount_after_copy: settings.unmount_after_copy,
        }
    }

    pub fn email(recipient: Recipient, settings: &Settings) -> Self {
        Self {
            mode: RunMode::Email,
            recipient: Some(recipient),
            today_only: settings.today_only,
            unmount_after_copy: settings.unmount_after_copy,
        }
    }
}

/// Caller side of a running worker.
pub struct WorkerHandle {
    messages: mpsc::UnboundedReceiver<WorkerMessage>,
    reply: Option<oneshot::Sender<SelectionReply>>,
    cancel: CancellationToken,
    join: JoinHandle<RunResult>,
}

impl WorkerHandle {
    /// Next event in FIFO order; `None` once the run has ended.
    pub async fn next_message(&mut self) -> Option<WorkerMessage> {
        self.messages.recv().await
    }

    /// Answers the selection prompt. Only the first reply is delivered.
    pub fn reply(&mut self, reply: SelectionReply) -> bool {
        match self.reply.take() {
            Some(tx) => tx.send(reply).is_ok(),
            None => false,
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn join(self) -> WorkerResult<RunResult> {
        self.join.await.map_err(WorkerError::task_failed)
    }
}

struct BusyGuard(Arc<AtomicBool>);

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Owns the single run slot.
#[derive(Debug, Clone, Default)]
pub struct WorkerLauncher {
    busy: Arc<AtomicBool>,
}

impl WorkerLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Spawns a run on the current tokio runtime. Fails with `RunInProgress`
    /// while a previous run has not reached a terminal state.
    pub fn launch(&self, deps: WorkerDeps, request: RunRequest) -> WorkerResult<WorkerHandle> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(WorkerError::RunInProgress);
        }
        let guard = BusyGuard(Arc::clone(&self.busy));

        let (tx, messages) = mpsc::unbounded_channel();
        let (reply, reply_rx) = oneshot::channel();
        let cancel = CancellationToken::new();

        let token = cancel.clone();
        let join = tokio::spawn(async move {
            let result = Run::new(deps, request, tx.clone(), token)
                .execute(reply_rx)
                .await;

            // The slot is free before the terminal message is observable
            drop(guard);
            let terminal = if result.is_success() {
                WorkerMessage::Done(result.clone())
            } else {
                WorkerMessage::Error(result.clone())
            };
            let _ = tx.send(terminal);
            result
        });

        Ok(WorkerHandle {
            messages,
            reply: Some(reply),
            cancel,
            join,
        })
    }
}
