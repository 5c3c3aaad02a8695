#[cfg(test)]
mod integration_tests {
    use crate::config::{AppPaths, MailTemplate, RunMode, Settings};
    use crate::error_codes::*;
    use crate::input_validation::Recipient;
    use crate::logging::LogManager;
    use crate::notifier::{Mailer, NotifyError, OutgoingMail};
    use crate::stores::{CsvLabelStore, JsonProfileStore, LabelStore, ProfileStore};
    use crate::system_integration::{MountDirectoryScanner, Platform, Volume, VolumeScanner};
    use crate::worker::{
        EmailOutcome, RunRequest, RunResult, RunStatus, SelectionReply, SelectionRequest, WorkerDeps, WorkerHandle,
        WorkerLauncher, WorkerMessage,
    };
    use crate::WorkerError;
    use chrono::{DateTime, Duration as ChronoDuration, Local};
    use filetime::FileTime;
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    const DEVICE_ID: &str = "3999999999";
    const DEVICE_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<Device xmlns="http://www.garmin.com/xmlschemas/GarminDevice/v2">
  <Model><PartNumber>006-B3076-00</PartNumber><Description>Forerunner 245</Description></Model>
  <Id>3999999999</Id>
</Device>"#;

    #[derive(Default)]
    struct RecordingMailer {
        sent: Mutex<Vec<OutgoingMail>>,
        reject_auth: bool,
    }

    impl Mailer for RecordingMailer {
        fn deliver(&self, mail: &OutgoingMail) -> Result<(), NotifyError> {
            if self.reject_auth {
                return Err(NotifyError::AuthRejected {
                    server: "smtp.gmail.com".to_string(),
                });
            }
            self.sent.lock().unwrap().push(mail.clone());
            Ok(())
        }
    }

    /// Mount-directory detection with an eject that only records the call,
    /// optionally cancelling the run while it ejects.
    struct FakeEjectScanner {
        inner: MountDirectoryScanner,
        ejected: Mutex<Vec<PathBuf>>,
        cancel_on_eject: Mutex<Option<CancellationToken>>,
    }

    impl VolumeScanner for FakeEjectScanner {
        fn platform(&self) -> Platform {
            self.inner.platform()
        }

        fn probe(&self) -> Vec<Volume> {
            self.inner.probe()
        }

        fn watch_roots(&self) -> Vec<PathBuf> {
            self.inner.watch_roots()
        }

        fn eject(&self, volume: &Volume) -> anyhow::Result<()> {
            self.ejected.lock().unwrap().push(volume.root.clone());
            if let Some(token) = self.cancel_on_eject.lock().unwrap().as_ref() {
                token.cancel();
            }
            Ok(())
        }
    }

    struct Fixture {
        temp: TempDir,
        paths: AppPaths,
        mailer: Arc<RecordingMailer>,
    }

    impl Fixture {
        fn new() -> Self {
            Self::with_mailer(RecordingMailer::default())
        }

        fn with_mailer(mailer: RecordingMailer) -> Self {
            let temp = TempDir::new().unwrap();
            fs::create_dir_all(temp.path().join("mounts")).unwrap();
            let paths = AppPaths::new(temp.path().join("docs"));
            paths.ensure_dirs().unwrap();
            Self {
                temp,
                paths,
                mailer: Arc::new(mailer),
            }
        }

        fn mounts(&self) -> PathBuf {
            self.temp.path().join("mounts")
        }

        /// Mounts a watch volume with a device descriptor and returns its root.
        fn mount_watch(&self, name: &str) -> PathBuf {
            let root = self.mounts().join(name);
            fs::create_dir_all(root.join("GARMIN/Activity")).unwrap();
            fs::write(root.join("GARMIN/GarminDevice.xml"), DEVICE_XML).unwrap();
            root
        }

        fn add_activity(&self, root: &Path, name: &str, when: DateTime<Local>) -> PathBuf {
            let path = root.join("GARMIN/Activity").join(name);
            fs::write(&path, format!("fit-data-{name}")).unwrap();
            filetime::set_file_mtime(&path, FileTime::from_unix_time(when.timestamp(), 0)).unwrap();
            path
        }

        fn settings(&self) -> Settings {
            Settings {
                detect_timeout_secs: 2,
                poll_interval_ms: 50,
                unmount_after_copy: false,
                ..Settings::default()
            }
        }

        fn deps(&self) -> WorkerDeps {
            WorkerDeps {
                scanner: Arc::new(MountDirectoryScanner::new(vec![self.mounts()], Platform::Linux)),
                labels: Arc::new(CsvLabelStore::new(self.paths.labels_csv())),
                profiles: Arc::new(JsonProfileStore::new(self.paths.devices_dir())),
                mailer: Some(self.mailer.clone() as Arc<dyn Mailer>),
                summary_parser: None,
                log: Arc::new(LogManager::with_file(100, self.paths.log_file())),
                paths: self.paths.clone(),
                settings: self.settings(),
                template: MailTemplate::new("Hello {name}, your activities are attached."),
            }
        }

        fn label_watch(&self, label: &str) {
            CsvLabelStore::new(self.paths.labels_csv())
                .assign(DEVICE_ID, label)
                .unwrap();
        }

        fn today_dir(&self, mode: RunMode) -> PathBuf {
            self.paths.day_dir(mode, &today())
        }
    }

    fn today() -> String {
        Local::now().format("%Y%m%d").to_string()
    }

    fn recipient() -> Recipient {
        Recipient::new("Ana", "ana.m@example.org").unwrap()
    }

    /// Reads events until the terminal message, answering the prompt with `pick`.
    async fn drive(
        mut handle: WorkerHandle,
        mut pick: impl FnMut(&SelectionRequest) -> SelectionReply,
    ) -> (Vec<WorkerMessage>, RunResult) {
        let mut messages = Vec::new();
        let collected = tokio::time::timeout(Duration::from_secs(20), async {
            while let Some(message) = handle.next_message().await {
                if let WorkerMessage::AskPick(request) = &message {
                    let reply = pick(request);
                    handle.reply(reply);
                }
                messages.push(message);
            }
        })
        .await;
        assert!(collected.is_ok(), "run did not finish in time");

        let result = handle.join().await.unwrap();
        (messages, result)
    }

    fn pick_first(n: usize) -> impl FnMut(&SelectionRequest) -> SelectionReply {
        move |request| {
            SelectionReply::Chosen(
                request
                    .candidates
                    .iter()
                    .take(n)
                    .map(|c| c.source.clone())
                    .collect(),
            )
        }
    }

    fn terminal_count(messages: &[WorkerMessage]) -> usize {
        messages.iter().filter(|m| m.is_terminal()).count()
    }

    fn names_in(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .map(|e| e.file_name().to_string_lossy().to_string())
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        names
    }

    #[tokio::test]
    async fn test_archive_copies_selected_files_with_label_names() {
        let fx = Fixture::new();
        fx.label_watch("21");
        let root = fx.mount_watch("GARMIN");
        let now = Local::now();
        for i in 0..7 {
            fx.add_activity(&root, &format!("A{i}.fit"), now - ChronoDuration::hours(3 * i));
        }

        let launcher = WorkerLauncher::new();
        let handle = launcher
            .launch(fx.deps(), RunRequest::archive(&fx.settings()))
            .unwrap();

        let mut offered = 0;
        let (messages, result) = drive(handle, |request| {
            offered = request.candidates.len();
            pick_first(2)(request)
        })
        .await;

        assert_eq!(offered, 5);
        assert_eq!(result.status, RunStatus::Done);
        assert_eq!(result.percent, 100);
        assert_eq!(result.email, EmailOutcome::NotApplicable);

        let day = today();
        assert_eq!(
            names_in(&fx.today_dir(RunMode::Archive)),
            vec![format!("{day}_21_A0.fit"), format!("{day}_21_A1.fit")]
        );
        assert_eq!(
            fs::read_to_string(fx.today_dir(RunMode::Archive).join(format!("{day}_21_A0.fit"))).unwrap(),
            "fit-data-A0.fit"
        );
        assert!(result.summary.contains("Copied 2 file(s)"));
        assert!(result.summary.contains("Please attach the next watch."));

        // Exactly one terminal message, and it is the last one
        assert_eq!(terminal_count(&messages), 1);
        let last = messages.last().unwrap();
        assert!(matches!(last, WorkerMessage::Done(_)));
        assert!(last.to_line().starts_with("DONE|"));
        assert!(last.to_line().ends_with("|MODE:ARCHIVE"));

        // The prompt comes after detection and before the first copy progress
        let ask = messages
            .iter()
            .position(|m| matches!(m, WorkerMessage::AskPick(_)))
            .unwrap();
        let countdown_hidden = messages
            .iter()
            .position(|m| matches!(m, WorkerMessage::Countdown { seconds_left: None }))
            .unwrap();
        assert!(countdown_hidden < ask);

        let stored = JsonProfileStore::new(fx.paths.devices_dir())
            .load(DEVICE_ID)
            .unwrap()
            .unwrap();
        assert_eq!(stored.label.as_deref(), Some("21"));
        assert_eq!(stored.model.as_deref(), Some("Forerunner 245"));
        assert_eq!(stored.last_action.as_deref(), Some("archive"));
        assert_eq!(stored.last_files.len(), 2);
        assert_eq!(stored.run_count, 1);

        let log = fs::read_to_string(fx.paths.log_file()).unwrap();
        assert!(log.contains(&format!("COPIED label=21 file={day}_21_A0.fit")));
        assert!(!launcher.is_busy());
    }

    #[tokio::test]
    async fn test_email_today_only_without_today_files_fails_without_sending() {
        let fx = Fixture::new();
        let root = fx.mount_watch("GARMIN");
        fx.add_activity(&root, "OLD.fit", Local::now() - ChronoDuration::days(2));

        let handle = WorkerLauncher::new()
            .launch(fx.deps(), RunRequest::email(recipient(), &fx.settings()))
            .unwrap();
        let (messages, result) = drive(handle, pick_first(1)).await;

        assert_eq!(result.status, RunStatus::Error);
        assert_eq!(result.error_code, Some(ERR_NO_MATCHING_FILES));
        assert!(result.summary.contains("today"));
        assert!(!messages.iter().any(|m| matches!(m, WorkerMessage::AskPick(_))));
        assert!(matches!(messages.last(), Some(WorkerMessage::Error(_))));
        assert!(fx.mailer.sent.lock().unwrap().is_empty());
        assert!(names_in(&fx.today_dir(RunMode::Email)).is_empty());
    }

    #[tokio::test]
    async fn test_email_sends_copied_files() {
        let fx = Fixture::new();
        fx.label_watch("21");
        let root = fx.mount_watch("GARMIN");
        fx.add_activity(&root, "RUN.fit", Local::now());

        let handle = WorkerLauncher::new()
            .launch(fx.deps(), RunRequest::email(recipient(), &fx.settings()))
            .unwrap();
        let (messages, result) = drive(handle, pick_first(1)).await;

        assert_eq!(result.status, RunStatus::Done);
        let expected = fx
            .today_dir(RunMode::Email)
            .join(format!("{}_21_ana.m_RUN.fit", today()));
        assert!(expected.exists());

        let sent = fx.mailer.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].attachments, vec![expected]);
        assert_eq!(sent[0].body, "Hello Ana, your activities are attached.");
        assert!(sent[0].subject.starts_with("Garmin FIT "));
        assert!(matches!(result.email, EmailOutcome::Sent { attachments: 1, .. }));
        assert!(messages.last().unwrap().to_line().ends_with("|MODE:EMAIL"));

        let log = fs::read_to_string(fx.paths.log_file()).unwrap();
        assert!(log.contains("SENT label=21 name=Ana email=ana.m@example.org"));
    }

    #[tokio::test]
    async fn test_auth_rejection_keeps_copied_files() {
        let fx = Fixture::with_mailer(RecordingMailer {
            reject_auth: true,
            ..Default::default()
        });
        let root = fx.mount_watch("GARMIN");
        fx.add_activity(&root, "RUN.fit", Local::now());

        let handle = WorkerLauncher::new()
            .launch(fx.deps(), RunRequest::email(recipient(), &fx.settings()))
            .unwrap();
        let (messages, result) = drive(handle, pick_first(1)).await;

        assert_eq!(result.status, RunStatus::Error);
        assert_eq!(result.error_code, Some(ERR_AUTH_REJECTED));
        assert!(result.summary.contains("App Password"));
        assert!(matches!(result.email, EmailOutcome::Failed { .. }));
        assert_eq!(names_in(&fx.today_dir(RunMode::Email)).len(), 1);
        assert_eq!(terminal_count(&messages), 1);
        assert!(matches!(messages.last(), Some(WorkerMessage::Error(_))));
    }

    #[tokio::test]
    async fn test_partial_failure_attaches_only_copied_files() {
        let fx = Fixture::new();
        let root = fx.mount_watch("GARMIN");
        let now = Local::now();
        fx.add_activity(&root, "A.fit", now);
        let growing = fx.add_activity(&root, "B.fit", now - ChronoDuration::minutes(1));
        fx.add_activity(&root, "C.fit", now - ChronoDuration::minutes(2));

        let handle = WorkerLauncher::new()
            .launch(fx.deps(), RunRequest::email(recipient(), &fx.settings()))
            .unwrap();
        let (_, result) = drive(handle, |request| {
            // The watch is still writing B.fit after it was indexed
            fs::write(&growing, b"fit-data-B.fit plus a few more records").unwrap();
            pick_first(3)(request)
        })
        .await;

        assert_eq!(result.status, RunStatus::PartialSuccess);
        assert_eq!(result.transferred.len(), 2);
        assert_eq!(result.failed.len(), 1);
        assert_eq!(result.failed[0].file_name, "B.fit");
        assert!(result.summary.contains("B.fit"));
        assert!(result.summary.contains("not attached"));
        assert_eq!(result.percent, 66);

        let sent = fx.mailer.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].attachments.len(), 2);
        assert_eq!(sent[0].subject.split(" – ").next(), Some("Garmin FIT activities (2 files)"));
    }

    #[tokio::test]
    async fn test_cancelled_selection_copies_nothing() {
        let fx = Fixture::new();
        let root = fx.mount_watch("GARMIN");
        fx.add_activity(&root, "A.fit", Local::now());

        let handle = WorkerLauncher::new()
            .launch(fx.deps(), RunRequest::archive(&fx.settings()))
            .unwrap();
        let (messages, result) = drive(handle, |_| SelectionReply::Cancelled).await;

        assert_eq!(result.status, RunStatus::Cancelled);
        assert_eq!(result.error_code, Some(ERR_SELECTION_CANCELLED));
        assert!(names_in(&fx.today_dir(RunMode::Archive)).is_empty());
        assert_eq!(terminal_count(&messages), 1);
    }

    #[tokio::test]
    async fn test_second_run_rejected_while_busy() {
        let fx = Fixture::new();
        let mut deps = fx.deps();
        deps.settings.detect_timeout_secs = 30;

        let launcher = WorkerLauncher::new();
        let first = launcher
            .launch(deps.clone(), RunRequest::archive(&fx.settings()))
            .unwrap();
        assert!(launcher.is_busy());

        let second = launcher.launch(deps.clone(), RunRequest::archive(&fx.settings()));
        assert!(matches!(second, Err(WorkerError::RunInProgress)));

        first.cancel();
        let (_, result) = drive(first, pick_first(1)).await;
        assert_eq!(result.status, RunStatus::Cancelled);
        assert_eq!(result.error_code, Some(ERR_CANCELLED));

        assert!(!launcher.is_busy());
        let third = launcher
            .launch(deps, RunRequest::archive(&fx.settings()))
            .unwrap();
        third.cancel();
        let (_, result) = drive(third, pick_first(1)).await;
        assert_eq!(result.status, RunStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_two_watches_is_ambiguous() {
        let fx = Fixture::new();
        fx.mount_watch("GARMIN");
        fx.mount_watch("GARMIN 1");

        let handle = WorkerLauncher::new()
            .launch(fx.deps(), RunRequest::archive(&fx.settings()))
            .unwrap();
        let (_, result) = drive(handle, pick_first(1)).await;

        assert_eq!(result.status, RunStatus::Error);
        assert_eq!(result.error_code, Some(ERR_AMBIGUOUS_VOLUME));
    }

    #[tokio::test]
    async fn test_detection_timeout_reports_countdown() {
        let fx = Fixture::new();
        let mut deps = fx.deps();
        deps.settings.detect_timeout_secs = 1;

        let handle = WorkerLauncher::new()
            .launch(deps, RunRequest::archive(&fx.settings()))
            .unwrap();
        let (messages, result) = drive(handle, pick_first(1)).await;

        assert_eq!(result.status, RunStatus::Error);
        assert_eq!(result.error_code, Some(ERR_DETECTION_TIMEOUT));
        assert!(messages
            .iter()
            .any(|m| matches!(m, WorkerMessage::Countdown { seconds_left: Some(1) })));
        assert!(matches!(
            messages[messages.len() - 2],
            WorkerMessage::Countdown { seconds_left: None }
        ));
        assert_eq!(messages.last().unwrap().to_line(), format!("ERROR|{}", result.summary));
    }

    #[tokio::test]
    async fn test_email_without_mail_settings_fails_before_detection() {
        let fx = Fixture::new();
        fx.mount_watch("GARMIN");
        let mut deps = fx.deps();
        deps.mailer = None;

        let handle = WorkerLauncher::new()
            .launch(deps, RunRequest::email(recipient(), &fx.settings()))
            .unwrap();
        let (messages, result) = drive(handle, pick_first(1)).await;

        assert_eq!(result.error_code, Some(ERR_CONFIG));
        assert!(result.summary.contains("mailer.conf.json"));
        assert_eq!(messages.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_watch_gets_persisted_placeholder_label() {
        let fx = Fixture::new();
        let root = fx.mount_watch("GARMIN");
        fx.add_activity(&root, "A.fit", Local::now());

        let handle = WorkerLauncher::new()
            .launch(fx.deps(), RunRequest::archive(&fx.settings()))
            .unwrap();
        let (_, result) = drive(handle, pick_first(1)).await;

        assert_eq!(result.label.as_deref(), Some("W-999999"));
        assert_eq!(
            names_in(&fx.today_dir(RunMode::Archive)),
            vec![format!("{}_W-999999_A.fit", today())]
        );
        let labels = CsvLabelStore::new(fx.paths.labels_csv());
        assert_eq!(labels.lookup(DEVICE_ID).unwrap().as_deref(), Some("W-999999"));
    }

    #[tokio::test]
    async fn test_same_file_twice_same_day_keeps_both_copies() {
        let fx = Fixture::new();
        fx.label_watch("21");
        let root = fx.mount_watch("GARMIN");
        fx.add_activity(&root, "A.fit", Local::now());

        let launcher = WorkerLauncher::new();
        for _ in 0..2 {
            let handle = launcher
                .launch(fx.deps(), RunRequest::archive(&fx.settings()))
                .unwrap();
            let (_, result) = drive(handle, pick_first(1)).await;
            assert_eq!(result.status, RunStatus::Done);
        }

        let day = today();
        assert_eq!(
            names_in(&fx.today_dir(RunMode::Archive)),
            vec![format!("{day}_21_A.fit"), format!("{day}_21_A_2.fit")]
        );
        let stored = JsonProfileStore::new(fx.paths.devices_dir())
            .load(DEVICE_ID)
            .unwrap()
            .unwrap();
        assert_eq!(stored.run_count, 2);
    }

    #[tokio::test]
    async fn test_eject_after_copy_changes_summary() {
        let fx = Fixture::new();
        let root = fx.mount_watch("GARMIN");
        fx.add_activity(&root, "A.fit", Local::now());

        let scanner = Arc::new(FakeEjectScanner {
            inner: MountDirectoryScanner::new(vec![fx.mounts()], Platform::Linux),
            ejected: Mutex::new(Vec::new()),
            cancel_on_eject: Mutex::new(None),
        });
        let mut deps = fx.deps();
        deps.scanner = scanner.clone();
        let mut request = RunRequest::archive(&fx.settings());
        request.unmount_after_copy = true;

        let handle = WorkerLauncher::new().launch(deps, request).unwrap();
        let (_, result) = drive(handle, pick_first(1)).await;

        assert_eq!(result.status, RunStatus::Done);
        assert!(result.summary.contains("Eject successful"));
        assert_eq!(*scanner.ejected.lock().unwrap(), vec![root]);
    }

    #[tokio::test]
    async fn test_cancel_after_last_file_skips_email() {
        let fx = Fixture::new();
        fx.label_watch("21");
        let root = fx.mount_watch("GARMIN");
        fx.add_activity(&root, "RUN.fit", Local::now());

        let scanner = Arc::new(FakeEjectScanner {
            inner: MountDirectoryScanner::new(vec![fx.mounts()], Platform::Linux),
            ejected: Mutex::new(Vec::new()),
            cancel_on_eject: Mutex::new(None),
        });
        let mut deps = fx.deps();
        deps.scanner = scanner.clone();
        let mut request = RunRequest::email(recipient(), &fx.settings());
        request.unmount_after_copy = true;

        let handle = WorkerLauncher::new().launch(deps, request).unwrap();
        *scanner.cancel_on_eject.lock().unwrap() = Some(handle.cancel_token());
        let (messages, result) = drive(handle, pick_first(1)).await;

        assert_eq!(result.status, RunStatus::Cancelled);
        assert_eq!(result.error_code, Some(ERR_CANCELLED));
        assert!(fx.mailer.sent.lock().unwrap().is_empty());
        assert_eq!(names_in(&fx.today_dir(RunMode::Email)).len(), 1);
        assert!(matches!(messages.last(), Some(WorkerMessage::Error(_))));
        assert_eq!(terminal_count(&messages), 1);

        let stored = JsonProfileStore::new(fx.paths.devices_dir())
            .load(DEVICE_ID)
            .unwrap()
            .unwrap();
        assert_eq!(stored.run_count, 1);
    }
}
