use clap::{Parser, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use garmin_mailer_lib::activity_index::ActivityFile;
use garmin_mailer_lib::config::{AppPaths, RunMode, Settings};
use garmin_mailer_lib::input_validation::Recipient;
use garmin_mailer_lib::logging::init_tracing;
use garmin_mailer_lib::system_integration::{find_current_volume, platform_scanner};
use garmin_mailer_lib::worker::{
    ProgressHint, RunRequest, RunResult, SelectionReply, SelectionRequest, WorkerDeps, WorkerLauncher, WorkerMessage,
};

#[derive(Parser)]
#[command(name = "garmin-mailer")]
#[command(about = "Copy activities from a Garmin watch to a dated folder, or email them", long_about = None)]
struct Cli {
    /// Archive Mode: copy only, no email
    #[arg(long, conflicts_with = "email")]
    archive: bool,

    /// Email Mode: recipient address
    #[arg(long, requires = "name")]
    email: Option<String>,

    /// Email Mode: participant name used in the mail body
    #[arg(long)]
    name: Option<String>,

    /// Offer the most recent activities instead of only today's
    #[arg(long)]
    all_dates: bool,

    /// Leave the watch mounted after copying
    #[arg(long)]
    no_unmount: bool,

    /// Keep starting Archive runs whenever a watch is connected
    #[arg(long)]
    watch: bool,

    #[arg(long)]
    list_volumes: bool,

    /// Data directory (default: ~/Documents/GarminMailer)
    #[arg(long)]
    base_dir: Option<PathBuf>,

    /// Write mail to outbox/ instead of sending it, with debug logging
    #[arg(long)]
    devmode: bool,

    #[arg(long, value_enum, default_value_t = OutputFormat::Human)]
    format: OutputFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    /// Spinner and interactive prompt
    Human,
    /// Pipe-delimited lines; replies are read as `PICK|[..]` or `CANCEL`
    Lines,
    /// One JSON event per line; replies as in `lines`
    Json,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let paths = match &cli.base_dir {
        Some(base) => AppPaths::new(base),
        None => AppPaths::default_location()?,
    };
    paths.ensure_dirs()?;
    let mut settings = Settings::load_or_create(&paths.settings_file())?;
    if cli.devmode {
        settings.devmode = true;
    }
    if cli.all_dates {
        settings.today_only = false;
    }
    if cli.no_unmount {
        settings.unmount_after_copy = false;
    }
    init_tracing(settings.devmode);

    if cli.list_volumes {
        let scanner = platform_scanner();
        println!("💾 Scanning for Garmin watches ({:?})...", scanner.platform());
        let volumes = scanner.probe();
        println!("Found {} watch volume(s):", volumes.len());
        println!("{:<20} {:<40} {:<36}", "NAME", "ROOT", "DISK UUID");
        println!("{}", "-".repeat(96));
        for vol in volumes {
            println!(
                "{:<20} {:<40} {:<36}",
                vol.name,
                vol.root.display(),
                vol.disk_uuid.as_deref().unwrap_or("-")
            );
        }
        return Ok(());
    }

    let deps = WorkerDeps::standard(paths, settings.clone())?;
    let launcher = WorkerLauncher::new();

    if cli.watch {
        if cli.email.is_some() {
            anyhow::bail!("--watch only runs Archive Mode");
        }
        watch_loop(&launcher, deps, &settings, cli.format).await?;
        return Ok(());
    }

    let mode = if cli.archive {
        RunMode::Archive
    } else if cli.email.is_some() {
        RunMode::Email
    } else {
        settings.default_mode
    };
    let request = match mode {
        RunMode::Archive => RunRequest::archive(&settings),
        RunMode::Email => {
            let (Some(name), Some(email)) = (cli.name.as_deref(), cli.email.as_deref()) else {
                anyhow::bail!("Email Mode needs --name and --email (or pass --archive)");
            };
            RunRequest::email(Recipient::new(name, email)?, &settings)
        }
    };

    let result = run_once(&launcher, deps, request, cli.format).await?;
    // A pending stdin read must not keep the process alive
    std::process::exit(if result.is_success() { 0 } else { 1 });
}

async fn watch_loop(
    launcher: &WorkerLauncher,
    deps: WorkerDeps,
    settings: &Settings,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let scanner = Arc::clone(&deps.scanner);
    let poll = Duration::from_millis(settings.poll_interval_ms);
    println!("👀 Waiting for watches. Press Ctrl-C to stop.");

    loop {
        let volume = loop {
            if let Some(volume) = find_current_volume(scanner.as_ref()) {
                break volume;
            }
            tokio::select! {
                _ = tokio::time::sleep(poll) => {}
                _ = tokio::signal::ctrl_c() => return Ok(()),
            }
        };

        println!("⌚ {} connected", volume.name);
        let result = run_once(launcher, deps.clone(), RunRequest::archive(settings), format).await?;
        if !result.is_success() {
            eprintln!("⚠️  Run ended without copying; disconnect the watch to try again.");
        }

        while scanner.probe().iter().any(|v| v.root == volume.root) {
            tokio::select! {
                _ = tokio::time::sleep(poll) => {}
                _ = tokio::signal::ctrl_c() => return Ok(()),
            }
        }
    }
}

fn spinner() -> anyhow::Result<ProgressBar> {
    let pb = ProgressBar::new_spinner();
    pb.set_style(ProgressStyle::default_spinner().template("{spinner:.green} {msg}")?);
    pb.enable_steady_tick(Duration::from_millis(120));
    Ok(pb)
}

async fn run_once(
    launcher: &WorkerLauncher,
    deps: WorkerDeps,
    request: RunRequest,
    format: OutputFormat,
) -> anyhow::Result<RunResult> {
    let mut handle = launcher.launch(deps, request)?;
    let mut pb = match format {
        OutputFormat::Human => Some(spinner()?),
        _ => None,
    };

    loop {
        let message = tokio::select! {
            message = handle.next_message() => message,
            _ = tokio::signal::ctrl_c() => {
                handle.cancel();
                continue;
            }
        };
        let Some(message) = message else {
            break;
        };

        match format {
            OutputFormat::Lines => println!("{}", message.to_line()),
            OutputFormat::Json => println!("{}", serde_json::to_string(&message)?),
            OutputFormat::Human => render(&mut pb, &message)?,
        }

        if let WorkerMessage::AskPick(request) = &message {
            let reply = tokio::select! {
                reply = read_selection(request, format) => reply?,
                _ = tokio::signal::ctrl_c() => {
                    handle.cancel();
                    SelectionReply::Cancelled
                }
            };
            handle.reply(reply);
            if format == OutputFormat::Human {
                pb = Some(spinner()?);
            }
        }
    }

    Ok(handle.join().await?)
}

fn render(pb: &mut Option<ProgressBar>, message: &WorkerMessage) -> anyhow::Result<()> {
    let Some(bar) = pb.as_ref() else {
        return Ok(());
    };

    match message {
        WorkerMessage::Step { text, progress } => match progress {
            ProgressHint::Percent(p) => bar.set_message(format!("[{p:>3}%] {text}")),
            ProgressHint::SpinOn | ProgressHint::SpinOff => bar.set_message(text.clone()),
        },
        WorkerMessage::Countdown {
            seconds_left: Some(secs),
        } => bar.set_message(format!("Waiting for the watch ({secs}s left)")),
        WorkerMessage::Countdown { seconds_left: None } => {}
        WorkerMessage::AskPick(_) => {
            bar.finish_and_clear();
            *pb = None;
        }
        WorkerMessage::Done(result) => {
            bar.finish_with_message(format!("✅ {}", result.summary));
            print_result(result);
        }
        WorkerMessage::Error(result) => {
            bar.abandon_with_message(format!("❌ {}", result.summary));
            print_result(result);
        }
    }
    Ok(())
}

fn print_result(result: &RunResult) {
    if let Some(dest) = &result.destination {
        println!("   Folder: {}", dest.display());
    }
    for path in &result.transferred {
        println!("   ➕ {}", path.display());
    }
    for failed in &result.failed {
        eprintln!("   ⚠️  {}: {}", failed.file_name, failed.reason);
    }
}

async fn read_line() -> anyhow::Result<String> {
    let line = tokio::task::spawn_blocking(|| {
        let mut line = String::new();
        std::io::stdin().read_line(&mut line).map(|_| line)
    })
    .await??;
    Ok(line)
}

async fn read_selection(request: &SelectionRequest, format: OutputFormat) -> anyhow::Result<SelectionReply> {
    if format != OutputFormat::Human {
        return loop {
            let line = read_line().await?;
            if line.is_empty() {
                break Ok(SelectionReply::Cancelled);
            }
            match SelectionReply::from_line(&line) {
                Ok(reply) => break Ok(reply),
                Err(e) => eprintln!("{e}"),
            }
        };
    }

    println!("📝 Activities on the watch:");
    for (i, file) in request.candidates.iter().enumerate() {
        println!("   {:>2}. {}", i + 1, file.describe());
    }
    loop {
        print!("Select files (e.g. 1,3 or 'all'; empty cancels): ");
        std::io::stdout().flush()?;
        let line = read_line().await?;
        match parse_human_selection(&line, &request.candidates) {
            Ok(reply) => return Ok(reply),
            Err(e) => eprintln!("❌ {e}"),
        }
    }
}

fn parse_human_selection(input: &str, candidates: &[ActivityFile]) -> Result<SelectionReply, String> {
    let input = input.trim();
    if input.is_empty() {
        return Ok(SelectionReply::Cancelled);
    }
    if input.eq_ignore_ascii_case("all") {
        return Ok(SelectionReply::Chosen(
            candidates.iter().map(|c| c.source.clone()).collect(),
        ));
    }

    let mut chosen = Vec::new();
    for token in input.split([',', ' ']).filter(|t| !t.is_empty()) {
        let index: usize = token
            .parse()
            .map_err(|_| format!("not a number: {token}"))?;
        let file = index
            .checked_sub(1)
            .and_then(|i| candidates.get(i))
            .ok_or_else(|| format!("no activity number {index}"))?;
        if !chosen.contains(&file.source) {
            chosen.push(file.source.clone());
        }
    }
    Ok(SelectionReply::Chosen(chosen))
}
