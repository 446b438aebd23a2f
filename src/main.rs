//! procrack: Procfile supervisor daemon.
//!
//! Parses command-line arguments, loads configuration, and dispatches to the
//! foreground supervisor or to the daemon controls.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::builder::styling::{AnsiColor, Effects, Style};
use clap::builder::Styles;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use procrack::ansi::markup_to_plain;
use procrack::config::{self, Settings};
use procrack::context::DaemonContext;
use procrack::daemon::{DaemonController, DaemonError, StartOutcome, StopStage};
use procrack::procfile::Procfile;
use procrack::store::{OutputLine, OutputStore};

const FOLLOW_INTERVAL: Duration = Duration::from_millis(500);

/// Command-line interface definition.
#[derive(Debug, Parser)]
#[command(
    name = "procrack",
    version,
    about = "Procfile supervisor daemon with a persistent output log",
    styles = help_styles(),
    disable_help_subcommand = true
)]
struct Cli {
    /// Working directory (default: current directory).
    #[arg(long, global = true)]
    dir: Option<PathBuf>,
    /// Path to procrack.toml configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Log at debug level.
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the supervisor in the foreground.
    Run {
        /// Procfile to supervise.
        #[arg(long)]
        procfile: Option<PathBuf>,
    },
    /// Start the supervisor in the background.
    Start {
        /// Procfile to supervise.
        #[arg(long)]
        procfile: Option<PathBuf>,
    },
    /// Stop the background supervisor.
    Stop,
    /// Show whether the supervisor runs, and per-process line counts.
    Status {
        /// Print as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Print captured output.
    Logs {
        /// Keep printing new lines as they arrive.
        #[arg(short, long)]
        follow: bool,
        /// Only lines after this id (0 = recent lines of every process).
        #[arg(long, default_value_t = 0)]
        since: i64,
        /// Maximum lines per incremental read.
        #[arg(long)]
        limit: Option<usize>,
        /// Strip markup.
        #[arg(long)]
        plain: bool,
    },
    /// Validate a Procfile.
    Check {
        /// Procfile to check.
        #[arg(long)]
        procfile: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(&cli);

    let workdir = resolve_workdir(cli.dir.as_deref())?;
    let mut file_config = config::load_for(&workdir, cli.config.as_deref())?;
    if let Commands::Run { procfile: Some(path) }
    | Commands::Start { procfile: Some(path) }
    | Commands::Check { procfile: Some(path) } = &cli.command
    {
        file_config.procfile = Some(absolute(path)?);
    }
    let settings = Settings::resolve(&workdir, file_config);

    match &cli.command {
        Commands::Run { .. } => {
            let ctx = DaemonContext::build(settings, &program_marker())?;
            ctx.run().await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Start { .. } => start(&cli, &settings).await,
        Commands::Stop => stop(&settings).await,
        Commands::Status { json } => status(&settings, *json),
        Commands::Logs {
            follow,
            since,
            limit,
            plain,
        } => logs(&settings, *follow, *since, *limit, *plain).await,
        Commands::Check { .. } => check(&settings),
    }
}

fn init_tracing(cli: &Cli) {
    let level = if cli.verbose {
        "debug"
    } else if matches!(cli.command, Commands::Run { .. }) {
        "info"
    } else {
        "warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn resolve_workdir(dir: Option<&Path>) -> Result<PathBuf> {
    let dir = match dir {
        Some(dir) => dir.to_path_buf(),
        None => std::env::current_dir().context("failed to read current directory")?,
    };
    dir.canonicalize()
        .with_context(|| format!("working directory {} not found", dir.display()))
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    Ok(std::env::current_dir()
        .context("failed to read current directory")?
        .join(path))
}

/// What the daemon's command line must contain: this program's file name.
fn program_marker() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "procrack".to_string())
}

fn controller(cli: &Cli, settings: &Settings) -> Result<DaemonController> {
    let exe = std::env::current_exe().context("failed to locate own executable")?;
    let mut launch = vec![
        exe.to_string_lossy().into_owned(),
        "--dir".to_string(),
        settings.workdir.to_string_lossy().into_owned(),
    ];
    if let Some(config) = &cli.config {
        launch.push("--config".to_string());
        launch.push(absolute(config)?.to_string_lossy().into_owned());
    }
    if cli.verbose {
        launch.push("--verbose".to_string());
    }
    launch.push("run".to_string());
    launch.push("--procfile".to_string());
    launch.push(settings.procfile.to_string_lossy().into_owned());
    Ok(DaemonController::new(settings, launch))
}

async fn start(cli: &Cli, settings: &Settings) -> Result<ExitCode> {
    if settings.wrap.is_none() {
        let parsed = Procfile::load(&settings.procfile)?;
        if parsed.is_empty() {
            bail!("no processes defined in {}", settings.procfile.display());
        }
    }
    match controller(cli, settings)?.start().await? {
        StartOutcome::Started(pid) => println!("started (pid {})", pid),
        StartOutcome::AlreadyRunning(pid) => println!("already running (pid {})", pid),
    }
    Ok(ExitCode::SUCCESS)
}

async fn stop(settings: &Settings) -> Result<ExitCode> {
    let ctl = DaemonController::new(settings, vec![program_marker()]);
    match ctl.stop().await {
        Ok(stage) => {
            let how = match stage {
                StopStage::Quit => "quit command",
                StopStage::Terminate => "SIGTERM",
                StopStage::Kill => "SIGKILL",
            };
            println!("stopped ({})", how);
            Ok(ExitCode::SUCCESS)
        }
        Err(DaemonError::NotRunning) => {
            println!("not running");
            Ok(ExitCode::from(1))
        }
        Err(err) => Err(err.into()),
    }
}

fn status(settings: &Settings, json: bool) -> Result<ExitCode> {
    let ctl = DaemonController::new(settings, vec![program_marker()]);
    let pid = ctl.pid();
    let stats = if settings.store_file.exists() {
        OutputStore::open(&settings.store_file)?.process_stats()?
    } else {
        Vec::new()
    };

    if json {
        let body = serde_json::json!({
            "running": pid.is_some(),
            "pid": pid,
            "processes": stats,
        });
        println!("{}", serde_json::to_string_pretty(&body)?);
    } else {
        match pid {
            Some(pid) => println!("running (pid {})", pid),
            None => println!("not running"),
        }
        let width = stats.iter().map(|s| s.process.len()).max().unwrap_or(0);
        for stat in &stats {
            println!(
                "  {:<width$}  {} lines (ids {}..{})",
                stat.process,
                stat.count,
                stat.min_id,
                stat.max_id,
                width = width
            );
        }
    }
    Ok(if pid.is_some() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    })
}

async fn logs(
    settings: &Settings,
    follow: bool,
    since: i64,
    limit: Option<usize>,
    plain: bool,
) -> Result<ExitCode> {
    if !settings.store_file.exists() {
        bail!(
            "no output store at {} (has the supervisor run here?)",
            settings.store_file.display()
        );
    }
    let ctl = DaemonController::new(settings, vec![program_marker()]);
    let mut daemon = ctl.pid();
    let mut store = OutputStore::open(&settings.store_file)?;
    let mut last = print_lines(
        &store.read(since, limit, settings.bootstrap_limit)?,
        plain,
        since,
    );

    while follow {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = tokio::time::sleep(FOLLOW_INTERVAL) => {}
        }
        // A new daemon recreates the store and restarts ids.
        let current = ctl.pid();
        if current.is_some() && current != daemon {
            daemon = current;
            store = OutputStore::open(&settings.store_file)?;
            last = print_lines(
                &store.read(0, limit, settings.bootstrap_limit)?,
                plain,
                0,
            );
            continue;
        }
        last = print_lines(&store.read_since(last, limit)?, plain, last);
    }
    Ok(ExitCode::SUCCESS)
}

/// Prints `lines` and returns the id to resume from.
fn print_lines(lines: &[OutputLine], plain: bool, last: i64) -> i64 {
    for line in lines {
        if plain {
            println!("{}", markup_to_plain(&line.html));
        } else {
            println!("{}", line.html);
        }
    }
    lines.last().map(|line| line.id).unwrap_or(last)
}

fn check(settings: &Settings) -> Result<ExitCode> {
    let parsed = Procfile::load(&settings.procfile)?;
    for entry in &parsed.entries {
        println!("{}: {}", entry.name, entry.command);
    }
    for err in &parsed.errors {
        eprintln!("{}: {}", settings.procfile.display(), err);
    }
    if parsed.is_empty() {
        eprintln!("no processes defined");
    }
    Ok(if parsed.errors.is_empty() && !parsed.is_empty() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    })
}

fn help_styles() -> Styles {
    Styles::styled()
        .header(
            Style::new()
                .fg_color(Some(AnsiColor::Cyan.into()))
                .effects(Effects::BOLD),
        )
        .usage(
            Style::new()
                .fg_color(Some(AnsiColor::Green.into()))
                .effects(Effects::BOLD),
        )
        .literal(Style::new().fg_color(Some(AnsiColor::Yellow.into())))
        .placeholder(Style::new().fg_color(Some(AnsiColor::Magenta.into())))
        .valid(Style::new().fg_color(Some(AnsiColor::Green.into())))
        .invalid(
            Style::new()
                .fg_color(Some(AnsiColor::Red.into()))
                .effects(Effects::BOLD),
        )
}
