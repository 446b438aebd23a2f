//! Daemon lifecycle: one supervisor per working directory.
//!
//! A running daemon is recorded as its decimal PID in a file inside the working
//! directory. A record is only trusted if the process exists, is not a zombie,
//! and (when its command line is readable) looks like the supervisor program.
//! Anything else is stale and the file is removed on sight.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System, UpdateKind};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::supervisor::PUMP_DRAIN;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const ACQUIRE_ATTEMPTS: usize = 3;
/// Slack on top of the daemon's own shutdown budget before SIGKILL.
const SHUTDOWN_MARGIN: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("daemon already running (pid {0})")]
    AlreadyRunning(u32),

    #[error("daemon is not running")]
    NotRunning,

    #[error("failed to write pid file {path}: {source}")]
    PidFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to launch daemon: {0}")]
    Launch(#[source] std::io::Error),

    #[error("daemon exited during startup (code {0:?}), see {1}")]
    ExitedEarly(Option<i32>, PathBuf),

    #[error("daemon did not write its pid file within {0:?}")]
    StartTimeout(Duration),

    #[error("daemon (pid {0}) survived SIGKILL")]
    SurvivedKill(u32),

    #[error("invalid quit command: {0}")]
    QuitCommand(String),
}

/// What a PID file currently says.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Liveness {
    Absent,
    Live(u32),
    /// The file was stale and has been removed.
    Stale(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ProcessInfo {
    zombie: bool,
    cmdline: Vec<String>,
}

fn inspect_process(pid: u32) -> Option<ProcessInfo> {
    let pid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[pid]),
        true,
        ProcessRefreshKind::nothing().with_cmd(UpdateKind::Always),
    );
    let process = system.process(pid)?;
    Some(ProcessInfo {
        zombie: matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead),
        cmdline: process
            .cmd()
            .iter()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect(),
    })
}

/// True if `pid` exists and is not a zombie.
pub fn is_pid_alive(pid: u32) -> bool {
    inspect_process(pid).map(|info| !info.zombie).unwrap_or(false)
}

fn stale_reason(pid: u32, marker: &str) -> Option<String> {
    let Some(info) = inspect_process(pid) else {
        return Some(format!("process {} does not exist", pid));
    };
    if info.zombie {
        return Some(format!("process {} is a zombie", pid));
    }
    if !marker.is_empty()
        && !info.cmdline.is_empty()
        && !info.cmdline.iter().any(|arg| arg.contains(marker))
    {
        return Some(format!(
            "process {} is not {} ({})",
            pid,
            marker,
            info.cmdline.join(" ")
        ));
    }
    None
}

/// Reads the PID file at `path`, deleting it if it is stale.
pub fn probe(path: &Path, marker: &str) -> Liveness {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(_) => return Liveness::Absent,
    };
    let reason = match raw.trim().parse::<u32>() {
        Ok(0) => Some("pid 0".to_string()),
        Ok(pid) => match stale_reason(pid, marker) {
            None => return Liveness::Live(pid),
            Some(reason) => Some(reason),
        },
        Err(_) => Some(format!("unparseable pid '{}'", raw.trim())),
    };
    let reason = reason.unwrap_or_default();
    info!(path = %path.display(), reason = %reason, "removing stale pid file");
    let _ = std::fs::remove_file(path);
    Liveness::Stale(reason)
}

/// The running daemon's claim on its PID file; removes the file on drop.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
    pid: u32,
}

impl PidFile {
    /// Claims `path` for the current PID, refusing if a live daemon owns it.
    ///
    /// The file is written under a temporary name and linked into place, so
    /// it never exists without its content and only one claimant can win.
    pub fn acquire(path: &Path, marker: &str) -> Result<Self, DaemonError> {
        let pid = std::process::id();
        let pid_error = |source| DaemonError::PidFile {
            path: path.to_path_buf(),
            source,
        };
        let staging = PathBuf::from(format!("{}.{}", path.display(), pid));
        write_pid(&staging, pid).map_err(pid_error)?;

        let mut result = Err(pid_error(std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            "pid file keeps reappearing",
        )));
        for _ in 0..ACQUIRE_ATTEMPTS {
            match std::fs::hard_link(&staging, path) {
                Ok(()) => {
                    debug!(path = %path.display(), pid, "wrote pid file");
                    result = Ok(Self {
                        path: path.to_path_buf(),
                        pid,
                    });
                    break;
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    match probe(path, marker) {
                        Liveness::Live(owner) if owner == pid => {
                            result = Ok(Self {
                                path: path.to_path_buf(),
                                pid,
                            });
                            break;
                        }
                        Liveness::Live(owner) => {
                            result = Err(DaemonError::AlreadyRunning(owner));
                            break;
                        }
                        // Stale entries are removed by the probe; try again.
                        Liveness::Absent | Liveness::Stale(_) => {}
                    }
                }
                Err(source) => {
                    result = Err(pid_error(source));
                    break;
                }
            }
        }
        let _ = std::fs::remove_file(&staging);
        result
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        let ours = std::fs::read_to_string(&self.path)
            .ok()
            .and_then(|raw| raw.trim().parse::<u32>().ok())
            == Some(self.pid);
        if ours {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

#[cfg(unix)]
fn write_pid(path: &Path, pid: u32) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(pid.to_string().as_bytes())
}

#[cfg(not(unix))]
fn write_pid(path: &Path, pid: u32) -> std::io::Result<()> {
    std::fs::write(path, pid.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started(u32),
    AlreadyRunning(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopStage {
    Quit,
    Terminate,
    Kill,
}

/// Controls the daemon of one working directory from the outside.
#[derive(Debug, Clone)]
pub struct DaemonController {
    workdir: PathBuf,
    pid_file: PathBuf,
    log_file: PathBuf,
    /// Expected in the daemon's command line.
    marker: String,
    /// Program and arguments that run the daemon in the foreground.
    launch: Vec<String>,
    quit_command: Option<String>,
    start_wait: Duration,
    stop_wait: Duration,
    /// How long SIGTERM gets: enough for the daemon to stop its children.
    term_wait: Duration,
}

impl DaemonController {
    pub fn new(settings: &Settings, launch: Vec<String>) -> Self {
        let marker = launch
            .first()
            .and_then(|program| Path::new(program).file_name())
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            workdir: settings.workdir.clone(),
            pid_file: settings.pid_file.clone(),
            log_file: settings.log_file.clone(),
            marker,
            launch,
            quit_command: settings.quit_command.clone(),
            start_wait: settings.daemon_start,
            stop_wait: settings.daemon_stop,
            term_wait: settings
                .daemon_stop
                .max(settings.shutdown.total() + PUMP_DRAIN + SHUTDOWN_MARGIN),
        }
    }

    pub fn term_wait(&self) -> Duration {
        self.term_wait
    }

    pub fn is_running(&self) -> bool {
        self.pid().is_some()
    }

    /// PID of the live daemon, if any.
    pub fn pid(&self) -> Option<u32> {
        match probe(&self.pid_file, &self.marker) {
            Liveness::Live(pid) => Some(pid),
            Liveness::Absent | Liveness::Stale(_) => None,
        }
    }

    /// Launches the daemon in the background and waits for its PID file.
    pub async fn start(&self) -> Result<StartOutcome, DaemonError> {
        if let Some(pid) = self.pid() {
            return Ok(StartOutcome::AlreadyRunning(pid));
        }
        let Some((program, args)) = self.launch.split_first() else {
            return Err(DaemonError::Launch(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty launch command",
            )));
        };
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_file)
            .map_err(DaemonError::Launch)?;
        let log_err = log.try_clone().map_err(DaemonError::Launch)?;

        let mut command = std::process::Command::new(program);
        command
            .args(args)
            .current_dir(&self.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err));

        #[cfg(unix)]
        unsafe {
            use std::os::unix::process::CommandExt;
            command.pre_exec(|| {
                let _ = libc::setsid();
                Ok(())
            });
        }

        let mut child = command.spawn().map_err(DaemonError::Launch)?;
        info!(pid = child.id(), "launched daemon");

        let deadline = tokio::time::Instant::now() + self.start_wait;
        while tokio::time::Instant::now() < deadline {
            tokio::time::sleep(POLL_INTERVAL).await;
            if let Some(pid) = self.pid() {
                return Ok(StartOutcome::Started(pid));
            }
            if let Ok(Some(status)) = child.try_wait() {
                return Err(DaemonError::ExitedEarly(
                    status.code(),
                    self.log_file.clone(),
                ));
            }
        }
        Err(DaemonError::StartTimeout(self.start_wait))
    }

    /// Stops the daemon: quit command, then SIGTERM, then SIGKILL.
    ///
    /// Returns the stage that ended it.
    pub async fn stop(&self) -> Result<StopStage, DaemonError> {
        let Some(pid) = self.pid() else {
            return Err(DaemonError::NotRunning);
        };

        if let Some(quit) = &self.quit_command {
            match self.run_quit_command(quit).await {
                Ok(()) => {
                    if wait_for_exit(pid, self.stop_wait).await {
                        self.cleanup(pid);
                        return Ok(StopStage::Quit);
                    }
                }
                Err(err) => warn!(error = %err, "quit command failed"),
            }
        }

        info!(pid, "sending SIGTERM to daemon");
        signal_pid(pid, Signal::Term);
        if wait_for_exit(pid, self.term_wait).await {
            self.cleanup(pid);
            return Ok(StopStage::Terminate);
        }

        // Children live in their own process groups and outlive a killed daemon.
        let children = child_pids(pid);
        warn!(pid, children = children.len(), "daemon still running, sending SIGKILL");
        signal_pid(pid, Signal::Kill);
        let exited = wait_for_exit(pid, self.stop_wait).await;
        for child in &children {
            kill_group(*child);
        }
        if exited {
            self.cleanup(pid);
            return Ok(StopStage::Kill);
        }
        Err(DaemonError::SurvivedKill(pid))
    }

    async fn run_quit_command(&self, quit: &str) -> Result<(), DaemonError> {
        let parts =
            shell_words::split(quit).map_err(|err| DaemonError::QuitCommand(err.to_string()))?;
        let Some((program, args)) = parts.split_first() else {
            return Err(DaemonError::QuitCommand("empty".to_string()));
        };
        let mut command = tokio::process::Command::new(program);
        command
            .args(args)
            .current_dir(&self.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        match tokio::time::timeout(self.stop_wait, command.status()).await {
            Ok(Ok(status)) if status.success() => Ok(()),
            Ok(Ok(status)) => Err(DaemonError::QuitCommand(format!("exited with {}", status))),
            Ok(Err(err)) => Err(DaemonError::QuitCommand(err.to_string())),
            Err(_) => Err(DaemonError::QuitCommand("timed out".to_string())),
        }
    }

    // A killed daemon cannot remove its own record.
    fn cleanup(&self, pid: u32) {
        let still_ours = std::fs::read_to_string(&self.pid_file)
            .ok()
            .and_then(|raw| raw.trim().parse::<u32>().ok())
            == Some(pid);
        if still_ours {
            let _ = std::fs::remove_file(&self.pid_file);
        }
    }
}

async fn wait_for_exit(pid: u32, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if !is_pid_alive(pid) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Direct children of `parent`.
fn child_pids(parent: u32) -> Vec<u32> {
    let parent = Pid::from_u32(parent);
    let mut system = System::new();
    system.refresh_processes_specifics(
        ProcessesToUpdate::All,
        true,
        ProcessRefreshKind::nothing(),
    );
    system
        .processes()
        .iter()
        .filter(|(_, process)| process.parent() == Some(parent))
        .map(|(pid, _)| pid.as_u32())
        .collect()
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Term,
    Kill,
}

#[cfg(unix)]
fn signal_pid(pid: u32, signal: Signal) {
    let sig = match signal {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    unsafe {
        let _ = libc::kill(pid as i32, sig);
    }
}

#[cfg(not(unix))]
fn signal_pid(_pid: u32, _signal: Signal) {}

/// SIGKILLs `pid` and the process group it leads, if any.
#[cfg(unix)]
fn kill_group(pid: u32) {
    debug!(pid, "killing orphaned process group");
    unsafe {
        let _ = libc::kill(-(pid as i32), libc::SIGKILL);
        let _ = libc::kill(pid as i32, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: u32) {}
