//! Process execution and management.
//!
//! A `ManagedProcess` owns exactly one child at a time. Starting it spawns the
//! command in its own process group and launches three tokio tasks: a capture
//! loop for stdout, one for stderr, and a monitor that waits for exit. Stopping
//! walks an escalation ladder (interrupt, terminate, kill), signalling the whole
//! process group and waiting a bounded time at each stage.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::ansi;
use crate::error::ControlError;
use crate::events::ProcessEvent;
use crate::format::Formatter;
use crate::procfile::ProcfileEntry;
use crate::process::{ProcessRecord, ProcessStatus, RunState};

/// Durations for each shutdown stage. A zero duration skips the stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownConfig {
    pub interrupt: Duration,
    pub terminate: Duration,
    pub kill: Duration,
    /// Bounded wait for the workers once the child is gone.
    pub join: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            interrupt: Duration::ZERO,
            terminate: Duration::from_secs(5),
            kill: Duration::from_secs(2),
            join: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownStage {
    Interrupt,
    Terminate,
    Kill,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSignal {
    SigInt,
    SigTerm,
    SigKill,
}

impl ProcessSignal {
    pub fn label(self) -> &'static str {
        match self {
            ProcessSignal::SigInt => "SIGINT",
            ProcessSignal::SigTerm => "SIGTERM",
            ProcessSignal::SigKill => "SIGKILL",
        }
    }
}

impl ShutdownStage {
    pub fn signal(self) -> ProcessSignal {
        match self {
            ShutdownStage::Interrupt => ProcessSignal::SigInt,
            ShutdownStage::Terminate => ProcessSignal::SigTerm,
            ShutdownStage::Kill => ProcessSignal::SigKill,
        }
    }
}

impl ShutdownConfig {
    /// Replaces the terminate-stage wait.
    pub fn with_terminate(mut self, timeout: Duration) -> Self {
        self.terminate = timeout;
        self
    }

    pub fn first_stage(&self) -> ShutdownStage {
        if !self.interrupt.is_zero() {
            ShutdownStage::Interrupt
        } else if !self.terminate.is_zero() {
            ShutdownStage::Terminate
        } else {
            ShutdownStage::Kill
        }
    }

    pub fn next_stage(&self, stage: ShutdownStage) -> Option<ShutdownStage> {
        match stage {
            ShutdownStage::Interrupt if !self.terminate.is_zero() => Some(ShutdownStage::Terminate),
            ShutdownStage::Interrupt | ShutdownStage::Terminate => Some(ShutdownStage::Kill),
            ShutdownStage::Kill => None,
        }
    }

    pub fn wait_for(&self, stage: ShutdownStage) -> Duration {
        match stage {
            ShutdownStage::Interrupt => self.interrupt,
            ShutdownStage::Terminate => self.terminate,
            ShutdownStage::Kill => self.kill,
        }
    }

    /// Longest a full stop can take: every stage plus the worker join.
    pub fn total(&self) -> Duration {
        self.interrupt + self.terminate + self.kill + self.join
    }
}

/// Settings shared by every managed process of a supervisor.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Working directory for children; inherited when `None`.
    pub cwd: Option<PathBuf>,
    pub shutdown: ShutdownConfig,
    /// Pause between stop and start on restart.
    pub restart_delay: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            cwd: None,
            shutdown: ShutdownConfig::default(),
            restart_delay: Duration::from_millis(250),
        }
    }
}

struct Workers {
    pid: u32,
    stop_requested: Arc<AtomicBool>,
    exited: watch::Receiver<bool>,
    monitor: JoinHandle<()>,
}

/// Handle for one supervised child process.
pub struct ManagedProcess {
    name: String,
    command: String,
    config: RunnerConfig,
    formatter: Arc<RwLock<Formatter>>,
    events: mpsc::Sender<ProcessEvent>,
    record: Arc<Mutex<ProcessRecord>>,
    control: tokio::sync::Mutex<Option<Workers>>,
}

impl ManagedProcess {
    pub fn new(
        entry: ProcfileEntry,
        config: RunnerConfig,
        formatter: Arc<RwLock<Formatter>>,
        events: mpsc::Sender<ProcessEvent>,
    ) -> Self {
        Self {
            name: entry.name,
            command: entry.command,
            config,
            formatter,
            events,
            record: Arc::new(Mutex::new(ProcessRecord::default())),
            control: tokio::sync::Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    fn record(&self) -> MutexGuard<'_, ProcessRecord> {
        lock_record(&self.record)
    }

    pub fn state(&self) -> RunState {
        self.record().state
    }

    pub fn pid(&self) -> Option<u32> {
        self.record().pid
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.record().exit_code
    }

    pub fn is_alive(&self) -> bool {
        self.state().is_active()
    }

    pub fn status(&self) -> ProcessStatus {
        ProcessStatus::from_record(&self.name, &self.command, &self.record())
    }

    pub fn set_flagged(&self, flagged: bool) {
        self.record().flagged = flagged;
    }

    /// Spawns the command and its workers, returning the child's pid.
    ///
    /// Fails with `AlreadyRunning` if a child is alive; the existing child is
    /// left untouched.
    pub async fn start(&self) -> Result<u32, ControlError> {
        let mut control = self.control.lock().await;
        if self.is_alive() {
            return Err(ControlError::AlreadyRunning(self.name.clone()));
        }
        if let Some(previous) = control.take() {
            // The previous child already exited; its monitor is finishing up.
            let _ = tokio::time::timeout(self.config.shutdown.join, previous.monitor).await;
        }

        {
            let mut record = self.record();
            record.state = RunState::Starting;
            record.exit_code = None;
            record.stopped_at = None;
            record.flagged = false;
        }

        let mut child = match self.spawn_child() {
            Ok(child) => child,
            Err(source) => {
                {
                    let mut record = self.record();
                    record.state = RunState::Dead;
                    record.pid = None;
                    record.stopped_at = Some(Utc::now());
                }
                warn!(process = %self.name, error = %source, "failed to spawn");
                let _ = self
                    .events
                    .send(ProcessEvent::SpawnFailed {
                        name: self.name.clone(),
                        error: source.to_string(),
                    })
                    .await;
                return Err(ControlError::Spawn {
                    name: self.name.clone(),
                    source,
                });
            }
        };

        let pid = child.id().unwrap_or(0);
        {
            let mut record = self.record();
            record.state = RunState::Running;
            record.pid = Some(pid);
            record.started_at = Some(Utc::now());
            record.started = Some(Instant::now());
        }
        info!(process = %self.name, pid, command = %self.command, "started");
        let _ = self
            .events
            .send(ProcessEvent::Started {
                name: self.name.clone(),
                pid,
            })
            .await;

        let mut captures = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            captures.push(tokio::spawn(capture_lines(
                self.name.clone(),
                stdout,
                self.formatter.clone(),
                self.events.clone(),
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            captures.push(tokio::spawn(capture_lines(
                self.name.clone(),
                stderr,
                self.formatter.clone(),
                self.events.clone(),
            )));
        }

        let stop_requested = Arc::new(AtomicBool::new(false));
        let (exit_tx, exit_rx) = watch::channel(false);
        let monitor = tokio::spawn(monitor_exit(MonitorContext {
            name: self.name.clone(),
            child,
            captures,
            record: self.record.clone(),
            stop_requested: stop_requested.clone(),
            events: self.events.clone(),
            exit_tx,
            join_timeout: self.config.shutdown.join,
        }));

        *control = Some(Workers {
            pid,
            stop_requested,
            exited: exit_rx,
            monitor,
        });
        Ok(pid)
    }

    fn spawn_child(&self) -> std::io::Result<Child> {
        let mut command = Command::new("sh");
        command.arg("-c").arg(&self.command);
        if let Some(cwd) = &self.config.cwd {
            command.current_dir(cwd);
        }
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        command.kill_on_drop(true);

        #[cfg(unix)]
        unsafe {
            command.pre_exec(|| {
                let _ = libc::setpgid(0, 0);
                Ok(())
            });
        }

        command.spawn()
    }

    /// Stops the child, escalating signals until it exits.
    ///
    /// `timeout` overrides the configured terminate-stage wait. Returns the
    /// exit code, or `NotRunning` if there was no live child.
    pub async fn stop(&self, timeout: Option<Duration>) -> Result<Option<i32>, ControlError> {
        let mut control = self.control.lock().await;
        let Some(mut workers) = control.take() else {
            return Err(ControlError::NotRunning(self.name.clone()));
        };
        if !self.is_alive() {
            let _ = tokio::time::timeout(self.config.shutdown.join, &mut workers.monitor).await;
            return Err(ControlError::NotRunning(self.name.clone()));
        }

        let shutdown = match timeout {
            Some(timeout) => self.config.shutdown.with_terminate(timeout),
            None => self.config.shutdown,
        };
        workers.stop_requested.store(true, Ordering::SeqCst);

        let mut stage = Some(shutdown.first_stage());
        let mut exited = false;
        while let Some(current) = stage {
            let signal = current.signal();
            debug!(process = %self.name, pid = workers.pid, signal = signal.label(), "signalling");
            send_os_signal(workers.pid, signal);
            if wait_for_exit(&mut workers.exited, shutdown.wait_for(current)).await {
                exited = true;
                break;
            }
            stage = shutdown.next_stage(current);
            if let Some(next) = stage {
                info!(process = %self.name, "still running, escalating to {}", next.signal().label());
            }
        }

        if !exited {
            warn!(process = %self.name, pid = workers.pid, "survived SIGKILL");
            let pid = workers.pid;
            *control = Some(workers);
            return Err(ControlError::SurvivedKill {
                name: self.name.clone(),
                pid,
            });
        }

        if tokio::time::timeout(shutdown.join, &mut workers.monitor)
            .await
            .is_err()
        {
            warn!(process = %self.name, "monitor did not finish in time");
            workers.monitor.abort();
        }
        info!(process = %self.name, "stopped");
        Ok(self.exit_code())
    }

    /// Stops (if running), pauses briefly, and starts again.
    pub async fn restart(&self) -> Result<u32, ControlError> {
        match self.stop(None).await {
            Ok(_) | Err(ControlError::NotRunning(_)) => {}
            Err(err) => return Err(err),
        }
        tokio::time::sleep(self.config.restart_delay).await;
        self.start().await
    }
}

fn lock_record(record: &Mutex<ProcessRecord>) -> MutexGuard<'_, ProcessRecord> {
    record.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct MonitorContext {
    name: String,
    child: Child,
    captures: Vec<JoinHandle<()>>,
    record: Arc<Mutex<ProcessRecord>>,
    stop_requested: Arc<AtomicBool>,
    events: mpsc::Sender<ProcessEvent>,
    exit_tx: watch::Sender<bool>,
    join_timeout: Duration,
}

// Wait for the child, drain its output, then record how it ended.
async fn monitor_exit(ctx: MonitorContext) {
    let MonitorContext {
        name,
        mut child,
        captures,
        record,
        stop_requested,
        events,
        exit_tx,
        join_timeout,
    } = ctx;

    let code = match child.wait().await {
        Ok(status) => exit_code(status),
        Err(err) => {
            warn!(process = %name, error = %err, "failed to wait for child");
            None
        }
    };

    // Grandchildren may keep the pipes open; don't wait on them forever.
    for mut capture in captures {
        if tokio::time::timeout(join_timeout, &mut capture).await.is_err() {
            capture.abort();
        }
    }

    let requested = stop_requested.load(Ordering::SeqCst);
    {
        let mut record = lock_record(&record);
        record.exit_code = code;
        record.pid = None;
        record.started = None;
        record.stopped_at = Some(Utc::now());
        record.state = if requested {
            RunState::Stopped
        } else {
            RunState::Dead
        };
    }
    let _ = exit_tx.send(true);

    if !requested {
        info!(process = %name, code = ?code, "exited");
        let _ = events.send(ProcessEvent::Died { name, code }).await;
    }
}

async fn capture_lines<R>(
    name: String,
    reader: R,
    formatter: Arc<RwLock<Formatter>>,
    events: mpsc::Sender<ProcessEvent>,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let text = decode_line(&buf);
                let rendered = {
                    let formatter = formatter.read().unwrap_or_else(|p| p.into_inner());
                    ansi::to_markup(&formatter.format_line(&name, &text))
                };
                let event = ProcessEvent::Output {
                    name: name.clone(),
                    text,
                    rendered,
                };
                if events.send(event).await.is_err() {
                    break;
                }
            }
            Err(err) => {
                debug!(process = %name, error = %err, "capture ended");
                break;
            }
        }
    }
}

fn decode_line(bytes: &[u8]) -> String {
    let mut end = bytes.len();
    while end > 0 && matches!(bytes[end - 1], b'\n' | b'\r') {
        end -= 1;
    }
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

async fn wait_for_exit(exited: &mut watch::Receiver<bool>, timeout: Duration) -> bool {
    if *exited.borrow() {
        return true;
    }
    if timeout.is_zero() {
        return false;
    }
    match tokio::time::timeout(timeout, exited.wait_for(|done| *done)).await {
        Ok(Ok(_)) => true,
        // Sender dropped: the monitor is gone, and so is the child.
        Ok(Err(_)) => true,
        Err(_) => false,
    }
}

#[cfg(unix)]
fn exit_code(status: std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
}

#[cfg(not(unix))]
fn exit_code(status: std::process::ExitStatus) -> Option<i32> {
    status.code()
}

#[cfg(unix)]
pub(crate) fn send_os_signal(pid: u32, signal: ProcessSignal) {
    if pid == 0 {
        return;
    }
    unsafe {
        let sig = match signal {
            ProcessSignal::SigInt => libc::SIGINT,
            ProcessSignal::SigTerm => libc::SIGTERM,
            ProcessSignal::SigKill => libc::SIGKILL,
        };
        let pid = pid as i32;
        let _ = libc::kill(-pid, sig);
        let _ = libc::kill(pid, sig);
    }
}

#[cfg(not(unix))]
pub(crate) fn send_os_signal(_pid: u32, _signal: ProcessSignal) {}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_shutdown() -> ShutdownConfig {
        ShutdownConfig {
            interrupt: Duration::ZERO,
            terminate: Duration::from_millis(300),
            kill: Duration::from_secs(2),
            join: Duration::from_secs(1),
        }
    }

    fn managed(command: &str, capacity: usize) -> (ManagedProcess, mpsc::Receiver<ProcessEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        let formatter = Arc::new(RwLock::new(Formatter::new(["proc"])));
        let config = RunnerConfig {
            cwd: None,
            shutdown: fast_shutdown(),
            restart_delay: Duration::from_millis(10),
        };
        let entry = ProcfileEntry {
            name: "proc".into(),
            command: command.into(),
        };
        (ManagedProcess::new(entry, config, formatter, tx), rx)
    }

    async fn wait_for_state(process: &ManagedProcess, state: RunState) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while process.state() != state {
            assert!(Instant::now() < deadline, "timed out waiting for {:?}", state);
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[test]
    fn escalation_ladder() {
        let config = ShutdownConfig {
            interrupt: Duration::from_millis(10),
            terminate: Duration::from_millis(20),
            kill: Duration::from_millis(30),
            join: Duration::ZERO,
        };
        assert_eq!(config.first_stage(), ShutdownStage::Interrupt);
        assert_eq!(config.next_stage(ShutdownStage::Interrupt), Some(ShutdownStage::Terminate));
        assert_eq!(config.next_stage(ShutdownStage::Terminate), Some(ShutdownStage::Kill));
        assert_eq!(config.next_stage(ShutdownStage::Kill), None);
        assert_eq!(config.wait_for(ShutdownStage::Kill), Duration::from_millis(30));
        assert_eq!(config.total(), Duration::from_millis(60));
    }

    #[test]
    fn escalation_skips_disabled_stages() {
        let config = ShutdownConfig {
            interrupt: Duration::from_millis(10),
            terminate: Duration::ZERO,
            ..ShutdownConfig::default()
        };
        assert_eq!(config.next_stage(ShutdownStage::Interrupt), Some(ShutdownStage::Kill));

        let config = ShutdownConfig::default().with_terminate(Duration::ZERO);
        assert_eq!(config.first_stage(), ShutdownStage::Kill);
    }

    #[test]
    fn decode_line_is_lossy_and_trims_line_endings() {
        assert_eq!(decode_line(b"ok\r\n"), "ok");
        assert_eq!(decode_line(b"a\xffb\n"), "a\u{fffd}b");
    }

    #[tokio::test]
    async fn captures_both_streams_and_reports_death() {
        let (process, mut rx) = managed("echo out; echo err 1>&2; exit 3", 16);
        process.start().await.unwrap();

        let mut lines = Vec::new();
        let mut died = None;
        while died.is_none() {
            match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
                Ok(Some(ProcessEvent::Output { text, rendered, .. })) => {
                    assert!(rendered.contains("proc"));
                    lines.push(text);
                }
                Ok(Some(ProcessEvent::Died { code, .. })) => died = Some(code),
                Ok(Some(ProcessEvent::Started { .. })) => {}
                other => panic!("unexpected event: {:?}", other),
            }
        }
        lines.sort();
        assert_eq!(lines, vec!["err", "out"]);
        assert_eq!(died, Some(Some(3)));
        assert_eq!(process.state(), RunState::Dead);
        assert_eq!(process.exit_code(), Some(3));
    }

    #[tokio::test]
    async fn start_while_running_is_rejected() {
        let (process, _rx) = managed("sleep 30", 16);
        let pid = process.start().await.unwrap();
        let err = process.start().await.unwrap_err();
        assert!(matches!(err, ControlError::AlreadyRunning(_)));
        assert_eq!(process.pid(), Some(pid));
        assert!(process.is_alive());
        process.stop(None).await.unwrap();
    }

    #[tokio::test]
    async fn stop_is_not_reported_as_death() {
        let (process, mut rx) = managed("sleep 30", 16);
        let pid = process.start().await.unwrap();
        assert!(matches!(
            rx.recv().await,
            Some(ProcessEvent::Started { pid: started, .. }) if started == pid
        ));
        process.stop(None).await.unwrap();
        assert_eq!(process.state(), RunState::Stopped);
        assert!(!process.is_alive());
        assert!(process.status().stopped_at.is_some());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn stop_escalates_to_kill() {
        let (process, _rx) = managed("trap '' TERM INT; sleep 30", 16);
        process.start().await.unwrap();
        // Give the shell a moment to install the trap.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let code = process.stop(Some(Duration::from_millis(200))).await.unwrap();
        assert!(!process.is_alive());
        assert_eq!(code, Some(128 + 9));
    }

    #[tokio::test]
    async fn stop_without_child_is_not_running() {
        let (process, _rx) = managed("true", 16);
        assert!(matches!(
            process.stop(None).await,
            Err(ControlError::NotRunning(_))
        ));
        process.start().await.unwrap();
        wait_for_state(&process, RunState::Dead).await;
        assert!(matches!(
            process.stop(None).await,
            Err(ControlError::NotRunning(_))
        ));
    }

    #[tokio::test]
    async fn restart_spawns_a_new_child() {
        let (process, _rx) = managed("sleep 30", 16);
        let first = process.start().await.unwrap();
        let second = process.restart().await.unwrap();
        assert_ne!(first, second);
        assert_eq!(process.state(), RunState::Running);
        process.stop(None).await.unwrap();
    }

    #[tokio::test]
    async fn spawn_failure_marks_dead() {
        let (tx, mut rx) = mpsc::channel(4);
        let formatter = Arc::new(RwLock::new(Formatter::new(["proc"])));
        let config = RunnerConfig {
            cwd: Some(PathBuf::from("/definitely/not/a/dir")),
            ..RunnerConfig::default()
        };
        let entry = ProcfileEntry {
            name: "proc".into(),
            command: "true".into(),
        };
        let process = ManagedProcess::new(entry, config, formatter, tx);
        let err = process.start().await.unwrap_err();
        assert!(matches!(err, ControlError::Spawn { .. }));
        assert_eq!(process.state(), RunState::Dead);
        assert!(matches!(rx.recv().await, Some(ProcessEvent::SpawnFailed { .. })));
    }
}
