//! The supervisor: a named set of managed processes plus their output pipeline.
//!
//! Every managed process sends its events into one bounded channel. A single
//! blocking worker (the pump) drains it, turns deaths and spawn failures into
//! in-band lines, runs the watchdog, and commits lines to the output store in
//! batches. The pump owns the store's only writer connection; reads go through
//! a separate connection.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::ansi;
use crate::error::ControlError;
use crate::events::ProcessEvent;
use crate::format::Formatter;
use crate::procfile::{is_valid_name, ProcfileEntry};
use crate::process::ProcessStatus;
use crate::runner::{ManagedProcess, RunnerConfig};
use crate::store::{self, OutputLine, OutputStore, ProcessStats, DEFAULT_BOOTSTRAP_LIMIT};
use crate::watchdog::{WatchAction, Watchdog};

/// Run every this many committed lines when retention is enabled.
const RETENTION_EVERY: usize = 10_000;

/// Bounded wait for the pump to commit queued lines on shutdown.
pub const PUMP_DRAIN: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub runner: RunnerConfig,
    pub channel_capacity: usize,
    pub batch_size: usize,
    pub bootstrap_limit: usize,
    pub retention_per_process: Option<usize>,
    pub watch_patterns: Vec<String>,
    pub watch_action: WatchAction,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            runner: RunnerConfig::default(),
            channel_capacity: 1024,
            batch_size: 256,
            bootstrap_limit: DEFAULT_BOOTSTRAP_LIMIT,
            retention_per_process: None,
            watch_patterns: Vec::new(),
            watch_action: WatchAction::Flag,
        }
    }
}

type ProcessTable = Arc<RwLock<Vec<Arc<ManagedProcess>>>>;

/// Owns the managed processes of one Procfile.
pub struct Supervisor {
    processes: ProcessTable,
    formatter: Arc<RwLock<Formatter>>,
    events: mpsc::Sender<ProcessEvent>,
    reader: OutputStore,
    config: SupervisorConfig,
    pump: JoinHandle<()>,
}

impl Supervisor {
    /// Builds the supervisor around `store`, which becomes the writer connection.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        entries: Vec<ProcfileEntry>,
        store: OutputStore,
        config: SupervisorConfig,
    ) -> Result<Self, SupervisorError> {
        let watchdog = Watchdog::new(&config.watch_patterns, config.watch_action)?;
        let reader = store.reopen()?;
        let formatter = Arc::new(RwLock::new(Formatter::new(
            entries.iter().map(|e| e.name.clone()),
        )));
        let (events, rx) = mpsc::channel(config.channel_capacity.max(1));

        let processes: Vec<Arc<ManagedProcess>> = entries
            .into_iter()
            .map(|entry| {
                Arc::new(ManagedProcess::new(
                    entry,
                    config.runner.clone(),
                    formatter.clone(),
                    events.clone(),
                ))
            })
            .collect();
        let processes = Arc::new(RwLock::new(processes));

        let pump = Pump {
            rx,
            store,
            processes: processes.clone(),
            formatter: formatter.clone(),
            watchdog,
            batch_size: config.batch_size.max(1),
            retention: config.retention_per_process,
            runtime: Handle::current(),
        };
        let pump = tokio::task::spawn_blocking(move || pump.run());

        Ok(Self {
            processes,
            formatter,
            events,
            reader,
            config,
            pump,
        })
    }

    fn snapshot(&self) -> Vec<Arc<ManagedProcess>> {
        self.processes
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    fn find(&self, name: &str) -> Result<Arc<ManagedProcess>, ControlError> {
        find_process(&self.processes, name).ok_or_else(|| ControlError::NotFound(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        self.snapshot().iter().map(|p| p.name().to_string()).collect()
    }

    /// Starts every process in parallel.
    ///
    /// Individual failures do not stop the others; the error names every
    /// process that did not start.
    pub async fn start_all(&self) -> Result<(), ControlError> {
        let tasks: Vec<_> = self
            .snapshot()
            .into_iter()
            .map(|process| {
                tokio::spawn(async move {
                    let result = process.start().await;
                    (process.name().to_string(), result)
                })
            })
            .collect();

        let mut failed = Vec::new();
        for task in tasks {
            match task.await {
                Ok((_, Ok(_))) | Ok((_, Err(ControlError::AlreadyRunning(_)))) => {}
                Ok((name, Err(err))) => {
                    warn!(process = %name, error = %err, "start failed");
                    failed.push(name);
                }
                Err(err) => error!(error = %err, "start task panicked"),
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            Err(ControlError::Partial {
                action: "start",
                failed,
            })
        }
    }

    /// Stops every running process in parallel.
    pub async fn stop_all(&self, timeout: Option<Duration>) -> Result<(), ControlError> {
        let tasks: Vec<_> = self
            .snapshot()
            .into_iter()
            .map(|process| {
                tokio::spawn(async move {
                    let result = process.stop(timeout).await;
                    (process.name().to_string(), result)
                })
            })
            .collect();

        let mut failed = Vec::new();
        for task in tasks {
            match task.await {
                Ok((_, Ok(_))) | Ok((_, Err(ControlError::NotRunning(_)))) => {}
                Ok((name, Err(err))) => {
                    warn!(process = %name, error = %err, "stop failed");
                    failed.push(name);
                }
                Err(err) => error!(error = %err, "stop task panicked"),
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            Err(ControlError::Partial {
                action: "stop",
                failed,
            })
        }
    }

    pub async fn start_process(&self, name: &str) -> Result<u32, ControlError> {
        self.find(name)?.start().await
    }

    pub async fn stop_process(
        &self,
        name: &str,
        timeout: Option<Duration>,
    ) -> Result<Option<i32>, ControlError> {
        self.find(name)?.stop(timeout).await
    }

    pub async fn restart_process(&self, name: &str) -> Result<u32, ControlError> {
        self.find(name)?.restart().await
    }

    /// Registers a new process at runtime. It is not started.
    pub fn add_process(&self, entry: ProcfileEntry) -> Result<(), ControlError> {
        if !is_valid_name(&entry.name) || entry.command.trim().is_empty() {
            return Err(ControlError::Invalid(entry.name));
        }
        let mut processes = self.processes.write().unwrap_or_else(|p| p.into_inner());
        if processes.iter().any(|p| p.name() == entry.name) {
            return Err(ControlError::Duplicate(entry.name));
        }
        self.formatter
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .add_process(entry.name.clone());
        info!(process = %entry.name, "added");
        processes.push(Arc::new(ManagedProcess::new(
            entry,
            self.config.runner.clone(),
            self.formatter.clone(),
            self.events.clone(),
        )));
        Ok(())
    }

    pub fn status(&self, name: &str) -> Result<ProcessStatus, ControlError> {
        Ok(self.find(name)?.status())
    }

    /// Snapshots every process, in Procfile order.
    pub fn get_all_status(&self) -> Vec<ProcessStatus> {
        self.snapshot().iter().map(|p| p.status()).collect()
    }

    pub fn read_since(&self, since_id: i64, limit: Option<usize>) -> store::Result<Vec<OutputLine>> {
        self.reader.read_since(since_id, limit)
    }

    pub fn read_bootstrap(&self, limit_per_process: Option<usize>) -> store::Result<Vec<OutputLine>> {
        self.reader
            .read_bootstrap(limit_per_process.unwrap_or(self.config.bootstrap_limit))
    }

    /// Bootstrap read for `since_id == 0`, incremental otherwise.
    pub fn read(&self, since_id: i64, limit: Option<usize>) -> store::Result<Vec<OutputLine>> {
        self.reader.read(since_id, limit, self.config.bootstrap_limit)
    }

    pub fn process_stats(&self) -> store::Result<Vec<ProcessStats>> {
        self.reader.process_stats()
    }

    /// Stops everything, then waits for the pump to commit what is queued.
    pub async fn shutdown(self, timeout: Option<Duration>) -> Result<(), ControlError> {
        let result = self.stop_all(timeout).await;
        let Supervisor {
            processes,
            events,
            pump,
            ..
        } = self;
        processes.write().unwrap_or_else(|p| p.into_inner()).clear();
        drop(events);
        if tokio::time::timeout(PUMP_DRAIN, pump).await.is_err() {
            warn!("output pump did not drain in time");
        }
        result
    }
}

fn find_process(table: &ProcessTable, name: &str) -> Option<Arc<ManagedProcess>> {
    table
        .read()
        .unwrap_or_else(|p| p.into_inner())
        .iter()
        .find(|p| p.name() == name)
        .cloned()
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Store(#[from] store::StoreError),

    #[error("invalid watchdog pattern: {0}")]
    Pattern(#[from] regex::Error),
}

struct Pump {
    rx: mpsc::Receiver<ProcessEvent>,
    store: OutputStore,
    processes: ProcessTable,
    formatter: Arc<RwLock<Formatter>>,
    watchdog: Option<Watchdog>,
    batch_size: usize,
    retention: Option<usize>,
    runtime: Handle,
}

impl Pump {
    fn run(mut self) {
        let mut batch = Vec::with_capacity(self.batch_size);
        let mut since_retention = 0usize;
        while let Some(event) = self.rx.blocking_recv() {
            self.handle(event, &mut batch);
            while batch.len() < self.batch_size {
                match self.rx.try_recv() {
                    Ok(event) => self.handle(event, &mut batch),
                    Err(_) => break,
                }
            }
            since_retention += batch.len();
            self.flush(&mut batch);

            if let Some(keep) = self.retention {
                if since_retention >= RETENTION_EVERY {
                    since_retention = 0;
                    match self.store.retain_latest(keep) {
                        Ok(deleted) => debug!(deleted, "applied output retention"),
                        Err(err) => error!(error = %err, "output retention failed"),
                    }
                }
            }
        }
        self.flush(&mut batch);
        debug!("output pump finished");
    }

    fn flush(&self, batch: &mut Vec<(String, String)>) {
        if batch.is_empty() {
            return;
        }
        if let Err(err) = self.store.append_batch(batch) {
            error!(lines = batch.len(), error = %err, "dropping output batch");
        }
        batch.clear();
    }

    fn system_line(&self, name: &str, text: &str) -> (String, String) {
        let formatter = self.formatter.read().unwrap_or_else(|p| p.into_inner());
        (
            name.to_string(),
            ansi::to_markup(&formatter.format_system_line(name, text)),
        )
    }

    fn handle(&mut self, event: ProcessEvent, batch: &mut Vec<(String, String)>) {
        match event {
            ProcessEvent::Started { name, .. } => {
                if let Some(watchdog) = self.watchdog.as_mut() {
                    watchdog.reset(&name);
                }
            }
            ProcessEvent::Output {
                name,
                text,
                rendered,
            } => {
                let hit = self
                    .watchdog
                    .as_mut()
                    .and_then(|watchdog| watchdog.inspect(&name, &text));
                batch.push((name, rendered));
                if let Some(hit) = hit {
                    self.on_watch_hit(&hit.process, &hit.pattern, hit.action, batch);
                }
            }
            ProcessEvent::Died { name, code } => {
                if code == Some(0) {
                    debug!(process = %name, "exited cleanly");
                    return;
                }
                let text = match code {
                    Some(code) => format!("process died (exit code {})", code),
                    None => "process died".to_string(),
                };
                batch.push(self.system_line(&name, &text));
            }
            ProcessEvent::SpawnFailed { name, error } => {
                batch.push(self.system_line(&name, &format!("failed to start: {}", error)));
            }
        }
    }

    fn on_watch_hit(
        &self,
        name: &str,
        pattern: &str,
        action: WatchAction,
        batch: &mut Vec<(String, String)>,
    ) {
        warn!(process = %name, pattern, "output matched warning pattern");
        let Some(process) = find_process(&self.processes, name) else {
            return;
        };
        process.set_flagged(true);
        let text = match action {
            WatchAction::Flag => format!("warning: output matched '{}'", pattern),
            WatchAction::Kill => format!("warning: output matched '{}', stopping", pattern),
        };
        batch.push(self.system_line(name, &text));
        if action == WatchAction::Kill {
            self.runtime.spawn(async move {
                if let Err(err) = process.stop(None).await {
                    warn!(process = %process.name(), error = %err, "watchdog stop failed");
                }
            });
        }
    }
}
