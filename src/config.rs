//! Configuration management for procrack.
//!
//! This module defines the structure of the optional `procrack.toml` file,
//! loads it, and resolves it (plus command-line overrides) into the concrete
//! `Settings` every other component is built from.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::runner::{RunnerConfig, ShutdownConfig};
use crate::store::DEFAULT_BOOTSTRAP_LIMIT;
use crate::watchdog::WatchAction;

pub const CONFIG_FILE: &str = "procrack.toml";

/// Top-level configuration structure corresponding to `procrack.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Path to the Procfile (default: `Procfile`).
    pub procfile: Option<PathBuf>,
    /// PID file name inside the working directory.
    pub pid_file: Option<PathBuf>,
    /// Output store file name inside the working directory.
    pub store_file: Option<PathBuf>,
    /// Where a daemonized supervisor writes its own logs.
    pub log_file: Option<PathBuf>,
    /// Lines per process returned by a bootstrap read.
    pub bootstrap_limit: Option<usize>,
    /// Capacity of the capture-to-store channel.
    pub channel_capacity: Option<usize>,
    /// Maximum lines committed per store transaction.
    pub batch_size: Option<usize>,
    /// Keep only this many lines per process in the store.
    pub retention_per_process: Option<usize>,
    /// Time to wait after SIGINT before escalating (ms, 0 = skip).
    pub shutdown_interrupt_ms: Option<u64>,
    /// Time to wait after SIGTERM before killing (ms).
    pub shutdown_terminate_ms: Option<u64>,
    /// Time to wait after SIGKILL (ms).
    pub shutdown_kill_ms: Option<u64>,
    /// Bounded wait for capture workers after exit (ms).
    pub worker_join_ms: Option<u64>,
    /// Pause between stop and start on restart (ms).
    pub restart_delay_ms: Option<u64>,
    /// How long `start` waits for the daemon to write its PID file (ms).
    pub daemon_start_ms: Option<u64>,
    /// How long `stop` waits at each escalation stage (ms).
    pub daemon_stop_ms: Option<u64>,
    /// Command asking a running daemon to quit cooperatively.
    pub quit_command: Option<String>,
    /// Supervise this single external tool instead of a Procfile.
    pub wrap: Option<String>,
    pub watchdog: Option<WatchdogConfig>,
}

/// Output patterns that flag (or kill) a process.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WatchdogConfig {
    #[serde(default)]
    pub patterns: Vec<String>,
    #[serde(default)]
    pub action: WatchAction,
}

/// Loads and parses the configuration from a file path.
pub fn load_config(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: Config = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    Ok(config)
}

/// Loads `path`, or `procrack.toml` in `workdir` if present, or defaults.
pub fn load_for(workdir: &Path, path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => load_config(path),
        None => {
            let default = workdir.join(CONFIG_FILE);
            if default.exists() {
                load_config(&default)
            } else {
                Ok(Config::default())
            }
        }
    }
}

/// Fully resolved settings, paths made absolute against the working directory.
#[derive(Debug, Clone)]
pub struct Settings {
    pub workdir: PathBuf,
    pub procfile: PathBuf,
    pub pid_file: PathBuf,
    pub store_file: PathBuf,
    pub log_file: PathBuf,
    pub bootstrap_limit: usize,
    pub channel_capacity: usize,
    pub batch_size: usize,
    pub retention_per_process: Option<usize>,
    pub shutdown: ShutdownConfig,
    pub restart_delay: Duration,
    pub daemon_start: Duration,
    pub daemon_stop: Duration,
    pub quit_command: Option<String>,
    pub wrap: Option<String>,
    pub watch_patterns: Vec<String>,
    pub watch_action: WatchAction,
}

impl Settings {
    pub fn resolve(workdir: &Path, config: Config) -> Self {
        let at = |path: Option<PathBuf>, default: &str| -> PathBuf {
            let path = path.unwrap_or_else(|| PathBuf::from(default));
            if path.is_absolute() {
                path
            } else {
                workdir.join(path)
            }
        };
        let ms = |value: Option<u64>, default: u64| Duration::from_millis(value.unwrap_or(default));
        let watchdog = config.watchdog.unwrap_or_default();

        Self {
            workdir: workdir.to_path_buf(),
            procfile: at(config.procfile, "Procfile"),
            pid_file: at(config.pid_file, ".procrack.pid"),
            store_file: at(config.store_file, ".procrack.db"),
            log_file: at(config.log_file, ".procrack.log"),
            bootstrap_limit: config.bootstrap_limit.unwrap_or(DEFAULT_BOOTSTRAP_LIMIT),
            channel_capacity: config.channel_capacity.unwrap_or(1024).max(1),
            batch_size: config.batch_size.unwrap_or(256).max(1),
            retention_per_process: config.retention_per_process,
            shutdown: ShutdownConfig {
                interrupt: ms(config.shutdown_interrupt_ms, 0),
                terminate: ms(config.shutdown_terminate_ms, 5000),
                kill: ms(config.shutdown_kill_ms, 2000),
                join: ms(config.worker_join_ms, 1000),
            },
            restart_delay: ms(config.restart_delay_ms, 250),
            daemon_start: ms(config.daemon_start_ms, 3000),
            daemon_stop: ms(config.daemon_stop_ms, 5000),
            quit_command: config.quit_command,
            wrap: config.wrap,
            watch_patterns: watchdog.patterns,
            watch_action: watchdog.action,
        }
    }

    pub fn runner(&self) -> RunnerConfig {
        RunnerConfig {
            cwd: Some(self.workdir.clone()),
            shutdown: self.shutdown,
            restart_delay: self.restart_delay,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_optional_fields() {
        let raw = r#"
procfile = "Procfile.dev"
pid_file = "/tmp/custom.pid"
bootstrap_limit = 200
channel_capacity = 64
batch_size = 32
retention_per_process = 10000
shutdown_interrupt_ms = 500
shutdown_terminate_ms = 3000
shutdown_kill_ms = 1000
restart_delay_ms = 100
quit_command = "procrack-ctl quit"

[watchdog]
patterns = ["panicked at", "FATAL"]
action = "kill"
"#;
        let config: Config = toml::from_str(raw).unwrap();
        let settings = Settings::resolve(Path::new("/work"), config);
        assert_eq!(settings.procfile, PathBuf::from("/work/Procfile.dev"));
        assert_eq!(settings.pid_file, PathBuf::from("/tmp/custom.pid"));
        assert_eq!(settings.store_file, PathBuf::from("/work/.procrack.db"));
        assert_eq!(settings.bootstrap_limit, 200);
        assert_eq!(settings.channel_capacity, 64);
        assert_eq!(settings.batch_size, 32);
        assert_eq!(settings.retention_per_process, Some(10000));
        assert_eq!(settings.shutdown.interrupt, Duration::from_millis(500));
        assert_eq!(settings.shutdown.terminate, Duration::from_secs(3));
        assert_eq!(settings.restart_delay, Duration::from_millis(100));
        assert_eq!(settings.quit_command.as_deref(), Some("procrack-ctl quit"));
        assert_eq!(settings.watch_patterns.len(), 2);
        assert_eq!(settings.watch_action, WatchAction::Kill);
    }

    #[test]
    fn defaults_without_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_for(dir.path(), None).unwrap();
        let settings = Settings::resolve(dir.path(), config);
        assert_eq!(settings.procfile, dir.path().join("Procfile"));
        assert_eq!(settings.bootstrap_limit, DEFAULT_BOOTSTRAP_LIMIT);
        assert_eq!(settings.shutdown, ShutdownConfig::default());
        assert_eq!(settings.watch_action, WatchAction::Flag);
        assert!(settings.wrap.is_none());
    }

    #[test]
    fn rejects_unknown_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, "procfiel = \"typo\"\n").unwrap();
        let err = load_for(dir.path(), None).unwrap_err();
        assert!(err.to_string().contains("failed to parse config file"));
    }
}
