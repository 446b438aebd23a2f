//! The running daemon: what it supervises and how it shuts down.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tracing::{info, warn};

use crate::config::Settings;
use crate::daemon::PidFile;
use crate::procfile::{is_valid_name, Procfile, ProcfileEntry};
use crate::runner::ProcessSignal;
use crate::store::OutputStore;
use crate::supervisor::{Supervisor, SupervisorConfig};

/// What the daemon supervises.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonMode {
    /// Every entry of a Procfile.
    Native { procfile: PathBuf },
    /// A single external tool, run through the same process machinery.
    Wrapped { name: String, command: String },
}

impl DaemonMode {
    pub fn from_settings(settings: &Settings) -> Self {
        match &settings.wrap {
            Some(command) => DaemonMode::Wrapped {
                name: wrapped_name(command),
                command: command.clone(),
            },
            None => DaemonMode::Native {
                procfile: settings.procfile.clone(),
            },
        }
    }

    /// Entries to supervise. Procfile syntax errors are logged and skipped.
    pub fn entries(&self) -> Result<Vec<ProcfileEntry>> {
        match self {
            DaemonMode::Native { procfile } => {
                let parsed = Procfile::load(procfile)?;
                for err in &parsed.errors {
                    warn!(procfile = %procfile.display(), "{}", err);
                }
                if parsed.is_empty() {
                    bail!("no processes defined in {}", procfile.display());
                }
                Ok(parsed.entries)
            }
            DaemonMode::Wrapped { name, command } => Ok(vec![ProcfileEntry {
                name: name.clone(),
                command: command.clone(),
            }]),
        }
    }
}

/// Display name for a wrapped tool: the file name of its program.
fn wrapped_name(command: &str) -> String {
    let program = shell_words::split(command)
        .ok()
        .and_then(|words| words.into_iter().next())
        .unwrap_or_default();
    let name = Path::new(&program)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    if is_valid_name(&name) {
        name
    } else {
        "wrapped".to_string()
    }
}

/// Everything `run` owns, built once and passed down explicitly.
pub struct DaemonContext {
    pub settings: Settings,
    pub mode: DaemonMode,
    pub supervisor: Supervisor,
    pid_file: PidFile,
}

impl DaemonContext {
    /// Claims the PID file, recreates the store and builds the supervisor.
    ///
    /// Must be called from within a tokio runtime.
    pub fn build(settings: Settings, marker: &str) -> Result<Self> {
        let mode = DaemonMode::from_settings(&settings);
        let entries = mode.entries()?;
        let pid_file = PidFile::acquire(&settings.pid_file, marker)?;
        let store = OutputStore::create(&settings.store_file).with_context(|| {
            format!("failed to create output store {}", settings.store_file.display())
        })?;
        let config = SupervisorConfig {
            runner: settings.runner(),
            channel_capacity: settings.channel_capacity,
            batch_size: settings.batch_size,
            bootstrap_limit: settings.bootstrap_limit,
            retention_per_process: settings.retention_per_process,
            watch_patterns: settings.watch_patterns.clone(),
            watch_action: settings.watch_action,
        };
        let supervisor = Supervisor::new(entries, store, config)?;
        Ok(Self {
            settings,
            mode,
            supervisor,
            pid_file,
        })
    }

    pub fn pid_file(&self) -> &Path {
        self.pid_file.path()
    }

    /// Starts everything and blocks until SIGINT or SIGTERM, then shuts down.
    pub async fn run(self) -> Result<()> {
        info!(
            mode = ?self.mode,
            processes = ?self.supervisor.names(),
            pid = std::process::id(),
            "supervisor starting"
        );
        if let Err(err) = self.supervisor.start_all().await {
            warn!(error = %err, "some processes failed to start");
        }

        let signal = wait_for_shutdown_signal().await;
        info!(signal = signal.label(), "shutting down");

        let DaemonContext {
            supervisor,
            pid_file,
            ..
        } = self;
        let result = supervisor.shutdown(None).await;
        drop(pid_file);
        result.context("shutdown incomplete")
    }
}

async fn wait_for_shutdown_signal() -> ProcessSignal {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => ProcessSignal::SigInt,
                    _ = sigterm.recv() => ProcessSignal::SigTerm,
                }
            }
            Err(err) => {
                warn!(error = %err, "cannot listen for SIGTERM");
                let _ = tokio::signal::ctrl_c().await;
                ProcessSignal::SigInt
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        ProcessSignal::SigInt
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn settings(dir: &Path, config: Config) -> Settings {
        Settings::resolve(dir, config)
    }

    #[test]
    fn wrapped_mode_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            wrap: Some("/usr/local/bin/overmind start -f Procfile.dev".into()),
            ..Config::default()
        };
        let mode = DaemonMode::from_settings(&settings(dir.path(), config));
        assert_eq!(
            mode,
            DaemonMode::Wrapped {
                name: "overmind".into(),
                command: "/usr/local/bin/overmind start -f Procfile.dev".into(),
            }
        );
        let entries = mode.entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "overmind");
    }

    #[test]
    fn wrapped_name_falls_back() {
        assert_eq!(wrapped_name("'' x"), "wrapped");
        assert_eq!(wrapped_name("hivemind"), "hivemind");
    }

    #[test]
    fn native_mode_skips_bad_lines() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Procfile"), "web: serve\nnot a line\n").unwrap();
        let mode = DaemonMode::from_settings(&settings(dir.path(), Config::default()));
        let entries = mode.entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "web");
    }

    #[test]
    fn native_mode_requires_entries() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Procfile"), "# nothing\n").unwrap();
        let mode = DaemonMode::from_settings(&settings(dir.path(), Config::default()));
        assert!(mode.entries().is_err());

        let missing = DaemonMode::Native {
            procfile: dir.path().join("nope"),
        };
        assert!(missing.entries().is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn build_claims_pid_file_and_store() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Procfile"), "a: echo hi\n").unwrap();
        let settings = settings(dir.path(), Config::default());
        let marker = std::env::current_exe()
            .unwrap()
            .file_name()
            .unwrap()
            .to_string_lossy()
            .into_owned();

        let ctx = DaemonContext::build(settings.clone(), &marker).unwrap();
        assert!(ctx.pid_file().exists());
        assert!(settings.store_file.exists());
        assert_eq!(ctx.supervisor.names(), vec!["a".to_string()]);

        let DaemonContext {
            supervisor,
            pid_file,
            ..
        } = ctx;
        supervisor.shutdown(None).await.unwrap();
        drop(pid_file);
        assert!(!settings.pid_file.exists());
    }
}
