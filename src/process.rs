//! Data structures for tracking process state.
//!
//! This module defines the lifecycle state of a managed process (`RunState`),
//! the mutable record its control and monitor logic share (`ProcessRecord`), and
//! the serializable snapshot handed to callers (`ProcessStatus`).

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// The current lifecycle state of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Not running: never started, or stopped on request.
    Stopped,
    /// Spawn in progress.
    Starting,
    /// Child is alive.
    Running,
    /// Exited without being asked to, or failed to spawn.
    Dead,
}

impl RunState {
    pub fn is_active(self) -> bool {
        matches!(self, RunState::Starting | RunState::Running)
    }
}

/// Runtime record of a single process, owned by its `ManagedProcess`.
#[derive(Debug, Clone)]
pub struct ProcessRecord {
    pub state: RunState,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    /// Monotonic start time, for uptime.
    pub started: Option<Instant>,
    /// Set when an output pattern matched.
    pub flagged: bool,
}

impl Default for ProcessRecord {
    fn default() -> Self {
        Self {
            state: RunState::Stopped,
            pid: None,
            exit_code: None,
            started_at: None,
            stopped_at: None,
            started: None,
            flagged: false,
        }
    }
}

impl ProcessRecord {
    pub fn uptime(&self) -> Option<Duration> {
        if !self.state.is_active() {
            return None;
        }
        self.started.map(|at| at.elapsed())
    }
}

/// Point-in-time view of a managed process.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessStatus {
    pub name: String,
    pub command: String,
    pub state: RunState,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    /// Seconds since start, while running.
    pub uptime_secs: Option<u64>,
    pub flagged: bool,
}

impl ProcessStatus {
    pub fn from_record(name: &str, command: &str, record: &ProcessRecord) -> Self {
        Self {
            name: name.to_string(),
            command: command.to_string(),
            state: record.state,
            pid: record.pid,
            exit_code: record.exit_code,
            started_at: record.started_at,
            stopped_at: record.stopped_at,
            uptime_secs: record.uptime().map(|d| d.as_secs()),
            flagged: record.flagged,
        }
    }
}
