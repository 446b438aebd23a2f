//! Events emitted by managed processes.
//!
//! Capture and monitor workers never touch the store directly. They send
//! `ProcessEvent`s into a bounded channel drained by the supervisor's event
//! pump, which keeps capture speed independent of storage speed.

/// An event produced by a managed process's workers.
#[derive(Debug, Clone)]
pub enum ProcessEvent {
    /// A child was spawned.
    Started { name: String, pid: u32 },
    /// A captured line (stdout or stderr, undistinguished).
    Output {
        name: String,
        /// The line as the child wrote it, escapes included.
        text: String,
        /// Prefixed and converted to markup.
        rendered: String,
    },
    /// The child exited without a stop request.
    Died { name: String, code: Option<i32> },
    /// The command could not be launched.
    SpawnFailed { name: String, error: String },
}
