//! procrack: a Procfile supervisor daemon.
//!
//! Runs the processes of a Procfile as a background daemon, captures their
//! output as colored markup into an embedded store, and serves it back through
//! bootstrap and incremental reads.

pub mod ansi;
pub mod config;
pub mod context;
pub mod daemon;
pub mod error;
pub mod events;
pub mod format;
pub mod process;
pub mod procfile;
pub mod runner;
pub mod store;
pub mod supervisor;
pub mod watchdog;
