//! Warning-pattern detection over captured output.
//!
//! Patterns are matched against the plain text of each line (escapes stripped).
//! A process is reported at most once per run; what happens next depends on
//! the configured [`WatchAction`].

use std::collections::HashSet;

use regex::RegexSet;
use serde::Deserialize;
use strip_ansi_escapes::strip;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchAction {
    /// Mark the process as flagged and write a warning line.
    #[default]
    Flag,
    /// Flag, then stop the process.
    Kill,
}

/// A match reported by [`Watchdog::inspect`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchHit {
    pub process: String,
    pub pattern: String,
    pub action: WatchAction,
}

#[derive(Debug)]
pub struct Watchdog {
    patterns: RegexSet,
    action: WatchAction,
    tripped: HashSet<String>,
}

impl Watchdog {
    /// Builds a watchdog, or `None` when there is nothing to watch for.
    pub fn new(patterns: &[String], action: WatchAction) -> Result<Option<Self>, regex::Error> {
        if patterns.is_empty() {
            return Ok(None);
        }
        Ok(Some(Self {
            patterns: RegexSet::new(patterns)?,
            action,
            tripped: HashSet::new(),
        }))
    }

    /// Checks one captured line; returns a hit the first time `process` matches.
    pub fn inspect(&mut self, process: &str, text: &str) -> Option<WatchHit> {
        if self.tripped.contains(process) {
            return None;
        }
        let plain = sanitize_text(text);
        let index = self.patterns.matches(&plain).into_iter().next()?;
        self.tripped.insert(process.to_string());
        Some(WatchHit {
            process: process.to_string(),
            pattern: self.patterns.patterns()[index].clone(),
            action: self.action,
        })
    }

    /// Re-arms detection for `process`, e.g. after a restart.
    pub fn reset(&mut self, process: &str) {
        self.tripped.remove(process);
    }
}

/// Strips ANSI escapes, replacing invalid UTF-8.
pub fn sanitize_text(text: &str) -> String {
    let stripped = strip(text.as_bytes());
    String::from_utf8_lossy(&stripped).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_patterns_means_no_watchdog() {
        assert!(Watchdog::new(&[], WatchAction::Flag).unwrap().is_none());
    }

    #[test]
    fn matches_plain_text_once_per_process() {
        let patterns = vec!["panicked at".to_string(), "(?i)out of memory".to_string()];
        let mut dog = Watchdog::new(&patterns, WatchAction::Kill).unwrap().unwrap();
        assert!(dog.inspect("web", "all good").is_none());

        let hit = dog.inspect("web", "\u{1b}[31mOut Of \u{1b}[1mMemory\u{1b}[0m").unwrap();
        assert_eq!(hit.pattern, "(?i)out of memory");
        assert_eq!(hit.action, WatchAction::Kill);
        assert!(dog.inspect("web", "thread 'main' panicked at").is_none());
        assert!(dog.inspect("worker", "thread 'main' panicked at").is_some());

        dog.reset("web");
        assert!(dog.inspect("web", "panicked at x").is_some());
    }

    #[test]
    fn rejects_bad_patterns() {
        assert!(Watchdog::new(&["(".to_string()], WatchAction::Flag).is_err());
    }

    #[test]
    fn sanitize_strips_escapes() {
        assert_eq!(sanitize_text("\u{1b}[32mok\u{1b}[0m"), "ok");
    }
}
