//! Procfile parsing.
//!
//! A Procfile maps process names to shell commands, one per line:
//!
//! ```text
//! web: python -m http.server 8000
//! # comments and blank lines are ignored
//! worker: ./bin/worker --queue default
//! ```
//!
//! Parsing never stops at a bad line. Every rejected line is reported with its
//! line number and the caller decides whether an empty result is fatal.

use std::collections::HashSet;
use std::fmt;
use std::path::Path;

use thiserror::Error;

/// A single `name: command` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcfileEntry {
    pub name: String,
    pub command: String,
}

/// A rejected Procfile line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    /// 1-based line number.
    pub line: usize,
    pub message: String,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

/// Result of parsing a whole Procfile.
#[derive(Debug, Clone, Default)]
pub struct Procfile {
    pub entries: Vec<ProcfileEntry>,
    pub errors: Vec<ParseError>,
}

#[derive(Debug, Error)]
pub enum ProcfileError {
    #[error("failed to read procfile {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl Procfile {
    /// Reads and parses the Procfile at `path`.
    pub fn load(path: &Path) -> Result<Self, ProcfileError> {
        let text = std::fs::read_to_string(path).map_err(|source| ProcfileError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Self::parse(&text))
    }

    /// Parses Procfile text.
    pub fn parse(text: &str) -> Self {
        let mut procfile = Procfile::default();
        let mut seen = HashSet::new();

        for (idx, raw) in text.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match parse_line(line) {
                Ok(entry) => {
                    if !seen.insert(entry.name.clone()) {
                        procfile.errors.push(ParseError {
                            line: line_no,
                            message: format!("duplicate process name '{}'", entry.name),
                        });
                        continue;
                    }
                    procfile.entries.push(entry);
                }
                Err(message) => procfile.errors.push(ParseError {
                    line: line_no,
                    message,
                }),
            }
        }
        procfile
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.name.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn parse_line(line: &str) -> Result<ProcfileEntry, String> {
    let Some((name, command)) = line.split_once(':') else {
        return Err("missing ':' between name and command".to_string());
    };
    let name = name.trim();
    let command = command.trim();
    if !is_valid_name(name) {
        return Err(format!(
            "invalid process name '{}' (allowed: letters, digits, '_' and '-')",
            name
        ));
    }
    if command.is_empty() {
        return Err(format!("empty command for '{}'", name));
    }
    Ok(ProcfileEntry {
        name: name.to_string(),
        command: command.to_string(),
    })
}

/// Returns true if `name` matches `[A-Za-z0-9_-]+`.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_entries_in_order() {
        let procfile = Procfile::parse("web: python -m http.server\nworker: ./worker --fast\n");
        assert!(procfile.errors.is_empty());
        assert_eq!(procfile.names(), vec!["web", "worker"]);
        assert_eq!(procfile.entries[0].command, "python -m http.server");
    }

    #[test]
    fn splits_on_first_colon_only() {
        let procfile = Procfile::parse("api: env URL=http://localhost:8080 ./api");
        assert_eq!(
            procfile.entries[0].command,
            "env URL=http://localhost:8080 ./api"
        );
    }

    #[test]
    fn skips_comments_and_blank_lines() {
        let procfile = Procfile::parse("# header\n\n   \n  # indented\nweb: run\n");
        assert_eq!(procfile.entries.len(), 1);
        assert!(procfile.errors.is_empty());
    }

    #[test]
    fn records_errors_and_keeps_going() {
        let text = "\
web: serve
no colon here
bad name!: echo hi
empty:
web: duplicate
worker: work
";
        let procfile = Procfile::parse(text);
        assert_eq!(procfile.names(), vec!["web", "worker"]);
        let lines: Vec<usize> = procfile.errors.iter().map(|e| e.line).collect();
        assert_eq!(lines, vec![2, 3, 4, 5]);
        assert!(procfile.errors[3].message.contains("duplicate"));
    }

    #[test]
    fn every_significant_line_is_accounted_for_once() {
        let text = "a: one\n#c\nb two\nc: three\n\nd:\n-_x9: ok\na: again\n";
        let significant = text
            .lines()
            .filter(|l| !l.trim().is_empty() && !l.trim().starts_with('#'))
            .count();
        let procfile = Procfile::parse(text);
        assert_eq!(procfile.entries.len() + procfile.errors.len(), significant);
    }

    #[test]
    fn name_validation() {
        assert!(is_valid_name("web-1_a"));
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("web.1"));
        assert!(!is_valid_name("we b"));
    }

    #[test]
    fn load_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = Procfile::load(&dir.path().join("Procfile")).unwrap_err();
        assert!(err.to_string().contains("failed to read procfile"));
    }
}
