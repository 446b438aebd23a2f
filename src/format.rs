//! Per-process line prefixes.
//!
//! Every captured line is prefixed with its process name, colored and padded so
//! prefixes line up in a combined stream. The prefix is emitted as ANSI escapes
//! and goes through the markup converter together with the rest of the line.

use std::collections::HashMap;

const RESET: &str = "\u{1b}[0m";
const BOLD: &str = "\u{1b}[1m";
const DIM: &str = "\u{1b}[2m";

/// Foreground SGR codes, in allocation order.
const PALETTE: [u8; 12] = [36, 33, 32, 35, 34, 31, 96, 93, 92, 95, 94, 91];

/// Color and alignment state shared by all managed processes.
#[derive(Debug, Clone, Default)]
pub struct Formatter {
    colors: HashMap<String, u8>,
    order: Vec<String>,
    max_name_len: usize,
}

impl Formatter {
    /// Builds a formatter for `names`, in Procfile order.
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut formatter = Self::default();
        for name in names {
            formatter.add_process(name);
        }
        formatter
    }

    /// Registers a process, allocating the next palette color.
    ///
    /// Lines formatted after this call use the new padding width; lines that
    /// were already formatted are left as they are.
    pub fn add_process(&mut self, name: impl Into<String>) {
        let name = name.into();
        if self.colors.contains_key(&name) {
            return;
        }
        let color = PALETTE[self.order.len() % PALETTE.len()];
        self.max_name_len = self.max_name_len.max(name.chars().count());
        self.colors.insert(name.clone(), color);
        self.order.push(name);
    }

    pub fn color_of(&self, name: &str) -> Option<u8> {
        self.colors.get(name).copied()
    }

    pub fn max_name_len(&self) -> usize {
        self.max_name_len
    }

    /// Formats a captured line as `<color><bold>{name}<reset> | {text}`.
    pub fn format_line(&self, name: &str, text: &str) -> String {
        format!("{} | {}", self.prefix(name), text)
    }

    /// Formats a supervisor-generated line (deaths, spawn failures, warnings).
    pub fn format_system_line(&self, name: &str, text: &str) -> String {
        format!("{} | {}{}{}", self.prefix(name), DIM, text, RESET)
    }

    fn prefix(&self, name: &str) -> String {
        let padded = format!("{:<width$}", name, width = self.max_name_len);
        match self.color_of(name) {
            Some(color) => format!("\u{1b}[{}m{}{}{}", color, BOLD, padded, RESET),
            None => format!("{}{}{}", BOLD, padded, RESET),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn colors_cycle_through_palette() {
        let names: Vec<String> = (0..PALETTE.len() + 2).map(|i| format!("p{}", i)).collect();
        let formatter = Formatter::new(names.clone());
        assert_eq!(formatter.color_of("p0"), Some(PALETTE[0]));
        assert_eq!(formatter.color_of(&names[PALETTE.len()]), Some(PALETTE[0]));
        assert_eq!(formatter.color_of(&names[PALETTE.len() + 1]), Some(PALETTE[1]));
    }

    #[test]
    fn pads_names_to_longest() {
        let formatter = Formatter::new(["web", "worker"]);
        let line = formatter.format_line("web", "hello");
        assert_eq!(line, "\u{1b}[36m\u{1b}[1mweb   \u{1b}[0m | hello");
    }

    #[test]
    fn add_process_widens_later_lines() {
        let mut formatter = Formatter::new(["a"]);
        let before = formatter.format_line("a", "x");
        formatter.add_process("longer");
        let after = formatter.format_line("a", "x");
        assert!(before.contains("a\u{1b}[0m"));
        assert!(after.contains("a     \u{1b}[0m"));
        assert_eq!(formatter.color_of("longer"), Some(PALETTE[1]));
    }

    #[test]
    fn re_adding_keeps_original_color() {
        let mut formatter = Formatter::new(["a", "b"]);
        formatter.add_process("a");
        assert_eq!(formatter.color_of("a"), Some(PALETTE[0]));
        assert_eq!(formatter.max_name_len(), 1);
    }

    #[test]
    fn unknown_names_have_no_color() {
        let formatter = Formatter::new(["web"]);
        assert_eq!(formatter.format_line("x", "y"), "\u{1b}[1mx  \u{1b}[0m | y");
    }
}
