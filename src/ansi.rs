//! ANSI escape sequence conversion for markup rendering.
//!
//! This module converts ANSI-colored text into HTML-style markup so viewers can
//! render colors safely without leaking control characters. Every `<span>` the
//! converter opens is closed before it returns, whatever state the input leaves
//! the terminal in.

use std::fmt::Write as _;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Rgb(u8, u8, u8);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Style {
    Bold,
    Italic,
    Underline,
    Fg(Rgb),
    Bg(Rgb),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StyleKind {
    Bold,
    Italic,
    Underline,
    Fg,
    Bg,
}

impl Style {
    fn kind(&self) -> StyleKind {
        match self {
            Style::Bold => StyleKind::Bold,
            Style::Italic => StyleKind::Italic,
            Style::Underline => StyleKind::Underline,
            Style::Fg(_) => StyleKind::Fg,
            Style::Bg(_) => StyleKind::Bg,
        }
    }

    fn css(&self) -> String {
        match self {
            Style::Bold => "font-weight:bold".to_string(),
            Style::Italic => "font-style:italic".to_string(),
            Style::Underline => "text-decoration:underline".to_string(),
            Style::Fg(Rgb(r, g, b)) => format!("color:#{:02x}{:02x}{:02x}", r, g, b),
            Style::Bg(Rgb(r, g, b)) => {
                format!("background-color:#{:02x}{:02x}{:02x}", r, g, b)
            }
        }
    }
}

/// Markup output plus the stack of currently open spans.
#[derive(Debug, Default)]
struct Markup {
    out: String,
    open: Vec<Style>,
}

impl Markup {
    fn push_text(&mut self, ch: char) {
        match ch {
            '&' => self.out.push_str("&amp;"),
            '<' => self.out.push_str("&lt;"),
            '>' => self.out.push_str("&gt;"),
            '"' => self.out.push_str("&quot;"),
            '\'' => self.out.push_str("&#39;"),
            _ => self.out.push(ch),
        }
    }

    fn write_open(&mut self, style: Style) {
        let _ = write!(self.out, "<span style=\"{}\">", style.css());
        self.open.push(style);
    }

    fn open(&mut self, style: Style) {
        if self.open.contains(&style) {
            return;
        }
        // Only one color of each kind is active at a time.
        if matches!(style.kind(), StyleKind::Fg | StyleKind::Bg) {
            self.close(style.kind());
        }
        self.write_open(style);
    }

    /// Closes the innermost span of `kind`, re-opening anything nested inside it.
    fn close(&mut self, kind: StyleKind) {
        let Some(pos) = self.open.iter().rposition(|s| s.kind() == kind) else {
            return;
        };
        let reopen = self.open.split_off(pos + 1);
        self.open.pop();
        for _ in 0..=reopen.len() {
            self.out.push_str("</span>");
        }
        for style in reopen {
            self.write_open(style);
        }
    }

    fn close_all(&mut self) {
        for _ in self.open.drain(..) {
            self.out.push_str("</span>");
        }
    }

    fn finish(mut self) -> String {
        self.close_all();
        self.out
    }
}

/// Converts one line of ANSI-colored text into balanced markup.
pub fn to_markup(text: &str) -> String {
    // Carriage return overwrites the line from the start: keep the last segment.
    let text = text.rsplit('\r').find(|s| !s.is_empty()).unwrap_or("");
    let mut markup = Markup::default();
    let mut chars = text.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '\x1b' {
            if matches!(chars.peek(), Some('[')) {
                chars.next();
                let mut params = String::new();
                let mut final_byte = None;
                while let Some(&c) = chars.peek() {
                    if ('@'..='~').contains(&c) {
                        final_byte = Some(c);
                        chars.next();
                        break;
                    }
                    params.push(c);
                    chars.next();
                }
                if final_byte == Some('m') {
                    apply_sgr(&mut markup, &params);
                }
                continue;
            }
            if matches!(chars.peek(), Some(']')) {
                // OSC sequence: skip until BEL or ESC \
                chars.next();
                while let Some(next) = chars.next() {
                    if next == '\x07' {
                        break;
                    }
                    if next == '\x1b' && matches!(chars.peek(), Some('\\')) {
                        chars.next();
                        break;
                    }
                }
                continue;
            }
            // Other escapes (e.g. ESC ( B): intermediates 0x20-0x2F, then one final byte.
            while let Some(&c) = chars.peek() {
                if !(' '..='/').contains(&c) {
                    break;
                }
                chars.next();
            }
            if matches!(chars.peek(), Some(c) if ('0'..='~').contains(c)) {
                chars.next();
            }
            continue;
        }
        if ch.is_control() && ch != '\t' {
            continue;
        }
        markup.push_text(ch);
    }
    markup.finish()
}

/// Removes markup tags and decodes entities produced by [`to_markup`].
pub fn markup_to_plain(markup: &str) -> String {
    let mut out = String::with_capacity(markup.len());
    let mut in_tag = false;
    for ch in markup.chars() {
        match ch {
            '<' => in_tag = true,
            '>' if in_tag => in_tag = false,
            _ if !in_tag => out.push(ch),
            _ => {}
        }
    }
    out.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

fn apply_sgr(markup: &mut Markup, params: &str) {
    let values = parse_params(params);
    let mut i = 0;
    while i < values.len() {
        match values[i] {
            0 => markup.close_all(),
            1 => markup.open(Style::Bold),
            3 => markup.open(Style::Italic),
            4 => markup.open(Style::Underline),
            22 => markup.close(StyleKind::Bold),
            23 => markup.close(StyleKind::Italic),
            24 => markup.close(StyleKind::Underline),
            30..=37 => markup.open(Style::Fg(basic_color(values[i] - 30, false))),
            90..=97 => markup.open(Style::Fg(basic_color(values[i] - 90, true))),
            40..=47 => markup.open(Style::Bg(basic_color(values[i] - 40, false))),
            100..=107 => markup.open(Style::Bg(basic_color(values[i] - 100, true))),
            39 => markup.close(StyleKind::Fg),
            49 => markup.close(StyleKind::Bg),
            38 | 48 => {
                let is_fg = values[i] == 38;
                if let Some((advance, color)) = parse_extended_color(&values[i + 1..]) {
                    if is_fg {
                        markup.open(Style::Fg(color));
                    } else {
                        markup.open(Style::Bg(color));
                    }
                    i += advance;
                }
            }
            _ => {}
        }
        i += 1;
    }
}

fn parse_params(params: &str) -> Vec<i32> {
    if params.is_empty() {
        return vec![0];
    }
    let mut values = Vec::new();
    for part in params.split(';') {
        if part.is_empty() {
            values.push(0);
        } else if let Ok(value) = part.parse::<i32>() {
            values.push(value);
        }
    }
    if values.is_empty() {
        values.push(0);
    }
    values
}

fn parse_extended_color(values: &[i32]) -> Option<(usize, Rgb)> {
    if values.is_empty() {
        return None;
    }
    match values[0] {
        5 => {
            let index = *values.get(1)?;
            let index = u8::try_from(index).ok()?;
            Some((2, indexed_color(index)))
        }
        2 => {
            let r = u8::try_from(*values.get(1)?).ok()?;
            let g = u8::try_from(*values.get(2)?).ok()?;
            let b = u8::try_from(*values.get(3)?).ok()?;
            Some((4, Rgb(r, g, b)))
        }
        _ => None,
    }
}

const BASIC: [Rgb; 8] = [
    Rgb(0x00, 0x00, 0x00),
    Rgb(0xcd, 0x00, 0x00),
    Rgb(0x00, 0xcd, 0x00),
    Rgb(0xcd, 0xcd, 0x00),
    Rgb(0x00, 0x00, 0xee),
    Rgb(0xcd, 0x00, 0xcd),
    Rgb(0x00, 0xcd, 0xcd),
    Rgb(0xe5, 0xe5, 0xe5),
];

const BRIGHT: [Rgb; 8] = [
    Rgb(0x7f, 0x7f, 0x7f),
    Rgb(0xff, 0x00, 0x00),
    Rgb(0x00, 0xff, 0x00),
    Rgb(0xff, 0xff, 0x00),
    Rgb(0x5c, 0x5c, 0xff),
    Rgb(0xff, 0x00, 0xff),
    Rgb(0x00, 0xff, 0xff),
    Rgb(0xff, 0xff, 0xff),
];

fn basic_color(index: i32, bright: bool) -> Rgb {
    let index = index.clamp(0, 7) as usize;
    if bright {
        BRIGHT[index]
    } else {
        BASIC[index]
    }
}

/// xterm 256-color palette.
fn indexed_color(index: u8) -> Rgb {
    const LEVELS: [u8; 6] = [0, 95, 135, 175, 215, 255];
    match index {
        0..=7 => BASIC[index as usize],
        8..=15 => BRIGHT[(index - 8) as usize],
        16..=231 => {
            let n = index - 16;
            Rgb(
                LEVELS[(n / 36) as usize],
                LEVELS[((n / 6) % 6) as usize],
                LEVELS[(n % 6) as usize],
            )
        }
        _ => {
            let level = 8 + (index - 232) * 10;
            Rgb(level, level, level)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn balanced(markup: &str) -> bool {
        markup.matches("<span").count() == markup.matches("</span>").count()
    }

    #[test]
    fn plain_text_is_escaped() {
        assert_eq!(to_markup("a < b && c"), "a &lt; b &amp;&amp; c");
    }

    #[test]
    fn sgr_color_wraps_text() {
        assert_eq!(
            to_markup("\u{1b}[31mred\u{1b}[0m"),
            "<span style=\"color:#cd0000\">red</span>"
        );
    }

    #[test]
    fn unclosed_256_color_is_closed_at_end() {
        let markup = to_markup("\u{1b}[38;5;196munclosed");
        assert_eq!(markup, "<span style=\"color:#ff0000\">unclosed</span>");
        assert!(balanced(&markup));
    }

    #[test]
    fn truecolor_background() {
        let markup = to_markup("\u{1b}[48;2;1;2;3mx");
        assert_eq!(markup, "<span style=\"background-color:#010203\">x</span>");
    }

    #[test]
    fn reset_closes_every_open_span() {
        let markup = to_markup("\u{1b}[1;3;4;32mall\u{1b}[0m after");
        assert!(markup.ends_with("</span></span></span></span> after"));
        assert!(balanced(&markup));
    }

    #[test]
    fn off_code_reopens_nested_styles() {
        let markup = to_markup("\u{1b}[1m\u{1b}[3mbi\u{1b}[22mi");
        assert_eq!(
            markup,
            "<span style=\"font-weight:bold\"><span style=\"font-style:italic\">bi\
             </span></span><span style=\"font-style:italic\">i</span>"
        );
    }

    #[test]
    fn new_color_replaces_old() {
        let markup = to_markup("\u{1b}[31ma\u{1b}[32mb");
        assert_eq!(
            markup,
            "<span style=\"color:#cd0000\">a</span><span style=\"color:#00cd00\">b</span>"
        );
    }

    #[test]
    fn non_sgr_sequences_are_dropped() {
        assert_eq!(to_markup("\u{1b}[2K\u{1b}[1Gdone"), "done");
        assert_eq!(to_markup("hi\u{1b}]0;title\u{7}there"), "hithere");
        assert_eq!(
            to_markup("\u{1b}[1mbold\u{1b}(B\u{1b}[m done"),
            "<span style=\"font-weight:bold\">bold</span> done"
        );
        assert_eq!(to_markup("a\u{1b}=b\u{1b}7c"), "abc");
    }

    #[test]
    fn truncated_sequences_stay_balanced() {
        let inputs = [
            "\u{1b}[31mred\u{1b}[",
            "\u{1b}[1;38;5",
            "\u{1b}[38;2;1;2mx",
            "\u{1b}",
            "\u{1b}[4munder\u{1b}[24",
            "\u{1b}[1m\u{1b}[3m\u{1b}[4m\u{1b}[22m\u{1b}[31m",
        ];
        for input in inputs {
            assert!(balanced(&to_markup(input)), "unbalanced for {:?}", input);
        }
    }

    #[test]
    fn carriage_return_keeps_last_segment() {
        assert_eq!(to_markup("10%\r50%\r100%"), "100%");
        assert_eq!(to_markup("line\r"), "line");
    }

    #[test]
    fn plain_round_trip_strips_tags() {
        let markup = to_markup("\u{1b}[31m<tag> & 'q'\u{1b}[0m");
        assert_eq!(markup_to_plain(&markup), "<tag> & 'q'");
    }

    #[test]
    fn parse_params_defaults_to_reset() {
        assert_eq!(parse_params(""), vec![0]);
        assert_eq!(parse_params(";"), vec![0, 0]);
        assert_eq!(parse_params("1;"), vec![1, 0]);
    }

    #[test]
    fn palette_lookup() {
        assert_eq!(indexed_color(1), BASIC[1]);
        assert_eq!(indexed_color(196), Rgb(255, 0, 0));
        assert_eq!(indexed_color(232), Rgb(8, 8, 8));
        assert!(parse_extended_color(&[9]).is_none());
    }
}
