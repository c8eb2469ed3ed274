use std::iter::Peekable;
use std::str::Chars;

const MAX_LINE_CHARS: usize = 4096;
pub const REDACTED: &str = "[redacted]";

/// Makes external tool output safe to print: terminal escape sequences and control characters
/// are stripped, overlong lines truncated, and known secret values replaced with [`REDACTED`].
#[derive(Debug, Default, Clone)]
pub struct Scrubber {
    // Longest first, so a secret containing another is replaced whole.
    secrets: Vec<String>,
}

impl Scrubber {
    pub fn new<'a>(secrets: impl IntoIterator<Item = &'a str>) -> Self {
        let mut secrets: Vec<String> = secrets
            .into_iter()
            .filter(|s| !s.is_empty())
            .map(ToOwned::to_owned)
            .collect();
        secrets.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        secrets.dedup();
        Self { secrets }
    }

    /// Strips terminal sequences, then redacts, then truncates, so a cut never splits a secret.
    pub fn scrub(&self, line: &str) -> String {
        truncate(self.redact(&strip_sequences(line)))
    }

    pub fn redact(&self, text: &str) -> String {
        let mut out = text.to_string();
        for secret in &self.secrets {
            if out.contains(secret.as_str()) {
                out = out.replace(secret.as_str(), REDACTED);
            }
        }
        out
    }

    /// Byte offset of the longest tail of `text` that could begin a secret continuing past the
    /// end, or `text.len()` when there is none.
    pub fn partial_secret_start(&self, text: &str) -> usize {
        let mut start = text.len();
        for secret in &self.secrets {
            for k in (1..secret.len()).rev() {
                if k > text.len() || !text.is_char_boundary(text.len() - k) {
                    continue;
                }
                let tail = &text[text.len() - k..];
                if secret.starts_with(tail) {
                    start = start.min(text.len() - k);
                    break;
                }
            }
        }
        start
    }
}

pub fn strip_terminal_sequences(input: &str) -> String {
    truncate(strip_sequences(input))
}

fn strip_sequences(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\x1b' => skip_escape(&mut chars),
            '\t' => out.push(' '),
            c if c.is_control() || is_bidi_control(c) => {}
            c => out.push(c),
        }
    }
    out
}

fn truncate(line: String) -> String {
    match line.char_indices().nth(MAX_LINE_CHARS) {
        Some((cut, _)) => format!("{} ...[truncated]", &line[..cut]),
        None => line,
    }
}

fn skip_escape(chars: &mut Peekable<Chars<'_>>) {
    match chars.next() {
        // CSI: parameters until a final byte in '@'..='~'.
        Some('[') => {
            for c in chars.by_ref() {
                if ('@'..='~').contains(&c) {
                    break;
                }
            }
        }
        // OSC ends at BEL or ST.
        Some(']') => skip_string_sequence(chars, true),
        // DCS, SOS, PM, APC end at ST only.
        Some('P' | 'X' | '^' | '_') => skip_string_sequence(chars, false),
        _ => {}
    }
}

fn skip_string_sequence(chars: &mut Peekable<Chars<'_>>, bel_terminates: bool) {
    while let Some(c) = chars.next() {
        if bel_terminates && c == '\x07' {
            return;
        }
        if c == '\x1b' && chars.peek() == Some(&'\\') {
            chars.next();
            return;
        }
    }
}

fn is_bidi_control(c: char) -> bool {
    matches!(c, '\u{061C}' | '\u{200E}' | '\u{200F}')
        || ('\u{202A}'..='\u{202E}').contains(&c)
        || ('\u{2066}'..='\u{2069}').contains(&c)
}
