use std::collections::VecDeque;
use std::sync::OnceLock;

use regex_lite::Regex;
use serde::Serialize;

use crate::model::{EpochMillis, OutputLine, OutputStream};

pub const DEFAULT_OUTPUT_CAPACITY: usize = 1000;

/// Fixed-capacity line buffer. Evicts oldest first and keeps a count of
/// every line ever pushed.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputBuffer {
    #[serde(rename = "outputLines")]
    lines: VecDeque<OutputLine>,
    #[serde(skip)]
    capacity: usize,
    total_line_count: u64,
}

impl OutputBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            lines: VecDeque::with_capacity(capacity.min(DEFAULT_OUTPUT_CAPACITY)),
            capacity,
            total_line_count: 0,
        }
    }

    pub fn push(&mut self, line: OutputLine) {
        self.total_line_count = self.total_line_count.saturating_add(1);
        while self.lines.len() >= self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    pub fn lines(&self) -> impl Iterator<Item = &OutputLine> {
        self.lines.iter()
    }

    pub fn to_vec(&self) -> Vec<OutputLine> {
        self.lines.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn total_line_count(&self) -> u64 {
        self.total_line_count
    }
}

pub(crate) fn make_line(
    id: u64,
    content: String,
    stream: OutputStream,
    timestamp: EpochMillis,
) -> OutputLine {
    OutputLine {
        id,
        content,
        stream,
        timestamp,
    }
}

/// Removes terminal escape sequences and non-printing control characters.
/// Tabs and newlines survive.
pub fn strip_control_sequences(raw: &str) -> String {
    let chars: Vec<char> = raw.chars().collect();
    let mut out = String::with_capacity(raw.len());
    let mut i = 0usize;
    while i < chars.len() {
        let ch = chars[i];
        if ch == '\u{1b}' {
            i = skip_escape(&chars, i);
            continue;
        }
        if ch == '\u{9b}' {
            i = skip_csi_body(&chars, i + 1);
            continue;
        }
        if !is_stripped_control(ch) {
            out.push(ch);
        }
        i += 1;
    }
    out
}

fn skip_escape(chars: &[char], start: usize) -> usize {
    let Some(next) = chars.get(start + 1) else {
        return start + 1;
    };
    match next {
        '[' => skip_csi_body(chars, start + 2),
        ']' | 'P' | '_' | '^' | 'X' => skip_string_body(chars, start + 2),
        // Charset designators carry one trailing byte.
        '(' | ')' | '*' | '+' => (start + 3).min(chars.len()),
        _ => start + 2,
    }
}

fn skip_csi_body(chars: &[char], mut i: usize) -> usize {
    while i < chars.len() {
        if ('@'..='~').contains(&chars[i]) {
            return i + 1;
        }
        i += 1;
    }
    i
}

fn skip_string_body(chars: &[char], mut i: usize) -> usize {
    while i < chars.len() {
        if chars[i] == '\u{0007}' {
            return i + 1;
        }
        if chars[i] == '\u{1b}' && chars.get(i + 1) == Some(&'\\') {
            return i + 2;
        }
        i += 1;
    }
    i
}

fn is_stripped_control(ch: char) -> bool {
    matches!(
        ch,
        '\u{0000}'..='\u{0008}'
            | '\u{000B}'..='\u{001F}'
            | '\u{007F}'..='\u{009F}'
    )
}

fn port_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"(?i)(?:localhost|127\.0\.0\.1|0\.0\.0\.0|\[::\]|\[::1\]):(\d{2,5})\b",
            r"(?i)\bport\s*[:=]?\s*(\d{2,5})\b",
        ]
        .iter()
        .filter_map(|pattern| Regex::new(pattern).ok())
        .collect()
    })
}

/// Advisory listening-port guess from one output line.
pub fn detect_port(content: &str) -> Option<u16> {
    let clean = strip_control_sequences(content);
    port_patterns().iter().find_map(|pattern| {
        pattern
            .captures(&clean)
            .and_then(|captures| captures.get(1))
            .and_then(|port| port.as_str().parse::<u16>().ok())
            .filter(|port| *port > 0)
    })
}
