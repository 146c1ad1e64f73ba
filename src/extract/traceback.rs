//! Python traceback recogniser.

use std::str::Lines;
use std::sync::LazyLock;

use regex::Regex;

use super::{ErrorCandidate, ErrorProducer};

static HEADER_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\bTraceback\b").unwrap());

static FRAME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"File "([^"]+)", line (\d+)"#).unwrap());

const EXCEPTION_NAME: &str =
    r"[A-Za-z_][\w.]*(?:Error|Exception|Exit|Interrupt|Warning|Iteration)";

/// The line that terminates a multi-line traceback, e.g. `KeyError: 'x'`.
static EXCEPTION_LINE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(&format!(r"^{EXCEPTION_NAME}(?::.*)?$")).unwrap());

/// Exception at the end of a traceback collapsed onto one line.
static EXCEPTION_TAIL_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(&format!(r"\b{EXCEPTION_NAME}(?::[^\n]*)?$")).unwrap());

/// Recognises `Traceback (most recent call last):` blocks. The file reference
/// is the innermost frame; the message is the terminating exception line.
#[derive(Debug, Default)]
pub struct PythonTracebackProducer;

impl PythonTracebackProducer {
    pub fn new() -> Self {
        Self
    }
}

impl ErrorProducer for PythonTracebackProducer {
    fn name(&self) -> &'static str {
        "python_traceback"
    }

    fn produce<'a>(&'a self, text: &'a str) -> Box<dyn Iterator<Item = ErrorCandidate> + 'a> {
        Box::new(TracebackIter::new(text))
    }
}

struct OpenBlock {
    raw: String,
    file_path: Option<String>,
    line: Option<u32>,
}

impl OpenBlock {
    fn new(first_line: &str) -> Self {
        Self {
            raw: first_line.to_string(),
            file_path: None,
            line: None,
        }
    }

    fn note_frames(&mut self, text: &str) -> Option<usize> {
        let mut last_end = None;
        for caps in FRAME_REGEX.captures_iter(text) {
            self.file_path = Some(caps[1].to_string());
            self.line = caps[2].parse().ok();
            last_end = caps.get(0).map(|m| m.end());
        }
        last_end
    }

    fn finish(self, message: &str) -> ErrorCandidate {
        ErrorCandidate::new(self.file_path, self.line, message.trim(), self.raw)
    }
}

/// Single pass over the text; an unterminated traceback yields nothing.
pub struct TracebackIter<'a> {
    lines: Lines<'a>,
    open: Option<OpenBlock>,
}

impl<'a> TracebackIter<'a> {
    pub fn new(text: &'a str) -> Self {
        Self {
            lines: text.lines(),
            open: None,
        }
    }
}

impl Iterator for TracebackIter<'_> {
    type Item = ErrorCandidate;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = self.lines.next()?;

            if let Some(header) = HEADER_REGEX.find(line) {
                let mut block = OpenBlock::new(line);
                let tail_start = block.note_frames(line).unwrap_or(header.end());
                if let Some(exc) = EXCEPTION_TAIL_REGEX.find(&line[tail_start..]) {
                    return Some(block.finish(exc.as_str()));
                }
                self.open = Some(block);
                continue;
            }

            let Some(block) = self.open.as_mut() else {
                continue;
            };
            block.raw.push('\n');
            block.raw.push_str(line);

            if block.note_frames(line).is_some() {
                continue;
            }

            let indented = line.starts_with(char::is_whitespace);
            if !indented
                && EXCEPTION_LINE_REGEX.is_match(line.trim_end())
                && let Some(block) = self.open.take()
            {
                return Some(block.finish(line));
            }
        }
    }
}
