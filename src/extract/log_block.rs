//! Recogniser for blank-line-separated application log entries.
//!
//! ```text
//! 2024-05-01 12:00:00 ERROR Unhandled request failure
//! File: api/routes.py, line 88
//! ```

use std::str::Split;
use std::sync::LazyLock;

use regex::Regex;

use super::{ErrorCandidate, ErrorProducer};

static FILE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"File: ([^,\n]+)(?:,\s*line\s*(\d+))?").unwrap());

const ERROR_MARKER: &str = "ERROR";

/// Entries containing `ERROR`. Entries that carry a Python traceback are left
/// to [`super::PythonTracebackProducer`].
#[derive(Debug, Default)]
pub struct LogBlockProducer;

impl LogBlockProducer {
    pub fn new() -> Self {
        Self
    }
}

impl ErrorProducer for LogBlockProducer {
    fn name(&self) -> &'static str {
        "log_block"
    }

    fn produce<'a>(&'a self, text: &'a str) -> Box<dyn Iterator<Item = ErrorCandidate> + 'a> {
        Box::new(LogBlockIter::new(text))
    }
}

pub struct LogBlockIter<'a> {
    entries: Split<'a, &'static str>,
}

impl<'a> LogBlockIter<'a> {
    pub fn new(text: &'a str) -> Self {
        Self {
            entries: text.split("\n\n"),
        }
    }
}

impl Iterator for LogBlockIter<'_> {
    type Item = ErrorCandidate;

    fn next(&mut self) -> Option<Self::Item> {
        self.entries.by_ref().find_map(parse_entry)
    }
}

fn parse_entry(entry: &str) -> Option<ErrorCandidate> {
    let entry = entry.trim();
    if !entry.contains(ERROR_MARKER) || entry.contains("Traceback") {
        return None;
    }

    let message = entry
        .lines()
        .find(|l| l.contains(ERROR_MARKER))
        .map(str::trim)
        .unwrap_or(entry);

    let (file_path, line) = match FILE_REGEX.captures(entry) {
        Some(caps) => (
            Some(caps[1].trim().to_string()).filter(|p| !p.is_empty()),
            caps.get(2).and_then(|m| m.as_str().parse().ok()),
        ),
        None => (None, None),
    };

    Some(ErrorCandidate::new(file_path, line, message, entry))
}
