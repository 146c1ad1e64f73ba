//! Error candidate extraction from raw log text.
//!
//! Extraction is a stateless transform: each [`ErrorProducer`] recognises one
//! log format and yields candidates lazily while scanning the text once.
//! Malformed input never fails; it simply yields nothing. Deduplication is
//! not done here; repeated occurrences produce separate candidates.

pub mod log_block;
pub mod traceback;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use log_block::LogBlockProducer;
pub use traceback::PythonTracebackProducer;

/// One detected error, immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorCandidate {
    pub id: Uuid,
    /// Repository-relative file the error points at, if the log names one.
    pub file_path: Option<String>,
    pub line: Option<u32>,
    pub message: String,
    pub raw_excerpt: String,
    pub detected_at: DateTime<Utc>,
}

impl ErrorCandidate {
    pub fn new(
        file_path: Option<String>,
        line: Option<u32>,
        message: impl Into<String>,
        raw_excerpt: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            file_path,
            line,
            message: message.into(),
            raw_excerpt: raw_excerpt.into(),
            detected_at: Utc::now(),
        }
    }
}

/// A recogniser for one log format.
pub trait ErrorProducer: Send + Sync {
    /// Short identifier used in configuration (`[extract] producers`).
    fn name(&self) -> &'static str;

    fn produce<'a>(&'a self, text: &'a str) -> Box<dyn Iterator<Item = ErrorCandidate> + 'a>;
}

/// Ordered set of producers applied to the same text.
pub struct Extractor {
    producers: Vec<Box<dyn ErrorProducer>>,
}

impl Default for Extractor {
    fn default() -> Self {
        Self::new(vec![
            Box::new(PythonTracebackProducer::new()),
            Box::new(LogBlockProducer::new()),
        ])
    }
}

impl Extractor {
    pub fn new(producers: Vec<Box<dyn ErrorProducer>>) -> Self {
        Self { producers }
    }

    /// Build an extractor from producer names. Unknown names are an error so
    /// that a typo in configuration does not silently disable detection.
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> anyhow::Result<Self> {
        let mut producers: Vec<Box<dyn ErrorProducer>> = Vec::new();
        for name in names {
            producers.push(producer_by_name(name.as_ref()).ok_or_else(|| {
                anyhow::anyhow!(
                    "Unknown error producer '{}'. Valid values: {}",
                    name.as_ref(),
                    PRODUCER_NAMES.join(", ")
                )
            })?);
        }
        Ok(Self::new(producers))
    }

    pub fn producer_names(&self) -> Vec<&'static str> {
        self.producers.iter().map(|p| p.name()).collect()
    }

    /// Lazily run every producer over `text`, in order.
    pub fn extract<'a>(&'a self, text: &'a str) -> impl Iterator<Item = ErrorCandidate> + 'a {
        self.producers.iter().flat_map(move |p| p.produce(text))
    }
}

pub const PRODUCER_NAMES: &[&str] = &["python_traceback", "log_block"];

pub fn producer_by_name(name: &str) -> Option<Box<dyn ErrorProducer>> {
    match name {
        "python_traceback" => Some(Box::new(PythonTracebackProducer::new())),
        "log_block" => Some(Box::new(LogBlockProducer::new())),
        _ => None,
    }
}

/// Extract with the default producer set.
pub fn extract(raw: &str) -> impl Iterator<Item = ErrorCandidate> + '_ {
    traceback::TracebackIter::new(raw).chain(log_block::LogBlockIter::new(raw))
}
