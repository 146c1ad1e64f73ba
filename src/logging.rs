//! Tracing subscriber setup for the CLI.

use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub const LOG_FILE_PREFIX: &str = "fixloop.log";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    pub verbose: bool,
    pub format: LogFormat,
    /// When set, logs go to a daily rolling file in this directory instead
    /// of stderr.
    pub dir: Option<PathBuf>,
}

/// `RUST_LOG` wins; otherwise `debug` for fixloop when verbose, `info` if not.
pub fn env_filter(verbose: bool, rust_log: Option<&str>) -> EnvFilter {
    let fallback = if verbose {
        "fixloop=debug,tower_http=debug,info"
    } else {
        "info"
    };
    match rust_log {
        Some(directives) if !directives.trim().is_empty() => {
            EnvFilter::try_new(directives).unwrap_or_else(|_| EnvFilter::new(fallback))
        }
        _ => EnvFilter::new(fallback),
    }
}

/// Install the global subscriber. Keep the returned guard alive for the life
/// of the process so buffered file output is flushed.
pub fn init(options: &LogOptions) -> Result<Option<WorkerGuard>> {
    let rust_log = std::env::var("RUST_LOG").ok();
    let filter = env_filter(options.verbose, rust_log.as_deref());

    let (writer, guard) = match &options.dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (tracing_subscriber::fmt::writer::BoxMakeWriter::new(writer), Some(guard))
        }
        None => (
            tracing_subscriber::fmt::writer::BoxMakeWriter::new(std::io::stderr),
            None,
        ),
    };
    let ansi = options.dir.is_none();

    let registry = tracing_subscriber::registry().with(filter);
    let result = match options.format {
        LogFormat::Text => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(writer)
                    .with_ansi(ansi)
                    .with_target(false),
            )
            .try_init(),
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(writer)
                    .with_current_span(false),
            )
            .try_init(),
    };
    result.context("Failed to install tracing subscriber")?;
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_filter_prefers_rust_log() {
        let filter = env_filter(false, Some("fixloop=trace"));
        assert_eq!(filter.to_string(), "fixloop=trace");
    }

    #[test]
    fn test_env_filter_verbose_fallback() {
        assert!(env_filter(true, None).to_string().contains("fixloop=debug"));
        assert_eq!(env_filter(false, Some("  ")).to_string(), "info");
    }

    #[test]
    fn test_log_format_default_is_text() {
        assert_eq!(LogFormat::default(), LogFormat::Text);
    }
}
