//! Offline extraction command: `fixloop scan <log-file>`.

use std::path::Path;

use anyhow::{Context, Result};
use fixloop::extract::{ErrorCandidate, Extractor};

use super::super::Cli;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

pub fn cmd_scan(cli: &Cli, project_dir: &Path, log_file: &Path, format: OutputFormat) -> Result<()> {
    let config = super::load_config(cli, project_dir)?;
    let extractor = Extractor::from_names(&config.toml.extract.producers)?;

    let text = std::fs::read_to_string(log_file)
        .with_context(|| format!("Failed to read log file {}", log_file.display()))?;
    let candidates: Vec<ErrorCandidate> = extractor.extract(&text).collect();
    tracing::debug!(
        file = %log_file.display(),
        found = candidates.len(),
        producers = ?extractor.producer_names(),
        "scan finished"
    );

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&candidates)?);
        }
        OutputFormat::Text => print_text(&candidates),
    }
    Ok(())
}

fn location(candidate: &ErrorCandidate) -> String {
    match (&candidate.file_path, candidate.line) {
        (Some(path), Some(line)) => format!("{}:{}", path, line),
        (Some(path), None) => path.clone(),
        (None, _) => "<no file>".to_string(),
    }
}

fn print_text(candidates: &[ErrorCandidate]) {
    if candidates.is_empty() {
        println!("No errors found.");
        return;
    }
    println!(
        "{}",
        console::style(format!("Found {} error(s)", candidates.len())).bold()
    );
    for candidate in candidates {
        println!(
            "  {} {}",
            console::style(location(candidate)).cyan(),
            candidate.message
        );
    }
}
