use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use fixloop::logging::{LogFormat, LogOptions};

mod cmd;

#[derive(Parser)]
#[command(name = "fixloop")]
#[command(version, about = "Turn error logs into reviewed, pushed fix branches")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to fixloop.toml (defaults to .fixloop/fixloop.toml in the project directory)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[arg(long, value_enum, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Write logs to a daily rolling file in this directory instead of stderr
    #[arg(long, global = true)]
    pub log_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP service
    Serve {
        #[arg(long)]
        host: Option<String>,

        #[arg(short, long)]
        port: Option<u16>,

        /// Enable dev mode (permissive CORS for a UI on another origin)
        #[arg(long)]
        dev: bool,
    },
    /// Extract error candidates from a log file without creating attempts
    Scan {
        log_file: PathBuf,

        #[arg(long, value_enum, default_value = "text")]
        format: cmd::scan::OutputFormat,
    },
    /// View, create or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write a default fixloop.toml
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is normal.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let _log_guard = fixloop::logging::init(&LogOptions {
        verbose: cli.verbose,
        format: cli.log_format,
        dir: cli.log_dir.clone(),
    })?;

    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Serve { host, port, dev } => {
            cmd::cmd_serve(&cli, &project_dir, host.clone(), *port, *dev).await?
        }
        Commands::Scan { log_file, format } => cmd::cmd_scan(&cli, &project_dir, log_file, *format)?,
        Commands::Config { command } => cmd::cmd_config(&cli, &project_dir, command.clone())?,
    }

    Ok(())
}
