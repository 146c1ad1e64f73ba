//! Configuration view and validation commands: `fixloop config`.

use std::path::Path;

use anyhow::Result;
use fixloop::config::{FixloopConfig, FixloopToml, default_config_path};

use super::super::{Cli, ConfigCommands};

pub fn cmd_config(cli: &Cli, project_dir: &Path, command: Option<ConfigCommands>) -> Result<()> {
    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => default_config_path(project_dir),
    };

    match command {
        None | Some(ConfigCommands::Show) => {
            let config = super::load_config(cli, project_dir)?;
            show(&config, config_path.exists())?;
        }
        Some(ConfigCommands::Validate) => {
            let config = super::load_config(cli, project_dir)?;
            println!();
            println!("Validating configuration...");
            if !config_path.exists() {
                println!("No fixloop.toml found. Using defaults.");
            }
            println!();

            let warnings = config.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("{}", console::style("Configuration warnings:").yellow());
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("fixloop.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            FixloopToml::default().save(&config_path)?;

            println!("Created fixloop.toml at {}", config_path.display());
            println!();
            println!("Secrets are read from the environment (or a .env file):");
            println!("  - ANTHROPIC_API_KEY for proposal requests");
            println!("  - GITHUB_TOKEN for cloning and pushing private repositories");
            println!();
        }
    }

    Ok(())
}

fn show(config: &FixloopConfig, from_file: bool) -> Result<()> {
    println!();
    println!("{}", console::style("fixloop configuration").bold());
    println!();
    if from_file {
        println!("Config file: {}", config.config_path.display());
    } else {
        println!(
            "No fixloop.toml at {} (defaults shown)",
            config.config_path.display()
        );
    }
    println!();

    // Effective values, environment overrides included.
    print!("{}", toml::to_string_pretty(&config.toml)?);
    println!();
    println!("Resolved workspace: {}", config.workspace_root().display());
    println!(
        "ANTHROPIC_API_KEY: {}",
        if config.anthropic_api_key.is_some() { "set" } else { "not set" }
    );
    println!(
        "GITHUB_TOKEN: {}",
        if config.github_token.is_some() { "set" } else { "not set" }
    );
    println!();
    Ok(())
}
