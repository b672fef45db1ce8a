//! Configuration view and validation: `orchestrate config`.

use anyhow::Result;
use console::style;
use orchestrate::errors::{EXIT_FAILURE, EXIT_OK};

use super::super::{Cli, ConfigCommands};
use super::{load_config, print_json};

pub fn cmd_config(cli: &Cli, command: Option<ConfigCommands>) -> Result<i32> {
    let config = load_config(cli, None)?;

    match command {
        None | Some(ConfigCommands::Show) => {
            if cli.json {
                print_json(config.toml())?;
                return Ok(EXIT_OK);
            }
            println!();
            match config.source {
                Some(ref path) => println!("Config file: {}", path.display()),
                None => println!("No orchestrate.toml found; using defaults"),
            }
            println!("Project:     {}", config.project_dir.display());
            println!("State:       {}", config.state_dir.display());
            println!("Backlog:     {}", config.backlog_file.display());
            println!();
            println!("Effective values (with env/CLI overrides):");
            println!();
            print!("{}", config.toml().to_toml_string()?);
            println!();
            Ok(EXIT_OK)
        }
        Some(ConfigCommands::Validate) => {
            let warnings = config.validate();
            if cli.json {
                print_json(&warnings)?;
            } else if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("{}", style("Configuration warnings:").yellow());
                for warning in &warnings {
                    println!("  - {}", warning);
                }
            }
            Ok(if warnings.is_empty() { EXIT_OK } else { EXIT_FAILURE })
        }
    }
}
