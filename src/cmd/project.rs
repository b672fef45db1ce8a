//! Project setup: `orchestrate init`.

use anyhow::Result;
use console::style;
use orchestrate::errors::EXIT_OK;
use orchestrate::init::init_project;
use orchestrate::ui;

use super::super::Cli;
use super::{load_config, print_json};

pub fn cmd_init(cli: &Cli) -> Result<i32> {
    let config = load_config(cli, None)?;
    let result = init_project(&config)?;

    if cli.json {
        print_json(&serde_json::json!({
            "state_dir": result.state_dir,
            "created": result.created,
        }))?;
        return Ok(EXIT_OK);
    }

    println!("{}Initialized {}", ui::CHECK, result.state_dir.display());
    if result.created.is_empty() {
        println!("  {}", style("already initialized; nothing written").dim());
    }
    for path in &result.created {
        println!("  created {}", path.display());
    }
    println!();
    println!("Next steps:");
    println!("  1. Add tasks to {}", config.backlog_file.display());
    println!("  2. Point [executor] command at your agent CLI");
    println!("  3. Run `orchestrate program --dry-run` to check the order");
    Ok(EXIT_OK)
}
