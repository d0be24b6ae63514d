//! Configuration view and validation commands: `shardkit config`.

use std::path::Path;

use anyhow::Result;
use console::style;

use super::super::ConfigCommands;
use shardkit::config::ClusterConfig;

pub fn cmd_config(path: &Path, config: &ClusterConfig, command: Option<ConfigCommands>) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("{}", style("Shardkit Configuration").bold().cyan());
            println!();
            println!("Config file: {}", path.display());
            println!();

            // Values after env overrides
            println!("{}", config.to_toml()?);
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            let warnings = config.validate();
            if warnings.is_empty() {
                println!("{}", style("Configuration is valid.").green());
            } else {
                println!("{}", style("Configuration warnings:").yellow());
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
    }

    Ok(())
}
