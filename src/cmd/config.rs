//! Configuration view and validation commands: `phasegraph config`.

use anyhow::Result;

use phasegraph::engine_config::PhasegraphConfig;

use super::super::ConfigCommands;

pub fn cmd_config(config: &PhasegraphConfig, command: Option<ConfigCommands>) -> Result<()> {
    let config_path = config.config_file();

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Phasegraph Configuration");
            println!("========================");
            println!();

            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No config file found at {}", config_path.display());
                println!("Using defaults. Run 'phasegraph init' to create one.");
            }
            println!();

            let toml = &config.toml;
            println!("[engine]");
            println!("  max_parallel = {}", toml.engine.max_parallel);
            println!("  stall_timeout_secs = {}", toml.engine.stall_timeout_secs);
            println!("  poll_interval_ms = {}", toml.engine.poll_interval_ms);
            println!();

            println!("[decomposition]");
            println!("  enabled = {}", toml.decomposition.enabled);
            println!("  autonomous = {}", toml.decomposition.autonomous);
            println!(
                "  large_deliverable_count = {}",
                toml.decomposition.large_deliverable_count
            );
            println!("  small_change_max = {}", toml.decomposition.small_change_max);
            println!();

            println!("[store]");
            println!("  path = \"{}\"", toml.store.path.display());
            println!();

            println!("[logging]");
            println!("  format = \"{}\"", toml.logging.format);
            println!("  file = {}", toml.logging.file);
            println!();

            // Values after environment and CLI overrides
            println!("Effective:");
            println!("  max_parallel = {}", config.max_parallel());
            println!("  stall_timeout = {}s", config.stall_timeout().as_secs());
            println!("  poll_interval = {}ms", config.poll_interval().as_millis());
            println!("  autonomous = {}", config.autonomous());
            println!("  log_format = \"{}\"", config.log_format());
        }
        Some(ConfigCommands::Validate) => {
            if config_path.exists() {
                println!("Validating: {}", config_path.display());
            } else {
                println!("No config file found; validating defaults.");
            }

            let warnings = config.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!();
                println!("Warnings:");
                for warning in &warnings {
                    println!("  - {}", warning);
                }
            }
        }
    }

    Ok(())
}
