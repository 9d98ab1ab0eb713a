//! Configuration view and validation commands: `warden config`.

use anyhow::Result;
use std::path::Path;

use super::super::ConfigCommands;
use warden::config::Settings;

pub fn cmd_config(config_path: &Path, command: Option<ConfigCommands>) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Warden Configuration");
            println!("====================");
            println!();

            let settings = if config_path.exists() {
                println!("Config file: {}", config_path.display());
                Settings::load(config_path)?
            } else {
                println!("No settings file at {}", config_path.display());
                println!("Using default configuration:");
                Settings::load_or_default(config_path)?
            };
            println!();
            print!("{}", toml::to_string_pretty(&settings)?);
            println!();

            println!("Effective values (with env overrides):");
            println!("  listen = \"{}\"", settings.bind_addr());
            println!("  binaries_dir = \"{}\"", settings.binaries_dir().display());
            println!("  data_dir = \"{}\"", settings.data_dir().display());
            println!("  state_file = \"{}\"", settings.state_file().display());
            if let Some(ui) = settings.ui_dir() {
                println!("  ui_dir = \"{}\"", ui.display());
            }
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No settings file found. Using defaults (valid).");
                return Ok(());
            }

            let settings = Settings::load(config_path)?;
            let warnings = settings.validate();

            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
    }

    Ok(())
}
