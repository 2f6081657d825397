//! Configuration view and validation commands: `dispatch config`.

use anyhow::{Context, Result};
use dispatch::config::DispatchConfig;

use super::super::ConfigCommands;

pub fn cmd_config(config: &DispatchConfig, command: Option<ConfigCommands>) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            println!("# Effective configuration (file, environment and flags)");
            let mut shown = config.clone();
            if shown.server.webhook_secret.is_some() {
                shown.server.webhook_secret = Some("<redacted>".into());
            }
            print!(
                "{}",
                toml::to_string_pretty(&shown).context("Failed to render configuration")?
            );
        }
        Some(ConfigCommands::Validate) => {
            let warnings = config.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
                return Ok(());
            }
            for warning in &warnings {
                println!("  - {}", warning);
            }
            anyhow::bail!("Configuration has {} problem(s)", warnings.len());
        }
    }
    Ok(())
}
