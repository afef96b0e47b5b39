//! Config command - print the effective device configuration.

use super::load_config;
use anyhow::{Context, Result};
use std::path::Path;

/// Run the config command.
pub fn run(file: Option<&Path>) -> Result<()> {
    let config = load_config(file)?;
    tracing::info!(source = ?file, "Loaded configuration");
    let yaml = config.to_yaml().context("Failed to serialize configuration")?;
    print!("{}", yaml);
    Ok(())
}
