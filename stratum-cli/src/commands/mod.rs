//! CLI command implementations.

pub mod config;
pub mod record;
pub mod stress;
pub mod version;

use anyhow::{Context, Result};
use std::path::Path;
use stratum_core::DeviceConfig;

/// Load a configuration file, or defaults overlaid with the environment.
pub fn load_config(file: Option<&Path>) -> Result<DeviceConfig> {
    let config = match file {
        Some(path) => DeviceConfig::from_yaml_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => DeviceConfig::from_env().context("Invalid STRATUM_* environment variable")?,
    };
    config.validate().context("Invalid device configuration")?;
    Ok(config)
}
