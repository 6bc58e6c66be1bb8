//! Configuration file IO.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use dirs_next::config_dir;
use runway_util::expand_tilde;

use super::{RunwayConfig, validate_config};

/// Environment variable overriding the configuration file location.
pub const CONFIG_PATH_ENV: &str = "RUNWAY_CONFIG_PATH";

/// Returns the default path for the configuration file.
pub fn default_config_path() -> PathBuf {
    if let Ok(path) = env::var(CONFIG_PATH_ENV)
        && !path.trim().is_empty()
    {
        return expand_tilde(&path);
    }

    config_dir().unwrap_or_else(|| PathBuf::from(".")).join("runway").join("config.json")
}

/// Loads configuration from the default path.
pub fn load_config() -> anyhow::Result<RunwayConfig> {
    load_config_from_path(&default_config_path())
}

/// Loads configuration from a specific path; a missing file yields defaults.
pub fn load_config_from_path(path: &Path) -> anyhow::Result<RunwayConfig> {
    if !path.exists() {
        return Ok(RunwayConfig::default());
    }

    let content = fs::read_to_string(path).with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: RunwayConfig =
        serde_json::from_str(&content).with_context(|| format!("failed to parse config file {}", path.display()))?;
    validate_config(&config)?;
    Ok(config)
}
