//! Configuration for shfrp.
//!
//! Settings live in an optional `shfrp.toml` inside the data directory (or
//! wherever `--config` points). Command-line flags override them.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Top-level configuration structure corresponding to `shfrp.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Shell used to run commands (default: /bin/bash).
    pub shell: Option<String>,
    /// Whether to kill a running command when an update supersedes it.
    pub kill: Option<bool>,
    /// Whether to print commands instead of running them.
    pub echo: Option<bool>,
    /// Log filter directive (e.g. "shfrp=debug").
    pub log: Option<String>,
}

/// Loads and parses the configuration from a file path.
pub fn load_config(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: Config = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    Ok(config)
}

/// Like [`load_config`], but a missing file yields the defaults.
pub fn load_optional(path: &Path) -> Result<Config> {
    if path.exists() {
        load_config(path)
    } else {
        Ok(Config::default())
    }
}
