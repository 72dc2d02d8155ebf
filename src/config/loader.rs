// src/config/loader.rs

use std::fs;
use std::path::Path;

use crate::config::model::{RawRunConfig, RunConfig};
use crate::errors::Result;

/// Read a run configuration file without semantic validation.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<RawRunConfig> {
    let contents = fs::read_to_string(path.as_ref())?;
    let config: RawRunConfig = toml::from_str(&contents)?;
    Ok(config)
}

/// Read and validate a run configuration file.
///
/// Node-level checks (unknown handles, config schemas) need the graph and
/// happen at compile time instead.
pub fn load_and_validate(path: impl AsRef<Path>) -> Result<RunConfig> {
    let raw = load_from_path(path)?;
    RunConfig::try_from(raw)
}

/// Parse and validate a run configuration from a TOML string.
pub fn parse_run_config(contents: &str) -> Result<RunConfig> {
    let raw: RawRunConfig = toml::from_str(contents)?;
    RunConfig::try_from(raw)
}
