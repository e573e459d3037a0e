//! Locating and reading the RON configuration file

use std::path::{Path, PathBuf};

use crate::Inbound;

/// Environment variable naming the configuration file
pub const CONFIG_ENV: &str = "INBOUND_CONFIG";

/// Find the configuration file using the following precedence:
/// 1. `INBOUND_CONFIG` environment variable
/// 2. ./inbound.config.ron (current working directory)
/// 3. /etc/inbound/inbound.config.ron (system-wide config)
///
/// # Errors
///
/// If `INBOUND_CONFIG` names a missing file, or none of the default paths exist
pub fn find_config_file() -> anyhow::Result<PathBuf> {
    if let Ok(env_path) = std::env::var(CONFIG_ENV) {
        let path = PathBuf::from(env_path);
        if path.exists() {
            return Ok(path);
        }
        anyhow::bail!("{CONFIG_ENV} points to non-existent file: {}", path.display());
    }

    let default_paths = [
        PathBuf::from("./inbound.config.ron"),
        PathBuf::from("/etc/inbound/inbound.config.ron"),
    ];

    if let Some(path) = default_paths.iter().find(|path| path.exists()) {
        return Ok(path.clone());
    }

    let paths_tried = default_paths
        .iter()
        .map(|p| format!("  - {}", p.display()))
        .collect::<Vec<_>>()
        .join("\n");

    anyhow::bail!(
        "No configuration file found. Tried:\n  - {CONFIG_ENV} environment variable\n{paths_tried}"
    )
}

/// Read and parse the configuration at `path`
///
/// # Errors
///
/// If the file cannot be read or is not a valid configuration
pub fn load(path: &Path) -> anyhow::Result<Inbound> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        anyhow::anyhow!("Failed to read config from {}: {e}", path.display())
    })?;

    ron::from_str(&content)
        .map_err(|e| anyhow::anyhow!("Invalid config in {}: {e}", path.display()))
}
