//! Configuration loading and root folder resolution
//!
//! Bootstrap configuration is a TOML file per service. Values resolve with
//! the priority: command-line argument → environment variable → TOML file →
//! OS-dependent compiled default.

use crate::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Logging configuration shared by all services
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level or full EnvFilter directive (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Root folder resolution:
/// 1. Command-line argument (highest priority)
/// 2. Environment variable
/// 3. `root_folder` key of the TOML config file
/// 4. OS-dependent compiled default (fallback)
pub fn resolve_root_folder(
    cli_arg: Option<&Path>,
    env_var_name: &str,
    toml_root: Option<&Path>,
) -> PathBuf {
    if let Some(path) = cli_arg {
        return path.to_path_buf();
    }

    if let Ok(path) = std::env::var(env_var_name) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }

    if let Some(path) = toml_root {
        return path.to_path_buf();
    }

    get_default_root_folder()
}

/// Default per-user TOML config path for a service (`~/.config/critique/<service>.toml`)
pub fn default_config_path(service_name: &str) -> Result<PathBuf> {
    dirs::config_dir()
        .map(|d| d.join("critique").join(format!("{}.toml", service_name)))
        .ok_or_else(|| Error::Config("Could not determine config directory".to_string()))
}

/// Get OS-dependent default root folder path
fn get_default_root_folder() -> PathBuf {
    if cfg!(target_os = "linux") {
        dirs::data_local_dir()
            .map(|d| d.join("critique"))
            .unwrap_or_else(|| PathBuf::from("/var/lib/critique"))
    } else if cfg!(target_os = "macos") {
        dirs::data_dir()
            .map(|d| d.join("critique"))
            .unwrap_or_else(|| PathBuf::from("/Library/Application Support/critique"))
    } else if cfg!(target_os = "windows") {
        dirs::data_local_dir()
            .map(|d| d.join("critique"))
            .unwrap_or_else(|| PathBuf::from("C:\\ProgramData\\critique"))
    } else {
        PathBuf::from("./critique_data")
    }
}

/// Load and parse a TOML config file
///
/// A missing file yields `Ok(None)` so callers can fall back to defaults.
pub fn load_toml_config<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        tracing::debug!(path = %path.display(), "No TOML config file, using defaults");
        return Ok(None);
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Read TOML failed ({}): {}", path.display(), e)))?;
    let parsed = toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Parse TOML failed ({}): {}", path.display(), e)))?;

    tracing::info!(path = %path.display(), "Loaded TOML config");
    Ok(Some(parsed))
}

/// Serialize and write a TOML config file atomically (temp file + rename)
pub fn write_toml_config<T: Serialize>(config: &T, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)
        .map_err(|e| Error::Config(format!("Serialize TOML failed: {}", e)))?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let tmp_path = path.with_extension("toml.tmp");
    std::fs::write(&tmp_path, content)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}
