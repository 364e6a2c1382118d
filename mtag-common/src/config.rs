//! Configuration file loading and data folder resolution

use crate::{Error, Result};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Directory name used under the platform config/data directories
pub const APP_DIR_NAME: &str = "mtag";

/// Config file resolution priority order:
/// 1. Command-line argument (highest priority)
/// 2. Environment variable
/// 3. Platform config directory (`<config_dir>/mtag/<file_name>`), if the file exists
///
/// Returns `None` when no config file is available; callers fall back to
/// built-in defaults.
pub fn resolve_config_path(
    cli_arg: Option<&Path>,
    env_var_name: &str,
    file_name: &str,
) -> Option<PathBuf> {
    // Priority 1: Command-line argument
    if let Some(path) = cli_arg {
        return Some(path.to_path_buf());
    }

    // Priority 2: Environment variable
    if let Ok(path) = std::env::var(env_var_name) {
        if !path.trim().is_empty() {
            return Some(PathBuf::from(path));
        }
    }

    // Priority 3: Platform config directory
    let candidates = [
        dirs::config_dir().map(|d| d.join(APP_DIR_NAME).join(file_name)),
        Some(PathBuf::from("/etc").join(APP_DIR_NAME).join(file_name)),
    ];
    candidates.into_iter().flatten().find(|path| path.exists())
}

/// Get OS-dependent default data folder
pub fn default_data_folder() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join(APP_DIR_NAME))
        .unwrap_or_else(|| PathBuf::from("./mtag_data"))
}

/// Load a TOML config file, or defaults when `path` is `None`
///
/// A path that was given explicitly but cannot be read or parsed is an error;
/// silently ignoring it would hide a misconfiguration.
pub fn load_toml_config<T>(path: Option<&Path>) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    let Some(path) = path else {
        debug!("No config file found, using built-in defaults");
        return Ok(T::default());
    };

    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Read {} failed: {}", path.display(), e)))?;
    let config = toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Parse {} failed: {}", path.display(), e)))?;

    info!("Configuration loaded from {}", path.display());
    Ok(config)
}
