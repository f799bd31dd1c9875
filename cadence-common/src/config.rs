//! Configuration file resolution and loading
//!
//! Resolution follows a fixed priority order:
//! 1. Path given on the command line (highest priority)
//! 2. Path named by an environment variable
//! 3. `<user config dir>/<app>/config.toml`
//! 4. Compiled defaults (fallback)
//!
//! Explicitly named files (1 and 2) must exist. The per-user file is only
//! consulted when present, so a fresh install starts on defaults.

use crate::{Error, Result};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// File name looked up inside the per-user config directory
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Where the effective configuration comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    /// Path passed on the command line
    Explicit(PathBuf),
    /// Path read from an environment variable
    Environment(PathBuf),
    /// Per-user config file that exists on disk
    UserConfig(PathBuf),
    /// No file; compiled defaults apply
    Defaults,
}

impl ConfigSource {
    /// File backing this source, if any
    pub fn path(&self) -> Option<&Path> {
        match self {
            ConfigSource::Explicit(path)
            | ConfigSource::Environment(path)
            | ConfigSource::UserConfig(path) => Some(path),
            ConfigSource::Defaults => None,
        }
    }
}

/// Resolve which configuration file to load.
///
/// # Arguments
/// * `cli_arg` - Path from the command line, if given
/// * `env_var_name` - Environment variable holding a config path
/// * `app_dir` - Directory name under the platform config dir
pub fn resolve_config_source(
    cli_arg: Option<&Path>,
    env_var_name: &str,
    app_dir: &str,
) -> ConfigSource {
    // Priority 1: Command-line argument
    if let Some(path) = cli_arg {
        return ConfigSource::Explicit(path.to_path_buf());
    }

    // Priority 2: Environment variable
    if let Ok(path) = std::env::var(env_var_name) {
        if !path.is_empty() {
            return ConfigSource::Environment(PathBuf::from(path));
        }
    }

    // Priority 3: Per-user config file, only if it exists
    if let Some(path) = user_config_path(app_dir) {
        if path.exists() {
            return ConfigSource::UserConfig(path);
        }
        debug!("No user config at {}", path.display());
    }

    // Priority 4: Compiled defaults
    ConfigSource::Defaults
}

/// Platform location of the per-user config file
pub fn user_config_path(app_dir: &str) -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(app_dir).join(CONFIG_FILE_NAME))
}

/// Load a TOML configuration of type `T` from the resolved source.
///
/// Returns `T::default()` for [`ConfigSource::Defaults`].
pub fn load_toml<T>(source: &ConfigSource) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    let path = match source.path() {
        Some(path) => path,
        None => {
            info!("No configuration file found, using compiled defaults");
            return Ok(T::default());
        }
    };

    if !path.exists() {
        return Err(Error::Config(format!(
            "Config file not found: {}",
            path.display()
        )));
    }

    let content = std::fs::read_to_string(path)?;
    if content.trim().is_empty() {
        warn!("Config file {} is empty, using defaults", path.display());
        return Ok(T::default());
    }

    let config = toml::from_str::<T>(&content)?;
    info!("Loaded configuration from {}", path.display());
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_arg_wins() {
        let source = resolve_config_source(
            Some(Path::new("/tmp/cadence-cli.toml")),
            "CADENCE_TEST_UNSET_VARIABLE",
            "cadence",
        );
        assert_eq!(
            source,
            ConfigSource::Explicit(PathBuf::from("/tmp/cadence-cli.toml"))
        );
    }

    #[test]
    fn test_defaults_have_no_path() {
        assert!(ConfigSource::Defaults.path().is_none());
    }

    #[test]
    fn test_user_config_path_ends_with_file_name() {
        if let Some(path) = user_config_path("cadence") {
            assert!(path.ends_with("cadence/config.toml"));
        }
    }
}
