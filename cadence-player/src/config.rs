//! cadence-player specific configuration

use crate::error::{Error, Result};
use cadence_common::config::{load_toml, resolve_config_source};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Environment variable naming a config file
pub const CONFIG_ENV_VAR: &str = "CADENCE_CONFIG";

/// Directory under the platform config dir
pub const CONFIG_APP_DIR: &str = "cadence";

/// Playback pipeline tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    /// Period of the decoder update job in milliseconds
    pub update_interval_ms: u64,

    /// Buffered sample count above which the native pipeline is paused
    pub high_water_mark: usize,

    /// Buffered sample count below which a paused pipeline resumes
    pub low_water_mark: usize,

    /// Number of frame slots in the video frame pool
    pub frame_pool_size: usize,

    /// Inputs the loopback backend queues before signalling enough-data
    pub feed_queue_limit: usize,

    /// Emit Float32 audio samples when true, Int16 otherwise
    pub prefer_float_samples: bool,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            update_interval_ms: 5,
            high_water_mark: 60,
            low_water_mark: 30,
            frame_pool_size: 26,
            feed_queue_limit: 4,
            prefer_float_samples: true,
        }
    }
}

impl PlayerConfig {
    /// Resolve, load and validate the player configuration.
    ///
    /// `explicit` is the `--config` path from the command line, if any.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let source = resolve_config_source(explicit, CONFIG_ENV_VAR, CONFIG_APP_DIR);
        debug!("Player config source: {:?}", source);
        let config: PlayerConfig = load_toml(&source)?;
        config.validate()?;
        Ok(config)
    }

    /// Check invariants the pipeline relies on
    pub fn validate(&self) -> Result<()> {
        if self.update_interval_ms == 0 {
            return Err(Error::Config("update_interval_ms must be > 0".to_string()));
        }
        if self.frame_pool_size == 0 {
            return Err(Error::Config("frame_pool_size must be > 0".to_string()));
        }
        if self.feed_queue_limit == 0 {
            return Err(Error::Config("feed_queue_limit must be > 0".to_string()));
        }
        if self.low_water_mark >= self.high_water_mark {
            return Err(Error::Config(format!(
                "low_water_mark ({}) must be below high_water_mark ({})",
                self.low_water_mark, self.high_water_mark
            )));
        }
        Ok(())
    }

    /// Update job period
    pub fn update_interval(&self) -> Duration {
        Duration::from_millis(self.update_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = PlayerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.update_interval(), Duration::from_millis(5));
        assert_eq!(config.frame_pool_size, 26);
    }

    #[test]
    fn test_inverted_watermarks_rejected() {
        let config = PlayerConfig {
            high_water_mark: 10,
            low_water_mark: 10,
            ..PlayerConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let config = PlayerConfig {
            update_interval_ms: 0,
            ..PlayerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_pool_rejected() {
        let config = PlayerConfig {
            frame_pool_size: 0,
            ..PlayerConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
