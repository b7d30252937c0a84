//! Configuration loading for midifeed.
//!
//! Values are layered, later sources winning:
//!
//! 1. Compiled defaults
//! 2. `/etc/midifeed/config.toml` (system)
//! 3. `~/.config/midifeed/config.toml` (user)
//! 4. `./midifeed.toml`, or the path given with `--config`
//! 5. Environment variables (`MIDIFEED_*`)
//!
//! Command-line flags are applied by the binary on top of the result.
//!
//! # Example Config
//!
//! ```toml
//! verbose = false
//!
//! [device]
//! keywords = ["SAP200", "MEDELI", "MIDI"]
//! retry_ms = 1000
//!
//! [normalize]
//! hold_threshold_s = 0.6
//!
//! [capture]
//! prefix = "midi_capture"
//! dir = "~/midi/logs"
//! capture_all = false
//!
//! [server]
//! bind = "0.0.0.0"
//! port = 8766
//! keep_alive_secs = 15
//! queue_capacity = 2048
//!
//! [telemetry]
//! log_level = "info"
//! ```

pub mod loader;
pub mod sections;

pub use loader::{discover_config_files_with_override, ConfigSources};
pub use sections::{CaptureConfig, DeviceConfig, NormalizeConfig, ServerConfig, TelemetryConfig};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Complete midifeed configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct FeedConfig {
    /// Print every event as it arrives.
    #[serde(default)]
    pub verbose: bool,

    #[serde(default)]
    pub device: DeviceConfig,

    #[serde(default)]
    pub normalize: NormalizeConfig,

    #[serde(default)]
    pub capture: CaptureConfig,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl FeedConfig {
    /// Load configuration from all standard sources.
    pub fn load() -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(None)?;
        Ok(config)
    }

    /// Load configuration with an explicit file taking the place of
    /// `./midifeed.toml`. System and user files still load first.
    pub fn load_from(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(config_path)?;
        Ok(config)
    }

    /// Load configuration and report which files and variables contributed.
    pub fn load_with_sources_from(
        config_path: Option<&Path>,
    ) -> Result<(Self, ConfigSources), ConfigError> {
        let mut sources = ConfigSources::default();
        let mut config = FeedConfig::default();

        for path in loader::discover_config_files_with_override(config_path) {
            loader::overlay_file(&mut config, &path)?;
            sources.files.push(path);
        }

        loader::apply_env_overrides(&mut config, &mut sources);

        Ok((config, sources))
    }

    /// Serialize config to a TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        let body = toml::to_string_pretty(self)?;
        Ok(format!("# midifeed configuration\n\n{}", body))
    }
}
