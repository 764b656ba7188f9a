//! Runtime tuning with environment variable support.
//!
//! This module provides [`Config`] for loading and validating ETDK settings
//! from an optional JSON file and environment variables.
//!
//! ## Environment Variables
//!
//! - `ETDK_CONFIG`: Override config file path
//! - `ETDK_FILE_CHUNK_SIZE`: Read size used when streaming regular files
//! - `ETDK_DEVICE_CHUNK_SIZE`: Read size used when streaming block devices
//! - `ETDK_DISPLAY_PAUSE_SECS`: Pause after the key is shown

use crate::streaming::BLOCK_SIZE;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

/// Environment variable names for configuration overrides
pub const ENV_CONFIG_PATH: &str = "ETDK_CONFIG";
pub const ENV_FILE_CHUNK_SIZE: &str = "ETDK_FILE_CHUNK_SIZE";
pub const ENV_DEVICE_CHUNK_SIZE: &str = "ETDK_DEVICE_CHUNK_SIZE";
pub const ENV_DISPLAY_PAUSE_SECS: &str = "ETDK_DISPLAY_PAUSE_SECS";

pub const DEFAULT_FILE_CHUNK_SIZE: usize = 4096;
pub const DEFAULT_DEVICE_CHUNK_SIZE: usize = 1024 * 1024;
pub const DEFAULT_DISPLAY_PAUSE_SECS: u64 = 3;
/// Shortest pause after the key is shown that a config may ask for.
pub const MIN_DISPLAY_PAUSE_SECS: u64 = 3;
pub const DEFAULT_TEMP_SUFFIX: &str = ".tmp_encrypted";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub file_chunk_size: usize,
    pub device_chunk_size: usize,
    pub display_pause_secs: u64,
    pub temp_suffix: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            file_chunk_size: DEFAULT_FILE_CHUNK_SIZE,
            device_chunk_size: DEFAULT_DEVICE_CHUNK_SIZE,
            display_pause_secs: DEFAULT_DISPLAY_PAUSE_SECS,
            temp_suffix: DEFAULT_TEMP_SUFFIX.to_string(),
        }
    }
}

impl Config {
    /// Load config from file path
    pub fn load(path: &str) -> Result<Self> {
        let s =
            fs::read_to_string(path).with_context(|| format!("reading config file {}", path))?;
        let mut config: Config =
            serde_json::from_str(&s).with_context(|| format!("parsing config file {}", path))?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Load config with environment variable overrides
    /// Priority: ENV vars > config file > defaults
    pub fn load_with_env(path: Option<&str>) -> Result<Self> {
        let config_path = path
            .map(String::from)
            .or_else(|| env::var(ENV_CONFIG_PATH).ok());

        let mut config = match config_path {
            Some(ref p) if Path::new(p).exists() => {
                info!(path = p, "loading config from file");
                let s = fs::read_to_string(p)
                    .with_context(|| format!("reading config file {}", p))?;
                serde_json::from_str(&s).with_context(|| format!("parsing config file {}", p))?
            }
            _ => {
                debug!("using default configuration");
                Config::default()
            }
        };

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(size) = env_override::<usize>(ENV_FILE_CHUNK_SIZE)? {
            debug!(file_chunk_size = size, "overriding file_chunk_size from environment");
            self.file_chunk_size = size;
        }

        if let Some(size) = env_override::<usize>(ENV_DEVICE_CHUNK_SIZE)? {
            debug!(device_chunk_size = size, "overriding device_chunk_size from environment");
            self.device_chunk_size = size;
        }

        if let Some(secs) = env_override::<u64>(ENV_DISPLAY_PAUSE_SECS)? {
            debug!(display_pause_secs = secs, "overriding display_pause_secs from environment");
            self.display_pause_secs = secs;
        }

        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.file_chunk_size == 0 {
            anyhow::bail!("file_chunk_size must be greater than zero");
        }

        // Device chunks are written back in place, so every chunk but the last
        // has to end on a cipher block boundary.
        if self.device_chunk_size == 0 || self.device_chunk_size % BLOCK_SIZE != 0 {
            anyhow::bail!(
                "device_chunk_size must be a non-zero multiple of {} (got {})",
                BLOCK_SIZE,
                self.device_chunk_size
            );
        }

        if self.display_pause_secs < MIN_DISPLAY_PAUSE_SECS {
            anyhow::bail!(
                "display_pause_secs must be at least {} (got {})",
                MIN_DISPLAY_PAUSE_SECS,
                self.display_pause_secs
            );
        }

        if self.temp_suffix.is_empty() {
            anyhow::bail!("temp_suffix cannot be empty");
        }

        if self.temp_suffix.contains('/') || self.temp_suffix.contains('\\') {
            anyhow::bail!("temp_suffix must not contain path separators");
        }

        Ok(())
    }

    pub fn display_pause(&self) -> Duration {
        Duration::from_secs(self.display_pause_secs)
    }

    pub fn with_display_pause_secs(mut self, secs: u64) -> Self {
        self.display_pause_secs = secs;
        self
    }

    pub fn with_chunk_sizes(mut self, file_chunk_size: usize, device_chunk_size: usize) -> Self {
        self.file_chunk_size = file_chunk_size;
        self.device_chunk_size = device_chunk_size;
        self
    }
}

fn env_override<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => {
            let value = raw
                .trim()
                .parse::<T>()
                .with_context(|| format!("parsing {}={:?}", name, raw))?;
            Ok(Some(value))
        }
        Err(_) => Ok(None),
    }
}
