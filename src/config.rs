//! Configuration System
//!
//! Handles loading configuration from files and environment variables.
//! Supports TOML config files and environment variable overrides.

use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub backend: BackendConfig,

    #[serde(default)]
    pub downsample: DownsampleConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Data stream backend selection
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BackendConfig {
    /// Backend name: "memory" or "none". Absent means no backend.
    pub kind: Option<String>,

    /// Snapshot directory for the memory backend
    pub data_dir: Option<PathBuf>,
}

/// Background downsampling configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DownsampleConfig {
    #[serde(default = "default_downsample_enabled")]
    pub enabled: bool,

    #[serde(default = "default_downsample_interval")]
    pub interval_secs: u64,
}

fn default_downsample_enabled() -> bool {
    true
}

fn default_downsample_interval() -> u64 {
    60
}

impl Default for DownsampleConfig {
    fn default() -> Self {
        Self {
            enabled: default_downsample_enabled(),
            interval_secs: default_downsample_interval(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        Self::parse(&content).map_err(|e| match e {
            ConfigError::Parse { error, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                error,
            },
            other => other,
        })
    }

    /// Parse configuration from TOML text
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: PathBuf::new(),
            error: e.to_string(),
        })
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env_overrides();
        config
    }

    /// Load configuration with environment variable overrides
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from default locations or environment
    pub fn load_default() -> Self {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("datastream").join("config.toml")),
            Some(PathBuf::from("/etc/datastream/config.toml")),
            Some(PathBuf::from("./datastream.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                match Self::load_with_env(path) {
                    Ok(config) => {
                        tracing::info!("Loaded config from {:?}", path);
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load config from {:?}: {}", path, e);
                    }
                }
            }
        }

        tracing::info!("Using default config with environment overrides");
        Self::from_env()
    }

    /// Default snapshot directory for the memory backend
    pub fn default_data_dir() -> PathBuf {
        dirs::data_local_dir()
            .map(|p| p.join("datastream"))
            .unwrap_or_else(|| PathBuf::from("./datastream_data"))
    }

    /// Apply environment variable overrides to an existing config
    fn apply_env_overrides(&mut self) {
        if let Ok(kind) = std::env::var("DATASTREAM_BACKEND") {
            self.backend.kind = Some(kind);
        }
        if let Ok(data_dir) = std::env::var("DATASTREAM_DATA_DIR") {
            self.backend.data_dir = Some(PathBuf::from(data_dir));
        }

        if let Ok(level) = std::env::var("DATASTREAM_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("DATASTREAM_LOG_FORMAT") {
            self.logging.format = format;
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse config file {path:?}: {error}")]
    Parse { path: PathBuf, error: String },
}

/// Generate a default config file content
pub fn generate_default_config() -> String {
    r#"# Datastream Configuration
#
# Environment variables override these settings:
# - DATASTREAM_BACKEND
# - DATASTREAM_DATA_DIR
# - DATASTREAM_LOG_LEVEL
# - DATASTREAM_LOG_FORMAT

[backend]
# Backend: "memory" or "none". Without a backend every read is empty
# and every write is dropped.
kind = "memory"

# Snapshot directory for the memory backend (omit to keep data in memory only)
data_dir = "./datastream_data"

[downsample]
# Periodically roll closed buckets into coarser granularities
enabled = true

# How often to downsample all metrics (seconds)
interval_secs = 60

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log format: pretty (for development) or json (for production)
format = "pretty"
"#
    .to_string()
}
