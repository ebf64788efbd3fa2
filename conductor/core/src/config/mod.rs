//! TOML Configuration File Support
//!
//! Configuration is read from `~/.config/storyloom/storyloom.toml`.
//!
//! # Configuration Priority
//!
//! Values are applied with the following priority (highest first):
//! 1. CLI arguments ([`ConfigOverrides`])
//! 2. Environment variables
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [backend]
//! host = "localhost"
//! port = 5001
//! connect_timeout_ms = 10000
//!
//! [sampler]
//! max_context_length = 4096
//! top_p = 0.9
//!
//! [typing]
//! base_time_ms = 200
//! damping = 0.9
//! stall_timeout_secs = 120   # 0 disables the watchdog
//!
//! [storage]
//! save_path = "/home/me/stories/save.json"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::{SamplerSettings, DEFAULT_HOST, DEFAULT_PORT};
use crate::typing::TypingConfig;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where a configuration value came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// Backend section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendToml {
    /// KoboldCpp host
    pub host: Option<String>,
    /// KoboldCpp port
    pub port: Option<u16>,
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: Option<u64>,
}

/// Typing section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TypingToml {
    /// Base delay per character in milliseconds
    pub base_time_ms: Option<u64>,
    /// Catch-up factor
    pub damping: Option<f64>,
    /// Stall watchdog in seconds (0 = disabled)
    pub stall_timeout_secs: Option<u64>,
}

/// Storage section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageToml {
    /// Save file location
    pub save_path: Option<PathBuf>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoryloomToml {
    /// Backend section
    pub backend: BackendToml,
    /// Sampler settings (missing keys keep their defaults)
    pub sampler: Option<SamplerSettings>,
    /// Typing section
    pub typing: TypingToml,
    /// Storage section
    pub storage: StorageToml,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Backend connection settings
#[derive(Clone, Debug, PartialEq)]
pub struct BackendConfig {
    /// KoboldCpp host
    pub host: String,
    /// KoboldCpp port
    pub port: u16,
    /// Connection timeout
    pub connect_timeout: Duration,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Resolved storyloom configuration
#[derive(Clone, Debug)]
pub struct StoryloomConfig {
    /// Backend connection
    pub backend: BackendConfig,
    /// Sampler settings
    pub sampler: SamplerSettings,
    /// Typing engine tunables
    pub typing: TypingConfig,
    /// Save file location (None when no data directory is known)
    pub save_path: Option<PathBuf>,
    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,
    /// Highest-priority source that set a value
    source: ConfigSource,
}

impl Default for StoryloomConfig {
    fn default() -> Self {
        Self {
            backend: BackendConfig::default(),
            sampler: SamplerSettings::default(),
            typing: TypingConfig::default(),
            save_path: default_save_path(),
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl StoryloomConfig {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backend.port == 0 {
            return Err(ConfigError::ValidationError(
                "backend port must not be 0".to_string(),
            ));
        }
        if self.typing.base_time.is_zero() {
            return Err(ConfigError::ValidationError(
                "typing base time must be greater than 0".to_string(),
            ));
        }
        let damping = self.typing.damping;
        if !(damping > 0.0 && damping < 1.0) {
            return Err(ConfigError::ValidationError(format!(
                "typing damping must be between 0 and 1 (got {damping})"
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/storyloom/storyloom.toml`.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("storyloom").join("storyloom.toml"))
}

/// Get the default save file path
///
/// Returns `$XDG_DATA_HOME/storyloom/save.json`.
#[must_use]
pub fn default_save_path() -> Option<PathBuf> {
    dirs::data_dir().map(|p| p.join("storyloom").join("save.json"))
}

/// Load configuration from the default path and the process environment
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed, or if
/// the resulting values are out of range. A missing config file is not an
/// error (defaults are used).
pub fn load_config() -> Result<StoryloomConfig, ConfigError> {
    load_config_from_path(default_config_path().as_deref())
}

/// Load configuration from a specific path and the process environment
pub fn load_config_from_path(path: Option<&Path>) -> Result<StoryloomConfig, ConfigError> {
    load_config_with_env(path, |key| std::env::var(key).ok())
}

/// Load configuration with an explicit environment lookup
pub fn load_config_with_env(
    path: Option<&Path>,
    env: impl Fn(&str) -> Option<String>,
) -> Result<StoryloomConfig, ConfigError> {
    let mut config = StoryloomConfig::default();

    if let Some(config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.to_path_buf(),
                    source: e,
                })?;

            let toml_config: StoryloomToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, toml_config);
            config.config_file_path = Some(config_path.to_path_buf());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config, env)?;
    config.validate()?;
    Ok(config)
}

/// Apply TOML configuration values to the config struct
fn apply_toml_config(config: &mut StoryloomConfig, toml: StoryloomToml) {
    if let Some(host) = toml.backend.host {
        config.backend.host = host;
    }
    if let Some(port) = toml.backend.port {
        config.backend.port = port;
    }
    if let Some(ms) = toml.backend.connect_timeout_ms {
        config.backend.connect_timeout = Duration::from_millis(ms);
    }

    if let Some(sampler) = toml.sampler {
        config.sampler = sampler;
    }

    if let Some(ms) = toml.typing.base_time_ms {
        config.typing.base_time = Duration::from_millis(ms);
    }
    if let Some(damping) = toml.typing.damping {
        config.typing.damping = damping;
    }
    if let Some(secs) = toml.typing.stall_timeout_secs {
        config.typing.stall_timeout = stall_timeout(secs);
    }

    if let Some(path) = toml.storage.save_path {
        config.save_path = Some(path);
    }
}

/// Apply environment variable overrides to the config
///
/// Unparseable numbers are an error rather than silently ignored.
fn apply_env_config(
    config: &mut StoryloomConfig,
    env: impl Fn(&str) -> Option<String>,
) -> Result<(), ConfigError> {
    if let Some(host) = env("KOBOLD_HOST") {
        config.backend.host = host;
        config.source = ConfigSource::Env;
    }
    if let Some(port) = env("KOBOLD_PORT") {
        config.backend.port = parse_env("KOBOLD_PORT", &port)?;
        config.source = ConfigSource::Env;
    }
    if let Some(path) = env("STORYLOOM_SAVE_PATH") {
        config.save_path = Some(PathBuf::from(path));
        config.source = ConfigSource::Env;
    }
    if let Some(ms) = env("STORYLOOM_BASE_TYPING_MS") {
        config.typing.base_time =
            Duration::from_millis(parse_env("STORYLOOM_BASE_TYPING_MS", &ms)?);
        config.source = ConfigSource::Env;
    }
    if let Some(damping) = env("STORYLOOM_TYPING_DAMPING") {
        config.typing.damping = parse_env("STORYLOOM_TYPING_DAMPING", &damping)?;
        config.source = ConfigSource::Env;
    }
    if let Some(secs) = env("STORYLOOM_STALL_TIMEOUT") {
        config.typing.stall_timeout = stall_timeout(parse_env("STORYLOOM_STALL_TIMEOUT", &secs)?);
        config.source = ConfigSource::Env;
    }
    Ok(())
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::ValidationError(format!("{key}={value:?} is not a valid value")))
}

fn stall_timeout(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Builder for applying CLI overrides to configuration
///
/// Use this after [`load_config`] to apply command-line argument overrides.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Host override
    pub host: Option<String>,
    /// Port override
    pub port: Option<u16>,
    /// Save path override
    pub save_path: Option<PathBuf>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set host override
    #[must_use]
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Set port override
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Set save path override
    #[must_use]
    pub fn with_save_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.save_path = Some(path.into());
        self
    }

    /// Apply overrides to a configuration and re-validate it
    pub fn apply(&self, config: &mut StoryloomConfig) -> Result<(), ConfigError> {
        if self.host.is_some() || self.port.is_some() || self.save_path.is_some() {
            config.source = ConfigSource::Cli;
        }
        if let Some(host) = &self.host {
            config.backend.host = host.clone();
        }
        if let Some(port) = self.port {
            config.backend.port = port;
        }
        if let Some(path) = &self.save_path {
            config.save_path = Some(path.clone());
        }
        config.validate()
    }
}

// =============================================================================
// Tests
// =============================================================================
