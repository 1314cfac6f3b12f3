//! Configuration management.

use serde::Deserialize;

/// Main engine configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Engine tuning
    #[serde(default)]
    pub engine: EngineConfig,

    /// Preference persistence
    #[serde(default)]
    pub preferences: PreferencesConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Capacity of the aggregate-update broadcast channel
    #[serde(default = "default_update_channel_capacity")]
    pub update_channel_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            update_channel_capacity: default_update_channel_capacity(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PreferencesConfig {
    /// Path of the JSON preference file; unset means in-memory only
    pub path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level filter
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default)]
    pub json_logging: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logging: false,
        }
    }
}

// Default value functions
fn default_update_channel_capacity() -> usize {
    64
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from the environment.
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("CALLBOARD").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        Ok(cfg)
    }

    /// Load from a specific file path, with environment overrides.
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("CALLBOARD").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        Ok(cfg)
    }
}
