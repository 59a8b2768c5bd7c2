//! Application configuration.
//!
//! Aggregates configuration into a single Config struct that can be loaded
//! from YAML files or environment variables.

mod connection;

pub use connection::{
    ConfigError, ConnectionOptions, Endpoint, NodeAddress, ResolvedOptions, DEFAULT_PORT,
};

use std::time::Duration;

use serde::Deserialize;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "CLUSTERBUS_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "CLUSTERBUS";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "CLUSTERBUS_LOG";

/// Main application configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Identity of this server within the cluster. Stamped on every outgoing
    /// envelope and compared against inbound origins and destinations.
    pub server_name: String,
    /// Transport connection options.
    pub redis: ConnectionOptions,
    /// Upper bound on waiting for the transport to become ready.
    pub ready_timeout_secs: u64,
    /// Settings for the tap binary.
    pub tap: TapConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_name: uuid::Uuid::new_v4().to_string(),
            redis: ConnectionOptions::default(),
            ready_timeout_secs: 30,
            tap: TapConfig::default(),
        }
    }
}

/// Topics the tap binary listens on, by name.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TapConfig {
    pub topics: Vec<String>,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `config.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new("config", FileFormat::Yaml).required(false))
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        Ok(config)
    }

    /// Create config for testing.
    pub fn for_test(server_name: &str) -> Self {
        Self {
            server_name: server_name.to_string(),
            redis: ConnectionOptions {
                host: Some("localhost".to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }
}
