//! Server configuration.
//!
//! A TOML file deserializes into one [`Config`] with a section per
//! subsystem; every field has a production default so an empty file is
//! a valid configuration. A handful of environment variables override
//! the bind target and logging for container deployments.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::middleware::{MetricsConfig, RateLimitConfig};
use crate::registry::{ModelConfig, RegistryConfig};
use crate::scheduler::BatchConfig;
use crate::stream::StreamConfig;
use crate::telemetry::LogConfig;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot read config file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("Cannot parse config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// HTTP frontend tunables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Admission cap on concurrent requests.
    pub max_connections: usize,
    /// Wall-time budget per request when the caller sets none.
    pub request_timeout_s: f64,
    /// Drain budget on shutdown.
    pub graceful_shutdown_timeout_s: f64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            max_connections: 256,
            request_timeout_s: 30.0,
            graceful_shutdown_timeout_s: 30.0,
        }
    }
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.request_timeout_s)
    }

    pub fn graceful_shutdown_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.graceful_shutdown_timeout_s)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Root configuration, one section per subsystem.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub batch: BatchConfig,
    pub stream: StreamConfig,
    pub rate_limit: RateLimitConfig,
    pub metrics: MetricsConfig,
    pub registry: RegistryConfig,
    pub log: LogConfig,
    /// Models loaded at startup, through registered loaders.
    pub models: Vec<ModelConfig>,
}

impl Config {
    /// Read and validate a TOML config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let mut config: Config = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides, for running without a file.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Config::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("FLUXSERVE_HOST") {
            self.server.host = host;
        }
        if let Ok(port) = std::env::var("FLUXSERVE_PORT") {
            if let Ok(port) = port.parse() {
                self.server.port = port;
            }
        }
        if let Ok(filter) = std::env::var("FLUXSERVE_LOG") {
            self.log.filter = filter;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch.max_batch_size == 0 {
            return Err(ConfigError::Invalid("batch.max_batch_size must be >= 1".into()));
        }
        if self.batch.queue_capacity == 0 {
            return Err(ConfigError::Invalid("batch.queue_capacity must be >= 1".into()));
        }
        if self.stream.buffer_size == 0 {
            return Err(ConfigError::Invalid("stream.buffer_size must be >= 1".into()));
        }
        if self.metrics.window == 0 {
            return Err(ConfigError::Invalid("metrics.window must be >= 1".into()));
        }
        if self.rate_limit.per_minute <= 0.0 {
            return Err(ConfigError::Invalid("rate_limit.per_minute must be > 0".into()));
        }
        if self.server.request_timeout_s <= 0.0 {
            return Err(ConfigError::Invalid("server.request_timeout_s must be > 0".into()));
        }
        for model in &self.models {
            if model.name.is_empty() {
                return Err(ConfigError::Invalid("models[].name must not be empty".into()));
            }
            crate::registry::ModelVersion::parse(&model.version)
                .map_err(|e| ConfigError::Invalid(format!("models[].version: {e}")))?;
        }
        Ok(())
    }
}
