//! Configuration management for streamgate

use figment::{Figment, providers::{Format, Yaml, Env}};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

mod consumer;
mod producer;
mod version;

pub use consumer::{CommitOrder, ConsumerGroupConfig, OffsetReset, RebalanceStrategy};
pub use producer::{ProducerConfig, ProducerMode, RequiredAcks, RetryPolicy};
pub use version::{KafkaVersion, SUPPORTED_VERSIONS};

/// Environment variable prefix, nested keys are separated by `__`
pub const ENV_PREFIX: &str = "STREAMGATE_";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    LoadError(String),

    #[error("Unsupported protocol version: {0:?}")]
    UnsupportedVersion(String),

    #[error("Unknown rebalance strategy: {0:?}")]
    UnknownRebalanceStrategy(String),

    #[error("Invalid configuration for {field}: {message}")]
    ValidationError { field: String, message: String },
}

impl ConfigError {
    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ValidationError {
            field: field.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Top-level configuration file layout
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamgateConfig {
    pub logging: LoggingConfig,

    pub consumer: Option<ConsumerGroupConfig>,

    pub producer: Option<ProducerConfig>,
}

impl StreamgateConfig {
    /// Load configuration from file and environment
    pub fn load(config_path: Option<PathBuf>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(path) = config_path {
            figment = figment.merge(Yaml::file(path));
        }

        // Override with environment variables (prefixed with STREAMGATE_)
        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        figment.extract().map_err(|e| ConfigError::LoadError(e.to_string()))
    }

    /// Validate every section present
    pub fn validate(&self) -> Result<()> {
        self.logging.validate()?;
        if let Some(consumer) = &self.consumer {
            consumer.validate()?;
        }
        if let Some(producer) = &self.producer {
            producer.validate()?;
        }
        Ok(())
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default level or full filter directive (e.g. `info,messaging=debug`)
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl LoggingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.level.trim().is_empty() {
            return Err(ConfigError::invalid("logging.level", "must not be empty"));
        }
        Ok(())
    }
}
