//! Producer gateway configuration.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::{ConfigError, KafkaVersion, Result};

/// Send strategy of a gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProducerMode {
    /// Wait for the broker acknowledgement before `send` returns
    Sync,
    /// Accept the record and deliver it in the background
    #[default]
    Async,
}

impl ProducerMode {
    pub fn from_async(is_async: bool) -> Self {
        if is_async {
            ProducerMode::Async
        } else {
            ProducerMode::Sync
        }
    }
}

/// Acknowledgement level required from the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequiredAcks {
    /// No acknowledgement
    None,
    /// The partition leader wrote the record
    #[default]
    #[serde(alias = "wait_for_local")]
    Leader,
    /// All in-sync replicas wrote the record
    All,
}

impl RequiredAcks {
    /// Value for librdkafka's `acks`.
    pub fn acks(&self) -> &'static str {
        match self {
            RequiredAcks::None => "0",
            RequiredAcks::Leader => "1",
            RequiredAcks::All => "all",
        }
    }
}

/// What the async gateway does with a record whose delivery failed.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Pause before resubmitting (milliseconds). Zero resubmits immediately.
    pub backoff_ms: u64,

    /// Dead-letter the record after this many attempts. `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    /// Whether a record that just failed its `attempt`-th delivery may go again.
    pub fn allows_another(&self, attempt: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempt < max)
    }
}

/// Configuration of one producer gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProducerConfig {
    pub mode: ProducerMode,

    /// Identity callers must present on every send
    pub name: String,

    pub brokers: Vec<String>,

    /// Protocol version, must be an entry of the compatibility table
    pub version: String,

    pub required_acks: RequiredAcks,

    pub client_id: String,

    /// librdkafka `message.timeout.ms`
    pub message_timeout_ms: u64,

    /// Upper bound on a synchronous send (milliseconds)
    pub send_timeout_ms: u64,

    /// Capacity of the async input channel
    pub channel_capacity: usize,

    pub retry: RetryPolicy,

    pub connect_timeout_ms: u64,

    /// Additional librdkafka properties, applied last
    pub extra: HashMap<String, String>,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            mode: ProducerMode::Async,
            name: String::new(),
            brokers: vec!["localhost:9092".to_string()],
            version: "2.1.0".to_string(),
            required_acks: RequiredAcks::Leader,
            client_id: "streamgate".to_string(),
            message_timeout_ms: 30_000,
            send_timeout_ms: 10_000,
            channel_capacity: 256,
            retry: RetryPolicy::default(),
            connect_timeout_ms: 10_000,
            extra: HashMap::new(),
        }
    }
}

impl ProducerConfig {
    pub fn new(
        mode: ProducerMode,
        name: impl Into<String>,
        brokers: Vec<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            mode,
            name: name.into(),
            brokers,
            version: version.into(),
            ..Default::default()
        }
    }

    pub fn kafka_version(&self) -> Result<KafkaVersion> {
        KafkaVersion::parse(&self.version)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn bootstrap_servers(&self) -> String {
        self.brokers.join(",")
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.kafka_version()?;

        if self.name.is_empty() {
            return Err(ConfigError::invalid("name", "producer name is required"));
        }
        if self.brokers.is_empty() {
            return Err(ConfigError::invalid("brokers", "at least one broker is required"));
        }
        if self.channel_capacity == 0 {
            return Err(ConfigError::invalid("channel_capacity", "must be greater than 0"));
        }
        if self.send_timeout_ms == 0 {
            return Err(ConfigError::invalid("send_timeout_ms", "must be greater than 0"));
        }
        if self.retry.max_attempts == Some(0) {
            return Err(ConfigError::invalid("retry.max_attempts", "must be at least 1"));
        }

        Ok(())
    }
}
