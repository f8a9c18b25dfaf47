//! Consumer-group configuration.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::{ConfigError, KafkaVersion, Result};

/// Partition assignment strategy used when the group rebalances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RebalanceStrategy {
    Sticky,
    RoundRobin,
    Range,
}

impl RebalanceStrategy {
    /// Value for librdkafka's `partition.assignment.strategy`.
    ///
    /// librdkafka only ships the cooperative flavour of the sticky assignor.
    pub fn assignor(&self) -> &'static str {
        match self {
            RebalanceStrategy::Sticky => "cooperative-sticky",
            RebalanceStrategy::RoundRobin => "roundrobin",
            RebalanceStrategy::Range => "range",
        }
    }

    /// Whether the assignor hands out partitions incrementally.
    pub fn is_cooperative(&self) -> bool {
        matches!(self, RebalanceStrategy::Sticky)
    }
}

impl FromStr for RebalanceStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sticky" => Ok(RebalanceStrategy::Sticky),
            "roundrobin" | "round-robin" => Ok(RebalanceStrategy::RoundRobin),
            "range" => Ok(RebalanceStrategy::Range),
            other => Err(ConfigError::UnknownRebalanceStrategy(other.to_string())),
        }
    }
}

impl fmt::Display for RebalanceStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RebalanceStrategy::Sticky => write!(f, "sticky"),
            RebalanceStrategy::RoundRobin => write!(f, "roundrobin"),
            RebalanceStrategy::Range => write!(f, "range"),
        }
    }
}

/// Where a group without committed offsets starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OffsetReset {
    Oldest,
    #[default]
    Newest,
}

impl OffsetReset {
    pub fn from_oldest(start_from_oldest: bool) -> Self {
        if start_from_oldest {
            OffsetReset::Oldest
        } else {
            OffsetReset::Newest
        }
    }

    /// Value for librdkafka's `auto.offset.reset`.
    pub fn auto_offset_reset(&self) -> &'static str {
        match self {
            OffsetReset::Oldest => "earliest",
            OffsetReset::Newest => "latest",
        }
    }
}

/// When a claimed message is marked relative to handing it to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitOrder {
    /// Mark first, then hand off. A crash between the two loses the message.
    BeforeDelivery,
    /// Mark once the message channel has buffered the message. The
    /// application may not have read it yet, so a crash can still lose
    /// up to `message_buffer` messages.
    #[default]
    AfterDelivery,
}

/// Configuration of one consumer-group member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerGroupConfig {
    /// Topics to join the group for
    pub topics: Vec<String>,

    /// Consumer group id
    pub group_id: String,

    /// Bootstrap broker addresses
    pub brokers: Vec<String>,

    /// Protocol version, must be an entry of the compatibility table
    pub version: String,

    /// sticky, roundrobin (or round-robin), range
    pub rebalance_strategy: String,

    pub offset_reset: OffsetReset,

    pub client_id: String,

    /// Capacity of the channel handing messages to the application
    pub message_buffer: usize,

    /// Capacity of the error notification channel
    pub error_buffer: usize,

    /// Pause between failed consume attempts (milliseconds)
    pub retry_backoff_ms: u64,

    pub commit_order: CommitOrder,

    /// Give up waiting for the first partition assignment after this long
    pub startup_timeout_ms: Option<u64>,

    /// Bound on the metadata request made while connecting
    pub connect_timeout_ms: u64,

    pub session_timeout_ms: u64,

    /// Additional librdkafka properties, applied last
    pub extra: HashMap<String, String>,
}

impl Default for ConsumerGroupConfig {
    fn default() -> Self {
        Self {
            topics: vec![],
            group_id: String::new(),
            brokers: vec!["localhost:9092".to_string()],
            version: "2.1.0".to_string(),
            rebalance_strategy: "range".to_string(),
            offset_reset: OffsetReset::Newest,
            client_id: "streamgate".to_string(),
            message_buffer: 1,
            error_buffer: 16,
            retry_backoff_ms: 1000,
            commit_order: CommitOrder::AfterDelivery,
            startup_timeout_ms: None,
            connect_timeout_ms: 10_000,
            session_timeout_ms: 10_000,
            extra: HashMap::new(),
        }
    }
}

impl ConsumerGroupConfig {
    pub fn new(
        topics: Vec<String>,
        group_id: impl Into<String>,
        brokers: Vec<String>,
        version: impl Into<String>,
        rebalance_strategy: impl Into<String>,
        offset_reset: OffsetReset,
        client_id: impl Into<String>,
    ) -> Self {
        Self {
            topics,
            group_id: group_id.into(),
            brokers,
            version: version.into(),
            rebalance_strategy: rebalance_strategy.into(),
            offset_reset,
            client_id: client_id.into(),
            ..Default::default()
        }
    }

    pub fn kafka_version(&self) -> Result<KafkaVersion> {
        KafkaVersion::parse(&self.version)
    }

    pub fn strategy(&self) -> Result<RebalanceStrategy> {
        self.rebalance_strategy.parse()
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn startup_timeout(&self) -> Option<Duration> {
        self.startup_timeout_ms.map(Duration::from_millis)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Comma-joined broker list as librdkafka expects it.
    pub fn bootstrap_servers(&self) -> String {
        self.brokers.join(",")
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.kafka_version()?;
        self.strategy()?;

        if self.topics.is_empty() || self.topics.iter().any(|t| t.is_empty()) {
            return Err(ConfigError::invalid("topics", "at least one non-empty topic is required"));
        }
        if self.group_id.is_empty() {
            return Err(ConfigError::invalid("group_id", "group id is required"));
        }
        if self.brokers.is_empty() {
            return Err(ConfigError::invalid("brokers", "at least one broker is required"));
        }
        if self.message_buffer == 0 {
            return Err(ConfigError::invalid("message_buffer", "must be greater than 0"));
        }
        if self.error_buffer == 0 {
            return Err(ConfigError::invalid("error_buffer", "must be greater than 0"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ConsumerGroupConfig {
        ConsumerGroupConfig::new(
            vec!["t".to_string()],
            "g",
            vec!["b1".to_string()],
            "2.1.0",
            "sticky",
            OffsetReset::Newest,
            "client",
        )
    }

    #[test]
    fn test_strategy_names() {
        assert_eq!("sticky".parse::<RebalanceStrategy>().unwrap(), RebalanceStrategy::Sticky);
        assert_eq!(
            "roundrobin".parse::<RebalanceStrategy>().unwrap(),
            RebalanceStrategy::RoundRobin
        );
        assert_eq!(
            "round-robin".parse::<RebalanceStrategy>().unwrap(),
            RebalanceStrategy::RoundRobin
        );
        assert_eq!("range".parse::<RebalanceStrategy>().unwrap(), RebalanceStrategy::Range);

        for bad in ["", "Sticky", "RANGE", "round_robin", "cooperative-sticky", "random"] {
            assert!(matches!(
                bad.parse::<RebalanceStrategy>(),
                Err(ConfigError::UnknownRebalanceStrategy(_))
            ));
        }
    }

    #[test]
    fn test_assignor_mapping() {
        assert_eq!(RebalanceStrategy::Sticky.assignor(), "cooperative-sticky");
        assert!(RebalanceStrategy::Sticky.is_cooperative());
        assert_eq!(RebalanceStrategy::RoundRobin.assignor(), "roundrobin");
        assert_eq!(RebalanceStrategy::Range.assignor(), "range");
        assert!(!RebalanceStrategy::Range.is_cooperative());
    }

    #[test]
    fn test_offset_reset() {
        assert_eq!(OffsetReset::from_oldest(true).auto_offset_reset(), "earliest");
        assert_eq!(OffsetReset::from_oldest(false).auto_offset_reset(), "latest");
        assert_eq!(OffsetReset::default(), OffsetReset::Newest);
    }

    #[test]
    fn test_valid_config() {
        let config = config();
        assert!(config.validate().is_ok());
        assert_eq!(config.bootstrap_servers(), "b1");
        assert_eq!(config.retry_backoff(), Duration::from_secs(1));
        assert_eq!(config.commit_order, CommitOrder::AfterDelivery);
    }

    #[test]
    fn test_config_validation() {
        let mut config = config();
        config.version = "2.1".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::UnsupportedVersion(_))));

        let mut config = self::config();
        config.rebalance_strategy = "fair".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::UnknownRebalanceStrategy(_))));

        let mut config = self::config();
        config.version = "0.8.2.2".to_string();
        assert!(config.validate().is_ok());

        let mut config = self::config();
        config.topics.clear();
        assert!(config.validate().is_err());

        let mut config = self::config();
        config.group_id.clear();
        assert!(config.validate().is_err());

        let mut config = self::config();
        config.brokers.clear();
        assert!(config.validate().is_err());

        let mut config = self::config();
        config.message_buffer = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_commit_order_serialization() {
        let json = serde_json::to_string(&CommitOrder::BeforeDelivery).unwrap();
        assert_eq!(json, "\"before_delivery\"");
        let back: CommitOrder = serde_json::from_str(&json).unwrap();
        assert_eq!(back, CommitOrder::BeforeDelivery);
    }
}
