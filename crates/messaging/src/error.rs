//! Error types for consumer-group coordination and production.
//!
//! Startup failures (`Config`, `Connect`) are fatal and never leave a
//! half-started component behind. `Consume` errors are retried by the
//! coordinator, `Delivery` errors by the async gateway. Everything else is
//! returned to the caller as is.

use std::fmt;
use streamgate_config::ConfigError;
use thiserror::Error;

/// Result type alias for messaging operations.
pub type Result<T> = std::result::Result<T, MessagingError>;

#[derive(Error, Debug, Clone)]
pub enum MessagingError {
    /// Invalid protocol version, rebalance strategy or other setting.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// The broker client could not be created or the brokers are unreachable.
    #[error("failed to connect to brokers {brokers}: {message}")]
    Connect {
        message: String,
        brokers: String,
    },

    /// A consume attempt failed; the coordinator retries it.
    #[error("failed to consume from group {group_id}: {message}")]
    Consume {
        message: String,
        group_id: String,
    },

    /// The group client was closed. Ends the supervising loop.
    #[error("consumer group is closed")]
    GroupClosed,

    /// `close` was called on a client that is already closed.
    #[error("{0} is already closed")]
    AlreadyClosed(&'static str),

    /// A send named a producer other than the gateway's bound identity.
    #[error("wrong producer name: gateway is bound to {expected:?}, got {actual:?}")]
    ProducerIdentity {
        expected: String,
        actual: String,
    },

    /// The payload could not be encoded.
    #[error("serialization error: {message}")]
    Serialization {
        message: String,
        context: Option<String>,
    },

    /// The payload could not be decoded into the requested type.
    #[error("deserialization error: {message}")]
    Deserialization {
        message: String,
        context: Option<String>,
    },

    /// The gateway is not accepting sends.
    #[error("producer {0:?} is not ready")]
    NotReady(String),

    /// The broker rejected or failed to acknowledge a record.
    #[error("failed to deliver message to topic {topic}: {message}")]
    Delivery {
        message: String,
        topic: String,
    },

    #[error("operation timed out after {timeout_ms}ms: {operation}")]
    Timeout {
        operation: String,
        timeout_ms: u64,
    },

    /// An internal channel was closed by its other end.
    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),

    /// Error from the underlying rdkafka library.
    #[error("kafka client error: {message} (error code: {code:?})")]
    Client {
        message: String,
        code: Option<i32>,
    },
}

impl MessagingError {
    pub fn connect(message: impl Into<String>, brokers: impl Into<String>) -> Self {
        Self::Connect {
            message: message.into(),
            brokers: brokers.into(),
        }
    }

    pub fn consume(message: impl Into<String>, group_id: impl Into<String>) -> Self {
        Self::Consume {
            message: message.into(),
            group_id: group_id.into(),
        }
    }

    pub fn identity(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Self::ProducerIdentity {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    pub fn serialization(message: impl Into<String>, context: Option<String>) -> Self {
        Self::Serialization {
            message: message.into(),
            context,
        }
    }

    pub fn deserialization(message: impl Into<String>, context: Option<String>) -> Self {
        Self::Deserialization {
            message: message.into(),
            context,
        }
    }

    pub fn delivery(message: impl Into<String>, topic: impl Into<String>) -> Self {
        Self::Delivery {
            message: message.into(),
            topic: topic.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    pub fn client(message: impl Into<String>, code: Option<i32>) -> Self {
        Self::Client {
            message: message.into(),
            code,
        }
    }

    pub fn is_group_closed(&self) -> bool {
        matches!(self, MessagingError::GroupClosed)
    }

    /// Check if the operation that caused this error can be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MessagingError::Consume { .. }
                | MessagingError::Delivery { .. }
                | MessagingError::Timeout { .. }
                | MessagingError::Client { .. }
        )
    }

    /// Check if the error prevents a component from starting at all.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MessagingError::Config(_) | MessagingError::Connect { .. }
        )
    }

    /// Get a severity level suitable for logging and monitoring.
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            MessagingError::Config(_) | MessagingError::Connect { .. } => ErrorSeverity::Critical,
            MessagingError::Delivery { .. } | MessagingError::Client { .. } => ErrorSeverity::Error,
            MessagingError::Consume { .. }
            | MessagingError::Timeout { .. }
            | MessagingError::ProducerIdentity { .. }
            | MessagingError::Serialization { .. }
            | MessagingError::Deserialization { .. }
            | MessagingError::NotReady(_)
            | MessagingError::ChannelClosed(_) => ErrorSeverity::Warning,
            MessagingError::GroupClosed | MessagingError::AlreadyClosed(_) => ErrorSeverity::Info,
        }
    }
}

/// Error severity levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSeverity::Info => write!(f, "INFO"),
            ErrorSeverity::Warning => write!(f, "WARNING"),
            ErrorSeverity::Error => write!(f, "ERROR"),
            ErrorSeverity::Critical => write!(f, "CRITICAL"),
        }
    }
}

impl From<serde_json::Error> for MessagingError {
    fn from(err: serde_json::Error) -> Self {
        MessagingError::serialization(err.to_string(), Some("JSON".to_string()))
    }
}

impl From<bincode::Error> for MessagingError {
    fn from(err: bincode::Error) -> Self {
        MessagingError::serialization(err.to_string(), Some("bincode".to_string()))
    }
}

impl From<rdkafka::error::KafkaError> for MessagingError {
    fn from(err: rdkafka::error::KafkaError) -> Self {
        use rdkafka::error::KafkaError as RdKafkaError;

        match err {
            RdKafkaError::ClientCreation(msg) => MessagingError::connect(msg, "unknown"),
            RdKafkaError::MessageProduction(code) => MessagingError::delivery(
                format!("message production failed with code: {:?}", code),
                "unknown",
            ),
            RdKafkaError::MessageConsumption(code) => MessagingError::consume(
                format!("message consumption failed with code: {:?}", code),
                "unknown",
            ),
            other => {
                let code = other.rdkafka_error_code().map(|c| c as i32);
                MessagingError::client(other.to_string(), code)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let config: MessagingError = ConfigError::UnsupportedVersion("9.9".into()).into();
        assert!(config.is_fatal());
        assert!(!config.is_retryable());
        assert_eq!(config.severity(), ErrorSeverity::Critical);

        let consume = MessagingError::consume("broker went away", "g");
        assert!(consume.is_retryable());
        assert!(!consume.is_fatal());
        assert_eq!(consume.severity(), ErrorSeverity::Warning);

        let delivery = MessagingError::delivery("queue full", "t");
        assert!(delivery.is_retryable());
        assert_eq!(delivery.severity(), ErrorSeverity::Error);

        assert!(MessagingError::GroupClosed.is_group_closed());
        assert!(!MessagingError::GroupClosed.is_retryable());
        assert!(!MessagingError::identity("P1", "P2").is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = MessagingError::identity("P1", "P2");
        let display = err.to_string();
        assert!(display.contains("\"P1\""));
        assert!(display.contains("\"P2\""));

        let err = MessagingError::connect("Connection refused", "b1:9092");
        assert!(err.to_string().contains("b1:9092"));
    }

    #[test]
    fn test_serde_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("invalid json").unwrap_err();
        let err: MessagingError = json_err.into();
        assert!(matches!(err, MessagingError::Serialization { .. }));
    }

    #[test]
    fn test_rdkafka_error_conversion() {
        use rdkafka::types::RDKafkaErrorCode;

        let err: MessagingError =
            rdkafka::error::KafkaError::ClientCreation("bad config".into()).into();
        assert!(matches!(err, MessagingError::Connect { .. }));

        let err: MessagingError =
            rdkafka::error::KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull).into();
        assert!(matches!(err, MessagingError::Delivery { .. }));
    }
}
