//! Messages flowing in and out of the broker.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;

use crate::codec::PayloadCodec;
use crate::error::{MessagingError, Result};

/// A message claimed from a partition.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub topic: String,
    pub key: Option<Vec<u8>>,
    pub value: Vec<u8>,
    /// Assigned by the broker
    pub partition: i32,
    /// Assigned by the broker
    pub offset: i64,
    pub timestamp: Option<DateTime<Utc>>,
    pub headers: HashMap<String, Vec<u8>>,
}

impl Message {
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64, value: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            key: None,
            value,
            partition,
            offset,
            timestamp: None,
            headers: HashMap::new(),
        }
    }

    pub fn with_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Key as UTF-8, lossy.
    pub fn key_str(&self) -> Option<String> {
        self.key.as_ref().map(|k| String::from_utf8_lossy(k).into_owned())
    }

    /// Decode the value into `T` with the given codec.
    pub fn decode<T, C>(&self, codec: &C) -> Result<T>
    where
        T: serde::de::DeserializeOwned,
        C: PayloadCodec + ?Sized,
    {
        codec.decode(&self.value).map_err(|e| match e {
            MessagingError::Deserialization { message, .. } => MessagingError::deserialization(
                message,
                Some(format!("{}/{}@{}", self.topic, self.partition, self.offset)),
            ),
            other => other,
        })
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.topic, self.partition, self.offset)
    }
}

/// An encoded record on its way to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerRecord {
    pub topic: String,
    pub key: String,
    pub payload: Vec<u8>,
    /// Delivery attempts made so far
    pub attempt: u32,
}

impl ProducerRecord {
    pub fn new(topic: impl Into<String>, key: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            key: key.into(),
            payload,
            attempt: 0,
        }
    }
}

/// Broker acknowledgement of one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub topic: String,
    pub key: String,
    pub partition: i32,
    pub offset: i64,
}

/// A failed outbound record and the error that failed it.
#[derive(Debug, Clone)]
pub struct ErrorEvent {
    pub record: ProducerRecord,
    pub error: MessagingError,
}

impl fmt::Display for ErrorEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} - attempt {} to topic {} failed: {}",
            self.record.key, self.record.attempt, self.record.topic, self.error
        )
    }
}

/// Consume-side failure reported on a group's error channel.
#[derive(Debug, Clone)]
pub struct ConsumerError {
    pub topic: Option<String>,
    pub partition: Option<i32>,
    pub error: MessagingError,
}

impl ConsumerError {
    pub fn new(error: MessagingError) -> Self {
        Self {
            topic: None,
            partition: None,
            error,
        }
    }

    pub fn at(topic: impl Into<String>, partition: i32, error: MessagingError) -> Self {
        Self {
            topic: Some(topic.into()),
            partition: Some(partition),
            error,
        }
    }
}

impl fmt::Display for ConsumerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.topic, self.partition) {
            (Some(topic), Some(partition)) => write!(f, "{}/{}: {}", topic, partition, self.error),
            _ => write!(f, "{}", self.error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonCodec;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Payment {
        id: u32,
    }

    #[test]
    fn test_message_builder() {
        let msg = Message::new("payments", 3, 42, b"{}".to_vec())
            .with_key("k1")
            .with_header("trace-id", "abc");

        assert_eq!(msg.key_str().as_deref(), Some("k1"));
        assert_eq!(msg.headers.get("trace-id").map(Vec::as_slice), Some(&b"abc"[..]));
        assert_eq!(msg.to_string(), "payments/3@42");
    }

    #[test]
    fn test_decode_reports_position() {
        let msg = Message::new("payments", 1, 7, br#"{"id":9}"#.to_vec());
        let payment: Payment = msg.decode(&JsonCodec).unwrap();
        assert_eq!(payment, Payment { id: 9 });

        let broken = Message::new("payments", 1, 8, b"not json".to_vec());
        match broken.decode::<Payment, _>(&JsonCodec) {
            Err(MessagingError::Deserialization { context, .. }) => {
                assert_eq!(context.as_deref(), Some("payments/1@8"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_error_event_display() {
        let mut record = ProducerRecord::new("t", "k", vec![]);
        record.attempt = 2;
        let event = ErrorEvent {
            record,
            error: MessagingError::delivery("broker down", "t"),
        };
        assert!(event.to_string().starts_with("k - attempt 2 to topic t failed"));
    }
}
