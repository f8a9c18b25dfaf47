//! Payload codecs.
//!
//! Decoding is always parameterized by the destination type; there is no
//! "decode into whatever it was" path.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{MessagingError, Result};

/// Converts typed payloads to and from broker bytes.
pub trait PayloadCodec: Send + Sync {
    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>>;

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T>;

    /// Content type identifier
    fn content_type(&self) -> &'static str;
}

/// JSON codec, the default.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl PayloadCodec for JsonCodec {
    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>> {
        serde_json::to_vec(value)
            .map_err(|e| MessagingError::serialization(e.to_string(), Some("JSON".to_string())))
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        serde_json::from_slice(bytes)
            .map_err(|e| MessagingError::deserialization(e.to_string(), None))
    }

    fn content_type(&self) -> &'static str {
        "application/json"
    }
}

/// Bincode codec
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeCodec;

impl PayloadCodec for BincodeCodec {
    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>> {
        bincode::serialize(value)
            .map_err(|e| MessagingError::serialization(e.to_string(), Some("bincode".to_string())))
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        bincode::deserialize(bytes)
            .map_err(|e| MessagingError::deserialization(e.to_string(), None))
    }

    fn content_type(&self) -> &'static str {
        "application/octet-stream"
    }
}
