//! Broker protocol-version compatibility table.
//!
//! Only versions listed in [`SUPPORTED_VERSIONS`] are accepted. Anything else is
//! rejected before a client is built, so a typo in a deployment file never
//! reaches the network.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::ConfigError;

/// Every protocol version string the clients know how to speak.
pub const SUPPORTED_VERSIONS: &[&str] = &[
    "0.8.2.0", "0.8.2.1", "0.8.2.2", "0.9.0.0", "0.9.0.1", "0.10.0.0", "0.10.0.1", "0.10.1.0",
    "0.10.1.1", "0.10.2.0", "0.10.2.1", "0.10.2.2", "0.11.0.0", "0.11.0.1", "0.11.0.2", "1.0.0",
    "1.0.1", "1.0.2", "1.1.0", "1.1.1", "2.0.0", "2.0.1", "2.1.0", "2.2.0", "2.3.0", "2.4.0",
    "2.5.0", "2.6.0", "2.7.0", "2.8.0", "3.0.0", "3.1.0", "3.2.0", "3.3.0", "3.4.0", "3.5.0",
    "3.6.0",
];

/// A validated entry of the compatibility table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KafkaVersion {
    parts: [u16; 4],
    /// Index into [`SUPPORTED_VERSIONS`]
    index: usize,
}

impl KafkaVersion {
    /// Parse a version string, accepting only entries of the compatibility table.
    pub fn parse(version: &str) -> Result<Self, ConfigError> {
        let index = SUPPORTED_VERSIONS
            .iter()
            .position(|v| *v == version.trim())
            .ok_or_else(|| ConfigError::UnsupportedVersion(version.to_string()))?;

        let mut parts = [0u16; 4];
        for (slot, piece) in parts.iter_mut().zip(SUPPORTED_VERSIONS[index].split('.')) {
            *slot = piece
                .parse()
                .map_err(|_| ConfigError::UnsupportedVersion(version.to_string()))?;
        }

        Ok(Self { parts, index })
    }

    /// All versions of the table, oldest first.
    pub fn all() -> impl Iterator<Item = KafkaVersion> {
        SUPPORTED_VERSIONS
            .iter()
            .filter_map(|v| KafkaVersion::parse(v).ok())
    }

    pub fn as_str(&self) -> &'static str {
        SUPPORTED_VERSIONS[self.index]
    }

    pub fn major(&self) -> u16 {
        self.parts[0]
    }

    pub fn minor(&self) -> u16 {
        self.parts[1]
    }

    /// Brokers older than 0.10.0 cannot answer ApiVersions requests.
    pub fn supports_api_version_request(&self) -> bool {
        self.parts >= [0, 10, 0, 0]
    }

    /// Consumer groups coordinated by the broker appeared in 0.9.0.
    pub fn supports_consumer_groups(&self) -> bool {
        self.parts >= [0, 9, 0, 0]
    }

    /// Idempotent production needs 0.11.
    pub fn supports_idempotence(&self) -> bool {
        self.parts >= [0, 11, 0, 0]
    }
}

impl fmt::Display for KafkaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KafkaVersion {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        KafkaVersion::parse(s)
    }
}

impl Serialize for KafkaVersion {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for KafkaVersion {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        KafkaVersion::parse(&raw).map_err(serde::de::Error::custom)
    }
}
