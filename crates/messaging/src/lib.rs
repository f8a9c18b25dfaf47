//! Kafka consumer-group coordination and producer gateways.
//!
//! - [`ConsumerGroup`] joins a consumer group, supervises its sessions and
//!   forwards claimed messages to the application in partition order.
//! - [`ProducerGateway`] sends typed payloads under a bound producer name,
//!   either fire-and-forget with background retries or synchronously.
//! - [`ShutdownController`] closes both on SIGINT/SIGTERM.
//!
//! Broker access goes through the [`GroupClient`] and [`ProduceClient`]
//! traits, implemented over rdkafka and in memory.

pub mod codec;
pub mod error;
pub mod group;
pub mod memory;
pub mod message;
pub mod producer;
pub mod shutdown;

pub use codec::{BincodeCodec, JsonCodec, PayloadCodec};
pub use error::{ErrorSeverity, MessagingError, Result};
pub use group::{
    Claim, ConsumerGroup, ConsumerStreams, GroupClient, GroupHandler, GroupSession,
    KafkaGroupClient, ReadinessGate, TopicPartition,
};
pub use memory::{
    ClaimScript, GroupController, InMemoryGroupClient, InMemoryProducer, MarkedOffset,
};
pub use message::{ConsumerError, DeliveryReport, ErrorEvent, Message, ProducerRecord};
pub use producer::{
    KafkaProduceClient, PendingDelivery, ProduceClient, ProducerGateway, ProducerStatsSnapshot,
};
pub use shutdown::ShutdownController;

use streamgate_config::{ConsumerGroupConfig, OffsetReset, ProducerConfig, ProducerMode};

/// Start a consumer group over rdkafka.
///
/// Blocks until the first generation's partitions are set up and returns
/// the group together with its message and error channels.
pub async fn start_consumer_group(
    topics: Vec<String>,
    group_id: &str,
    brokers: Vec<String>,
    version: &str,
    rebalance_strategy: &str,
    start_from_oldest: bool,
    client_id: &str,
) -> Result<(ConsumerGroup, ConsumerStreams)> {
    let config = ConsumerGroupConfig::new(
        topics,
        group_id,
        brokers,
        version,
        rebalance_strategy,
        OffsetReset::from_oldest(start_from_oldest),
        client_id,
    );
    ConsumerGroup::start(config).await
}

/// Connect a producer gateway bound to `name`.
pub async fn new_producer(
    is_async: bool,
    name: &str,
    brokers: Vec<String>,
    version: &str,
) -> Result<ProducerGateway> {
    let config = ProducerConfig::new(ProducerMode::from_async(is_async), name, brokers, version);
    ProducerGateway::new(config).await
}
