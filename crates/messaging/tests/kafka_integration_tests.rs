//! End-to-end tests against a real broker
//!
//! These tests use testcontainers to spin up a Kafka instance and need a
//! running Docker daemon; run them with `cargo test -- --ignored`.

mod common;

use common::recv_messages;
use messaging::{
    new_producer, start_consumer_group, ConsumerGroup, JsonCodec, MessagingError, ProducerGateway,
    ShutdownController,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use streamgate_config::{ConsumerGroupConfig, OffsetReset, ProducerConfig, ProducerMode};
use testcontainers::clients::Cli;
use testcontainers::{Container, RunnableImage};
use testcontainers_modules::kafka::Kafka;
use uuid::Uuid;

/// Test container wrapper for Kafka
struct KafkaTestContainer<'a> {
    _container: Container<'a, Kafka>,
    bootstrap_servers: String,
}

impl<'a> KafkaTestContainer<'a> {
    fn start(docker: &'a Cli) -> Self {
        let container = docker.run(RunnableImage::from(Kafka::default()));
        let bootstrap_servers = format!("localhost:{}", container.get_host_port_ipv4(9093));

        // Wait for Kafka to be ready
        std::thread::sleep(Duration::from_secs(5));

        Self {
            _container: container,
            bootstrap_servers,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Ping {
    seq: u32,
}

#[tokio::test]
#[ignore] // Requires Docker
async fn test_produce_and_consume_through_group() {
    let docker = Cli::default();
    let kafka = KafkaTestContainer::start(&docker);
    let topic = format!("pings-{}", Uuid::new_v4());

    let producer = new_producer(false, "pinger", vec![kafka.bootstrap_servers.clone()], "2.8.0")
        .await
        .expect("Failed to create producer");

    // Creates the topic so the group gets an assignment
    producer.send("pinger", &topic, "warmup", &Ping { seq: 0 }).await.unwrap();

    let (group, mut streams) = start_consumer_group(
        vec![topic.clone()],
        "pingers",
        vec![kafka.bootstrap_servers.clone()],
        "2.8.0",
        "range",
        true,
        "ping-consumer",
    )
    .await
    .expect("Failed to start consumer group");

    for seq in 1..=5 {
        producer.send("pinger", &topic, "k", &Ping { seq }).await.unwrap();
    }

    let received = recv_messages(&mut streams.messages, 6, Duration::from_secs(30)).await;
    let pings: Vec<Ping> = received
        .iter()
        .map(|m| m.decode(&JsonCodec).unwrap())
        .collect();
    assert_eq!(pings.iter().map(|p| p.seq).collect::<Vec<_>>(), vec![0, 1, 2, 3, 4, 5]);

    let group = Arc::new(group);
    ShutdownController::new()
        .with_consumer_group(group.clone())
        .with_producer(Arc::new(producer), Duration::from_secs(5))
        .run_until(async {})
        .await;
    tokio::time::timeout(Duration::from_secs(10), group.wait())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_unreachable_brokers_fail_to_connect() {
    let mut config = ProducerConfig::new(
        ProducerMode::Async,
        "P1",
        vec!["127.0.0.1:1".to_string()],
        "2.1.0",
    );
    config.connect_timeout_ms = 1_000;

    let result = ProducerGateway::new(config).await;
    assert!(matches!(result, Err(MessagingError::Connect { .. })));
}

#[tokio::test]
async fn test_unreachable_brokers_fail_group_start() {
    let mut config = ConsumerGroupConfig::new(
        vec!["t".to_string()],
        "g",
        vec!["127.0.0.1:1".to_string()],
        "2.1.0",
        "sticky",
        OffsetReset::Newest,
        "test-client",
    );
    config.connect_timeout_ms = 1_000;

    let result = ConsumerGroup::start(config).await;
    assert!(matches!(result, Err(MessagingError::Connect { .. })));
}
