//! Common test utilities for integration tests

#![allow(dead_code)]

use messaging::{
    ClaimScript, ConsumerGroup, ConsumerStreams, GroupController, InMemoryGroupClient,
    InMemoryProducer, Message, ProducerGateway, Result,
};
use std::sync::Arc;
use std::time::Duration;
use streamgate_config::{ConsumerGroupConfig, OffsetReset, ProducerConfig, ProducerMode};
use tokio::sync::mpsc;

/// Consumer config for the `b1` / `t` / `g` test group
pub fn group_config(version: &str, strategy: &str) -> ConsumerGroupConfig {
    ConsumerGroupConfig::new(
        vec!["t".to_string()],
        "g",
        vec!["b1".to_string()],
        version,
        strategy,
        OffsetReset::Newest,
        "test-client",
    )
}

/// Start a group over an in-memory client whose first session owns `claims`.
pub async fn start_group(
    config: ConsumerGroupConfig,
    claims: Vec<ClaimScript>,
) -> Result<(ConsumerGroup, ConsumerStreams, GroupController)> {
    let (client, controller) = InMemoryGroupClient::new(config.group_id.clone());
    controller.assign(claims);
    let (group, streams) =
        ConsumerGroup::start_with(config, move |_| async move { Ok(client) }).await?;
    Ok((group, streams, controller))
}

pub fn producer_config(mode: ProducerMode, name: &str) -> ProducerConfig {
    ProducerConfig::new(mode, name, vec!["b1".to_string()], "2.1.0")
}

/// Gateway over a fresh in-memory producer.
pub fn gateway(config: ProducerConfig) -> (Arc<ProducerGateway>, InMemoryProducer) {
    let producer = InMemoryProducer::new();
    let gateway = ProducerGateway::with_client(config, Arc::new(producer.clone()))
        .expect("Failed to create gateway");
    (Arc::new(gateway), producer)
}

/// Receive `count` messages, failing the test if they take longer than `timeout`.
pub async fn recv_messages(
    messages: &mut mpsc::Receiver<Message>,
    count: usize,
    timeout: Duration,
) -> Vec<Message> {
    let mut received = Vec::with_capacity(count);
    while received.len() < count {
        match tokio::time::timeout(timeout, messages.recv()).await {
            Ok(Some(message)) => received.push(message),
            Ok(None) => panic!("message channel closed after {} messages", received.len()),
            Err(_) => panic!("timed out after {} of {} messages", received.len(), count),
        }
    }
    received
}

/// Wait for a condition with timeout
pub async fn wait_for_condition<F>(
    mut check: F,
    timeout: Duration,
    check_interval: Duration,
) -> bool
where
    F: FnMut() -> bool,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout {
        if check() {
            return true;
        }
        tokio::time::sleep(check_interval).await;
    }
    check()
}
