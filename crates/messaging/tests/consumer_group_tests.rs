//! Consumer group coordination against the in-memory group client

mod common;

use common::{group_config, recv_messages, start_group, wait_for_condition};
use messaging::{ClaimScript, ConsumerGroup, GroupClient, InMemoryGroupClient, MessagingError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use streamgate_config::{CommitOrder, ConfigError, SUPPORTED_VERSIONS};

const WAIT: Duration = Duration::from_secs(5);
const POLL: Duration = Duration::from_millis(10);

#[tokio::test]
async fn test_every_supported_version_starts() {
    for version in SUPPORTED_VERSIONS {
        let (group, _streams, controller) = start_group(group_config(version, "range"), vec![])
            .await
            .unwrap_or_else(|e| panic!("version {} failed to start: {}", version, e));

        assert_eq!(group.generation(), 1, "version {}", version);
        group.close().await.unwrap();
        group.wait().await;
        assert!(controller.is_closed());
    }
}

#[tokio::test]
async fn test_unsupported_version_never_connects() {
    for version in ["2.1", "2.1.0.0", "9.9.9", "v2.1.0", "", "latest"] {
        let connected = Arc::new(AtomicBool::new(false));
        let flag = connected.clone();

        let result = ConsumerGroup::start_with(group_config(version, "sticky"), move |config| {
            flag.store(true, Ordering::SeqCst);
            async move { Ok(InMemoryGroupClient::new(config.group_id).0) }
        })
        .await;

        assert!(
            matches!(
                result,
                Err(MessagingError::Config(ConfigError::UnsupportedVersion(_)))
            ),
            "version {:?} was accepted",
            version
        );
        assert!(!connected.load(Ordering::SeqCst), "version {:?} connected", version);
    }
}

#[tokio::test]
async fn test_unknown_strategy_rejected() {
    for strategy in ["fair", "Sticky", "round_robin", "", "cooperative-sticky"] {
        let connected = Arc::new(AtomicBool::new(false));
        let flag = connected.clone();

        let result = ConsumerGroup::start_with(group_config("2.1.0", strategy), move |config| {
            flag.store(true, Ordering::SeqCst);
            async move { Ok(InMemoryGroupClient::new(config.group_id).0) }
        })
        .await;

        assert!(
            matches!(
                result,
                Err(MessagingError::Config(ConfigError::UnknownRebalanceStrategy(_)))
            ),
            "strategy {:?} was accepted",
            strategy
        );
        assert!(!connected.load(Ordering::SeqCst));
    }
}

#[tokio::test]
async fn test_known_strategies_start() {
    for strategy in ["sticky", "roundrobin", "round-robin", "range"] {
        let (group, _streams, _controller) = start_group(group_config("2.1.0", strategy), vec![])
            .await
            .unwrap();
        group.close().await.unwrap();
    }
}

#[tokio::test]
async fn test_start_blocks_until_first_setup() {
    let config = group_config("2.1.0", "sticky");
    let (client, controller) = InMemoryGroupClient::new("g");

    let start = tokio::spawn(ConsumerGroup::start_with(config, move |_| async move {
        Ok(client)
    }));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!start.is_finished(), "start returned before the first setup");
    assert_eq!(controller.generation(), 0);

    controller.assign(vec![ClaimScript::new("t", 0, vec![])]);

    let (group, mut streams) = tokio::time::timeout(WAIT, start)
        .await
        .expect("start did not return after setup")
        .unwrap()
        .unwrap();

    assert_eq!(group.group_id(), "g");
    assert_eq!(group.generation(), 1);
    assert_eq!(controller.generation(), 1);
    assert!(streams.messages.try_recv().is_err());
    assert!(streams.errors.try_recv().is_err());

    group.close().await.unwrap();
}

#[tokio::test]
async fn test_claim_delivered_in_order_exactly_once() {
    let (group, mut streams, controller) = start_group(
        group_config("2.1.0", "range"),
        vec![ClaimScript::numbered("t", 0, 100, 50)],
    )
    .await
    .unwrap();

    let received = recv_messages(&mut streams.messages, 50, WAIT).await;
    let offsets: Vec<i64> = received.iter().map(|m| m.offset).collect();
    assert_eq!(offsets, (100..150).collect::<Vec<_>>());
    assert_eq!(received[0].key_str().as_deref(), Some("m1"));

    // Nothing after the last message of the claim
    assert!(
        tokio::time::timeout(Duration::from_millis(100), streams.messages.recv())
            .await
            .is_err()
    );

    assert!(wait_for_condition(|| controller.marks().len() == 50, WAIT, POLL).await);
    let marked: Vec<i64> = controller.marks().iter().map(|m| m.offset).collect();
    assert_eq!(marked, offsets);

    group.close().await.unwrap();
}

#[tokio::test]
async fn test_partitions_keep_their_own_order() {
    let (group, mut streams, _controller) = start_group(
        group_config("2.1.0", "roundrobin"),
        vec![
            ClaimScript::numbered("t", 0, 0, 20),
            ClaimScript::numbered("t", 1, 0, 20),
        ],
    )
    .await
    .unwrap();

    let received = recv_messages(&mut streams.messages, 40, WAIT).await;
    for partition in [0, 1] {
        let offsets: Vec<i64> = received
            .iter()
            .filter(|m| m.partition == partition)
            .map(|m| m.offset)
            .collect();
        assert_eq!(offsets, (0..20).collect::<Vec<_>>(), "partition {}", partition);
    }

    group.close().await.unwrap();
}

#[tokio::test]
async fn test_rebalance_starts_new_generation() {
    let (group, mut streams, controller) = start_group(
        group_config("2.1.0", "sticky"),
        vec![ClaimScript::numbered("t", 0, 0, 2)],
    )
    .await
    .unwrap();
    recv_messages(&mut streams.messages, 2, WAIT).await;

    controller.rebalance();
    controller.assign(vec![ClaimScript::numbered("t", 0, 2, 2)]);

    let received = recv_messages(&mut streams.messages, 2, WAIT).await;
    assert_eq!(received.iter().map(|m| m.offset).collect::<Vec<_>>(), vec![2, 3]);
    assert!(wait_for_condition(|| group.generation() == 2, WAIT, POLL).await);
    assert!(wait_for_condition(|| controller.marks().len() == 4, WAIT, POLL).await);

    let generations: Vec<i32> = controller.marks().iter().map(|m| m.generation_id).collect();
    assert_eq!(generations, vec![1, 1, 2, 2]);

    group.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_transient_failure_is_retried_after_backoff() {
    let config = group_config("2.1.0", "range");
    let (client, controller) = InMemoryGroupClient::new("g");
    controller.fail("coordinator not available");
    controller.assign(vec![]);

    let started = tokio::time::Instant::now();
    let (group, mut streams) = ConsumerGroup::start_with(config, move |_| async move { Ok(client) })
        .await
        .unwrap();

    assert!(started.elapsed() >= Duration::from_secs(1));
    assert_eq!(controller.consume_calls(), 2);
    // Transient failures are logged, not surfaced
    assert!(streams.errors.try_recv().is_err());

    group.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_fatal_error_stops_supervisor_without_backoff() {
    let config = group_config("2.1.0", "range");
    let (group, _streams, controller) = start_group(config, vec![]).await.unwrap();

    controller.rebalance();
    controller.fail_with(MessagingError::Config(ConfigError::invalid("group_id", "revoked")));

    let started = tokio::time::Instant::now();
    tokio::time::timeout(WAIT, group.wait()).await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(group.is_finished());
    assert_eq!(controller.consume_calls(), 2);
    assert!(!controller.is_closed());
}

#[tokio::test]
async fn test_claim_errors_carry_their_partition() {
    let (group, streams, controller) =
        start_group(group_config("2.1.0", "range"), vec![ClaimScript::numbered("t", 3, 0, 3)])
            .await
            .unwrap();
    let mut errors = streams.errors;
    drop(streams.messages);

    controller.rebalance();
    let error = tokio::time::timeout(WAIT, errors.recv())
        .await
        .unwrap()
        .expect("error channel closed");

    assert_eq!(error.topic.as_deref(), Some("t"));
    assert_eq!(error.partition, Some(3));
    assert!(matches!(error.error, MessagingError::ChannelClosed(_)));

    group.close().await.unwrap();
}

#[tokio::test]
async fn test_commit_before_delivery_marks_ahead_of_the_application() {
    let mut config = group_config("2.1.0", "range");
    config.commit_order = CommitOrder::BeforeDelivery;

    let (group, mut streams, controller) =
        start_group(config, vec![ClaimScript::numbered("t", 0, 0, 3)]).await.unwrap();

    // One message buffered in the channel, the next one marked and waiting
    assert!(wait_for_condition(|| controller.marks().len() == 2, WAIT, POLL).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(controller.marks().len(), 2);

    recv_messages(&mut streams.messages, 3, WAIT).await;
    assert!(wait_for_condition(|| controller.marks().len() == 3, WAIT, POLL).await);

    group.close().await.unwrap();
}

#[tokio::test]
async fn test_commit_after_delivery_marks_once_buffered() {
    let config = group_config("2.1.0", "range");
    assert_eq!(config.commit_order, CommitOrder::AfterDelivery);

    let (group, mut streams, controller) =
        start_group(config, vec![ClaimScript::numbered("t", 0, 0, 3)]).await.unwrap();

    // The first message sits in the one-slot channel, unread, and is already marked
    assert!(wait_for_condition(|| controller.marks().len() == 1, WAIT, POLL).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(controller.marks().len(), 1);

    recv_messages(&mut streams.messages, 3, WAIT).await;
    assert!(wait_for_condition(|| controller.marks().len() == 3, WAIT, POLL).await);

    group.close().await.unwrap();
}

#[tokio::test]
async fn test_second_close_returns_already_closed() {
    let (group, _streams, controller) = start_group(group_config("2.1.0", "range"), vec![])
        .await
        .unwrap();

    group.close().await.unwrap();
    assert!(matches!(
        group.close().await,
        Err(MessagingError::AlreadyClosed(_))
    ));

    tokio::time::timeout(WAIT, group.wait()).await.unwrap();
    assert!(group.is_finished());
    assert_eq!(controller.close_calls(), 2);
}

#[tokio::test]
async fn test_start_fails_when_client_closes_before_first_setup() {
    let result = ConsumerGroup::start_with(group_config("2.1.0", "range"), |config| async move {
        let (client, _controller) = InMemoryGroupClient::new(config.group_id);
        client.close().await?;
        Ok::<_, MessagingError>(client)
    })
    .await;

    assert!(matches!(result, Err(MessagingError::GroupClosed)));
}

#[tokio::test(start_paused = true)]
async fn test_startup_timeout_closes_client() {
    let mut config = group_config("2.1.0", "range");
    config.startup_timeout_ms = Some(500);
    let (client, controller) = InMemoryGroupClient::new("g");

    let result = ConsumerGroup::start_with(config, move |_| async move { Ok(client) }).await;

    assert!(matches!(result, Err(MessagingError::Timeout { .. })));
    assert!(controller.is_closed());
}
