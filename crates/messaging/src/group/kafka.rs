//! rdkafka-backed group client.
//!
//! rdkafka runs the group protocol itself; rebalance callbacks from the
//! consumer context are forwarded to the session router, which ends the
//! current session whenever the assignment changes. Messages are routed to
//! one bounded channel per assigned partition, so a slow claim applies
//! backpressure to the whole consumer the same way a blocked claim does
//! for the group protocol. A message polled for a partition that has no
//! open claim yet is held and handed to the next session's claim, since the
//! fetch position has already moved past it.

use async_trait::async_trait;
use chrono::DateTime;
use futures::future::join_all;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::error::{KafkaError, KafkaResult};
use rdkafka::message::{BorrowedMessage, Headers};
use rdkafka::{ClientContext, Message as _, TopicPartitionList};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use streamgate_config::{ConsumerGroupConfig, KafkaVersion, RebalanceStrategy};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{Claim, GroupClient, GroupHandler, GroupSession, TopicPartition};
use crate::error::{MessagingError, Result};
use crate::message::{ConsumerError, Message};
use crate::shutdown::signalled;

/// Assignment changes reported by the consumer context.
#[derive(Debug)]
enum RebalanceEvent {
    Assigned(Vec<TopicPartition>),
    Revoked(Vec<TopicPartition>),
    Failed(String),
}

fn partitions(tpl: &TopicPartitionList) -> Vec<TopicPartition> {
    tpl.elements()
        .iter()
        .map(|elem| TopicPartition::new(elem.topic(), elem.partition()))
        .collect()
}

/// Consumer context forwarding rebalances to the session router.
struct GroupContext {
    group_id: String,
    events: mpsc::UnboundedSender<RebalanceEvent>,
}

impl ClientContext for GroupContext {}

impl ConsumerContext for GroupContext {
    fn pre_rebalance(&self, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Revoke(tpl) => {
                info!(group_id = %self.group_id, "Partition revocation: {:?}", tpl);
                let _ = self.events.send(RebalanceEvent::Revoked(partitions(tpl)));
            }
            Rebalance::Assign(tpl) => {
                debug!(group_id = %self.group_id, "Partition assignment: {:?}", tpl);
            }
            Rebalance::Error(err) => {
                error!(group_id = %self.group_id, "Rebalance error: {}", err);
                let _ = self.events.send(RebalanceEvent::Failed(err.to_string()));
            }
        }
    }

    fn post_rebalance(&self, rebalance: &Rebalance) {
        if let Rebalance::Assign(tpl) = rebalance {
            let assigned = partitions(tpl);
            info!(
                group_id = %self.group_id,
                partitions = assigned.len(),
                "Successfully assigned partitions"
            );
            let _ = self.events.send(RebalanceEvent::Assigned(assigned));
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, _offsets: &TopicPartitionList) {
        match result {
            Ok(_) => debug!(group_id = %self.group_id, "Offsets committed"),
            Err(err) => warn!(group_id = %self.group_id, "Commit callback error: {}", err),
        }
    }
}

type GroupConsumer = StreamConsumer<GroupContext>;

/// Polled messages waiting for a claim of their partition, in fetch order.
type Held = HashMap<TopicPartition, VecDeque<Message>>;

/// Routing state, owned by one consume call at a time.
struct RouterState {
    events: mpsc::UnboundedReceiver<RebalanceEvent>,
    assignment: BTreeSet<TopicPartition>,
    held: Held,
}

/// Apply one rebalance event to the current assignment.
///
/// Eager assignors hand out the full assignment on every rebalance, the
/// cooperative one only the increment. Held messages of revoked partitions
/// are dropped: the fetch position goes with the partition and the next
/// owner starts from the committed offset.
fn apply_rebalance(
    assignment: &mut BTreeSet<TopicPartition>,
    held: &mut Held,
    event: &RebalanceEvent,
    cooperative: bool,
) {
    match event {
        RebalanceEvent::Assigned(added) => {
            if !cooperative {
                assignment.clear();
            }
            assignment.extend(added.iter().cloned());
        }
        RebalanceEvent::Revoked(removed) => {
            if cooperative {
                for tp in removed {
                    assignment.remove(tp);
                    held.remove(tp);
                }
            } else {
                assignment.clear();
                held.clear();
            }
        }
        RebalanceEvent::Failed(_) => {
            assignment.clear();
            held.clear();
        }
    }
}

fn hold(held: &mut Held, message: Message) {
    let tp = TopicPartition::new(message.topic.clone(), message.partition);
    debug!(
        partition = %tp,
        offset = message.offset,
        "Holding message until its partition is claimed"
    );
    held.entry(tp).or_default().push_back(message);
}

/// Group client over an rdkafka [`StreamConsumer`].
pub struct KafkaGroupClient {
    group_id: String,
    member_id: String,
    cooperative: bool,
    claim_buffer: usize,
    consumer: Arc<GroupConsumer>,
    router: Mutex<RouterState>,
    subscribed: AtomicBool,
    generation: AtomicI32,
    closed: watch::Sender<bool>,
}

impl KafkaGroupClient {
    /// Create the consumer and check that the brokers answer a metadata request.
    pub async fn connect(config: ConsumerGroupConfig) -> Result<Self> {
        let version = config.kafka_version()?;
        let strategy = config.strategy()?;
        let brokers = config.bootstrap_servers();
        if !version.supports_consumer_groups() {
            warn!(
                version = %version,
                "Protocol version predates broker-coordinated consumer groups"
            );
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let context = GroupContext {
            group_id: config.group_id.clone(),
            events: events_tx,
        };

        let consumer: GroupConsumer = Self::client_config(&config, version, strategy)
            .create_with_context(context)
            .map_err(|e| MessagingError::connect(e.to_string(), brokers.clone()))?;
        let consumer = Arc::new(consumer);

        let metadata = consumer.clone();
        let timeout = config.connect_timeout();
        tokio::task::spawn_blocking(move || metadata.fetch_metadata(None, timeout).map(|_| ()))
            .await
            .map_err(|e| MessagingError::connect(e.to_string(), brokers.clone()))?
            .map_err(|e| MessagingError::connect(e.to_string(), brokers.clone()))?;

        info!(
            group_id = %config.group_id,
            brokers = %brokers,
            version = %version,
            strategy = %strategy,
            "Connected consumer group client"
        );

        let (closed, _) = watch::channel(false);
        Ok(Self {
            group_id: config.group_id.clone(),
            member_id: format!("{}-{}", config.client_id, Uuid::new_v4()),
            cooperative: strategy.is_cooperative(),
            claim_buffer: config.message_buffer,
            consumer,
            router: Mutex::new(RouterState {
                events: events_rx,
                assignment: BTreeSet::new(),
                held: HashMap::new(),
            }),
            subscribed: AtomicBool::new(false),
            generation: AtomicI32::new(0),
            closed,
        })
    }

    /// librdkafka properties for a group consumer.
    pub fn client_config(
        config: &ConsumerGroupConfig,
        version: KafkaVersion,
        strategy: RebalanceStrategy,
    ) -> ClientConfig {
        let mut client_config = ClientConfig::new();

        client_config
            .set("bootstrap.servers", config.bootstrap_servers())
            .set("group.id", &config.group_id)
            .set("client.id", &config.client_id)
            .set("partition.assignment.strategy", strategy.assignor())
            .set("auto.offset.reset", config.offset_reset.auto_offset_reset())
            // Offsets are stored by mark_offset and committed in the background
            .set("enable.auto.commit", "true")
            .set("enable.auto.offset.store", "false")
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", config.session_timeout_ms.to_string())
            .set(
                "api.version.request",
                version.supports_api_version_request().to_string(),
            )
            .set("broker.version.fallback", version.as_str());

        for (key, value) in &config.extra {
            client_config.set(key, value);
        }

        client_config
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Hand `message` to its claim, or hold it when the partition has no open claim.
    ///
    /// Returns `false` if the client closed while the claim was full.
    async fn forward(
        &self,
        claims: &mut HashMap<TopicPartition, mpsc::Sender<Message>>,
        held: &mut Held,
        message: Message,
    ) -> bool {
        let tp = TopicPartition::new(message.topic.clone(), message.partition);
        let Some(claim) = claims.get(&tp).cloned() else {
            hold(held, message);
            return true;
        };

        let mut closed = self.closed.subscribe();
        tokio::select! {
            biased;
            _ = signalled(&mut closed) => false,
            sent = claim.send(message) => {
                if let Err(mpsc::error::SendError(message)) = sent {
                    // Claim returned early; later messages wait for the next session
                    claims.remove(&tp);
                    hold(held, message);
                }
                true
            }
        }
    }

    /// Route messages to claims until the assignment changes or the client closes.
    async fn route(
        &self,
        router: &mut RouterState,
        claims: &mut HashMap<TopicPartition, mpsc::Sender<Message>>,
        handler: &Arc<dyn GroupHandler>,
    ) -> SessionEnd {
        let RouterState {
            events,
            assignment,
            held,
        } = router;

        // Messages polled before this session started go first
        let owned: Vec<TopicPartition> = claims.keys().cloned().collect();
        for tp in owned {
            for message in held.remove(&tp).unwrap_or_default() {
                if !self.forward(claims, held, message).await {
                    return SessionEnd::Closed;
                }
            }
        }

        let mut closed = self.closed.subscribe();
        loop {
            // Rebalance events win over fetched messages so an assignment is
            // applied before messages of the new partitions are routed
            tokio::select! {
                biased;
                _ = signalled(&mut closed) => return SessionEnd::Closed,
                event = events.recv() => match event {
                    Some(event) => {
                        apply_rebalance(assignment, held, &event, self.cooperative);
                        return match event {
                            RebalanceEvent::Failed(reason) => SessionEnd::Failed(reason),
                            _ => SessionEnd::Rebalanced,
                        };
                    }
                    None => return SessionEnd::Closed,
                },
                received = self.consumer.recv() => match received {
                    Ok(borrowed) => {
                        let message = to_message(&borrowed);
                        drop(borrowed);
                        if !self.forward(claims, held, message).await {
                            return SessionEnd::Closed;
                        }
                    }
                    Err(KafkaError::PartitionEOF(_)) => {}
                    Err(e) => {
                        warn!(group_id = %self.group_id, error = %e, "Error receiving message");
                        handler.on_error(ConsumerError::new(e.into()));
                    }
                },
            }
        }
    }
}

enum SessionEnd {
    Rebalanced,
    Closed,
    Failed(String),
}

fn to_message(msg: &BorrowedMessage<'_>) -> Message {
    let mut message = Message::new(
        msg.topic(),
        msg.partition(),
        msg.offset(),
        msg.payload().map(|p| p.to_vec()).unwrap_or_default(),
    );
    if let Some(key) = msg.key() {
        message = message.with_key(key);
    }
    if let Some(timestamp) = msg.timestamp().to_millis().and_then(DateTime::from_timestamp_millis) {
        message = message.with_timestamp(timestamp);
    }
    if let Some(headers) = msg.headers() {
        for idx in 0..headers.count() {
            let header = headers.get(idx);
            message = message.with_header(header.key, header.value.unwrap_or_default());
        }
    }
    message
}

#[async_trait]
impl GroupClient for KafkaGroupClient {
    async fn consume(&self, topics: &[String], handler: Arc<dyn GroupHandler>) -> Result<()> {
        if self.is_closed() {
            return Err(MessagingError::GroupClosed);
        }

        // One session at a time
        let mut guard = self.router.lock().await;
        let router = &mut *guard;

        if !self.subscribed.swap(true, Ordering::SeqCst) {
            let topic_refs: Vec<&str> = topics.iter().map(|s| s.as_str()).collect();
            if let Err(e) = self.consumer.subscribe(&topic_refs) {
                self.subscribed.store(false, Ordering::SeqCst);
                return Err(MessagingError::consume(e.to_string(), &self.group_id));
            }
            info!(group_id = %self.group_id, "Subscribed to topics: {:?}", topics);
        }

        while let Ok(event) = router.events.try_recv() {
            apply_rebalance(&mut router.assignment, &mut router.held, &event, self.cooperative);
        }

        // Join: the consumer has to be polled for the assignment to arrive
        {
            let RouterState {
                events,
                assignment,
                held,
            } = &mut *router;
            let mut closed = self.closed.subscribe();
            while assignment.is_empty() {
                tokio::select! {
                    biased;
                    _ = signalled(&mut closed) => return Err(MessagingError::GroupClosed),
                    event = events.recv() => match event {
                        Some(RebalanceEvent::Failed(reason)) => {
                            return Err(MessagingError::consume(reason, &self.group_id));
                        }
                        Some(event) => apply_rebalance(assignment, held, &event, self.cooperative),
                        None => return Err(MessagingError::GroupClosed),
                    },
                    received = self.consumer.recv() => match received {
                        Ok(borrowed) => {
                            let message = to_message(&borrowed);
                            drop(borrowed);
                            hold(held, message);
                        }
                        Err(KafkaError::PartitionEOF(_)) => {}
                        Err(e) => {
                            return Err(MessagingError::consume(e.to_string(), &self.group_id));
                        }
                    },
                }
            }
        }

        let session = Arc::new(KafkaSession {
            consumer: self.consumer.clone(),
            generation_id: self.generation.fetch_add(1, Ordering::SeqCst) + 1,
            member_id: self.member_id.clone(),
            assignment: router.assignment.iter().cloned().collect(),
        });
        let dyn_session: Arc<dyn GroupSession> = session.clone();

        handler.setup(dyn_session.as_ref()).await?;

        let mut claims = HashMap::new();
        let mut tasks = Vec::new();
        for tp in session.assignment.iter() {
            let (tx, rx) = mpsc::channel(self.claim_buffer);
            claims.insert(tp.clone(), tx);
            let handler = handler.clone();
            let session = dyn_session.clone();
            let claim = Claim::new(tp.topic.clone(), tp.partition, rx);
            let task = tokio::spawn(async move { handler.consume_claim(session, claim).await });
            tasks.push((tp.clone(), task));
        }

        let end = self.route(router, &mut claims, &handler).await;

        // Closing the claim channels ends every claim
        drop(claims);
        let (owners, handles): (Vec<_>, Vec<_>) = tasks.into_iter().unzip();
        for (tp, joined) in owners.into_iter().zip(join_all(handles).await) {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(
                        group_id = %self.group_id,
                        partition = %tp,
                        error = %e,
                        "Claim ended with error"
                    );
                    handler.on_error(ConsumerError::at(tp.topic, tp.partition, e));
                }
                Err(e) => error!(
                    group_id = %self.group_id,
                    partition = %tp,
                    error = %e,
                    "Claim task failed"
                ),
            }
        }

        handler.cleanup(dyn_session.as_ref()).await?;

        match end {
            SessionEnd::Rebalanced => Ok(()),
            SessionEnd::Closed => Err(MessagingError::GroupClosed),
            SessionEnd::Failed(reason) => Err(MessagingError::consume(reason, &self.group_id)),
        }
    }

    async fn close(&self) -> Result<()> {
        if self.closed.send_replace(true) {
            return Err(MessagingError::AlreadyClosed("consumer group"));
        }
        if self.subscribed.load(Ordering::SeqCst) {
            self.consumer.unsubscribe();
        }
        info!(group_id = %self.group_id, "Consumer group client closed");
        Ok(())
    }
}

struct KafkaSession {
    consumer: Arc<GroupConsumer>,
    generation_id: i32,
    member_id: String,
    assignment: Vec<TopicPartition>,
}

impl GroupSession for KafkaSession {
    fn generation_id(&self) -> i32 {
        self.generation_id
    }

    fn member_id(&self) -> &str {
        &self.member_id
    }

    fn assignment(&self) -> &[TopicPartition] {
        &self.assignment
    }

    fn mark_offset(&self, topic: &str, partition: i32, offset: i64, _metadata: &str) {
        // librdkafka commits the stored offset + 1
        if let Err(e) = self.consumer.store_offset(topic, partition, offset) {
            warn!(topic, partition, offset, error = %e, "Failed to store offset");
        }
    }
}
