//! In-memory broker clients.
//!
//! [`InMemoryGroupClient`] plays back a script of group sessions pushed
//! through its [`GroupController`]; [`InMemoryProducer`] acknowledges
//! records locally and can be told to fail the next N of them. Both are
//! used by the test suites and by the CLI's dry-run mode.

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::error::{MessagingError, Result};
use crate::group::{Claim, GroupClient, GroupHandler, GroupSession, TopicPartition};
use crate::message::{ConsumerError, DeliveryReport, Message, ProducerRecord};
use crate::producer::{PendingDelivery, ProduceClient};
use crate::shutdown::signalled;

/// Messages one partition will deliver during a scripted session.
#[derive(Debug, Clone)]
pub struct ClaimScript {
    pub topic: String,
    pub partition: i32,
    pub messages: Vec<Message>,
}

impl ClaimScript {
    pub fn new(topic: impl Into<String>, partition: i32, messages: Vec<Message>) -> Self {
        Self {
            topic: topic.into(),
            partition,
            messages,
        }
    }

    /// `count` messages with JSON-encoded sequence numbers as values, starting at `first_offset`.
    pub fn numbered(
        topic: impl Into<String>,
        partition: i32,
        first_offset: i64,
        count: usize,
    ) -> Self {
        let topic = topic.into();
        let messages = (0..count as i64)
            .map(|i| {
                let value = (i + 1).to_string().into_bytes();
                Message::new(topic.clone(), partition, first_offset + i, value)
                    .with_key(format!("m{}", i + 1))
            })
            .collect();
        Self::new(topic, partition, messages)
    }
}

#[derive(Debug)]
enum Step {
    Session(Vec<ClaimScript>),
    Rebalance,
    Fail(MessagingError),
}

/// An offset marked through a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkedOffset {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub generation_id: i32,
}

struct GroupState {
    group_id: String,
    claim_buffer: usize,
    steps: Mutex<VecDeque<Step>>,
    step_added: watch::Sender<u64>,
    closed: watch::Sender<bool>,
    generation: AtomicI32,
    consume_calls: AtomicUsize,
    close_calls: AtomicUsize,
    marks: Mutex<Vec<MarkedOffset>>,
    session_lock: tokio::sync::Mutex<()>,
}

impl GroupState {
    fn push(&self, step: Step) {
        self.steps.lock().push_back(step);
        self.step_added.send_modify(|n| *n += 1);
    }

    async fn next_step(&self, closed: &mut watch::Receiver<bool>) -> Option<Step> {
        let mut added = self.step_added.subscribe();
        loop {
            if *closed.borrow_and_update() {
                return None;
            }
            if let Some(step) = self.steps.lock().pop_front() {
                return Some(step);
            }
            tokio::select! {
                _ = added.changed() => {}
                _ = closed.changed() => {}
            }
        }
    }
}

/// Scriptable group client.
pub struct InMemoryGroupClient {
    state: Arc<GroupState>,
}

/// Drives an [`InMemoryGroupClient`] from the outside.
#[derive(Clone)]
pub struct GroupController {
    state: Arc<GroupState>,
}

impl InMemoryGroupClient {
    pub fn new(group_id: impl Into<String>) -> (Self, GroupController) {
        Self::with_claim_buffer(group_id, 1)
    }

    pub fn with_claim_buffer(
        group_id: impl Into<String>,
        claim_buffer: usize,
    ) -> (Self, GroupController) {
        let (step_added, _) = watch::channel(0);
        let (closed, _) = watch::channel(false);
        let state = Arc::new(GroupState {
            group_id: group_id.into(),
            claim_buffer: claim_buffer.max(1),
            steps: Mutex::new(VecDeque::new()),
            step_added,
            closed,
            generation: AtomicI32::new(0),
            consume_calls: AtomicUsize::new(0),
            close_calls: AtomicUsize::new(0),
            marks: Mutex::new(Vec::new()),
            session_lock: tokio::sync::Mutex::new(()),
        });
        (
            Self {
                state: state.clone(),
            },
            GroupController { state },
        )
    }

    async fn run_session(
        &self,
        claims: Vec<ClaimScript>,
        handler: Arc<dyn GroupHandler>,
        closed: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let session = Arc::new(MemorySession {
            state: self.state.clone(),
            generation_id: self.state.generation.fetch_add(1, Ordering::SeqCst) + 1,
            member_id: format!("{}-member", self.state.group_id),
            assignment: claims
                .iter()
                .map(|c| TopicPartition::new(c.topic.clone(), c.partition))
                .collect(),
        });
        let dyn_session: Arc<dyn GroupSession> = session.clone();

        handler.setup(dyn_session.as_ref()).await?;

        let (end_tx, end_rx) = watch::channel(false);
        let mut tasks = Vec::new();
        for script in claims {
            let (tx, rx) = mpsc::channel(self.state.claim_buffer);
            let mut end = end_rx.clone();
            tokio::spawn(async move {
                for message in script.messages {
                    tokio::select! {
                        sent = tx.send(message) => if sent.is_err() { return },
                        _ = signalled(&mut end) => return,
                    }
                }
                // The claim stays open until the session ends
                signalled(&mut end).await;
            });

            let handler = handler.clone();
            let session = dyn_session.clone();
            let owner = TopicPartition::new(script.topic.clone(), script.partition);
            let claim = Claim::new(script.topic, script.partition, rx);
            let task = tokio::spawn(async move { handler.consume_claim(session, claim).await });
            tasks.push((owner, task));
        }

        let outcome = match self.state.next_step(closed).await {
            None => Err(MessagingError::GroupClosed),
            Some(Step::Rebalance) => Ok(()),
            Some(other) => {
                // Session ends here; the step runs on the next consume call
                self.state.steps.lock().push_front(other);
                Ok(())
            }
        };

        let _ = end_tx.send(true);
        for (owner, task) in tasks {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => handler.on_error(ConsumerError::at(owner.topic, owner.partition, e)),
                Err(e) => warn!(partition = %owner, error = %e, "Claim task failed"),
            }
        }

        handler.cleanup(dyn_session.as_ref()).await?;
        outcome
    }
}

#[async_trait]
impl GroupClient for InMemoryGroupClient {
    async fn consume(&self, _topics: &[String], handler: Arc<dyn GroupHandler>) -> Result<()> {
        self.state.consume_calls.fetch_add(1, Ordering::SeqCst);
        let _session = self.state.session_lock.lock().await;
        let mut closed = self.state.closed.subscribe();

        match self.state.next_step(&mut closed).await {
            None => Err(MessagingError::GroupClosed),
            Some(Step::Fail(error)) => Err(error),
            Some(Step::Rebalance) => Ok(()),
            Some(Step::Session(claims)) => self.run_session(claims, handler, &mut closed).await,
        }
    }

    async fn close(&self) -> Result<()> {
        self.state.close_calls.fetch_add(1, Ordering::SeqCst);
        if self.state.closed.send_replace(true) {
            return Err(MessagingError::AlreadyClosed("consumer group"));
        }
        debug!(group_id = %self.state.group_id, "In-memory group client closed");
        Ok(())
    }
}

impl GroupController {
    /// Start a session owning the given claims.
    pub fn assign(&self, claims: Vec<ClaimScript>) {
        self.state.push(Step::Session(claims));
    }

    /// End the current session.
    pub fn rebalance(&self) {
        self.state.push(Step::Rebalance);
    }

    /// Fail the next consume call with a transient consume error.
    pub fn fail(&self, reason: impl Into<String>) {
        let error = MessagingError::consume(reason, self.state.group_id.clone());
        self.state.push(Step::Fail(error));
    }

    /// Fail the next consume call with `error`.
    pub fn fail_with(&self, error: MessagingError) {
        self.state.push(Step::Fail(error));
    }

    pub fn marks(&self) -> Vec<MarkedOffset> {
        self.state.marks.lock().clone()
    }

    pub fn consume_calls(&self) -> usize {
        self.state.consume_calls.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> usize {
        self.state.close_calls.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        *self.state.closed.borrow()
    }

    /// Generation id of the latest session
    pub fn generation(&self) -> i32 {
        self.state.generation.load(Ordering::SeqCst)
    }
}

struct MemorySession {
    state: Arc<GroupState>,
    generation_id: i32,
    member_id: String,
    assignment: Vec<TopicPartition>,
}

impl GroupSession for MemorySession {
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
        self.state.marks.lock().push(MarkedOffset {
            topic: topic.to_string(),
            partition,
            offset,
            generation_id: self.generation_id,
        });
    }
}

#[derive(Default)]
struct ProducerState {
    attempts: Mutex<Vec<ProducerRecord>>,
    delivered: Mutex<Vec<DeliveryReport>>,
    offsets: Mutex<HashMap<String, i64>>,
    fail_remaining: AtomicUsize,
    flushes: AtomicUsize,
    latency: Mutex<Duration>,
}

/// Producer client that acknowledges records locally.
#[derive(Clone, Default)]
pub struct InMemoryProducer {
    state: Arc<ProducerState>,
}

impl InMemoryProducer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` deliveries.
    pub fn fail_next(&self, count: usize) {
        self.state.fail_remaining.store(count, Ordering::SeqCst);
    }

    /// Delay every acknowledgement by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        *self.state.latency.lock() = latency;
    }

    /// Every record handed to the client, in enqueue order
    pub fn attempts(&self) -> Vec<ProducerRecord> {
        self.state.attempts.lock().clone()
    }

    pub fn attempt_count(&self) -> usize {
        self.state.attempts.lock().len()
    }

    pub fn delivered(&self) -> Vec<DeliveryReport> {
        self.state.delivered.lock().clone()
    }

    pub fn flush_count(&self) -> usize {
        self.state.flushes.load(Ordering::SeqCst)
    }

    fn take_failure(&self) -> bool {
        self.state
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl ProduceClient for InMemoryProducer {
    fn enqueue(&self, record: &ProducerRecord) -> Result<PendingDelivery> {
        self.state.attempts.lock().push(record.clone());
        let latency = *self.state.latency.lock();

        if self.take_failure() {
            let topic = record.topic.clone();
            return Ok(async move {
                tokio::time::sleep(latency).await;
                Err(MessagingError::delivery("injected failure", topic))
            }
            .boxed());
        }

        let offset = {
            let mut offsets = self.state.offsets.lock();
            let next = offsets.entry(record.topic.clone()).or_insert(0);
            let offset = *next;
            *next += 1;
            offset
        };
        let report = DeliveryReport {
            topic: record.topic.clone(),
            key: record.key.clone(),
            partition: 0,
            offset,
        };

        let state = self.state.clone();
        Ok(async move {
            tokio::time::sleep(latency).await;
            state.delivered.lock().push(report.clone());
            Ok(report)
        }
        .boxed())
    }

    fn flush(&self, _timeout: Duration) -> Result<()> {
        self.state.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_producer_failure_injection() {
        let producer = InMemoryProducer::new();
        producer.fail_next(2);

        let record = ProducerRecord::new("t", "k", b"1".to_vec());
        assert!(producer.enqueue(&record).unwrap().await.is_err());
        assert!(producer.enqueue(&record).unwrap().await.is_err());
        let report = producer.enqueue(&record).unwrap().await.unwrap();

        assert_eq!(report.offset, 0);
        assert_eq!(producer.attempt_count(), 3);
        assert_eq!(producer.delivered(), vec![report]);
    }

    #[tokio::test]
    async fn test_group_client_close_twice() {
        let (client, controller) = InMemoryGroupClient::new("g");
        client.close().await.unwrap();
        assert!(matches!(
            client.close().await,
            Err(MessagingError::AlreadyClosed(_))
        ));
        assert!(controller.is_closed());
        assert_eq!(controller.close_calls(), 2);
    }

    #[test]
    fn test_numbered_claim_script() {
        let script = ClaimScript::numbered("t", 2, 10, 3);
        let offsets: Vec<i64> = script.messages.iter().map(|m| m.offset).collect();
        assert_eq!(offsets, vec![10, 11, 12]);
        assert_eq!(script.messages[0].key_str().as_deref(), Some("m1"));
        assert_eq!(script.messages[2].value, b"3".to_vec());
    }
}
