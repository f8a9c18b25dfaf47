//! Consumer-group coordination.
//!
//! A [`GroupClient`] runs one group session per [`GroupClient::consume`]
//! call and drives a [`GroupHandler`] through it: `setup` once the
//! generation's partitions are assigned, `consume_claim` once per assigned
//! partition (concurrently), `cleanup` after every claim has returned.
//! [`ConsumerGroup`] supervises repeated sessions and forwards claimed
//! messages to the application.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::message::{ConsumerError, Message};

mod coordinator;
mod kafka;

pub use coordinator::{ConsumerGroup, ConsumerStreams, ReadinessGate};
pub use kafka::KafkaGroupClient;

/// A topic/partition pair.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.topic, self.partition)
    }
}

/// Broker-side consumer group membership.
#[async_trait]
pub trait GroupClient: Send + Sync + 'static {
    /// Join the group for `topics` and run a single session.
    ///
    /// Returns `Ok(())` when the session ends because of a rebalance and
    /// [`MessagingError::GroupClosed`](crate::MessagingError::GroupClosed)
    /// once the client has been closed.
    async fn consume(&self, topics: &[String], handler: Arc<dyn GroupHandler>) -> Result<()>;

    /// Leave the group and release the client.
    async fn close(&self) -> Result<()>;
}

/// Callbacks for one group session.
#[async_trait]
pub trait GroupHandler: Send + Sync + 'static {
    /// Run at the beginning of a session, before any claim is consumed.
    async fn setup(&self, session: &dyn GroupSession) -> Result<()>;

    /// Run at the end of a session, once every claim has returned.
    async fn cleanup(&self, session: &dyn GroupSession) -> Result<()>;

    /// Consume one partition claim until its message stream ends.
    async fn consume_claim(&self, session: Arc<dyn GroupSession>, claim: Claim) -> Result<()>;

    /// Asynchronous consume-side failures.
    fn on_error(&self, _error: ConsumerError) {}
}

/// State of the current generation, shared by its claims.
pub trait GroupSession: Send + Sync {
    fn generation_id(&self) -> i32;

    fn member_id(&self) -> &str;

    /// Partitions assigned to this member in this generation
    fn assignment(&self) -> &[TopicPartition];

    /// Mark `offset` as processed. The committed position becomes `offset + 1`.
    fn mark_offset(&self, topic: &str, partition: i32, offset: i64, metadata: &str);

    fn mark_message(&self, message: &Message, metadata: &str) {
        self.mark_offset(&message.topic, message.partition, message.offset, metadata);
    }
}

/// The ordered messages of one partition owned during one session.
#[derive(Debug)]
pub struct Claim {
    topic: String,
    partition: i32,
    messages: mpsc::Receiver<Message>,
}

impl Claim {
    pub fn new(
        topic: impl Into<String>,
        partition: i32,
        messages: mpsc::Receiver<Message>,
    ) -> Self {
        Self {
            topic: topic.into(),
            partition,
            messages,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    /// Next message in partition order; `None` once the session released the partition.
    pub async fn next(&mut self) -> Option<Message> {
        self.messages.recv().await
    }
}
