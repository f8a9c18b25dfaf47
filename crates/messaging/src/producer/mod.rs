//! Producer gateway.
//!
//! A [`ProducerGateway`] is bound to one producer name and refuses sends
//! for any other. Payloads are encoded with the gateway's codec and then
//! handed to one of two send strategies:
//!
//! - **async**: the record is queued and `send` returns right away. A pump
//!   task feeds the broker client in queue order and a triage task resubmits
//!   failed records according to the [`RetryPolicy`](streamgate_config::RetryPolicy).
//! - **sync**: `send` waits for the broker acknowledgement (bounded by the
//!   send timeout) and returns delivery failures to the caller.

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use streamgate_config::{ProducerConfig, ProducerMode};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::codec::{JsonCodec, PayloadCodec};
use crate::error::{MessagingError, Result};
use crate::message::{DeliveryReport, ErrorEvent, ProducerRecord};

mod async_send;
mod kafka;
mod sync_send;

pub use kafka::KafkaProduceClient;

use async_send::AsyncSender;
use sync_send::SyncSender;

/// Resolves once the broker acknowledged or rejected a record.
pub type PendingDelivery = BoxFuture<'static, Result<DeliveryReport>>;

/// Broker-side producer.
pub trait ProduceClient: Send + Sync + 'static {
    /// Hand `record` to the client's send queue.
    ///
    /// Records enqueued one after the other keep that order per partition.
    /// An `Err` means the record was never queued.
    fn enqueue(&self, record: &ProducerRecord) -> Result<PendingDelivery>;

    /// Wait for queued records to be acknowledged.
    fn flush(&self, timeout: Duration) -> Result<()>;
}

#[async_trait]
trait SendStrategy: Send + Sync {
    fn is_ready(&self) -> bool;

    async fn dispatch(&self, record: ProducerRecord) -> Result<()>;

    async fn close(&self, drain_timeout: Duration) -> Result<()>;

    fn take_dead_letters(&self) -> Option<mpsc::UnboundedReceiver<ErrorEvent>> {
        None
    }
}

/// Counters shared by a gateway and its background tasks.
#[derive(Debug, Default)]
pub(crate) struct ProducerStats {
    accepted: AtomicU64,
    delivered: AtomicU64,
    failed_attempts: AtomicU64,
    resubmitted: AtomicU64,
    dead_lettered: AtomicU64,
    rejected: AtomicU64,
}

impl ProducerStats {
    pub(crate) fn record_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failed_attempt(&self) {
        self.failed_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_resubmitted(&self) {
        self.resubmitted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dead_lettered(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    /// A record given up on and reported back to the caller
    pub(crate) fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Accepted records that have neither been delivered nor given up on.
    pub(crate) fn outstanding(&self) -> u64 {
        let finished = self.delivered.load(Ordering::Acquire)
            + self.dead_lettered.load(Ordering::Acquire)
            + self.rejected.load(Ordering::Acquire);
        self.accepted.load(Ordering::Acquire).saturating_sub(finished)
    }

    pub(crate) fn snapshot(&self) -> ProducerStatsSnapshot {
        ProducerStatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            failed_attempts: self.failed_attempts.load(Ordering::Relaxed),
            resubmitted: self.resubmitted.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            outstanding: self.outstanding(),
        }
    }
}

/// Point-in-time view of a gateway's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProducerStatsSnapshot {
    /// Records accepted by `send`
    pub accepted: u64,
    pub delivered: u64,
    /// Delivery attempts that failed, including retried ones
    pub failed_attempts: u64,
    pub resubmitted: u64,
    pub dead_lettered: u64,
    pub outstanding: u64,
}

/// Named, codec-aware entry point for producing records.
pub struct ProducerGateway<C = JsonCodec> {
    name: String,
    mode: ProducerMode,
    codec: C,
    client: Arc<dyn ProduceClient>,
    strategy: Box<dyn SendStrategy>,
    stats: Arc<ProducerStats>,
}

impl ProducerGateway<JsonCodec> {
    /// Validate `config`, connect to the brokers and start the send strategy.
    pub async fn new(config: ProducerConfig) -> Result<Self> {
        config.validate()?;
        let client = KafkaProduceClient::connect(&config).await?;
        Self::with_client(config, Arc::new(client))
    }

    /// Build a gateway over an existing client. Async gateways spawn their
    /// background tasks here, so this has to run inside a tokio runtime.
    pub fn with_client(config: ProducerConfig, client: Arc<dyn ProduceClient>) -> Result<Self> {
        config.validate()?;

        let stats = Arc::new(ProducerStats::default());
        let strategy: Box<dyn SendStrategy> = match config.mode {
            ProducerMode::Async => {
                Box::new(AsyncSender::start(&config, client.clone(), stats.clone()))
            }
            ProducerMode::Sync => Box::new(SyncSender::new(&config, client.clone(), stats.clone())),
        };

        info!(
            producer = %config.name,
            mode = ?config.mode,
            brokers = %config.bootstrap_servers(),
            "Producer gateway ready"
        );

        Ok(Self {
            name: config.name,
            mode: config.mode,
            codec: JsonCodec,
            client,
            strategy,
            stats,
        })
    }
}

impl<C: PayloadCodec> ProducerGateway<C> {
    /// Swap the payload codec.
    pub fn with_codec<D: PayloadCodec>(self, codec: D) -> ProducerGateway<D> {
        ProducerGateway {
            name: self.name,
            mode: self.mode,
            codec,
            client: self.client,
            strategy: self.strategy,
            stats: self.stats,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> ProducerMode {
        self.mode
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }

    /// Whether `send` currently accepts records.
    pub fn is_ready(&self) -> bool {
        self.strategy.is_ready()
    }

    /// Encode `payload` and send it to `topic` under `key`.
    ///
    /// `producer_name` has to match the gateway's bound name; a mismatch
    /// fails with [`MessagingError::ProducerIdentity`] before anything is
    /// encoded or sent. In async mode `Ok` means the record was accepted,
    /// not that it was delivered.
    pub async fn send<T>(
        &self,
        producer_name: &str,
        topic: &str,
        key: &str,
        payload: &T,
    ) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        if producer_name != self.name {
            return Err(MessagingError::identity(&self.name, producer_name));
        }

        let bytes = self.codec.encode(payload)?;
        debug!(
            producer = %self.name,
            topic,
            key,
            bytes = bytes.len(),
            "Sending message"
        );

        self.strategy
            .dispatch(ProducerRecord::new(topic, key, bytes))
            .await
    }

    /// Block until the client has flushed queued records.
    pub async fn flush(&self, timeout: Duration) -> Result<()> {
        let client = self.client.clone();
        tokio::task::spawn_blocking(move || client.flush(timeout))
            .await
            .map_err(|e| MessagingError::client(e.to_string(), None))?
    }

    /// Stop accepting sends, wait up to `drain_timeout` for outstanding
    /// records and flush the client.
    pub async fn close(&self, drain_timeout: Duration) -> Result<()> {
        self.strategy.close(drain_timeout).await?;
        info!(producer = %self.name, stats = ?self.stats(), "Producer gateway closed");
        Ok(())
    }

    pub fn stats(&self) -> ProducerStatsSnapshot {
        self.stats.snapshot()
    }

    /// Receiver for records that exhausted their retry attempts.
    ///
    /// Only the first call returns the receiver, and only async gateways have one.
    pub fn take_dead_letters(&self) -> Option<mpsc::UnboundedReceiver<ErrorEvent>> {
        self.strategy.take_dead_letters()
    }
}

impl<C> std::fmt::Debug for ProducerGateway<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProducerGateway")
            .field("name", &self.name)
            .field("mode", &self.mode)
            .field("stats", &self.stats.snapshot())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_outstanding() {
        let stats = ProducerStats::default();
        for _ in 0..4 {
            stats.record_accepted();
        }
        stats.record_delivered();
        stats.record_failed_attempt();
        stats.record_resubmitted();
        stats.record_dead_lettered();
        stats.record_rejected();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.accepted, 4);
        assert_eq!(snapshot.failed_attempts, 1);
        assert_eq!(snapshot.outstanding, 1);
    }

    #[test]
    fn test_outstanding_never_underflows() {
        let stats = ProducerStats::default();
        stats.record_delivered();
        assert_eq!(stats.outstanding(), 0);
    }
}
