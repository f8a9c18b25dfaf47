//! Publish-and-acknowledge send strategy.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use streamgate_config::ProducerConfig;
use tracing::{debug, warn};

use super::{ProduceClient, ProducerStats, SendStrategy};
use crate::error::{MessagingError, Result};
use crate::message::ProducerRecord;

pub(crate) struct SyncSender {
    name: String,
    client: Arc<dyn ProduceClient>,
    send_timeout: Duration,
    ready: AtomicBool,
    stats: Arc<ProducerStats>,
}

impl SyncSender {
    pub(crate) fn new(
        config: &ProducerConfig,
        client: Arc<dyn ProduceClient>,
        stats: Arc<ProducerStats>,
    ) -> Self {
        Self {
            name: config.name.clone(),
            client,
            send_timeout: config.send_timeout(),
            ready: AtomicBool::new(true),
            stats,
        }
    }

    fn fail(&self, record: &ProducerRecord, error: MessagingError) -> MessagingError {
        self.stats.record_failed_attempt();
        self.stats.record_rejected();
        warn!(
            producer = %self.name,
            key = %record.key,
            topic = %record.topic,
            error = %error,
            retryable = error.is_retryable(),
            "Failed to send message"
        );
        error
    }
}

#[async_trait]
impl SendStrategy for SyncSender {
    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    async fn dispatch(&self, mut record: ProducerRecord) -> Result<()> {
        if !self.is_ready() {
            return Err(MessagingError::NotReady(self.name.clone()));
        }

        record.attempt = 1;
        self.stats.record_accepted();

        let pending = match self.client.enqueue(&record) {
            Ok(pending) => pending,
            Err(e) => return Err(self.fail(&record, e)),
        };

        match tokio::time::timeout(self.send_timeout, pending).await {
            Ok(Ok(report)) => {
                self.stats.record_delivered();
                debug!(
                    producer = %self.name,
                    key = %report.key,
                    topic = %report.topic,
                    partition = report.partition,
                    offset = report.offset,
                    "Message acknowledged"
                );
                Ok(())
            }
            Ok(Err(e)) => Err(self.fail(&record, e)),
            Err(_) => {
                let e = MessagingError::timeout(
                    format!("waiting for acknowledgement from topic {}", record.topic),
                    self.send_timeout.as_millis() as u64,
                );
                Err(self.fail(&record, e))
            }
        }
    }

    async fn close(&self, drain_timeout: Duration) -> Result<()> {
        if !self.ready.swap(false, Ordering::AcqRel) {
            return Err(MessagingError::AlreadyClosed("producer"));
        }
        let client = self.client.clone();
        tokio::task::spawn_blocking(move || client.flush(drain_timeout))
            .await
            .map_err(|e| MessagingError::client(e.to_string(), None))?
    }
}
