//! Fire-and-forget send strategy with a background retry loop.

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use streamgate_config::{ProducerConfig, RetryPolicy};
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, error, info, warn};

use super::{ProduceClient, ProducerStats, SendStrategy};
use crate::error::{MessagingError, Result};
use crate::message::{DeliveryReport, ErrorEvent, ProducerRecord};
use crate::shutdown::signalled;

pub(crate) struct AsyncSender {
    name: String,
    input: mpsc::Sender<ProducerRecord>,
    ready: AtomicBool,
    client: Arc<dyn ProduceClient>,
    stats: Arc<ProducerStats>,
    drained: Arc<Notify>,
    shutdown: watch::Sender<bool>,
    dead_letters: Mutex<Option<mpsc::UnboundedReceiver<ErrorEvent>>>,
}

impl AsyncSender {
    /// Spawn the pump and triage tasks and mark the sender ready.
    pub(crate) fn start(
        config: &ProducerConfig,
        client: Arc<dyn ProduceClient>,
        stats: Arc<ProducerStats>,
    ) -> Self {
        let (input_tx, input_rx) = mpsc::channel(config.channel_capacity);
        let (error_tx, error_rx) = mpsc::unbounded_channel();
        let (success_tx, success_rx) = mpsc::unbounded_channel();
        let (dead_tx, dead_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let drained = Arc::new(Notify::new());

        tokio::spawn(pump(
            input_rx,
            client.clone(),
            error_tx,
            success_tx,
            shutdown_rx.clone(),
        ));

        let triage = Triage {
            producer: config.name.clone(),
            input: input_tx.clone(),
            policy: config.retry.clone(),
            stats: stats.clone(),
            dead_letters: dead_tx,
            drained: drained.clone(),
        };
        tokio::spawn(triage.run(error_rx, success_rx, shutdown_rx));

        Self {
            name: config.name.clone(),
            input: input_tx,
            ready: AtomicBool::new(true),
            client,
            stats,
            drained,
            shutdown: shutdown_tx,
            dead_letters: Mutex::new(Some(dead_rx)),
        }
    }

    async fn wait_drained(&self) {
        loop {
            let notified = self.drained.notified();
            if self.stats.outstanding() == 0 {
                return;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl SendStrategy for AsyncSender {
    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    async fn dispatch(&self, record: ProducerRecord) -> Result<()> {
        if !self.is_ready() {
            return Err(MessagingError::NotReady(self.name.clone()));
        }

        self.stats.record_accepted();
        if self.input.send(record).await.is_err() {
            self.stats.record_rejected();
            return Err(MessagingError::ChannelClosed("producer input"));
        }
        Ok(())
    }

    async fn close(&self, drain_timeout: Duration) -> Result<()> {
        if !self.ready.swap(false, Ordering::AcqRel) {
            return Err(MessagingError::AlreadyClosed("producer"));
        }

        let started = tokio::time::Instant::now();
        if tokio::time::timeout(drain_timeout, self.wait_drained())
            .await
            .is_err()
        {
            warn!(
                producer = %self.name,
                outstanding = self.stats.outstanding(),
                "Drain timed out, abandoning outstanding records"
            );
        }
        self.shutdown.send_replace(true);

        let remaining = drain_timeout.saturating_sub(started.elapsed());
        let client = self.client.clone();
        tokio::task::spawn_blocking(move || client.flush(remaining))
            .await
            .map_err(|e| MessagingError::client(e.to_string(), None))??;
        Ok(())
    }

    fn take_dead_letters(&self) -> Option<mpsc::UnboundedReceiver<ErrorEvent>> {
        self.dead_letters.lock().take()
    }
}

type InFlight = futures::future::BoxFuture<'static, (ProducerRecord, Result<DeliveryReport>)>;

/// Feed queued records to the client in order and report each outcome.
async fn pump(
    mut input: mpsc::Receiver<ProducerRecord>,
    client: Arc<dyn ProduceClient>,
    errors: mpsc::UnboundedSender<ErrorEvent>,
    successes: mpsc::UnboundedSender<DeliveryReport>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut in_flight: FuturesUnordered<InFlight> = FuturesUnordered::new();

    loop {
        tokio::select! {
            _ = signalled(&mut shutdown) => break,
            Some((record, outcome)) = in_flight.next(), if !in_flight.is_empty() => {
                match outcome {
                    Ok(report) => {
                        let _ = successes.send(report);
                    }
                    Err(error) => {
                        let _ = errors.send(ErrorEvent { record, error });
                    }
                }
            }
            queued = input.recv() => match queued {
                Some(mut record) => {
                    record.attempt = record.attempt.saturating_add(1);
                    match client.enqueue(&record) {
                        Ok(pending) => {
                            in_flight.push(pending.map(move |outcome| (record, outcome)).boxed());
                        }
                        Err(error) => {
                            let _ = errors.send(ErrorEvent { record, error });
                        }
                    }
                }
                None => break,
            },
        }
    }

    debug!(in_flight = in_flight.len(), "Producer pump stopped");
}

struct Triage {
    producer: String,
    input: mpsc::Sender<ProducerRecord>,
    policy: RetryPolicy,
    stats: Arc<ProducerStats>,
    dead_letters: mpsc::UnboundedSender<ErrorEvent>,
    drained: Arc<Notify>,
}

impl Triage {
    async fn run(
        self,
        mut errors: mpsc::UnboundedReceiver<ErrorEvent>,
        mut successes: mpsc::UnboundedReceiver<DeliveryReport>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = signalled(&mut shutdown) => break,
                Some(event) = errors.recv() => self.on_error(event).await,
                Some(report) = successes.recv() => self.on_success(report),
                else => break,
            }
        }
        debug!(producer = %self.producer, "Producer triage stopped");
    }

    async fn on_error(&self, event: ErrorEvent) {
        self.stats.record_failed_attempt();
        error!(
            producer = %self.producer,
            key = %event.record.key,
            topic = %event.record.topic,
            attempt = event.record.attempt,
            error = %event.error,
            "Failed to send message"
        );

        if !self.policy.allows_another(event.record.attempt) {
            error!(
                producer = %self.producer,
                key = %event.record.key,
                topic = %event.record.topic,
                attempts = event.record.attempt,
                "Giving up on message"
            );
            self.stats.record_dead_lettered();
            let _ = self.dead_letters.send(event);
            self.notify_if_drained();
            return;
        }

        self.stats.record_resubmitted();
        let backoff = self.policy.backoff();
        if backoff.is_zero() {
            self.resubmit(event.record).await;
        } else {
            // Keep triaging other outcomes while this record waits
            let input = self.input.clone();
            let stats = self.stats.clone();
            let drained = self.drained.clone();
            tokio::spawn(async move {
                tokio::time::sleep(backoff).await;
                if input.send(event.record).await.is_err() {
                    stats.record_rejected();
                    if stats.outstanding() == 0 {
                        drained.notify_waiters();
                    }
                }
            });
        }
    }

    async fn resubmit(&self, record: ProducerRecord) {
        if self.input.send(record).await.is_err() {
            warn!(producer = %self.producer, "Producer input closed, dropping retried message");
            self.stats.record_rejected();
            self.notify_if_drained();
        }
    }

    fn on_success(&self, report: DeliveryReport) {
        self.stats.record_delivered();
        info!(
            producer = %self.producer,
            key = %report.key,
            topic = %report.topic,
            partition = report.partition,
            offset = report.offset,
            "Sent message successfully"
        );
        self.notify_if_drained();
    }

    fn notify_if_drained(&self) {
        if self.stats.outstanding() == 0 {
            self.drained.notify_waiters();
        }
    }
}
