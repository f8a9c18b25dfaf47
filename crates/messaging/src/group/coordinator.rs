//! Consumer group supervisor.
//!
//! [`ConsumerGroup::start`] joins the group, waits until the first
//! generation's partitions are set up and then hands the application a
//! message channel. A background supervisor keeps calling the group
//! client's consume primitive for as long as the group lives: a rebalance
//! ends a session and the next call starts the next generation, transient
//! failures are logged and retried after a fixed backoff, and
//! [`MessagingError::GroupClosed`] or a fatal error ends the loop.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use streamgate_config::{CommitOrder, ConsumerGroupConfig};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use super::{Claim, GroupClient, GroupHandler, GroupSession, KafkaGroupClient};
use crate::error::{MessagingError, Result};
use crate::message::{ConsumerError, Message};

/// One-shot readiness signal owned by a single session generation.
///
/// Closing is the only transition; later calls are no-ops.
#[derive(Debug)]
pub struct ReadinessGate {
    tx: Mutex<Option<oneshot::Sender<i32>>>,
}

impl ReadinessGate {
    /// A new open gate and the receiver that observes its closing.
    pub fn new() -> (Self, oneshot::Receiver<i32>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                tx: Mutex::new(Some(tx)),
            },
            rx,
        )
    }

    /// Close the gate for `generation_id`. Returns `false` if it was already closed.
    pub fn close(&self, generation_id: i32) -> bool {
        match self.tx.lock().take() {
            Some(tx) => {
                // Nobody listening after the first generation
                let _ = tx.send(generation_id);
                true
            }
            None => false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.lock().is_none()
    }
}

/// Channels handed to the application by [`ConsumerGroup::start`].
#[derive(Debug)]
pub struct ConsumerStreams {
    /// Claimed messages, in partition order
    pub messages: mpsc::Receiver<Message>,
    /// Asynchronous consume-side failures
    pub errors: mpsc::Receiver<ConsumerError>,
}

/// A running consumer group.
pub struct ConsumerGroup {
    group_id: String,
    client: Arc<dyn GroupClient>,
    cancel: watch::Sender<bool>,
    done: watch::Receiver<bool>,
    generations: Arc<AtomicU64>,
}

impl ConsumerGroup {
    /// Join the group through rdkafka and block until the first generation is set up.
    pub async fn start(config: ConsumerGroupConfig) -> Result<(Self, ConsumerStreams)> {
        Self::start_with(config, KafkaGroupClient::connect).await
    }

    /// Like [`start`](Self::start) with a caller-provided group client.
    ///
    /// The configuration is validated before `connect` is called, so an
    /// unsupported protocol version or strategy never reaches the network.
    pub async fn start_with<C, F, Fut>(
        config: ConsumerGroupConfig,
        connect: F,
    ) -> Result<(Self, ConsumerStreams)>
    where
        C: GroupClient,
        F: FnOnce(ConsumerGroupConfig) -> Fut,
        Fut: Future<Output = Result<C>>,
    {
        config.validate()?;

        let client: Arc<dyn GroupClient> = Arc::new(connect(config.clone()).await?);

        let (message_tx, message_rx) = mpsc::channel(config.message_buffer);
        let (error_tx, error_rx) = mpsc::channel(config.error_buffer);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(false);
        let (started_tx, started_rx) = oneshot::channel();
        let generations = Arc::new(AtomicU64::new(0));

        let supervisor = Supervisor {
            group_id: config.group_id.clone(),
            topics: config.topics.clone(),
            client: client.clone(),
            forward: Arc::new(ForwardContext {
                group_id: config.group_id.clone(),
                commit_order: config.commit_order,
                messages: message_tx,
                errors: error_tx,
                generations: generations.clone(),
            }),
            backoff: config.retry_backoff(),
            cancel: cancel_rx,
        };
        tokio::spawn(async move {
            supervisor.run(started_tx).await;
            let _ = done_tx.send(true);
        });

        let group = Self {
            group_id: config.group_id.clone(),
            client,
            cancel: cancel_tx,
            done: done_rx,
            generations,
        };

        let started = match config.startup_timeout() {
            Some(timeout) => match tokio::time::timeout(timeout, started_rx).await {
                Ok(started) => started.map_err(|_| MessagingError::GroupClosed),
                Err(_) => Err(MessagingError::timeout(
                    "waiting for first partition assignment",
                    timeout.as_millis() as u64,
                )),
            },
            None => started_rx.await.map_err(|_| MessagingError::GroupClosed),
        };

        match started {
            Ok(generation_id) => {
                info!(
                    group_id = %group.group_id,
                    generation_id,
                    "Consumer group is up and running"
                );
                Ok((
                    group,
                    ConsumerStreams {
                        messages: message_rx,
                        errors: error_rx,
                    },
                ))
            }
            Err(e) => {
                warn!(group_id = %group.group_id, error = %e, "Consumer group failed to start");
                if let Err(close_err) = group.close().await {
                    debug!(error = %close_err, "Close after failed start");
                }
                group.wait().await;
                Err(e)
            }
        }
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    /// Number of sessions set up so far
    pub fn generation(&self) -> u64 {
        self.generations.load(Ordering::Relaxed)
    }

    /// Whether the supervising loop has exited.
    pub fn is_finished(&self) -> bool {
        *self.done.borrow()
    }

    /// Stop the supervisor and close the broker client.
    ///
    /// The supervisor observes cancellation between consume calls. A second
    /// call returns the client's `AlreadyClosed` error.
    pub async fn close(&self) -> Result<()> {
        self.cancel.send_replace(true);
        self.client.close().await?;
        info!(group_id = %self.group_id, "Consumer group closed");
        Ok(())
    }

    /// Wait for the supervising loop to exit.
    pub async fn wait(&self) {
        let mut done = self.done.clone();
        // Sender dropped means the task is gone as well
        let _ = done.wait_for(|finished| *finished).await;
    }
}

impl std::fmt::Debug for ConsumerGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerGroup")
            .field("group_id", &self.group_id)
            .field("generation", &self.generation())
            .field("finished", &self.is_finished())
            .finish()
    }
}

struct Supervisor {
    group_id: String,
    topics: Vec<String>,
    client: Arc<dyn GroupClient>,
    forward: Arc<ForwardContext>,
    backoff: Duration,
    cancel: watch::Receiver<bool>,
}

impl Supervisor {
    async fn run(mut self, started: oneshot::Sender<i32>) {
        let mut started = Some(started);

        loop {
            let (gate, mut gate_rx) = ReadinessGate::new();
            let handler: Arc<dyn GroupHandler> = Arc::new(ClaimForwarder {
                ctx: self.forward.clone(),
                gate,
            });

            let consume = self.client.consume(&self.topics, handler);
            tokio::pin!(consume);
            let mut gate_open = true;

            let result = loop {
                tokio::select! {
                    result = &mut consume => break result,
                    generation_id = &mut gate_rx, if gate_open => {
                        gate_open = false;
                        if let Ok(generation_id) = generation_id {
                            notify_started(&mut started, generation_id);
                        }
                    }
                }
            };
            if gate_open {
                if let Ok(generation_id) = gate_rx.try_recv() {
                    notify_started(&mut started, generation_id);
                }
            }

            match result {
                Ok(()) => debug!(group_id = %self.group_id, "Consumer group session ended"),
                Err(MessagingError::GroupClosed) => {
                    info!(group_id = %self.group_id, "Consumer group client closed, stopping");
                    break;
                }
                Err(e) if e.is_fatal() => {
                    error!(
                        group_id = %self.group_id,
                        error = %e,
                        severity = %e.severity(),
                        "Unrecoverable error from consumer group, stopping"
                    );
                    break;
                }
                Err(e) => {
                    error!(
                        group_id = %self.group_id,
                        error = %e,
                        severity = %e.severity(),
                        backoff_ms = self.backoff.as_millis() as u64,
                        "Error from consumer group"
                    );
                    tokio::time::sleep(self.backoff).await;
                }
            }

            if *self.cancel.borrow_and_update() {
                info!(group_id = %self.group_id, "Consumer group cancelled, stopping");
                break;
            }
        }
    }
}

fn notify_started(started: &mut Option<oneshot::Sender<i32>>, generation_id: i32) {
    if let Some(tx) = started.take() {
        let _ = tx.send(generation_id);
    }
}

/// State shared by every generation's handler.
struct ForwardContext {
    group_id: String,
    commit_order: CommitOrder,
    messages: mpsc::Sender<Message>,
    errors: mpsc::Sender<ConsumerError>,
    generations: Arc<AtomicU64>,
}

/// Session handler that forwards claimed messages to the application.
struct ClaimForwarder {
    ctx: Arc<ForwardContext>,
    gate: ReadinessGate,
}

#[async_trait]
impl GroupHandler for ClaimForwarder {
    async fn setup(&self, session: &dyn GroupSession) -> Result<()> {
        self.ctx.generations.fetch_add(1, Ordering::Relaxed);
        info!(
            group_id = %self.ctx.group_id,
            generation_id = session.generation_id(),
            member_id = session.member_id(),
            partitions = session.assignment().len(),
            "Consumer group session set up"
        );
        self.gate.close(session.generation_id());
        Ok(())
    }

    async fn cleanup(&self, session: &dyn GroupSession) -> Result<()> {
        debug!(
            group_id = %self.ctx.group_id,
            generation_id = session.generation_id(),
            "Consumer group session cleaned up"
        );
        Ok(())
    }

    async fn consume_claim(&self, session: Arc<dyn GroupSession>, mut claim: Claim) -> Result<()> {
        debug!(
            topic = claim.topic(),
            partition = claim.partition(),
            generation_id = session.generation_id(),
            "Consuming claim"
        );

        while let Some(message) = claim.next().await {
            debug!(
                topic = %message.topic,
                partition = message.partition,
                offset = message.offset,
                bytes = message.value.len(),
                "Message claimed"
            );
            match self.ctx.commit_order {
                CommitOrder::BeforeDelivery => {
                    session.mark_message(&message, "");
                    self.ctx
                        .messages
                        .send(message)
                        .await
                        .map_err(|_| MessagingError::ChannelClosed("messages"))?;
                }
                CommitOrder::AfterDelivery => {
                    let (topic, partition, offset) =
                        (message.topic.clone(), message.partition, message.offset);
                    self.ctx
                        .messages
                        .send(message)
                        .await
                        .map_err(|_| MessagingError::ChannelClosed("messages"))?;
                    session.mark_offset(&topic, partition, offset, "");
                }
            }
        }

        Ok(())
    }

    fn on_error(&self, error: ConsumerError) {
        if let Err(mpsc::error::TrySendError::Full(error)) = self.ctx.errors.try_send(error) {
            warn!(
                group_id = %self.ctx.group_id,
                error = %error,
                "Error channel full, dropping consumer error"
            );
        }
    }
}
