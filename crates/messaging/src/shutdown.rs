//! Graceful shutdown on termination signals.
//!
//! Consumer groups are closed first so no new messages are claimed, then
//! every registered producer gateway drains and flushes.

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::codec::PayloadCodec;
use crate::error::Result;
use crate::group::ConsumerGroup;
use crate::producer::ProducerGateway;

/// Resolves once `flag` is set or its sender is gone.
///
/// The borrowed value is dropped here, so the future stays `Send` inside `select!`.
pub(crate) async fn signalled(flag: &mut watch::Receiver<bool>) {
    let _ = flag.wait_for(|set| *set).await;
}

/// Type-erased producer gateway, whatever its codec.
#[async_trait]
trait Drain: Send + Sync {
    fn name(&self) -> &str;

    async fn drain(&self, timeout: Duration) -> Result<()>;
}

#[async_trait]
impl<C: PayloadCodec + 'static> Drain for ProducerGateway<C> {
    fn name(&self) -> &str {
        ProducerGateway::name(self)
    }

    async fn drain(&self, timeout: Duration) -> Result<()> {
        self.close(timeout).await
    }
}

/// Closes registered components when the process is asked to terminate.
#[derive(Default)]
pub struct ShutdownController {
    groups: Vec<Arc<ConsumerGroup>>,
    producers: Vec<(Arc<dyn Drain>, Duration)>,
}

impl ShutdownController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_consumer_group(mut self, group: Arc<ConsumerGroup>) -> Self {
        self.groups.push(group);
        self
    }

    /// Drain `producer` for at most `drain_timeout` on shutdown.
    pub fn with_producer<C>(
        mut self,
        producer: Arc<ProducerGateway<C>>,
        drain_timeout: Duration,
    ) -> Self
    where
        C: PayloadCodec + 'static,
    {
        let producer: Arc<dyn Drain> = producer;
        self.producers.push((producer, drain_timeout));
        self
    }

    /// Listen for SIGINT and SIGTERM in the background and shut down on the first one.
    ///
    /// The handlers are registered before this returns.
    pub fn spawn(self) -> std::io::Result<JoinHandle<()>> {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            let mut terminate = signal(SignalKind::terminate())?;
            let mut interrupt = signal(SignalKind::interrupt())?;
            Ok(tokio::spawn(async move {
                let signal = tokio::select! {
                    _ = terminate.recv() => "SIGTERM",
                    _ = interrupt.recv() => "SIGINT",
                };
                info!(signal, "Shutdown signal received");
                self.shutdown().await;
            }))
        }

        #[cfg(not(unix))]
        {
            Ok(tokio::spawn(async move {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!("Failed to listen for ctrl-c: {}", e);
                    return;
                }
                info!("Shutdown signal received");
                self.shutdown().await;
            }))
        }
    }

    /// Wait for `trigger`, then shut down.
    pub async fn run_until<F: Future>(self, trigger: F) {
        trigger.await;
        info!("Shutdown triggered");
        self.shutdown().await;
    }

    /// Close every consumer group, then drain every producer.
    ///
    /// Failures are logged and do not stop the remaining components from closing.
    pub async fn shutdown(&self) {
        for group in &self.groups {
            match group.close().await {
                Ok(()) => info!(group_id = group.group_id(), "Closed consumer group"),
                Err(e) => error!(
                    group_id = group.group_id(),
                    error = %e,
                    "Error closing consumer group"
                ),
            }
        }

        for (producer, drain_timeout) in &self.producers {
            if let Err(e) = producer.drain(*drain_timeout).await {
                warn!(producer = producer.name(), error = %e, "Error closing producer");
            }
        }
    }
}

impl std::fmt::Debug for ShutdownController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownController")
            .field("groups", &self.groups.len())
            .field("producers", &self.producers.len())
            .finish()
    }
}
