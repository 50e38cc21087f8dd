use std::any::type_name;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

use crate::backend::ExecutionBackend;
use crate::channel::{Delivery, MessageChannel};
use crate::config::LandoConfig;
use crate::error::{ChannelError, LandoError, Result};
use crate::lease::JobLeaseTable;
use crate::orchestrator::{HandleOutcome, JobOrchestrator};
use crate::store::JobRecordStore;
use crate::watcher::Watcher;

use super::worker::ConsumerConfig;

/// Token for signaling graceful shutdown to consumers and the watcher.
#[derive(Clone, Debug)]
pub struct ShutdownToken {
    inner: Arc<ShutdownTokenInner>,
}

#[derive(Debug)]
struct ShutdownTokenInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl ShutdownToken {
    /// Create a new shutdown token.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ShutdownTokenInner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Signal cancellation.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Check if cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Wait until cancelled.
    pub async fn cancelled(&self) {
        let notified = self.inner.notify.notified();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}

/// What a consumer did with one delivery.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DeliveryOutcome {
    /// Handled and acknowledged.
    Handled(HandleOutcome),
    /// The job was held by another consumer; the delivery went back on the queue.
    Requeued,
    /// The handler failed on a job-level backend error; acknowledged and dropped.
    Dropped,
}

/// First process-level failure seen by any runtime task.
#[derive(Clone, Default)]
struct FatalSlot(Arc<parking_lot::Mutex<Option<LandoError>>>);

impl FatalSlot {
    fn record(&self, err: LandoError) {
        let mut slot = self.0.lock();
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    fn take(&self) -> Option<LandoError> {
        self.0.lock().take()
    }
}

/// Runs the orchestrator against its inbox and the watcher against the
/// backend until shutdown or a process-level failure.
///
/// Consumers take a per-job lease before handling a command, so one job is
/// never handled by two consumers at once. A command is acknowledged only
/// after its handler returns; operational failures requeue the command and
/// stop the runtime.
pub struct OrchestratorRuntime<B, S> {
    config: Arc<LandoConfig>,
    orchestrator: Arc<JobOrchestrator<B, S>>,
    channel: Arc<dyn MessageChannel>,
    watcher: Option<Arc<Watcher<B>>>,
    leases: JobLeaseTable,
    shutdown_token: ShutdownToken,
    fatal: FatalSlot,
    worker_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl<B, S> fmt::Debug for OrchestratorRuntime<B, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrchestratorRuntime")
            .field("queue", &self.config.queue.name)
            .field("backend", &type_name::<B>())
            .field("store", &type_name::<S>())
            .field("watcher", &self.watcher.is_some())
            .field("leases", &self.leases)
            .field("shutdown", &self.shutdown_token.is_cancelled())
            .finish()
    }
}

impl<B, S> OrchestratorRuntime<B, S>
where
    B: ExecutionBackend + 'static,
    S: JobRecordStore + 'static,
{
    pub fn new(
        config: Arc<LandoConfig>,
        orchestrator: Arc<JobOrchestrator<B, S>>,
        channel: Arc<dyn MessageChannel>,
        watcher: Option<Arc<Watcher<B>>>,
        leases: JobLeaseTable,
    ) -> Self {
        Self {
            config,
            orchestrator,
            channel,
            watcher,
            leases,
            shutdown_token: ShutdownToken::new(),
            fatal: FatalSlot::default(),
            worker_handles: Mutex::new(Vec::new()),
        }
    }

    pub fn orchestrator(&self) -> Arc<JobOrchestrator<B, S>> {
        Arc::clone(&self.orchestrator)
    }

    pub fn leases(&self) -> &JobLeaseTable {
        &self.leases
    }

    pub fn shutdown_token(&self) -> ShutdownToken {
        self.shutdown_token.clone()
    }

    /// The first process-level failure, if one stopped the runtime.
    pub fn take_fatal_error(&self) -> Option<LandoError> {
        self.fatal.take()
    }

    /// Spawn the configured number of consumers and the watcher.
    pub async fn start(&self) -> anyhow::Result<()> {
        let consumers = self.config.runtime.consumers.max(1);
        self.spawn_consumers(consumers).await;
        self.spawn_watcher().await;
        tracing::info!(
            queue = %self.config.queue.name,
            consumers,
            watcher = self.watcher.is_some(),
            "orchestrator runtime started"
        );
        Ok(())
    }

    /// Gracefully shut down the runtime and all tasks.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        tracing::info!("Initiating graceful shutdown of orchestrator runtime");

        self.shutdown_token.cancel();

        let handles = {
            let mut guard = self.worker_handles.lock().await;
            std::mem::take(&mut *guard)
        };

        let timeout = tokio::time::Duration::from_secs(
            self.config.runtime.shutdown_timeout_secs,
        );
        for handle in handles {
            match tokio::time::timeout(timeout, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!("Runtime task failed: {:?}", e),
                Err(_) => {
                    tracing::warn!("Runtime task timed out during shutdown")
                }
            }
        }

        tracing::info!("Orchestrator runtime shutdown complete");
        Ok(())
    }

    /// Spawn `count` consumers on the inbox queue.
    pub async fn spawn_consumers(&self, count: usize) {
        let group = format!("{}-{}", self.config.queue.name, std::process::id());
        for i in 0..count {
            let consumer = ConsumerConfig::new(
                format!("{group}-c{i}"),
                self.config.queue.name.clone(),
            )
            .with_lease_retry_delay(self.config.runtime.lease_retry_delay_ms);
            let orchestrator = Arc::clone(&self.orchestrator);
            let channel = Arc::clone(&self.channel);
            let leases = self.leases.clone();
            let shutdown = self.shutdown_token.clone();
            let fatal = self.fatal.clone();

            let handle = tokio::spawn(async move {
                Self::consumer_loop(
                    consumer,
                    orchestrator,
                    channel,
                    leases,
                    shutdown,
                    fatal,
                )
                .await;
            });

            let mut handles = self.worker_handles.lock().await;
            handles.push(handle);
        }
    }

    async fn spawn_watcher(&self) {
        let Some(watcher) = self.watcher.clone() else {
            return;
        };
        let shutdown = self.shutdown_token.clone();
        let fatal = self.fatal.clone();

        let handle = tokio::spawn(async move {
            match watcher.run(shutdown.clone()).await {
                Ok(()) => tracing::info!("Watcher shutting down"),
                Err(err) => {
                    tracing::error!(error = %err, "watcher stopped");
                    fatal.record(err);
                    shutdown.cancel();
                }
            }
        });

        let mut handles = self.worker_handles.lock().await;
        handles.push(handle);
    }

    async fn consumer_loop(
        consumer: ConsumerConfig,
        orchestrator: Arc<JobOrchestrator<B, S>>,
        channel: Arc<dyn MessageChannel>,
        leases: JobLeaseTable,
        shutdown: ShutdownToken,
        fatal: FatalSlot,
    ) {
        loop {
            if shutdown.is_cancelled() {
                tracing::info!("Consumer {} shutting down", consumer.consumer_id);
                break;
            }

            let delivery = tokio::select! {
                _ = shutdown.cancelled() => continue,
                delivery = channel.next_delivery(&consumer.queue) => delivery,
            };
            let delivery = match delivery {
                Ok(delivery) => delivery,
                Err(ChannelError::Closed) => {
                    tracing::info!(
                        "Consumer {} channel closed",
                        consumer.consumer_id
                    );
                    break;
                }
                Err(err) => {
                    tracing::error!(
                        consumer = %consumer.consumer_id,
                        error = %err,
                        "receive failed, stopping runtime"
                    );
                    fatal.record(err.into());
                    shutdown.cancel();
                    break;
                }
            };

            if let Err(err) = Self::process_delivery(
                &consumer,
                &orchestrator,
                &*channel,
                &leases,
                delivery,
            )
            .await
            {
                tracing::error!(
                    consumer = %consumer.consumer_id,
                    error = %err,
                    "operational failure, stopping runtime"
                );
                fatal.record(err);
                shutdown.cancel();
                break;
            }
        }
    }

    /// Lease the delivery's job, handle it and settle the delivery.
    ///
    /// Returns `Err` only for operational failures, after requeueing the
    /// delivery so another process can pick it up.
    pub async fn process_delivery(
        consumer: &ConsumerConfig,
        orchestrator: &JobOrchestrator<B, S>,
        channel: &dyn MessageChannel,
        leases: &JobLeaseTable,
        delivery: Delivery,
    ) -> Result<DeliveryOutcome> {
        let job_id = delivery.command.job_id();
        let Some(_lease) = leases.try_acquire(job_id, &consumer.consumer_id)
        else {
            tracing::debug!(
                job_id = %job_id,
                command = delivery.command.name(),
                "job held by another consumer, requeueing"
            );
            tokio::time::sleep(consumer.lease_retry_delay()).await;
            channel.nack(delivery.tag, true).await?;
            return Ok(DeliveryOutcome::Requeued);
        };

        if delivery.redelivered {
            tracing::debug!(
                job_id = %job_id,
                command = delivery.command.name(),
                "handling redelivered command"
            );
        }

        match orchestrator.handle(&delivery.command).await {
            Ok(outcome) => {
                channel.ack(delivery.tag).await?;
                Ok(DeliveryOutcome::Handled(outcome))
            }
            Err(err) if err.is_operational() => {
                if let Err(nack_err) = channel.nack(delivery.tag, true).await {
                    tracing::warn!(
                        job_id = %job_id,
                        error = %nack_err,
                        "failed to requeue command"
                    );
                }
                Err(err)
            }
            Err(err) => {
                tracing::warn!(
                    job_id = %job_id,
                    command = delivery.command.name(),
                    error = %err,
                    "dropping command after backend failure"
                );
                channel.ack(delivery.tag).await?;
                Ok(DeliveryOutcome::Dropped)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn shutdown_token_wakes_waiters() {
        let token = ShutdownToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move { waiter.cancelled().await });
        tokio::task::yield_now().await;
        token.cancel();
        timeout(Duration::from_millis(200), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_returns_immediately_once_set() {
        let token = ShutdownToken::default();
        token.cancel();
        timeout(Duration::from_millis(50), token.cancelled())
            .await
            .unwrap();
    }

    #[test]
    fn fatal_slot_keeps_first_error() {
        let slot = FatalSlot::default();
        slot.record(ChannelError::Closed.into());
        slot.record(ChannelError::UnknownDelivery(3).into());
        assert!(matches!(
            slot.take(),
            Some(LandoError::Channel(ChannelError::Closed))
        ));
        assert!(slot.take().is_none());
    }
}
