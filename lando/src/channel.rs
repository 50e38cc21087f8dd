//! Durable point-to-point command queues.
//!
//! Delivery is at-least-once: a consumer acknowledges a delivery only after
//! its handler finished, and anything left unacknowledged when a connection
//! closes goes back to the head of its queue marked as redelivered.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::warn;

use crate::error::ChannelError;
use crate::job::{JobId, StepType};
use crate::message::Command;

/// A command handed to a consumer, pending acknowledgement.
#[derive(Clone, Debug)]
pub struct Delivery {
    pub tag: u64,
    pub queue: String,
    pub command: Command,
    /// Set when the message was delivered before and never acknowledged.
    pub redelivered: bool,
}

/// Queue transport used by clients, the orchestrator and the watcher.
#[async_trait]
pub trait MessageChannel: Send + Sync {
    async fn publish(
        &self,
        queue: &str,
        command: &Command,
    ) -> Result<(), ChannelError>;

    /// Wait for the next decodable delivery on `queue`.
    async fn next_delivery(&self, queue: &str)
        -> Result<Delivery, ChannelError>;

    async fn ack(&self, tag: u64) -> Result<(), ChannelError>;

    /// Reject a delivery, optionally putting it back on its queue.
    async fn nack(&self, tag: u64, requeue: bool) -> Result<(), ChannelError>;
}

#[derive(Clone, Debug)]
struct StoredMessage {
    body: Vec<u8>,
    redelivered: bool,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, VecDeque<StoredMessage>>,
}

struct BrokerInner {
    state: Mutex<BrokerState>,
    notify: Notify,
}

impl BrokerInner {
    fn push_back(&self, queue: &str, message: StoredMessage) {
        self.state
            .lock()
            .queues
            .entry(queue.to_string())
            .or_default()
            .push_back(message);
        self.notify.notify_waiters();
    }

    fn push_front(&self, queue: &str, message: StoredMessage) {
        self.state
            .lock()
            .queues
            .entry(queue.to_string())
            .or_default()
            .push_front(message);
        self.notify.notify_waiters();
    }

    fn pop(&self, queue: &str) -> Option<StoredMessage> {
        self.state.lock().queues.get_mut(queue)?.pop_front()
    }
}

/// In-process broker holding queues in memory.
///
/// Clone handles share the same queues.
#[derive(Clone)]
pub struct InProcBroker {
    inner: Arc<BrokerInner>,
    next_connection: Arc<AtomicU64>,
}

impl std::fmt::Debug for InProcBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("InProcBroker")
            .field("queues", &state.queues.len())
            .finish()
    }
}

impl Default for InProcBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InProcBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                state: Mutex::new(BrokerState::default()),
                notify: Notify::new(),
            }),
            next_connection: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Open a connection. Dropping or closing it requeues its unacked
    /// deliveries.
    pub fn connect(&self) -> InProcConnection {
        InProcConnection {
            id: self.next_connection.fetch_add(1, Ordering::Relaxed),
            inner: Arc::clone(&self.inner),
            unacked: Mutex::new(HashMap::new()),
            next_tag: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            closed_notify: Notify::new(),
        }
    }

    /// Number of messages waiting on `queue`, excluding unacked ones.
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.inner
            .state
            .lock()
            .queues
            .get(queue)
            .map_or(0, VecDeque::len)
    }

    /// Put raw bytes on a queue, bypassing the codec.
    pub fn publish_raw(&self, queue: &str, body: Vec<u8>) {
        self.inner.push_back(
            queue,
            StoredMessage {
                body,
                redelivered: false,
            },
        );
    }
}

/// One client connection to an [`InProcBroker`].
pub struct InProcConnection {
    id: u64,
    inner: Arc<BrokerInner>,
    unacked: Mutex<HashMap<u64, (String, StoredMessage)>>,
    next_tag: AtomicU64,
    closed: AtomicBool,
    closed_notify: Notify,
}

impl std::fmt::Debug for InProcConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcConnection")
            .field("id", &self.id)
            .field("unacked", &self.unacked.lock().len())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl InProcConnection {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close the connection, requeueing unacked deliveries. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.requeue_unacked();
        self.closed_notify.notify_waiters();
    }

    pub fn unacked_count(&self) -> usize {
        self.unacked.lock().len()
    }

    fn requeue_unacked(&self) {
        let mut pending: Vec<_> = self.unacked.lock().drain().collect();
        // Highest tag first so the oldest delivery ends up at the head.
        pending.sort_by(|a, b| b.0.cmp(&a.0));
        for (_, (queue, mut message)) in pending {
            message.redelivered = true;
            self.inner.push_front(&queue, message);
        }
    }

    fn ensure_open(&self) -> Result<(), ChannelError> {
        if self.is_closed() {
            Err(ChannelError::Closed)
        } else {
            Ok(())
        }
    }
}

impl Drop for InProcConnection {
    fn drop(&mut self) {
        self.close();
    }
}

#[async_trait]
impl MessageChannel for InProcConnection {
    async fn publish(
        &self,
        queue: &str,
        command: &Command,
    ) -> Result<(), ChannelError> {
        self.ensure_open()?;
        self.inner.push_back(
            queue,
            StoredMessage {
                body: command.encode()?,
                redelivered: false,
            },
        );
        Ok(())
    }

    async fn next_delivery(
        &self,
        queue: &str,
    ) -> Result<Delivery, ChannelError> {
        loop {
            self.ensure_open()?;
            let notified = self.inner.notify.notified();
            let closed = self.closed_notify.notified();
            tokio::pin!(notified);
            tokio::pin!(closed);
            notified.as_mut().enable();
            closed.as_mut().enable();

            if let Some(message) = self.inner.pop(queue) {
                match Command::decode(&message.body) {
                    Ok(command) => {
                        let tag = self.next_tag.fetch_add(1, Ordering::Relaxed);
                        let redelivered = message.redelivered;
                        self.unacked
                            .lock()
                            .insert(tag, (queue.to_string(), message));
                        return Ok(Delivery {
                            tag,
                            queue: queue.to_string(),
                            command,
                            redelivered,
                        });
                    }
                    Err(err) => {
                        warn!(queue, error = %err, "rejecting undecodable message");
                        continue;
                    }
                }
            }

            if self.is_closed() {
                return Err(ChannelError::Closed);
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = &mut closed => {}
            }
        }
    }

    async fn ack(&self, tag: u64) -> Result<(), ChannelError> {
        self.unacked
            .lock()
            .remove(&tag)
            .map(|_| ())
            .ok_or(ChannelError::UnknownDelivery(tag))
    }

    async fn nack(&self, tag: u64, requeue: bool) -> Result<(), ChannelError> {
        let (queue, mut message) = self
            .unacked
            .lock()
            .remove(&tag)
            .ok_or(ChannelError::UnknownDelivery(tag))?;
        if requeue {
            message.redelivered = true;
            self.inner.push_back(&queue, message);
        }
        Ok(())
    }
}

#[async_trait]
impl<T: MessageChannel + ?Sized> MessageChannel for Arc<T> {
    async fn publish(
        &self,
        queue: &str,
        command: &Command,
    ) -> Result<(), ChannelError> {
        (**self).publish(queue, command).await
    }

    async fn next_delivery(
        &self,
        queue: &str,
    ) -> Result<Delivery, ChannelError> {
        (**self).next_delivery(queue).await
    }

    async fn ack(&self, tag: u64) -> Result<(), ChannelError> {
        (**self).ack(tag).await
    }

    async fn nack(&self, tag: u64, requeue: bool) -> Result<(), ChannelError> {
        (**self).nack(tag, requeue).await
    }
}

/// Client role: asks the orchestrator to start, cancel or restart jobs.
#[derive(Clone)]
pub struct LandoClient {
    channel: Arc<dyn MessageChannel>,
    queue: String,
}

impl std::fmt::Debug for LandoClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LandoClient")
            .field("queue", &self.queue)
            .finish()
    }
}

impl LandoClient {
    pub fn new(channel: Arc<dyn MessageChannel>, queue: impl Into<String>) -> Self {
        Self {
            channel,
            queue: queue.into(),
        }
    }

    pub async fn start_job(&self, job_id: JobId) -> Result<(), ChannelError> {
        self.channel
            .publish(&self.queue, &Command::start_job(job_id))
            .await
    }

    pub async fn cancel_job(&self, job_id: JobId) -> Result<(), ChannelError> {
        self.channel
            .publish(&self.queue, &Command::cancel_job(job_id))
            .await
    }

    pub async fn restart_job(&self, job_id: JobId) -> Result<(), ChannelError> {
        self.channel
            .publish(&self.queue, &Command::restart_job(job_id))
            .await
    }
}

/// Worker role: reports step outcomes back to the orchestrator.
#[derive(Clone)]
pub struct StepNotifier {
    channel: Arc<dyn MessageChannel>,
    queue: String,
}

impl std::fmt::Debug for StepNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepNotifier")
            .field("queue", &self.queue)
            .finish()
    }
}

impl StepNotifier {
    pub fn new(channel: Arc<dyn MessageChannel>, queue: impl Into<String>) -> Self {
        Self {
            channel,
            queue: queue.into(),
        }
    }

    /// Publish an already built outcome command.
    pub async fn send(&self, command: &Command) -> Result<(), ChannelError> {
        self.channel.publish(&self.queue, command).await
    }

    pub async fn step_complete(
        &self,
        step: StepType,
        job_id: JobId,
        run_reference: &str,
    ) -> Result<(), ChannelError> {
        self.send(&Command::step_complete(step, job_id, run_reference))
            .await
    }

    pub async fn step_error(
        &self,
        step: StepType,
        job_id: JobId,
        message: &str,
    ) -> Result<(), ChannelError> {
        self.send(&Command::step_error(step, job_id, message)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn delivers_in_order_and_acks() {
        let broker = InProcBroker::new();
        let conn = broker.connect();
        conn.publish("lando", &Command::start_job(JobId(1))).await.unwrap();
        conn.publish("lando", &Command::cancel_job(JobId(1))).await.unwrap();

        let first = conn.next_delivery("lando").await.unwrap();
        assert_eq!(first.command, Command::start_job(JobId(1)));
        assert!(!first.redelivered);
        conn.ack(first.tag).await.unwrap();
        assert!(matches!(
            conn.ack(first.tag).await,
            Err(ChannelError::UnknownDelivery(_))
        ));

        let second = conn.next_delivery("lando").await.unwrap();
        assert_eq!(second.command, Command::cancel_job(JobId(1)));
    }

    #[tokio::test]
    async fn waits_for_publish() {
        let broker = InProcBroker::new();
        let consumer = Arc::new(broker.connect());
        let producer = broker.connect();

        let waiter = {
            let consumer = Arc::clone(&consumer);
            tokio::spawn(async move { consumer.next_delivery("lando").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        producer
            .publish("lando", &Command::restart_job(JobId(9)))
            .await
            .unwrap();

        let delivery = timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(delivery.command.job_id(), JobId(9));
    }

    #[tokio::test]
    async fn dropped_connection_requeues_unacked() {
        let broker = InProcBroker::new();
        {
            let conn = broker.connect();
            conn.publish("lando", &Command::start_job(JobId(1))).await.unwrap();
            let _delivery = conn.next_delivery("lando").await.unwrap();
            assert_eq!(broker.queue_depth("lando"), 0);
        }
        assert_eq!(broker.queue_depth("lando"), 1);

        let conn = broker.connect();
        let delivery = conn.next_delivery("lando").await.unwrap();
        assert!(delivery.redelivered);
        assert_eq!(delivery.command, Command::start_job(JobId(1)));
    }

    #[tokio::test]
    async fn nack_without_requeue_discards() {
        let broker = InProcBroker::new();
        let conn = broker.connect();
        conn.publish("lando", &Command::start_job(JobId(1))).await.unwrap();
        let delivery = conn.next_delivery("lando").await.unwrap();
        conn.nack(delivery.tag, false).await.unwrap();
        assert_eq!(broker.queue_depth("lando"), 0);
        assert_eq!(conn.unacked_count(), 0);
    }

    #[tokio::test]
    async fn undecodable_messages_are_skipped() {
        let broker = InProcBroker::new();
        broker.publish_raw("lando", b"not json".to_vec());
        let conn = broker.connect();
        conn.publish("lando", &Command::start_job(JobId(2))).await.unwrap();
        let delivery = conn.next_delivery("lando").await.unwrap();
        assert_eq!(delivery.command.job_id(), JobId(2));
        assert_eq!(broker.queue_depth("lando"), 0);
    }

    #[tokio::test]
    async fn close_wakes_waiting_consumer() {
        let broker = InProcBroker::new();
        let conn = Arc::new(broker.connect());
        let waiter = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move { conn.next_delivery("lando").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        conn.close();
        let result = timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert!(matches!(result, Err(ChannelError::Closed)));
    }

    #[tokio::test]
    async fn client_and_notifier_publish_commands() {
        let broker = InProcBroker::new();
        let conn: Arc<dyn MessageChannel> = Arc::new(broker.connect());
        let client = LandoClient::new(Arc::clone(&conn), "lando");
        let notifier = StepNotifier::new(Arc::clone(&conn), "lando");

        client.start_job(JobId(4)).await.unwrap();
        notifier
            .step_complete(StepType::StageData, JobId(4), "stage-data-4-x")
            .await
            .unwrap();
        let failed = Command::step_error(StepType::RunWorkflow, JobId(5), "oom");
        notifier.send(&failed).await.unwrap();

        assert_eq!(
            conn.next_delivery("lando").await.unwrap().command,
            Command::start_job(JobId(4))
        );
        assert_eq!(
            conn.next_delivery("lando").await.unwrap().command,
            Command::step_complete(StepType::StageData, JobId(4), "stage-data-4-x")
        );
        assert_eq!(conn.next_delivery("lando").await.unwrap().command, failed);
    }
}
