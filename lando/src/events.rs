use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::job::{JobId, JobPosition, StepType};
use crate::store::JobErrorKind;

/// Metadata envelope attached to every job event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventMeta {
    pub version: u16,
    /// Shared by every event raised while handling one command.
    pub correlation_id: Uuid,
    pub idempotency_key: String,
    pub job_id: JobId,
    pub timestamp: DateTime<Utc>,
}

impl EventMeta {
    pub fn new(
        job_id: JobId,
        correlation_id: Option<Uuid>,
        idempotency_key: impl Into<String>,
    ) -> Self {
        Self {
            version: 1,
            correlation_id: correlation_id.unwrap_or_else(Uuid::now_v7),
            idempotency_key: idempotency_key.into(),
            job_id,
            timestamp: Utc::now(),
        }
    }
}

/// Orchestrator lifecycle event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobEvent {
    pub meta: EventMeta,
    pub payload: JobEventPayload,
}

/// What happened to a job.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
#[non_exhaustive]
pub enum JobEventPayload {
    /// The job's recorded position changed.
    Transitioned { from: JobPosition, to: JobPosition },
    /// A backend run was scheduled for a step.
    StepLaunched { step_type: StepType, run_name: String },
    /// A command did not match the job's position and was dropped.
    StaleMessageDropped {
        command: String,
        position: JobPosition,
    },
    /// The job moved to ERRORED.
    Errored {
        step_type: Option<StepType>,
        kind: JobErrorKind,
        message: String,
    },
}

impl JobEventPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            JobEventPayload::Transitioned { .. } => "transitioned",
            JobEventPayload::StepLaunched { .. } => "step_launched",
            JobEventPayload::StaleMessageDropped { .. } => "stale_message_dropped",
            JobEventPayload::Errored { .. } => "errored",
        }
    }
}

/// Generic event publisher trait for publishing events of type `E`.
#[async_trait]
pub trait EventPublisher<E>: Send + Sync
where
    E: Clone + Send + Sync + 'static,
{
    /// Publish an event to all subscribers.
    async fn publish(&self, event: E) -> anyhow::Result<()>;
}

/// Generic event subscriber trait for receiving events of type `E`.
pub trait EventSubscriber<E>: Send + Sync
where
    E: Clone + Send + Sync + 'static,
{
    /// Subscribe to events, returning a broadcast receiver.
    ///
    /// Multiple subscribers can receive the same events (fan-out).
    fn subscribe(&self) -> broadcast::Receiver<E>;
}

/// In-process event bus using tokio broadcast channels.
///
/// Publishing never waits for slow subscribers; a subscriber that falls
/// more than `capacity` events behind receives `RecvError::Lagged`.
pub struct InProcEventBus {
    sender: broadcast::Sender<JobEvent>,
    capacity: usize,
}

impl std::fmt::Debug for InProcEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcEventBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl Default for InProcEventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl InProcEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender, capacity }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Publish without waiting. Events with no subscriber are dropped.
    pub fn publish_job(&self, event: JobEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe_job_events(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }
}

#[async_trait]
impl EventPublisher<JobEvent> for InProcEventBus {
    async fn publish(&self, event: JobEvent) -> anyhow::Result<()> {
        self.publish_job(event);
        Ok(())
    }
}

impl EventSubscriber<JobEvent> for InProcEventBus {
    fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.subscribe_job_events()
    }
}
