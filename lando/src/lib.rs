//! Lando - message-driven orchestration of staged workflow jobs.
//!
//! A job moves through four remote steps (stage data, run workflow,
//! organize output, save output). Each step is provisioned on an execution
//! backend, and its outcome comes back as a command on the orchestrator's
//! inbox. The orchestrator keeps no state of its own: every decision is made
//! from the job's recorded (state, step) in the record store.
//!
//! # Core Concepts
//!
//! - **Job**: [`Job`] with its [`JobState`] and [`JobStep`]. The pair is the
//!   job's position; a command that does not match it is dropped.
//!
//! - **Orchestrator**: [`JobOrchestrator`] handles one [`Command`] at a time
//!   and drives the backend and the record store.
//!
//! - **Steps**: [`StepBuilder`] turns a job and the static configuration into
//!   a [`StepPlan`] of volumes, secrets, configs and a run.
//!
//! - **Backends**: [`ExecutionBackend`] provisions and runs step plans.
//!   [`ClusterBackend`] and [`VmBackend`] are the two concrete backends.
//!
//! - **Watcher**: [`Watcher`] turns finished backend runs into commands.
//!
//! - **Runtime**: [`OrchestratorRuntime`] consumes the inbox with per-job
//!   leases and runs the watcher.
//!
//! # Feature Flags
//!
//! - `metrics` - Prometheus metrics support
//!
//! # Example
//!
//! ```ignore
//! use lando::*;
//!
//! let config = LandoConfig::load("lando.yml")?;
//! let broker = InProcBroker::new();
//! let runtime = OrchestratorRuntimeBuilder::new(config)
//!     .with_backend(backend)
//!     .with_store(store)
//!     .with_channel(Arc::new(broker.connect()))
//!     .build()?;
//! runtime.start().await?;
//! ```

/// Execution backends and the run event model.
///
/// The `backend` module defines the [`ExecutionBackend`] trait, the
/// cluster and VM implementations, and helpers shared by callers:
/// - [`read_run_logs`] - logs of a run's latest unit
/// - [`apply_teardown`] - best-effort deletion of a resource set
pub mod backend;

/// Queue transport and the client and worker roles.
pub mod channel;

/// Static configuration loaded from YAML.
pub mod config;

/// Error types for every concern, and the crate `Result`.
pub mod error;

/// Orchestrator lifecycle events.
///
/// The `events` module provides:
/// - [`EventPublisher`] and [`EventSubscriber`] for pub/sub patterns
/// - [`JobEvent`] and [`JobEventPayload`] for event data
/// - [`InProcEventBus`] for in-process event broadcasting
pub mod events;

/// Job records: ids, states, steps and workflow descriptions.
pub mod job;

/// Per-job exclusive leases for inbox consumers.
pub mod lease;

/// The command vocabulary and its wire encoding.
pub mod message;

#[cfg(feature = "metrics")]
/// Prometheus metrics.
pub mod metrics;

/// Deterministic resource names and labels.
pub mod names;

/// The job state machine.
pub mod orchestrator;

/// Runtime orchestration and consumer management.
///
/// The `runtime` module provides the [`OrchestratorRuntime`], which runs
/// inbox consumers and the watcher. Includes:
/// - [`ShutdownToken`] - graceful shutdown signaling
/// - [`ConsumerConfig`] - individual consumer configuration
/// - [`OrchestratorRuntimeBuilder`] for constructing runtimes
pub mod runtime;

/// Step definitions: what each step provisions and runs.
pub mod steps;

/// The job record store seam.
pub mod store;

/// Spans and `record_*` helpers.
pub mod telemetry;

/// Backend event to command bridge.
pub mod watcher;

pub use backend::{
    apply_teardown, read_run_logs, ClusterApi, ClusterBackend, CloudApi,
    ExecutionBackend, RunCondition, RunEvent, RunEventKind, RunStatus, VmBackend,
};
pub use channel::{
    Delivery, InProcBroker, InProcConnection, LandoClient, MessageChannel,
    StepNotifier,
};
pub use config::LandoConfig;
pub use error::{
    BackendError, ChannelError, ConfigError, LandoError, Result, StoreError,
};
pub use events::{
    EventMeta, EventPublisher, EventSubscriber, InProcEventBus, JobEvent,
    JobEventPayload,
};
pub use job::{
    Job, JobId, JobPosition, JobState, JobStep, StepType, Workflow,
    WorkflowType,
};
pub use lease::{JobLease, JobLeaseTable, LeaseId};
pub use message::Command;
pub use names::ResourceNames;
pub use orchestrator::{HandleOutcome, JobOrchestrator};
pub use runtime::{
    ConsumerConfig, DeliveryOutcome, OrchestratorRuntime,
    OrchestratorRuntimeBuilder, ShutdownToken,
};
pub use steps::{StepBuilder, StepPlan};
pub use store::{JobError, JobErrorKind, JobRecordStore};
pub use watcher::Watcher;
