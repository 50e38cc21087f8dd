use std::any::type_name;
use std::fmt;
use std::sync::Arc;

use crate::backend::ExecutionBackend;
use crate::channel::{MessageChannel, StepNotifier};
use crate::config::LandoConfig;
use crate::events::{EventPublisher, JobEvent};
use crate::lease::JobLeaseTable;
use crate::orchestrator::JobOrchestrator;
use crate::store::JobRecordStore;
use crate::watcher::Watcher;

use super::supervisor::OrchestratorRuntime;

/// Builder for constructing an `OrchestratorRuntime` with explicit dependencies.
///
/// The builder validates that all required dependencies are provided before
/// constructing the runtime. Each dependency is configured via a `with_*` method.
///
/// # Example
///
/// ```ignore
/// use lando::runtime::OrchestratorRuntimeBuilder;
///
/// let runtime = OrchestratorRuntimeBuilder::new(config)
///     .with_backend(backend)
///     .with_store(store)
///     .with_channel(channel)
///     .with_events(events)
///     .build()?;
/// runtime.start().await?;
/// ```
pub struct OrchestratorRuntimeBuilder<B, S> {
    config: LandoConfig,
    backend: Option<B>,
    store: Option<S>,
    channel: Option<Arc<dyn MessageChannel>>,
    events: Option<Arc<dyn EventPublisher<JobEvent>>>,
    leases: Option<JobLeaseTable>,
    watch: bool,
}

impl<B, S> fmt::Debug for OrchestratorRuntimeBuilder<B, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("OrchestratorRuntimeBuilder");
        debug.field("queue", &self.config.queue.name);
        debug.field("backend_set", &self.backend.is_some());
        debug.field("store_set", &self.store.is_some());
        debug.field("channel_set", &self.channel.is_some());
        debug.field("events_set", &self.events.is_some());
        debug.field("leases_set", &self.leases.is_some());
        debug.field("watch", &self.watch);

        if self.backend.is_some() {
            debug.field("backend_type", &type_name::<B>());
        }
        if self.store.is_some() {
            debug.field("store_type", &type_name::<S>());
        }

        debug.finish()
    }
}

impl<B, S> OrchestratorRuntimeBuilder<B, S>
where
    B: ExecutionBackend + Clone + 'static,
    S: JobRecordStore + 'static,
{
    /// Create a new builder with the given configuration.
    pub fn new(config: LandoConfig) -> Self {
        Self {
            config,
            backend: None,
            store: None,
            channel: None,
            events: None,
            leases: None,
            watch: true,
        }
    }

    /// Set the execution backend shared by the orchestrator and the watcher.
    pub fn with_backend(mut self, backend: B) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Set the job record store.
    pub fn with_store(mut self, store: S) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the message channel carrying the inbox queue.
    pub fn with_channel(mut self, channel: Arc<dyn MessageChannel>) -> Self {
        self.channel = Some(channel);
        self
    }

    /// Set the event publisher.
    pub fn with_events(mut self, events: Arc<dyn EventPublisher<JobEvent>>) -> Self {
        self.events = Some(events);
        self
    }

    /// Share a lease table with other runtimes in this process.
    pub fn with_leases(mut self, leases: JobLeaseTable) -> Self {
        self.leases = Some(leases);
        self
    }

    /// Run without a watcher; step outcomes must then arrive from elsewhere.
    pub fn without_watcher(mut self) -> Self {
        self.watch = false;
        self
    }

    /// Build the `OrchestratorRuntime` with all configured dependencies.
    ///
    /// # Errors
    ///
    /// Returns an error if any required dependency is missing or the
    /// configuration is invalid.
    pub fn build(self) -> anyhow::Result<OrchestratorRuntime<B, S>> {
        self.config.validate()?;
        let backend = self
            .backend
            .ok_or_else(|| anyhow::anyhow!("backend dependency missing"))?;
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("store dependency missing"))?;
        let channel = self
            .channel
            .ok_or_else(|| anyhow::anyhow!("channel dependency missing"))?;
        let leases = self.leases.unwrap_or_default();
        let config = Arc::new(self.config);

        let watcher = self.watch.then(|| {
            let notifier =
                StepNotifier::new(Arc::clone(&channel), config.queue.name.clone());
            Arc::new(Watcher::new(
                backend.clone(),
                notifier,
                config.watcher.clone(),
            ))
        });

        let mut orchestrator =
            JobOrchestrator::new(backend, store, Arc::clone(&config));
        if let Some(events) = self.events {
            orchestrator = orchestrator.with_events(events);
        }

        Ok(OrchestratorRuntime::new(
            config,
            Arc::new(orchestrator),
            channel,
            watcher,
            leases,
        ))
    }
}
