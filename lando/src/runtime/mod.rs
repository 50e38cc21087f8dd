/// Runtime builder for constructing orchestrator instances.
pub mod builder;
/// Runtime supervisor managing inbox consumers and the watcher.
pub mod supervisor;
/// Consumer configuration.
pub mod worker;

pub use builder::OrchestratorRuntimeBuilder;
pub use supervisor::{DeliveryOutcome, OrchestratorRuntime, ShutdownToken};
pub use worker::ConsumerConfig;
