//! Bridge from backend run events to orchestrator commands.
//!
//! The [`Watcher`] holds one long-lived event stream over every run lando
//! manages. Finished runs are turned into `*_complete` / `*_error` commands
//! and published on the orchestrator inbox.

use std::time::Duration;

use futures::StreamExt;
use tracing::Instrument;

use crate::backend::{read_run_logs, ExecutionBackend, RunCondition, RunEvent, RunEventKind};
use crate::channel::StepNotifier;
use crate::config::WatcherConfig;
use crate::error::{LandoError, Result};
use crate::message::Command;
use crate::names::{managed_selector, parse_run_labels};
use crate::runtime::ShutdownToken;
use crate::steps::main_container;
use crate::telemetry::{record_watch_reconnect, watch_span};

/// Error text sent when a failed run's logs cannot be read.
pub const LOGS_UNAVAILABLE: &str = "Unable to read logs.";

/// Exponential reconnect delay, reset after a healthy event.
#[derive(Clone, Debug)]
pub(crate) struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub(crate) fn new(config: &WatcherConfig) -> Self {
        let initial = Duration::from_millis(config.reconnect_backoff_ms);
        Self {
            initial,
            max: Duration::from_millis(
                config.max_reconnect_backoff_ms.max(config.reconnect_backoff_ms),
            ),
            current: initial,
        }
    }

    /// Delay to wait now; the following call returns double, capped.
    pub(crate) fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub(crate) fn reset(&mut self) {
        self.current = self.initial;
    }
}

pub struct Watcher<B> {
    backend: B,
    notifier: StepNotifier,
    config: WatcherConfig,
}

impl<B> std::fmt::Debug for Watcher<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watcher")
            .field("backend", &std::any::type_name::<B>())
            .field("notifier", &self.notifier)
            .field("config", &self.config)
            .finish()
    }
}

impl<B: ExecutionBackend> Watcher<B> {
    pub fn new(backend: B, notifier: StepNotifier, config: WatcherConfig) -> Self {
        Self {
            backend,
            notifier,
            config,
        }
    }

    /// Turn a run event into the command the orchestrator expects, if any.
    ///
    /// Deletes, unfinished runs and runs without lando labels yield `None`.
    /// For failed runs the step container's log on the latest unit becomes
    /// the error message.
    pub async fn translate(&self, event: &RunEvent) -> Option<Command> {
        if event.kind == RunEventKind::Deleted || !event.run.condition.is_finished() {
            return None;
        }
        let Some((job_id, step)) = parse_run_labels(&event.run.labels) else {
            tracing::debug!(run_name = %event.run.name, "ignoring unlabeled run");
            return None;
        };
        if event.run.condition == RunCondition::Succeeded {
            return Some(Command::step_complete(step, job_id, &event.run.name));
        }
        let container = main_container(step);
        let message =
            match read_run_logs(&self.backend, &event.run.name, Some(&container)).await {
                Ok(logs) => logs,
                Err(err) => {
                    tracing::warn!(
                        job_id = %job_id,
                        run_name = %event.run.name,
                        error = %err,
                        "failed to read logs of failed run"
                    );
                    LOGS_UNAVAILABLE.to_string()
                }
            };
        Some(Command::step_error(step, job_id, &message))
    }

    /// Translate and publish. Returns whether a command was sent.
    pub async fn handle_event(&self, event: &RunEvent) -> Result<bool> {
        let Some(command) = self.translate(event).await else {
            return Ok(false);
        };
        self.notifier.send(&command).await?;
        tracing::info!(
            job_id = %command.job_id(),
            command = command.name(),
            run_name = %event.run.name,
            "forwarded run event"
        );
        Ok(true)
    }

    /// Follow the backend's event stream until shutdown.
    ///
    /// A stream that ends is reopened. Stream and connect errors are retried
    /// with backoff; more than `max_reconnect_attempts` consecutive failures
    /// return [`LandoError::WatchExhausted`]. Publish failures are returned
    /// as is.
    pub async fn run(&self, shutdown: ShutdownToken) -> Result<()> {
        self.run_inner(shutdown)
            .instrument(watch_span(self.backend.name()))
            .await
    }

    async fn run_inner(&self, shutdown: ShutdownToken) -> Result<()> {
        let selector = managed_selector();
        let mut backoff = Backoff::new(&self.config);
        let mut failures: u32 = 0;

        while !shutdown.is_cancelled() {
            let failure = match self.backend.watch_runs(&selector).await {
                Ok(mut stream) => loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => return Ok(()),
                        item = stream.next() => match item {
                            Some(Ok(event)) => {
                                failures = 0;
                                backoff.reset();
                                self.handle_event(&event).await?;
                            }
                            Some(Err(err)) => break Some(err),
                            None => {
                                tracing::debug!("watch stream ended, reopening");
                                break None;
                            }
                        }
                    }
                },
                Err(err) => Some(err),
            };

            if let Some(err) = failure {
                failures += 1;
                if failures > self.config.max_reconnect_attempts {
                    tracing::error!(
                        attempts = failures,
                        error = %err,
                        "giving up on watch stream"
                    );
                    return Err(LandoError::WatchExhausted {
                        attempts: failures,
                        source: err,
                    });
                }
                record_watch_reconnect(failures, &err);
            }

            let delay = backoff.next_delay();
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_cap() {
        let config = WatcherConfig {
            reconnect_backoff_ms: 100,
            max_reconnect_backoff_ms: 350,
            max_reconnect_attempts: 3,
        };
        let mut backoff = Backoff::new(&config);
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(350));
        assert_eq!(backoff.next_delay(), Duration::from_millis(350));
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn cap_never_below_initial() {
        let config = WatcherConfig {
            reconnect_backoff_ms: 500,
            max_reconnect_backoff_ms: 10,
            max_reconnect_attempts: 1,
        };
        let mut backoff = Backoff::new(&config);
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
    }
}
