//! Tracing and telemetry instrumentation for lando.
//!
//! Span constructors for command handling, backend calls and the watcher,
//! plus `record_*` helpers that log an occurrence and, with the `metrics`
//! feature, update the matching Prometheus series.
//!
//! # Example
//!
//! ```ignore
//! use lando::telemetry::{command_span, record_command_handled};
//!
//! let span = command_span(job_id, "start_job");
//! let _enter = span.enter();
//! // ... handle the command
//! record_command_handled(job_id, "start_job", "ok");
//! ```

use std::fmt::Display;

use tracing::{info_span, Span};
use tracing_subscriber::EnvFilter;

/// Span wrapping the handling of one inbound command.
#[must_use]
pub fn command_span(job_id: impl Display, command: impl AsRef<str>) -> Span {
    info_span!(
        "lando.command",
        job_id = %job_id,
        command = %command.as_ref(),
    )
}

/// Span wrapping one backend call.
#[must_use]
pub fn backend_span(
    backend: impl AsRef<str>,
    operation: impl AsRef<str>,
    resource: impl AsRef<str>,
) -> Span {
    info_span!(
        "lando.backend",
        backend = %backend.as_ref(),
        operation = %operation.as_ref(),
        resource = %resource.as_ref(),
    )
}

/// Span covering the lifetime of a watcher stream.
#[must_use]
pub fn watch_span(backend: impl AsRef<str>) -> Span {
    info_span!("lando.watch", backend = %backend.as_ref())
}

pub fn record_command_handled(
    job_id: impl Display,
    command: impl AsRef<str>,
    outcome: impl AsRef<str>,
) {
    tracing::debug!(
        job_id = %job_id,
        command = %command.as_ref(),
        outcome = %outcome.as_ref(),
        "command handled"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_command_handled(command.as_ref(), outcome.as_ref());
}

/// A command that did not match the job's recorded position.
pub fn record_stale_message(
    job_id: impl Display,
    command: impl AsRef<str>,
    position: impl Display,
) {
    tracing::info!(
        job_id = %job_id,
        command = %command.as_ref(),
        position = %position,
        "dropping stale command"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_stale_message(command.as_ref());
}

pub fn record_step_launched(
    job_id: impl Display,
    step_type: impl AsRef<str>,
    run_name: impl AsRef<str>,
) {
    tracing::info!(
        job_id = %job_id,
        step = %step_type.as_ref(),
        run_name = %run_name.as_ref(),
        "step launched"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_step_launched(step_type.as_ref());
}

pub fn record_job_error(
    job_id: impl Display,
    step: impl AsRef<str>,
    kind: impl AsRef<str>,
    message: impl AsRef<str>,
) {
    tracing::warn!(
        job_id = %job_id,
        step = %step.as_ref(),
        kind = %kind.as_ref(),
        message = %message.as_ref(),
        "job errored"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_job_error(step.as_ref(), kind.as_ref());
}

pub fn record_watch_reconnect(attempt: u32, error: impl Display) {
    tracing::warn!(attempt, error = %error, "watch stream lost, reconnecting");

    #[cfg(feature = "metrics")]
    crate::metrics::record_watch_reconnect();
}

/// Start timing a command.
pub fn record_command_start(command: impl AsRef<str>) -> CommandTimer {
    CommandTimer {
        command: command.as_ref().to_string(),
        start: std::time::Instant::now(),
    }
}

/// Stop timing a command and observe its duration.
pub fn record_command_end(timer: CommandTimer) {
    let duration_secs = timer.start.elapsed().as_secs_f64();
    tracing::trace!(
        command = %timer.command,
        duration_secs,
        "command duration observed"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::observe_command_duration(&timer.command, duration_secs);
}

/// Opaque timing handle returned by [`record_command_start`].
#[derive(Debug)]
pub struct CommandTimer {
    command: String,
    start: std::time::Instant,
}

impl CommandTimer {
    #[must_use]
    pub fn command(&self) -> &str {
        &self.command
    }

    #[must_use]
    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }
}

/// Install a global `fmt` subscriber honoring `RUST_LOG`, falling back to
/// `default_filter`. Returns an error when a subscriber is already set.
pub fn init_tracing(default_filter: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!(e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn span_names() {
        assert_eq!(
            command_span(51, "start_job").metadata().unwrap().name(),
            "lando.command"
        );
        assert_eq!(
            backend_span("cluster", "run", "stage-data-51-jpb")
                .metadata()
                .unwrap()
                .name(),
            "lando.backend"
        );
        assert_eq!(
            watch_span("cluster").metadata().unwrap().name(),
            "lando.watch"
        );
    }

    #[test]
    fn command_timer() {
        let timer = record_command_start("start_job");
        assert_eq!(timer.command(), "start_job");
        std::thread::sleep(std::time::Duration::from_millis(1));
        assert!(timer.elapsed().as_nanos() > 0);
        record_command_end(timer);
    }

    #[test]
    fn record_helpers_do_not_panic() {
        record_command_handled(1, "start_job", "ok");
        record_stale_message(1, "run_job_complete", "running/staging");
        record_step_launched(1, "stage_data", "stage-data-1-jpb");
        record_job_error(1, "staging", "step_failed", "boom");
        record_watch_reconnect(1, "stream closed");
    }
}
