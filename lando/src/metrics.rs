//! Prometheus metrics for the lando orchestrator.
//!
//! Compiled only with the `metrics` feature.
//!
//! # Metrics
//!
//! ## Counters
//! - `lando_commands_handled_total` - Commands handled, by command and outcome
//! - `lando_stale_messages_total` - Commands dropped as stale or duplicate
//! - `lando_steps_launched_total` - Backend runs scheduled, by step type
//! - `lando_job_errors_total` - Jobs moved to ERRORED, by step and error kind
//! - `lando_watch_reconnects_total` - Watcher stream reconnect attempts
//!
//! ## Histograms
//! - `lando_command_duration_seconds` - Time spent handling one command
#![cfg(feature = "metrics")]

use prometheus::{
    exponential_buckets, CounterVec, HistogramVec, IntCounter, Opts, Registry,
};
use std::sync::LazyLock;

/// Global Prometheus registry for lando metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Labels: `command`, `outcome` (`ok`, `stale`, `job_error`, `operational_error`).
pub static COMMANDS_HANDLED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "lando_commands_handled_total",
        "Total number of commands handled",
    );
    CounterVec::new(opts, &["command", "outcome"])
        .expect("lando_commands_handled_total metric creation failed")
});

/// Labels: `command`.
pub static STALE_MESSAGES_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "lando_stale_messages_total",
        "Total number of stale or duplicate commands dropped",
    );
    CounterVec::new(opts, &["command"])
        .expect("lando_stale_messages_total metric creation failed")
});

/// Labels: `step_type`.
pub static STEPS_LAUNCHED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "lando_steps_launched_total",
        "Total number of backend runs scheduled",
    );
    CounterVec::new(opts, &["step_type"])
        .expect("lando_steps_launched_total metric creation failed")
});

/// Labels: `step`, `kind`.
pub static JOB_ERRORS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "lando_job_errors_total",
        "Total number of jobs moved to the errored state",
    );
    CounterVec::new(opts, &["step", "kind"])
        .expect("lando_job_errors_total metric creation failed")
});

pub static WATCH_RECONNECTS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "lando_watch_reconnects_total",
        "Total number of watcher stream reconnect attempts",
    )
    .expect("lando_watch_reconnects_total metric creation failed")
});

/// Labels: `command`.
pub static COMMAND_DURATION_SECONDS: LazyLock<HistogramVec> =
    LazyLock::new(|| {
        let buckets = exponential_buckets(0.001, 2.0, 15)
            .expect("bucket creation failed");
        let opts = prometheus::HistogramOpts::new(
            "lando_command_duration_seconds",
            "Time spent handling one command in seconds",
        )
        .buckets(buckets);
        HistogramVec::new(opts, &["command"])
            .expect("lando_command_duration_seconds metric creation failed")
    });

/// Register every metric with the global registry. Idempotent.
pub fn init_metrics() -> anyhow::Result<()> {
    let registry = &*REGISTRY;

    for metric in [
        Box::new(COMMANDS_HANDLED_TOTAL.clone())
            as Box<dyn prometheus::core::Collector>,
        Box::new(STALE_MESSAGES_TOTAL.clone()),
        Box::new(STEPS_LAUNCHED_TOTAL.clone()),
        Box::new(JOB_ERRORS_TOTAL.clone()),
        Box::new(WATCH_RECONNECTS_TOTAL.clone()),
        Box::new(COMMAND_DURATION_SECONDS.clone()),
    ] {
        if let Err(e) = registry.register(metric) {
            let msg = e.to_string();
            if !msg.contains("Duplicate metrics collector registration attempted")
            {
                return Err(e.into());
            }
        }
    }

    Ok(())
}

pub fn record_command_handled(command: &str, outcome: &str) {
    COMMANDS_HANDLED_TOTAL
        .with_label_values(&[command, outcome])
        .inc();
}

pub fn record_stale_message(command: &str) {
    STALE_MESSAGES_TOTAL.with_label_values(&[command]).inc();
}

pub fn record_step_launched(step_type: &str) {
    STEPS_LAUNCHED_TOTAL.with_label_values(&[step_type]).inc();
}

pub fn record_job_error(step: &str, kind: &str) {
    JOB_ERRORS_TOTAL.with_label_values(&[step, kind]).inc();
}

pub fn record_watch_reconnect() {
    WATCH_RECONNECTS_TOTAL.inc();
}

pub fn observe_command_duration(command: &str, duration_secs: f64) {
    COMMAND_DURATION_SECONDS
        .with_label_values(&[command])
        .observe(duration_secs);
}

/// Gather all registered metrics in Prometheus text format.
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        init_metrics().expect("metrics initialization should succeed");
        init_metrics().expect("second initialization should succeed");
    }

    #[test]
    fn gathered_output_contains_recorded_series() {
        init_metrics().expect("metrics initialization should succeed");

        record_command_handled("start_job", "ok");
        record_stale_message("run_job_complete");
        record_step_launched("stage_data");
        record_job_error("staging", "step_failed");
        record_watch_reconnect();
        observe_command_duration("start_job", 0.02);

        let output = gather_metrics().expect("gather should succeed");
        assert!(output.contains("lando_commands_handled_total"));
        assert!(output.contains("lando_stale_messages_total"));
        assert!(output.contains("lando_steps_launched_total"));
        assert!(output.contains("lando_job_errors_total"));
        assert!(output.contains("lando_watch_reconnects_total"));
        assert!(output.contains("lando_command_duration_seconds"));
    }
}
