//! Prometheus collectors for the engine, behind the `metrics` feature.
//!
//! ## Counters
//! - `flowcore_commands_total` - commands by name and status
//! - `flowcore_acquisition_total` - acquisition results (acquired, conflict, rejected)
//! - `flowcore_locks_expired_total` - locks cleared by the sweep
//! - `flowcore_incidents_total` - incidents created and resolved
//! - `flowcore_batches_completed_total`
//!
//! ## Gauges
//! - `flowcore_busy_workers` - worker permits in use
//!
//! ## Histograms
//! - `flowcore_command_duration_seconds`
//! - `flowcore_job_duration_seconds`
#![cfg(feature = "metrics")]

use prometheus::{
    exponential_buckets, Counter, CounterVec, Gauge, HistogramOpts, HistogramVec, Opts, Registry,
};
use std::sync::LazyLock;

/// Registry holding every flowcore collector.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

pub static COMMANDS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("flowcore_commands_total", "Commands executed");
    CounterVec::new(opts, &["command", "status"])
        .expect("flowcore_commands_total metric creation failed")
});

pub static COMMAND_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let buckets = exponential_buckets(0.0005, 2.0, 16).expect("bucket creation failed");
    let opts = HistogramOpts::new(
        "flowcore_command_duration_seconds",
        "Command duration including transaction commit",
    )
    .buckets(buckets);
    HistogramVec::new(opts, &["command"])
        .expect("flowcore_command_duration_seconds metric creation failed")
});

/// Labels: `result` is one of `acquired`, `conflict`, `rejected`.
pub static ACQUISITION_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("flowcore_acquisition_total", "Job acquisition results");
    CounterVec::new(opts, &["result"]).expect("flowcore_acquisition_total metric creation failed")
});

pub static LOCKS_EXPIRED_TOTAL: LazyLock<Counter> = LazyLock::new(|| {
    Counter::new(
        "flowcore_locks_expired_total",
        "Expired job locks cleared by the sweep",
    )
    .expect("flowcore_locks_expired_total metric creation failed")
});

pub static JOB_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let buckets = exponential_buckets(0.001, 2.0, 15).expect("bucket creation failed");
    let opts = HistogramOpts::new("flowcore_job_duration_seconds", "Job execution duration")
        .buckets(buckets);
    HistogramVec::new(opts, &["job_type", "status"])
        .expect("flowcore_job_duration_seconds metric creation failed")
});

pub static INCIDENTS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("flowcore_incidents_total", "Incidents created and resolved");
    CounterVec::new(opts, &["incident_type", "action"])
        .expect("flowcore_incidents_total metric creation failed")
});

pub static BATCHES_COMPLETED_TOTAL: LazyLock<Counter> = LazyLock::new(|| {
    Counter::new("flowcore_batches_completed_total", "Batches completed")
        .expect("flowcore_batches_completed_total metric creation failed")
});

pub static BUSY_WORKERS: LazyLock<Gauge> = LazyLock::new(|| {
    Gauge::new("flowcore_busy_workers", "Worker permits in use")
        .expect("flowcore_busy_workers metric creation failed")
});

/// Register all collectors. Safe to call more than once.
pub fn init_metrics() -> anyhow::Result<()> {
    let registry = &*REGISTRY;

    for metric in [
        Box::new(COMMANDS_TOTAL.clone()) as Box<dyn prometheus::core::Collector>,
        Box::new(COMMAND_DURATION_SECONDS.clone()),
        Box::new(ACQUISITION_TOTAL.clone()),
        Box::new(LOCKS_EXPIRED_TOTAL.clone()),
        Box::new(JOB_DURATION_SECONDS.clone()),
        Box::new(INCIDENTS_TOTAL.clone()),
        Box::new(BATCHES_COMPLETED_TOTAL.clone()),
        Box::new(BUSY_WORKERS.clone()),
    ] {
        if let Err(e) = registry.register(metric) {
            let msg = e.to_string();
            if !msg.contains("Duplicate metrics collector registration attempted") {
                return Err(e.into());
            }
        }
    }

    Ok(())
}

pub fn record_command(command: &str, status: &str, duration_secs: f64) {
    COMMANDS_TOTAL.with_label_values(&[command, status]).inc();
    COMMAND_DURATION_SECONDS
        .with_label_values(&[command])
        .observe(duration_secs);
}

pub fn record_acquisition(result: &str, count: usize) {
    ACQUISITION_TOTAL
        .with_label_values(&[result])
        .inc_by(count as f64);
}

pub fn record_locks_expired(count: usize) {
    LOCKS_EXPIRED_TOTAL.inc_by(count as f64);
}

pub fn observe_job(job_type: &str, status: &str, duration_secs: f64) {
    JOB_DURATION_SECONDS
        .with_label_values(&[job_type, status])
        .observe(duration_secs);
}

pub fn record_incident(incident_type: &str, action: &str) {
    INCIDENTS_TOTAL
        .with_label_values(&[incident_type, action])
        .inc();
}

pub fn record_batch_completed() {
    BATCHES_COMPLETED_TOTAL.inc();
}

pub fn set_busy_workers(busy: usize) {
    BUSY_WORKERS.set(busy as f64);
}

/// Gather all registered metrics in Prometheus text format.
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .map_err(Into::into)
}
