//! Tracing spans and counters for engine activity.
//!
//! Span helpers and `record_*` functions log through `tracing` and, with the
//! `metrics` feature, also update the Prometheus collectors in
//! [`crate::metrics`]. [`EngineMetrics`] holds per-engine atomic counters
//! that tests and callers read through [`EngineMetrics::snapshot`].

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tracing::{info_span, Span};

/// Span around one command invocation.
#[must_use]
pub fn command_span(command: &str) -> Span {
    info_span!("flowcore.command", command = %command)
}

/// Span around one acquisition cycle.
#[must_use]
pub fn acquire_span(lock_owner: &str, limit: usize) -> Span {
    info_span!("flowcore.acquire", lock_owner = %lock_owner, limit = limit)
}

/// Span around the execution of a single job.
#[must_use]
pub fn execute_job_span(job_id: impl AsRef<str>, job_type: impl AsRef<str>) -> Span {
    info_span!(
        "flowcore.execute_job",
        job_id = %job_id.as_ref(),
        job_type = %job_type.as_ref(),
    )
}

/// Per-engine counters.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    commands_executed: AtomicU64,
    commands_failed: AtomicU64,
    command_conflicts: AtomicU64,
    jobs_acquired: AtomicU64,
    jobs_executed: AtomicU64,
    jobs_failed: AtomicU64,
    claim_conflicts: AtomicU64,
    jobs_rejected: AtomicU64,
    locks_expired: AtomicU64,
    batch_jobs_created: AtomicU64,
    batch_jobs_completed: AtomicU64,
    batches_completed: AtomicU64,
    incidents_created: AtomicU64,
    incidents_resolved: AtomicU64,
}

/// Point-in-time copy of [`EngineMetrics`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub commands_executed: u64,
    pub commands_failed: u64,
    pub command_conflicts: u64,
    pub jobs_acquired: u64,
    pub jobs_executed: u64,
    pub jobs_failed: u64,
    pub claim_conflicts: u64,
    pub jobs_rejected: u64,
    pub locks_expired: u64,
    pub batch_jobs_created: u64,
    pub batch_jobs_completed: u64,
    pub batches_completed: u64,
    pub incidents_created: u64,
    pub incidents_resolved: u64,
}

fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            commands_executed: load(&self.commands_executed),
            commands_failed: load(&self.commands_failed),
            command_conflicts: load(&self.command_conflicts),
            jobs_acquired: load(&self.jobs_acquired),
            jobs_executed: load(&self.jobs_executed),
            jobs_failed: load(&self.jobs_failed),
            claim_conflicts: load(&self.claim_conflicts),
            jobs_rejected: load(&self.jobs_rejected),
            locks_expired: load(&self.locks_expired),
            batch_jobs_created: load(&self.batch_jobs_created),
            batch_jobs_completed: load(&self.batch_jobs_completed),
            batches_completed: load(&self.batches_completed),
            incidents_created: load(&self.incidents_created),
            incidents_resolved: load(&self.incidents_resolved),
        }
    }

    /// Record the end of a command; `status` is `ok`, `conflict` or `error`.
    pub fn record_command(&self, command: &str, status: &str, duration_secs: f64) {
        match status {
            "ok" => bump(&self.commands_executed, 1),
            "conflict" => bump(&self.command_conflicts, 1),
            _ => bump(&self.commands_failed, 1),
        }

        #[cfg(feature = "metrics")]
        crate::metrics::record_command(command, status, duration_secs);
        #[cfg(not(feature = "metrics"))]
        let _ = (command, duration_secs);
    }

    pub fn record_acquired(&self, count: usize) {
        bump(&self.jobs_acquired, count as u64);
        tracing::debug!(count, "jobs acquired");

        #[cfg(feature = "metrics")]
        crate::metrics::record_acquisition("acquired", count);
    }

    pub fn record_claim_conflict(&self, job_id: impl AsRef<str>) {
        bump(&self.claim_conflicts, 1);
        tracing::debug!(job_id = %job_id.as_ref(), "job claimed by another owner");

        #[cfg(feature = "metrics")]
        crate::metrics::record_acquisition("conflict", 1);
    }

    /// Claimed job handed back because the worker pool was saturated.
    pub fn record_rejected(&self, job_id: impl AsRef<str>) {
        bump(&self.jobs_rejected, 1);
        tracing::debug!(job_id = %job_id.as_ref(), "worker pool saturated, lock released");

        #[cfg(feature = "metrics")]
        crate::metrics::record_acquisition("rejected", 1);
    }

    pub fn record_job_executed(&self, job_type: &str, duration_secs: f64) {
        bump(&self.jobs_executed, 1);

        #[cfg(feature = "metrics")]
        crate::metrics::observe_job(job_type, "success", duration_secs);
        #[cfg(not(feature = "metrics"))]
        let _ = (job_type, duration_secs);
    }

    pub fn record_job_failed(&self, job_id: impl AsRef<str>, job_type: &str, retries_left: u32) {
        bump(&self.jobs_failed, 1);
        tracing::warn!(
            job_id = %job_id.as_ref(),
            job_type = %job_type,
            retries_left,
            "job failed"
        );

        #[cfg(feature = "metrics")]
        crate::metrics::observe_job(
            job_type,
            if retries_left == 0 { "exhausted" } else { "retryable" },
            0.0,
        );
    }

    pub fn record_locks_expired(&self, count: usize) {
        bump(&self.locks_expired, count as u64);
        if count > 0 {
            tracing::warn!(count, "expired job locks cleared");
        }

        #[cfg(feature = "metrics")]
        crate::metrics::record_locks_expired(count);
    }

    pub fn record_batch_jobs_created(&self, batch_id: impl AsRef<str>, count: usize) {
        bump(&self.batch_jobs_created, count as u64);
        tracing::debug!(batch_id = %batch_id.as_ref(), count, "batch execution jobs created");
    }

    pub fn record_batch_job_completed(&self) {
        bump(&self.batch_jobs_completed, 1);
    }

    pub fn record_batch_completed(&self, batch_id: impl AsRef<str>) {
        bump(&self.batches_completed, 1);
        tracing::info!(batch_id = %batch_id.as_ref(), "batch completed");

        #[cfg(feature = "metrics")]
        crate::metrics::record_batch_completed();
    }

    pub fn record_incident_created(&self, incident_type: &str) {
        bump(&self.incidents_created, 1);

        #[cfg(feature = "metrics")]
        crate::metrics::record_incident(incident_type, "created");
        #[cfg(not(feature = "metrics"))]
        let _ = incident_type;
    }

    pub fn record_incident_resolved(&self, incident_type: &str) {
        bump(&self.incidents_resolved, 1);

        #[cfg(feature = "metrics")]
        crate::metrics::record_incident(incident_type, "resolved");
        #[cfg(not(feature = "metrics"))]
        let _ = incident_type;
    }

    /// Worker permits currently in use.
    pub fn set_busy_workers(&self, busy: usize) {
        #[cfg(feature = "metrics")]
        crate::metrics::set_busy_workers(busy);
        #[cfg(not(feature = "metrics"))]
        let _ = busy;
    }
}
