use std::sync::Arc;

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::backoff::{
    BackoffStrategy, ExponentialBackoff, FixedBackoff, ImmediateBackoff, LinearBackoff,
};
use crate::clock::MAX_DELAY_MS;
use crate::error::{EngineError, Result};

fn check_delay(name: &str, ms: u64) -> Result<()> {
    if ms > MAX_DELAY_MS {
        return Err(EngineError::validation(format!(
            "{name} must not exceed {MAX_DELAY_MS} ms, got {ms}"
        )));
    }
    Ok(())
}

fn millis(ms: u64) -> Duration {
    Duration::milliseconds(ms.min(MAX_DELAY_MS) as i64)
}

/// Top-level engine configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Acquisition and dispatch settings.
    pub job_executor: JobExecutorConfig,
    /// Job failure and command conflict retry settings.
    pub retry: RetryConfig,
    /// Batch splitting settings.
    pub batch: BatchConfig,
    /// Capacity of the in-process event channel.
    pub event_bus_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            job_executor: JobExecutorConfig::default(),
            retry: RetryConfig::default(),
            batch: BatchConfig::default(),
            event_bus_capacity: 1024,
        }
    }
}

impl EngineConfig {
    pub fn with_job_executor(mut self, job_executor: JobExecutorConfig) -> Self {
        self.job_executor = job_executor;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_batch(mut self, batch: BatchConfig) -> Self {
        self.batch = batch;
        self
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        let executor = &self.job_executor;
        if executor.lock_owner.trim().is_empty() {
            return Err(EngineError::validation("lock_owner must not be empty"));
        }
        if executor.max_jobs_per_acquisition == 0 {
            return Err(EngineError::validation(
                "max_jobs_per_acquisition must be at least 1",
            ));
        }
        if executor.worker_pool_size == 0 {
            return Err(EngineError::validation("worker_pool_size must be at least 1"));
        }
        if executor.lock_duration_ms == 0 {
            return Err(EngineError::validation("lock_duration_ms must be positive"));
        }
        check_delay("acquisition_interval_ms", executor.acquisition_interval_ms)?;
        check_delay("lock_duration_ms", executor.lock_duration_ms)?;
        check_delay("max_acquisition_backoff_ms", executor.max_acquisition_backoff_ms)?;
        check_delay("shutdown_timeout_ms", executor.shutdown_timeout_ms)?;
        if let Some(sweep) = executor.lock_sweep_interval_ms {
            check_delay("lock_sweep_interval_ms", sweep)?;
        }
        if executor.max_acquisition_backoff_ms < executor.acquisition_backoff_ms {
            return Err(EngineError::validation(
                "max_acquisition_backoff_ms must not be below acquisition_backoff_ms",
            ));
        }
        if !(0.0..=1.0).contains(&self.retry.conflict_jitter_ratio) {
            return Err(EngineError::validation(
                "conflict_jitter_ratio must be within 0.0..=1.0",
            ));
        }
        check_delay("conflict_backoff_ms", self.retry.conflict_backoff_ms)?;
        match self.retry.backoff {
            BackoffPolicy::Immediate => {}
            BackoffPolicy::Fixed { delay_ms } => check_delay("backoff delay_ms", delay_ms)?,
            BackoffPolicy::Linear { step_ms, max_ms } => {
                check_delay("backoff step_ms", step_ms)?;
                check_delay("backoff max_ms", max_ms)?;
            }
            BackoffPolicy::Exponential {
                base_ms,
                max_ms,
                jitter_ratio,
            } => {
                check_delay("backoff base_ms", base_ms)?;
                check_delay("backoff max_ms", max_ms)?;
                if !(0.0..=1.0).contains(&jitter_ratio) {
                    return Err(EngineError::validation(
                        "backoff jitter_ratio must be within 0.0..=1.0",
                    ));
                }
            }
        }
        if self.batch.chunk_size == 0 || self.batch.jobs_per_seed == 0 {
            return Err(EngineError::validation(
                "batch chunk_size and jobs_per_seed must be at least 1",
            ));
        }
        check_delay("monitor_poll_interval_ms", self.batch.monitor_poll_interval_ms)?;
        if self.event_bus_capacity == 0 {
            return Err(EngineError::validation("event_bus_capacity must be at least 1"));
        }
        Ok(())
    }
}

/// Settings for the acquisition cycle and worker pool of one node.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct JobExecutorConfig {
    /// Owner written into job locks claimed by this node.
    pub lock_owner: String,
    /// Wait between acquisition cycles when nothing forces an early run.
    pub acquisition_interval_ms: u64,
    /// Upper bound of jobs claimed per cycle.
    pub max_jobs_per_acquisition: usize,
    /// Number of jobs executed concurrently by this node.
    pub worker_pool_size: usize,
    /// How long a claimed job stays owned before it becomes acquirable again.
    pub lock_duration_ms: u64,
    /// Enforce at most one in-flight exclusive job per process instance.
    pub exclusive_jobs_enabled: bool,
    /// First wait applied after a cycle that lost claims to other nodes.
    pub acquisition_backoff_ms: u64,
    /// Cap for the growing wait after repeated lost claims.
    pub max_acquisition_backoff_ms: u64,
    /// Run an active sweep clearing expired locks at this interval.
    pub lock_sweep_interval_ms: Option<u64>,
    /// How long shutdown waits for each background task.
    pub shutdown_timeout_ms: u64,
}

impl JobExecutorConfig {
    pub fn new(lock_owner: impl Into<String>) -> Self {
        Self {
            lock_owner: lock_owner.into(),
            ..Default::default()
        }
    }

    pub fn with_acquisition_interval(mut self, ms: u64) -> Self {
        self.acquisition_interval_ms = ms;
        self
    }

    pub fn with_max_jobs_per_acquisition(mut self, max: usize) -> Self {
        self.max_jobs_per_acquisition = max;
        self
    }

    pub fn with_worker_pool_size(mut self, size: usize) -> Self {
        self.worker_pool_size = size;
        self
    }

    pub fn with_lock_duration(mut self, ms: u64) -> Self {
        self.lock_duration_ms = ms;
        self
    }

    pub fn with_exclusive_jobs(mut self, enabled: bool) -> Self {
        self.exclusive_jobs_enabled = enabled;
        self
    }

    pub fn with_acquisition_backoff(mut self, base_ms: u64, max_ms: u64) -> Self {
        self.acquisition_backoff_ms = base_ms;
        self.max_acquisition_backoff_ms = max_ms;
        self
    }

    pub fn with_lock_sweep_interval(mut self, ms: u64) -> Self {
        self.lock_sweep_interval_ms = Some(ms);
        self
    }

    pub fn lock_duration(&self) -> Duration {
        millis(self.lock_duration_ms)
    }
}

impl Default for JobExecutorConfig {
    fn default() -> Self {
        Self {
            lock_owner: format!("flowcore-{}", std::process::id()),
            acquisition_interval_ms: 5_000,
            max_jobs_per_acquisition: 3,
            worker_pool_size: 3,
            lock_duration_ms: 300_000,
            exclusive_jobs_enabled: true,
            acquisition_backoff_ms: 100,
            max_acquisition_backoff_ms: 5_000,
            lock_sweep_interval_ms: None,
            shutdown_timeout_ms: 30_000,
        }
    }
}

/// Backoff applied to the due date of a job after its handler failed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackoffPolicy {
    /// Retry on the next cycle.
    Immediate,
    Fixed {
        delay_ms: u64,
    },
    Linear {
        step_ms: u64,
        max_ms: u64,
    },
    /// `base * 2^(attempt-1)`, capped and optionally jittered.
    Exponential {
        base_ms: u64,
        max_ms: u64,
        jitter_ratio: f32,
    },
}

impl BackoffPolicy {
    pub fn to_strategy(&self) -> Arc<dyn BackoffStrategy> {
        match *self {
            Self::Immediate => Arc::new(ImmediateBackoff),
            Self::Fixed { delay_ms } => Arc::new(FixedBackoff::new(delay_ms)),
            Self::Linear { step_ms, max_ms } => Arc::new(LinearBackoff::new(step_ms, max_ms)),
            Self::Exponential {
                base_ms,
                max_ms,
                jitter_ratio,
            } => Arc::new(ExponentialBackoff::new(base_ms, max_ms).with_jitter(jitter_ratio)),
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::Exponential {
            base_ms: 1_000,
            max_ms: 300_000,
            jitter_ratio: 0.25,
        }
    }
}

/// Failure and conflict retry settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries given to newly created jobs.
    pub default_retries: u32,
    /// Due-date backoff after a job failure.
    pub backoff: BackoffPolicy,
    /// Times a command is re-run after an optimistic lock conflict.
    pub conflict_retries: u32,
    /// Base wait before re-running a conflicting command.
    pub conflict_backoff_ms: u64,
    /// Ratio of jitter added to the conflict wait (0.0 - 1.0).
    pub conflict_jitter_ratio: f32,
}

impl RetryConfig {
    pub fn with_default_retries(mut self, retries: u32) -> Self {
        self.default_retries = retries;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_conflict_retries(mut self, retries: u32) -> Self {
        self.conflict_retries = retries;
        self
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            default_retries: 3,
            backoff: BackoffPolicy::default(),
            conflict_retries: 3,
            conflict_backoff_ms: 20,
            conflict_jitter_ratio: 0.5,
        }
    }
}

/// Settings for splitting batches into jobs.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Items handled by one execution job.
    pub chunk_size: u32,
    /// Execution jobs created per seed job run.
    pub jobs_per_seed: u32,
    /// Wait between monitor job runs.
    pub monitor_poll_interval_ms: u64,
}

impl BatchConfig {
    pub fn with_chunk_size(mut self, chunk_size: u32) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_jobs_per_seed(mut self, jobs_per_seed: u32) -> Self {
        self.jobs_per_seed = jobs_per_seed;
        self
    }

    pub fn with_monitor_poll_interval(mut self, ms: u64) -> Self {
        self.monitor_poll_interval_ms = ms;
        self
    }

    pub fn monitor_poll_interval(&self) -> Duration {
        millis(self.monitor_poll_interval_ms)
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            chunk_size: 10,
            jobs_per_seed: 100,
            monitor_poll_interval_ms: 30_000,
        }
    }
}
