use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::backoff::{exponential_delay, with_jitter};
use crate::commands::{ClaimJobCommand, ExecuteJobCommand, HandleJobFailureCommand, UnlockJobCommand};
use crate::config::JobExecutorConfig;
use crate::context::{CancellationToken, EngineServices};
use crate::error::{EngineError, Result};
use crate::ids::ProcessInstanceId;
use crate::interceptor::CommandExecutor;
use crate::job::Job;
use crate::store::AcquisitionQuery;
use crate::telemetry::acquire_span;

use super::worker::WorkerPool;

const JITTER_RATIO: f32 = 0.5;

/// What one acquisition cycle did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcquisitionReport {
    /// Due jobs returned by the store.
    pub found: usize,
    /// Jobs claimed and handed to a worker.
    pub acquired: usize,
    /// Claims lost to another node.
    pub conflicts: usize,
    /// Claimed jobs released because the pool was full.
    pub rejected: usize,
    /// Exclusive jobs skipped because this node runs their instance.
    pub deferred: usize,
    /// The cycle stopped early because no worker slot was free.
    pub saturated: bool,
    /// The store returned as many jobs as were asked for.
    pub full: bool,
}

/// Acquires due jobs, claims them and runs them on a bounded worker pool.
pub struct JobExecutor {
    inner: Arc<ExecutorInner>,
    shutdown_token: CancellationToken,
    handles: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

struct ExecutorInner {
    commands: CommandExecutor,
    config: JobExecutorConfig,
    pool: WorkerPool,
    /// Instances with an exclusive job currently running on this node.
    in_flight: Mutex<HashSet<ProcessInstanceId>>,
}

impl std::fmt::Debug for JobExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobExecutor")
            .field("lock_owner", &self.inner.config.lock_owner)
            .field("pool", &self.inner.pool)
            .field("is_shutdown", &self.shutdown_token.is_cancelled())
            .field(
                "handles",
                &self.handles.try_lock().map(|h| h.len()).unwrap_or_default(),
            )
            .finish()
    }
}

impl JobExecutor {
    pub fn new(commands: CommandExecutor) -> Self {
        let services = commands.services().clone();
        let config = services.config.job_executor.clone();
        let pool = WorkerPool::new(config.worker_pool_size, services.metrics.clone());
        Self {
            inner: Arc::new(ExecutorInner {
                commands,
                config,
                pool,
                in_flight: Mutex::new(HashSet::new()),
            }),
            shutdown_token: CancellationToken::new(),
            handles: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &JobExecutorConfig {
        &self.inner.config
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.inner.pool
    }

    pub fn is_running(&self) -> bool {
        !self.shutdown_token.is_cancelled()
            && self
                .handles
                .try_lock()
                .map(|h| !h.is_empty())
                .unwrap_or(true)
    }

    /// Spawn the acquisition loop and, when configured, the lock sweep.
    pub async fn start(&self) -> anyhow::Result<()> {
        if self.shutdown_token.is_cancelled() {
            anyhow::bail!("job executor {} was shut down", self.inner.config.lock_owner);
        }
        let mut handles = self.handles.lock().await;
        if !handles.is_empty() {
            return Ok(());
        }

        tracing::info!(
            lock_owner = %self.inner.config.lock_owner,
            workers = self.inner.pool.size(),
            "starting job executor"
        );

        let inner = self.inner.clone();
        let shutdown = self.shutdown_token.clone();
        handles.push(tokio::spawn(async move {
            inner.acquisition_loop(shutdown).await;
        }));

        if let Some(interval_ms) = self.inner.config.lock_sweep_interval_ms {
            let inner = self.inner.clone();
            let shutdown = self.shutdown_token.clone();
            handles.push(tokio::spawn(async move {
                inner
                    .lock_sweep_loop(Duration::from_millis(interval_ms), shutdown)
                    .await;
            }));
        }
        Ok(())
    }

    /// Stop acquiring, then wait for running jobs up to the configured
    /// shutdown timeout. Jobs still running at the deadline keep their locks
    /// until those expire.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        tracing::info!(lock_owner = %self.inner.config.lock_owner, "job executor shutting down");

        self.shutdown_token.cancel();
        let timeout = Duration::from_millis(self.inner.config.shutdown_timeout_ms);

        let handles = {
            let mut guard = self.handles.lock().await;
            std::mem::take(&mut *guard)
        };
        for handle in handles {
            match tokio::time::timeout(timeout, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!("Job executor task failed: {:?}", e),
                Err(_) => tracing::warn!("Job executor task timed out during shutdown"),
            }
        }

        if !self.inner.pool.close(timeout).await {
            tracing::warn!(
                busy = self.inner.pool.busy(),
                "jobs still running after shutdown timeout"
            );
        }

        tracing::info!("Job executor shutdown complete");
        Ok(())
    }

    /// Run one acquisition cycle now. Used by the loop and by callers that
    /// drive the executor by hand.
    pub async fn run_acquisition_cycle(&self) -> Result<AcquisitionReport> {
        self.inner.acquire_and_dispatch(&self.shutdown_token).await
    }

    /// Wait until every dispatched job has finished.
    pub async fn wait_idle(&self) {
        self.inner.pool.wait_idle().await;
    }

    /// Run cycles until a cycle finds nothing and the pool is idle. Returns
    /// the number of jobs acquired. `max_cycles` bounds jobs that keep
    /// rescheduling themselves as due.
    pub async fn run_until_idle(&self, max_cycles: usize) -> Result<usize> {
        let mut acquired = 0;
        for _ in 0..max_cycles {
            let report = self.run_acquisition_cycle().await?;
            self.wait_idle().await;
            acquired += report.acquired;
            if report.found == 0 {
                break;
            }
        }
        Ok(acquired)
    }
}

/// Marks an exclusive instance as running on this node until dropped.
///
/// Dropping also covers a rejected dispatch and a worker that unwinds.
struct InFlight {
    executor: Arc<ExecutorInner>,
    process_instance_id: ProcessInstanceId,
}

impl InFlight {
    fn enter(executor: &Arc<ExecutorInner>, process_instance_id: ProcessInstanceId) -> Self {
        executor.in_flight.lock().insert(process_instance_id);
        Self {
            executor: executor.clone(),
            process_instance_id,
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.executor.in_flight.lock().remove(&self.process_instance_id);
        // Follow-up jobs of the instance were deferred while this one ran.
        self.executor.services().job_added.notify_one();
    }
}

impl ExecutorInner {
    fn services(&self) -> &Arc<EngineServices> {
        self.commands.services()
    }

    async fn acquisition_loop(self: Arc<Self>, shutdown: CancellationToken) {
        let job_added = self.services().job_added.clone();
        let mut busy = self.pool.subscribe();
        let mut conflict_streak = 0u32;

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let report = match self.acquire_and_dispatch(&shutdown).await {
                Ok(report) => report,
                Err(err) => {
                    tracing::warn!(error = %err, "job acquisition failed");
                    AcquisitionReport::default()
                }
            };
            let wait = self.next_wait(&report, &mut conflict_streak);
            let _ = busy.borrow_and_update();

            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Job acquisition shutting down");
                    break;
                }
                _ = job_added.notified() => {}
                _ = busy.changed(), if report.saturated => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Zero when the last query was full, a growing jittered backoff after
    /// lost claims, the configured interval otherwise.
    fn next_wait(&self, report: &AcquisitionReport, conflict_streak: &mut u32) -> Duration {
        if report.conflicts > 0 {
            *conflict_streak = conflict_streak.saturating_add(1);
            let delay = with_jitter(
                exponential_delay(
                    *conflict_streak,
                    self.config.acquisition_backoff_ms,
                    self.config.max_acquisition_backoff_ms,
                ),
                JITTER_RATIO,
            );
            let cap = Duration::from_millis(self.config.max_acquisition_backoff_ms);
            return delay.to_std().unwrap_or_default().min(cap);
        }
        *conflict_streak = 0;

        if report.full && !report.saturated {
            Duration::ZERO
        } else {
            Duration::from_millis(self.config.acquisition_interval_ms)
        }
    }

    async fn acquire_and_dispatch(
        self: &Arc<Self>,
        shutdown: &CancellationToken,
    ) -> Result<AcquisitionReport> {
        let limit = self.config.max_jobs_per_acquisition;
        let span = acquire_span(&self.config.lock_owner, limit);
        async {
            let mut report = AcquisitionReport::default();
            if self.pool.available() == 0 {
                report.saturated = true;
                return Ok(report);
            }

            let services = self.services();
            let query = AcquisitionQuery {
                now: services.clock.now(),
                limit,
                exclusive_aware: self.config.exclusive_jobs_enabled,
            };
            let candidates = services.store.find_due_unlocked_jobs(&query).await?;
            report.found = candidates.len();
            report.full = candidates.len() >= limit;

            for job in candidates {
                if shutdown.is_cancelled() {
                    break;
                }
                if self.pool.available() == 0 {
                    report.saturated = true;
                    break;
                }
                let exclusive_pid = self.exclusive_instance(&job);
                if let Some(pid) = exclusive_pid {
                    if self.in_flight.lock().contains(&pid) {
                        report.deferred += 1;
                        continue;
                    }
                }

                let job = match self.claim(&job).await {
                    Ok(job) => job,
                    Err(err) if err.is_conflict() => {
                        report.conflicts += 1;
                        services.metrics.record_claim_conflict(job.id.to_string());
                        continue;
                    }
                    Err(err) => {
                        tracing::warn!(job_id = %job.id, error = %err, "job claim failed");
                        continue;
                    }
                };

                let in_flight = exclusive_pid.map(|pid| InFlight::enter(self, pid));
                let job_id = job.id;
                let task = self.clone().run_job(job, in_flight);
                if self.pool.try_dispatch(task) {
                    report.acquired += 1;
                } else {
                    report.rejected += 1;
                    report.saturated = true;
                    services.metrics.record_rejected(job_id.to_string());
                    self.release(job_id).await;
                }
            }

            services.metrics.record_acquired(report.acquired);
            if report.conflicts > 0 || report.rejected > 0 {
                tracing::debug!(?report, "acquisition cycle finished with lost jobs");
            }
            Ok(report)
        }
        .instrument(span)
        .await
    }

    fn exclusive_instance(&self, job: &Job) -> Option<ProcessInstanceId> {
        if self.config.exclusive_jobs_enabled && job.exclusive {
            job.process_instance_id
        } else {
            None
        }
    }

    async fn claim(&self, job: &Job) -> Result<Job> {
        let lock_expiration = self.services().clock.now() + self.config.lock_duration();
        self.commands
            .execute(ClaimJobCommand {
                job_id: job.id,
                lock_owner: self.config.lock_owner.clone(),
                lock_expiration,
            })
            .await
    }

    async fn release(&self, job_id: crate::ids::JobId) {
        let unlock = UnlockJobCommand {
            job_id,
            lock_owner: self.config.lock_owner.clone(),
        };
        if let Err(err) = self.commands.execute(unlock).await {
            tracing::warn!(job_id = %job_id, error = %err, "failed to release job lock");
        }
    }

    async fn run_job(self: Arc<Self>, job: Job, _in_flight: Option<InFlight>) {
        let job_id = job.id;
        let owner = self.config.lock_owner.clone();
        let result = self
            .commands
            .execute(ExecuteJobCommand::claimed_by(job_id, owner.clone()))
            .await;

        match result {
            Ok(outcome) => {
                tracing::debug!(job_id = %job_id, job_type = %job.job_type, ?outcome, "job executed");
            }
            Err(EngineError::NotFound { entity: "job", .. }) => {
                tracing::debug!(job_id = %job_id, "job removed before execution");
            }
            Err(err) if !err.counts_as_job_failure() => {
                // Release without using a retry.
                tracing::warn!(job_id = %job_id, error = %err, "job execution interrupted");
                self.release(job_id).await;
            }
            Err(err) => {
                tracing::warn!(job_id = %job_id, job_type = %job.job_type, error = %err, "job execution failed");
                let failure = HandleJobFailureCommand::from_error(job_id, Some(owner), &err);
                match self.commands.execute(failure).await {
                    Ok(Some(failure)) if failure.retries_left == 0 => {
                        tracing::warn!(
                            job_id = %job_id,
                            incident_id = ?failure.incident_id,
                            "job out of retries"
                        );
                    }
                    Ok(_) => {}
                    Err(err) => {
                        tracing::error!(job_id = %job_id, error = %err, "failed to record job failure");
                    }
                }
            }
        }
    }

    async fn lock_sweep_loop(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Lock sweep shutting down");
                    break;
                }
                _ = tokio::time::sleep(interval) => {}
            }

            let services = self.services();
            match services.store.clear_expired_locks(services.clock.now()).await {
                Ok(cleared) if !cleared.is_empty() => {
                    tracing::info!(count = cleared.len(), "cleared expired job locks");
                    services.metrics.record_locks_expired(cleared.len());
                    services.job_added.notify_one();
                }
                Ok(_) => {}
                Err(e) => tracing::warn!("Lock sweep failed: {:?}", e),
            }
        }
    }
}
