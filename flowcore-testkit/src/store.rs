use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flowcore::store::{AcquisitionQuery, Change, Entity, EntityKey};
use flowcore::*;

/// In-memory store whose flushes can be made to fail on demand.
#[derive(Clone, Default)]
pub struct FlakyStore {
    inner: Arc<InMemoryStore>,
    conflicts: Arc<AtomicUsize>,
    conflict_skip: Arc<AtomicUsize>,
    outages: Arc<AtomicUsize>,
    flushes: Arc<AtomicUsize>,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inner(&self) -> &Arc<InMemoryStore> {
        &self.inner
    }

    /// Reject the next `count` flushes with an optimistic lock conflict.
    pub fn conflict_next_flushes(&self, count: usize) {
        self.conflict_after(0, count);
    }

    /// Let `skip` flushes through, then reject the following `count`.
    pub fn conflict_after(&self, skip: usize, count: usize) {
        self.conflict_skip.store(skip, Ordering::SeqCst);
        self.conflicts.store(count, Ordering::SeqCst);
    }

    /// Fail the next `count` flushes as if the database were unreachable.
    pub fn fail_next_flushes(&self, count: usize) {
        self.outages.store(count, Ordering::SeqCst);
    }

    /// Successful and failed flush attempts so far.
    pub fn flush_count(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for FlakyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlakyStore")
            .field("entities", &self.inner.len())
            .field("pending_conflicts", &self.conflicts.load(Ordering::SeqCst))
            .field("pending_outages", &self.outages.load(Ordering::SeqCst))
            .field("flushes", &self.flush_count())
            .finish()
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl Store for FlakyStore {
    async fn find(&self, key: EntityKey) -> Result<Option<Entity>> {
        self.inner.find(key).await
    }

    async fn find_executions(&self, query: &ExecutionQuery) -> Result<Vec<Execution>> {
        self.inner.find_executions(query).await
    }

    async fn find_jobs(&self, query: &JobQuery) -> Result<Vec<Job>> {
        self.inner.find_jobs(query).await
    }

    async fn find_incidents(&self, query: &IncidentQuery) -> Result<Vec<Incident>> {
        self.inner.find_incidents(query).await
    }

    async fn find_batches(&self) -> Result<Vec<Batch>> {
        self.inner.find_batches().await
    }

    async fn find_due_unlocked_jobs(&self, query: &AcquisitionQuery) -> Result<Vec<Job>> {
        self.inner.find_due_unlocked_jobs(query).await
    }

    async fn flush(&self, changes: ChangeSet) -> Result<()> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        if take_one(&self.outages) {
            return Err(anyhow::anyhow!("injected store outage").into());
        }
        let conflicting = self.conflicts.load(Ordering::SeqCst) > 0;
        if conflicting && !take_one(&self.conflict_skip) && take_one(&self.conflicts) {
            let entity = changes
                .changes
                .first()
                .map(|change| change.key().to_string())
                .unwrap_or_default();
            return Err(EngineError::conflict(entity, "injected conflict"));
        }
        self.inner.flush(changes).await
    }
}

#[async_trait]
impl LockExpiryScanner for FlakyStore {
    async fn clear_expired_locks(&self, now: DateTime<Utc>) -> Result<Vec<JobId>> {
        self.inner.clear_expired_locks(now).await
    }
}

/// Write jobs straight to a store, bypassing commands.
pub async fn insert_jobs<S: Store + ?Sized>(
    store: &S,
    jobs: impl IntoIterator<Item = Job>,
) -> Result<Vec<JobId>> {
    let mut changes = ChangeSet::new();
    let mut ids = Vec::new();
    for job in jobs {
        ids.push(job.id);
        changes.push(Change::Insert(Entity::Job(job)));
    }
    store.flush(changes).await?;
    Ok(ids)
}

/// Load a job straight from a store.
pub async fn load_job<S: Store + ?Sized>(store: &S, job_id: JobId) -> Result<Option<Job>> {
    match store.find(EntityKey::Job(job_id)).await? {
        Some(Entity::Job(job)) => Ok(Some(job)),
        _ => Ok(None),
    }
}
