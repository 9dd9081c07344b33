use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use crate::auth::{Authentication, AuthorizationProvider};
use crate::backoff::BackoffStrategy;
use crate::batch::{Batch, BatchHandlerRegistry, BatchJobHandler};
use crate::clock::Clock;
use crate::command::Command;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::events::{EngineEvent, InProcEventBus};
use crate::ids::{BatchId, ExecutionId, IncidentId, JobId};
use crate::incident::{Incident, IncidentQuery};
use crate::job::{Job, JobHandler, JobHandlerRegistry, JobQuery};
use crate::pvm::{DefinitionRepository, Execution, ExecutionListener, ExecutionQuery, ProcessDefinition};
use crate::store::{Change, ChangeSet, EngineStore, Entity, EntityKey, Precondition, Record};
use crate::telemetry::EngineMetrics;

/// Cooperative cancellation flag shared by clones.
#[derive(Clone, Debug)]
pub struct CancellationToken {
    inner: Arc<CancellationInner>,
}

#[derive(Debug)]
struct CancellationInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CancellationInner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Wait until cancelled.
    pub async fn cancelled(&self) {
        let notified = self.inner.notify.notified();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared, immutable resources of one engine.
pub struct EngineServices {
    pub config: EngineConfig,
    pub store: Arc<dyn EngineStore>,
    pub clock: Arc<dyn Clock>,
    pub definitions: Arc<dyn DefinitionRepository>,
    pub job_handlers: JobHandlerRegistry,
    pub batch_handlers: BatchHandlerRegistry,
    pub execution_listeners: Vec<Arc<dyn ExecutionListener>>,
    pub authorization: Arc<dyn AuthorizationProvider>,
    pub retry_backoff: Arc<dyn BackoffStrategy>,
    pub events: InProcEventBus,
    pub metrics: Arc<EngineMetrics>,
    /// Signalled after a commit that created jobs.
    pub job_added: Arc<Notify>,
}

impl fmt::Debug for EngineServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineServices")
            .field("config", &self.config)
            .field("clock", &self.clock)
            .field("job_handlers", &self.job_handlers)
            .field("batch_handlers", &self.batch_handlers)
            .field("execution_listeners", &self.execution_listeners.len())
            .field("authorization", &self.authorization)
            .field("retry_backoff", &self.retry_backoff)
            .field("events", &self.events)
            .finish()
    }
}

#[derive(Debug)]
struct Entry {
    /// Revision read from the store; `None` for entities created here.
    original_revision: Option<u32>,
    /// `None` once deleted.
    current: Option<Entity>,
    dirty: bool,
}

type Hook = Box<dyn FnOnce() + Send + Sync>;

/// Unit of work: an entity cache whose changes are flushed atomically.
///
/// Reads go to the store once per entity and are then served from the cache,
/// so a transaction sees its own writes. Nothing reaches the store before
/// [`Transaction::commit`].
pub struct Transaction {
    store: Arc<dyn EngineStore>,
    entries: BTreeMap<EntityKey, Entry>,
    preconditions: Vec<Precondition>,
    events: Vec<EngineEvent>,
    job_added: bool,
    on_commit: Vec<Hook>,
    on_rollback: Vec<Hook>,
}

/// What a successful commit hands back to the transaction boundary.
#[derive(Debug, Default)]
pub struct Committed {
    pub events: Vec<EngineEvent>,
    pub job_added: bool,
    pub changes: usize,
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("entries", &self.entries.len())
            .field("preconditions", &self.preconditions.len())
            .field("events", &self.events.len())
            .finish()
    }
}

impl Transaction {
    pub fn begin(store: Arc<dyn EngineStore>) -> Self {
        Self {
            store,
            entries: BTreeMap::new(),
            preconditions: Vec::new(),
            events: Vec::new(),
            job_added: false,
            on_commit: Vec::new(),
            on_rollback: Vec::new(),
        }
    }

    pub async fn get<R: Record>(&mut self, id: R::Id) -> Result<Option<R>> {
        let key = R::key_of(id);
        if let Some(entry) = self.entries.get(&key) {
            return Ok(entry.current.as_ref().and_then(R::as_record).cloned());
        }

        let found = self.store.find(key).await?;
        let record = found.as_ref().and_then(R::as_record).cloned();
        if let Some(entity) = found {
            self.entries.insert(
                key,
                Entry {
                    original_revision: Some(entity.revision()),
                    current: Some(entity),
                    dirty: false,
                },
            );
        }
        Ok(record)
    }

    pub async fn require<R: Record>(&mut self, id: R::Id) -> Result<R> {
        self.get::<R>(id)
            .await?
            .ok_or_else(|| EngineError::not_found(R::KIND, id))
    }

    pub fn insert<R: Record>(&mut self, record: R) -> Result<()> {
        let key = record.key();
        match self.entries.get_mut(&key) {
            Some(Entry { current: Some(_), .. }) => Err(EngineError::Internal(format!(
                "{key} inserted twice in one transaction"
            ))),
            Some(entry) => {
                entry.current = Some(record.into_entity());
                entry.dirty = true;
                Ok(())
            }
            None => {
                self.entries.insert(
                    key,
                    Entry {
                        original_revision: None,
                        current: Some(record.into_entity()),
                        dirty: true,
                    },
                );
                Ok(())
            }
        }
    }

    /// Replace a loaded or inserted entity.
    pub fn update<R: Record>(&mut self, record: R) -> Result<()> {
        let key = record.key();
        match self.entries.get_mut(&key) {
            Some(entry) if entry.current.is_some() => {
                entry.current = Some(record.into_entity());
                entry.dirty = true;
                Ok(())
            }
            _ => Err(EngineError::Internal(format!(
                "{key} updated without being loaded"
            ))),
        }
    }

    pub fn delete<R: Record>(&mut self, id: R::Id) -> Result<()> {
        let key = R::key_of(id);
        match self.entries.get(&key) {
            Some(Entry {
                original_revision: None,
                ..
            }) => {
                self.entries.remove(&key);
                Ok(())
            }
            Some(Entry {
                current: Some(_), ..
            }) => {
                if let Some(entry) = self.entries.get_mut(&key) {
                    entry.current = None;
                    entry.dirty = true;
                }
                Ok(())
            }
            _ => Err(EngineError::Internal(format!(
                "{key} deleted without being loaded"
            ))),
        }
    }

    pub async fn jobs(&mut self, query: &JobQuery) -> Result<Vec<Job>> {
        let found = self.store.find_jobs(query).await?;
        Ok(self.merge(found, |job| query.matches(job)))
    }

    pub async fn executions(&mut self, query: &ExecutionQuery) -> Result<Vec<Execution>> {
        let found = self.store.find_executions(query).await?;
        Ok(self.merge(found, |execution| query.matches(execution)))
    }

    pub async fn incidents(&mut self, query: &IncidentQuery) -> Result<Vec<Incident>> {
        let found = self.store.find_incidents(query).await?;
        Ok(self.merge(found, |incident| query.matches(incident)))
    }

    pub async fn batches(&mut self) -> Result<Vec<Batch>> {
        let found = self.store.find_batches().await?;
        Ok(self.merge(found, |_| true))
    }

    /// Cache store results not seen yet, then answer from the cache so
    /// pending inserts, updates and deletes are reflected.
    fn merge<R: Record>(&mut self, found: Vec<R>, matches: impl Fn(&R) -> bool) -> Vec<R> {
        for record in found {
            let key = record.key();
            if !self.entries.contains_key(&key) {
                let entity = record.into_entity();
                self.entries.insert(
                    key,
                    Entry {
                        original_revision: Some(entity.revision()),
                        current: Some(entity),
                        dirty: false,
                    },
                );
            }
        }
        self.entries
            .values()
            .filter_map(|entry| entry.current.as_ref().and_then(R::as_record))
            .filter(|record| matches(record))
            .cloned()
            .collect()
    }

    pub fn require_precondition(&mut self, precondition: Precondition) {
        self.preconditions.push(precondition);
    }

    /// Queue an event published only if the transaction commits.
    pub fn publish(&mut self, event: EngineEvent) {
        self.events.push(event);
    }

    pub fn mark_job_added(&mut self) {
        self.job_added = true;
    }

    pub fn on_commit(&mut self, hook: impl FnOnce() + Send + Sync + 'static) {
        self.on_commit.push(Box::new(hook));
    }

    pub fn on_rollback(&mut self, hook: impl FnOnce() + Send + Sync + 'static) {
        self.on_rollback.push(Box::new(hook));
    }

    /// Writes this transaction would flush.
    pub fn change_set(&self) -> ChangeSet {
        let mut changes = ChangeSet::new();
        for (key, entry) in self.entries.iter().filter(|(_, e)| e.dirty) {
            match (entry.original_revision, &entry.current) {
                (None, Some(entity)) => {
                    let mut entity = entity.clone();
                    entity.set_revision(1);
                    changes.push(Change::Insert(entity));
                }
                (Some(revision), Some(entity)) => {
                    let mut entity = entity.clone();
                    entity.set_revision(revision + 1);
                    changes.push(Change::Update {
                        entity,
                        expected_revision: revision,
                    });
                }
                (Some(revision), None) => changes.push(Change::Delete {
                    key: *key,
                    expected_revision: revision,
                }),
                (None, None) => {}
            }
        }
        for precondition in &self.preconditions {
            changes.require(precondition.clone());
        }
        changes
    }

    /// Flush all changes atomically, then run commit hooks.
    ///
    /// On a failed flush the rollback hooks run and the error is returned.
    pub async fn commit(mut self) -> Result<Committed> {
        let changes = self.change_set();
        let count = changes.changes.len();
        if !changes.is_empty() {
            if let Err(err) = self.store.flush(changes).await {
                self.run_rollback_hooks();
                return Err(err);
            }
        }
        for hook in self.on_commit.drain(..) {
            hook();
        }
        Ok(Committed {
            events: std::mem::take(&mut self.events),
            job_added: self.job_added,
            changes: count,
        })
    }

    /// Discard all changes and run rollback hooks.
    pub fn rollback(mut self) {
        self.run_rollback_hooks();
    }

    fn run_rollback_hooks(&mut self) {
        for hook in self.on_rollback.drain(..) {
            hook();
        }
    }
}

/// Per-invocation carrier of the ambient resources a command works with.
///
/// Built fresh for every command invocation around its transaction and
/// dropped when the invocation ends.
pub struct CommandContext {
    tx: Transaction,
    services: Arc<EngineServices>,
    authentication: Option<Authentication>,
    cancellation: CancellationToken,
    command_name: &'static str,
}

impl fmt::Debug for CommandContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandContext")
            .field("command", &self.command_name)
            .field("authentication", &self.authentication)
            .field("cancelled", &self.cancellation.is_cancelled())
            .field("transaction", &self.tx)
            .finish()
    }
}

impl CommandContext {
    pub fn new(
        tx: Transaction,
        services: Arc<EngineServices>,
        authentication: Option<Authentication>,
        cancellation: CancellationToken,
        command_name: &'static str,
    ) -> Self {
        Self {
            tx,
            services,
            authentication,
            cancellation,
            command_name,
        }
    }

    /// Tear the context down, handing the transaction back to its owner.
    pub fn into_transaction(self) -> Transaction {
        self.tx
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.services.clock.now()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.services.config
    }

    pub fn services(&self) -> &Arc<EngineServices> {
        &self.services
    }

    pub fn metrics(&self) -> &EngineMetrics {
        &self.services.metrics
    }

    pub fn command_name(&self) -> &'static str {
        self.command_name
    }

    pub fn authentication(&self) -> Option<&Authentication> {
        self.authentication.as_ref()
    }

    pub fn transaction(&mut self) -> &mut Transaction {
        &mut self.tx
    }

    pub fn check_cancelled(&self) -> Result<()> {
        if self.cancellation.is_cancelled() {
            Err(EngineError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Run another command inside this context and transaction.
    pub async fn run_nested<C: Command>(&mut self, command: &C) -> Result<C::Output> {
        tracing::debug!(parent = self.command_name, nested = command.name(), "nested command");
        command.execute(self).await
    }

    pub async fn job(&mut self, id: JobId) -> Result<Option<Job>> {
        self.tx.get::<Job>(id).await
    }

    pub async fn require_job(&mut self, id: JobId) -> Result<Job> {
        self.tx.require::<Job>(id).await
    }

    pub async fn execution(&mut self, id: ExecutionId) -> Result<Option<Execution>> {
        self.tx.get::<Execution>(id).await
    }

    pub async fn batch(&mut self, id: BatchId) -> Result<Option<Batch>> {
        self.tx.get::<Batch>(id).await
    }

    pub async fn require_batch(&mut self, id: BatchId) -> Result<Batch> {
        self.tx.require::<Batch>(id).await
    }

    pub async fn incident(&mut self, id: IncidentId) -> Result<Option<Incident>> {
        self.tx.get::<Incident>(id).await
    }

    pub async fn jobs(&mut self, query: &JobQuery) -> Result<Vec<Job>> {
        self.tx.jobs(query).await
    }

    pub async fn executions(&mut self, query: &ExecutionQuery) -> Result<Vec<Execution>> {
        self.tx.executions(query).await
    }

    pub async fn incidents(&mut self, query: &IncidentQuery) -> Result<Vec<Incident>> {
        self.tx.incidents(query).await
    }

    pub async fn batches(&mut self) -> Result<Vec<Batch>> {
        self.tx.batches().await
    }

    pub fn insert<R: Record>(&mut self, record: R) -> Result<()> {
        self.tx.insert(record)
    }

    pub fn update<R: Record>(&mut self, record: R) -> Result<()> {
        self.tx.update(record)
    }

    pub fn delete<R: Record>(&mut self, id: R::Id) -> Result<()> {
        self.tx.delete::<R>(id)
    }

    /// Insert a new job and wake the acquisition loop after commit.
    pub fn create_job(&mut self, job: Job) -> Result<()> {
        let job = job.with_created_at(self.now());
        self.tx.publish(EngineEvent::JobCreated {
            job_id: job.id,
            job_type: job.job_type.clone(),
            due_date: job.due_date,
        });
        self.tx.insert(job)?;
        self.tx.mark_job_added();
        Ok(())
    }

    pub fn publish(&mut self, event: EngineEvent) {
        self.tx.publish(event);
    }

    pub fn job_handler(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.services.job_handlers.get(job_type)
    }

    pub fn batch_handler(&self, batch_type: &str) -> Option<Arc<dyn BatchJobHandler>> {
        self.services.batch_handlers.get(batch_type)
    }

    pub fn definition(&self, key: &str) -> Result<Arc<ProcessDefinition>> {
        self.services
            .definitions
            .get(key)
            .ok_or_else(|| EngineError::not_found("process definition", key))
    }

    pub fn execution_listeners(&self) -> &[Arc<dyn ExecutionListener>] {
        &self.services.execution_listeners
    }

    pub fn retry_backoff(&self) -> &Arc<dyn BackoffStrategy> {
        &self.services.retry_backoff
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryStore;
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;

    fn store() -> Arc<dyn EngineStore> {
        Arc::new(InMemoryStore::new())
    }

    fn job() -> Job {
        Job::new("test", json!({}), Utc::now(), 3)
    }

    #[tokio::test]
    async fn test_insert_flushes_at_revision_one() {
        let store = store();
        let job = job();
        let id = job.id;

        let mut tx = Transaction::begin(store.clone());
        tx.insert(job).unwrap();
        tx.commit().await.unwrap();

        let mut tx = Transaction::begin(store);
        let stored = tx.require::<Job>(id).await.unwrap();
        assert_eq!(stored.revision, 1);
    }

    #[tokio::test]
    async fn test_update_bumps_revision_and_detects_conflict() {
        let store = store();
        let job = job();
        let id = job.id;
        let mut tx = Transaction::begin(store.clone());
        tx.insert(job).unwrap();
        tx.commit().await.unwrap();

        let mut first = Transaction::begin(store.clone());
        let mut second = Transaction::begin(store.clone());
        let mut a = first.require::<Job>(id).await.unwrap();
        let mut b = second.require::<Job>(id).await.unwrap();
        a.retries = 2;
        b.retries = 1;
        first.update(a).unwrap();
        second.update(b).unwrap();

        first.commit().await.unwrap();
        let err = second.commit().await.unwrap_err();
        assert!(err.is_conflict());

        let mut check = Transaction::begin(store);
        let stored = check.require::<Job>(id).await.unwrap();
        assert_eq!(stored.retries, 2);
        assert_eq!(stored.revision, 2);
    }

    #[tokio::test]
    async fn test_reads_see_own_writes() {
        let store = store();
        let job = job();
        let id = job.id;
        let mut tx = Transaction::begin(store);
        tx.insert(job).unwrap();

        let found = tx.jobs(&JobQuery::default()).await.unwrap();
        assert_eq!(found.len(), 1);

        tx.delete::<Job>(id).unwrap();
        assert!(tx.get::<Job>(id).await.unwrap().is_none());
        assert!(tx.change_set().is_empty());
    }

    #[tokio::test]
    async fn test_rollback_runs_hooks_and_writes_nothing() {
        let store = store();
        let fired = Arc::new(AtomicBool::new(false));
        let job = job();
        let id = job.id;

        let mut tx = Transaction::begin(store.clone());
        tx.insert(job).unwrap();
        let flag = fired.clone();
        tx.on_rollback(move || flag.store(true, Ordering::SeqCst));
        tx.rollback();

        assert!(fired.load(Ordering::SeqCst));
        let mut check = Transaction::begin(store);
        assert!(check.get::<Job>(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_requires_loaded_entity() {
        let mut tx = Transaction::begin(store());
        let err = tx.update(job()).unwrap_err();
        assert!(matches!(err, EngineError::Internal(_)));
    }

    #[tokio::test]
    async fn test_cancellation_token_wakes_waiters() {
        let token = CancellationToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move { waiter.cancelled().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();

        timeout(Duration::from_secs(5), handle)
            .await
            .expect("waiter did not observe cancellation")
            .expect("waiter panicked");
    }

    #[tokio::test]
    async fn test_cancellation_token_already_cancelled() {
        let token = CancellationToken::default();
        assert!(!token.is_cancelled());
        token.cancel();
        timeout(Duration::from_secs(1), token.cancelled()).await.unwrap();
    }
}
