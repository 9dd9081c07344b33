use std::fmt;
use std::sync::Arc;

use tokio::sync::Notify;

use crate::auth::{AllowAll, AuthorizationProvider};
use crate::backoff::BackoffStrategy;
use crate::batch::{
    BatchExecutionJobHandler, BatchHandlerRegistry, BatchJobHandler, BatchMonitorJobHandler,
    BatchSeedJobHandler,
};
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::context::EngineServices;
use crate::events::InProcEventBus;
use crate::executor::JobExecutor;
use crate::interceptor::{default_chain, CommandExecutor, CommandInterceptor};
use crate::job::{JobHandler, JobHandlerRegistry};
use crate::pvm::{
    AsyncContinuationJobHandler, DefinitionRepository, ExecutionListener,
    InMemoryDefinitionRepository, ProcessDefinition, TimerJobHandler,
};
use crate::store::EngineStore;
use crate::telemetry::EngineMetrics;

use super::ProcessEngine;

/// Builder for a [`ProcessEngine`] with explicit dependencies.
///
/// Only the store is required. Everything else falls back to an in-process
/// default: the system clock, an in-memory definition repository, no
/// authorization checks and the retry backoff from the configuration.
///
/// # Example
///
/// ```ignore
/// use flowcore::*;
///
/// let engine = ProcessEngine::builder(EngineConfig::default())
///     .with_store(Arc::new(InMemoryStore::new()))
///     .with_definition(definition)
///     .with_job_handler(Arc::new(MyHandler))
///     .build()?;
/// ```
pub struct ProcessEngineBuilder {
    config: EngineConfig,
    store: Option<Arc<dyn EngineStore>>,
    clock: Option<Arc<dyn Clock>>,
    repository: Option<Arc<dyn DefinitionRepository>>,
    definitions: Vec<ProcessDefinition>,
    job_handlers: JobHandlerRegistry,
    batch_handlers: BatchHandlerRegistry,
    execution_listeners: Vec<Arc<dyn ExecutionListener>>,
    authorization: Option<Arc<dyn AuthorizationProvider>>,
    retry_backoff: Option<Arc<dyn BackoffStrategy>>,
    interceptors: Option<Vec<Arc<dyn CommandInterceptor>>>,
}

impl fmt::Debug for ProcessEngineBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessEngineBuilder")
            .field("config", &self.config)
            .field("store_set", &self.store.is_some())
            .field("clock", &self.clock)
            .field("repository", &self.repository)
            .field("definitions", &self.definitions.len())
            .field("job_handlers", &self.job_handlers)
            .field("batch_handlers", &self.batch_handlers)
            .field("execution_listeners", &self.execution_listeners.len())
            .field("authorization", &self.authorization)
            .field("custom_chain", &self.interceptors.is_some())
            .finish()
    }
}

impl ProcessEngineBuilder {
    /// Create a builder; the engine's own job and batch handlers are
    /// registered up front.
    pub fn new(config: EngineConfig) -> Self {
        let mut job_handlers = JobHandlerRegistry::new();
        job_handlers.register(Arc::new(AsyncContinuationJobHandler));
        job_handlers.register(Arc::new(TimerJobHandler));
        job_handlers.register(Arc::new(BatchSeedJobHandler));
        job_handlers.register(Arc::new(BatchExecutionJobHandler));
        job_handlers.register(Arc::new(BatchMonitorJobHandler));

        Self {
            config,
            store: None,
            clock: None,
            repository: None,
            definitions: Vec::new(),
            job_handlers,
            batch_handlers: BatchHandlerRegistry::with_builtins(),
            execution_listeners: Vec::new(),
            authorization: None,
            retry_backoff: None,
            interceptors: None,
        }
    }

    /// Set the persistence backend.
    pub fn with_store(mut self, store: Arc<dyn EngineStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Resolve definitions from an external repository instead of the
    /// built-in one. Cannot be combined with [`Self::with_definition`].
    pub fn with_definition_repository(mut self, repository: Arc<dyn DefinitionRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    /// Deploy a definition into the built-in repository.
    pub fn with_definition(mut self, definition: ProcessDefinition) -> Self {
        self.definitions.push(definition);
        self
    }

    /// Register a job handler, replacing any handler of the same type.
    pub fn with_job_handler(mut self, handler: Arc<dyn JobHandler>) -> Self {
        self.job_handlers.register(handler);
        self
    }

    pub fn with_batch_handler(mut self, handler: Arc<dyn BatchJobHandler>) -> Self {
        self.batch_handlers.register(handler);
        self
    }

    pub fn with_execution_listener(mut self, listener: Arc<dyn ExecutionListener>) -> Self {
        self.execution_listeners.push(listener);
        self
    }

    pub fn with_authorization(mut self, authorization: Arc<dyn AuthorizationProvider>) -> Self {
        self.authorization = Some(authorization);
        self
    }

    /// Override the delay applied between failed job attempts.
    pub fn with_retry_backoff(mut self, backoff: Arc<dyn BackoffStrategy>) -> Self {
        self.retry_backoff = Some(backoff);
        self
    }

    /// Replace the interceptor chain. The chain must end with
    /// [`CommandInvoker`](crate::interceptor::CommandInvoker) and run a
    /// context interceptor inside a transaction interceptor. A conflict
    /// retry interceptor, if present, must sit outside the transaction.
    /// [`build`](Self::build) rejects any other layout.
    pub fn with_interceptors(mut self, chain: Vec<Arc<dyn CommandInterceptor>>) -> Self {
        self.interceptors = Some(chain);
        self
    }

    /// Build the engine. The job executor is created but not started.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is missing, the configuration is
    /// invalid or definitions were given together with a custom repository.
    pub fn build(self) -> anyhow::Result<ProcessEngine> {
        self.config.validate()?;
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("store dependency missing"))?;

        let definitions: Arc<dyn DefinitionRepository> = match self.repository {
            Some(repository) if !self.definitions.is_empty() => {
                anyhow::bail!(
                    "cannot deploy {} definitions into custom repository {:?}",
                    self.definitions.len(),
                    repository
                );
            }
            Some(repository) => repository,
            None => {
                let repository = InMemoryDefinitionRepository::new();
                for definition in self.definitions {
                    repository.deploy(definition);
                }
                Arc::new(repository)
            }
        };

        let chain = self
            .interceptors
            .unwrap_or_else(|| default_chain(&self.config.retry));
        validate_chain(&chain)?;

        let retry_backoff = self
            .retry_backoff
            .unwrap_or_else(|| self.config.retry.backoff.to_strategy());
        let services = Arc::new(EngineServices {
            events: InProcEventBus::new(self.config.event_bus_capacity),
            config: self.config,
            store,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            definitions,
            job_handlers: self.job_handlers,
            batch_handlers: self.batch_handlers,
            execution_listeners: self.execution_listeners,
            authorization: self.authorization.unwrap_or_else(|| Arc::new(AllowAll)),
            retry_backoff,
            metrics: Arc::new(EngineMetrics::new()),
            job_added: Arc::new(Notify::new()),
        });

        let commands = CommandExecutor::new(services.clone(), chain);
        let job_executor = JobExecutor::new(commands.clone());
        tracing::debug!(
            lock_owner = %services.config.job_executor.lock_owner,
            "process engine built"
        );
        Ok(ProcessEngine::from_parts(services, commands, job_executor))
    }
}

/// Checks the positions the engine relies on in a custom chain.
fn validate_chain(chain: &[Arc<dyn CommandInterceptor>]) -> anyhow::Result<()> {
    let position = |name: &str| chain.iter().position(|i| i.name() == name);

    if chain.last().map(|i| i.name()) != Some("command-invoker") {
        anyhow::bail!("interceptor chain must end with the command invoker");
    }
    let Some(transaction) = position("transaction") else {
        anyhow::bail!("interceptor chain has no transaction interceptor");
    };
    match position("context") {
        Some(context) if context > transaction => {}
        Some(_) => anyhow::bail!("context interceptor must run inside the transaction"),
        None => anyhow::bail!("interceptor chain has no context interceptor"),
    }
    if position("conflict-retry").is_some_and(|retry| retry > transaction) {
        anyhow::bail!("conflict retry interceptor must sit outside the transaction");
    }
    Ok(())
}
