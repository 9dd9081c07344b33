//! Flowcore - a transactional workflow execution core.
//!
//! Every state change is a [`Command`] run through a chain of interceptors
//! that log, retry on optimistic lock conflicts, open a unit of work, attach
//! a command context and check authorization. Processes are trees of
//! executions advanced by atomic operations; asynchronous work is persisted
//! as jobs that a [`JobExecutor`] acquires, claims and runs on a bounded
//! worker pool.
//!
//! # Core Concepts
//!
//! - **Commands**: [`Command`] implementations and the [`CommandExecutor`]
//!   running them through [`CommandInterceptor`]s.
//!
//! - **Unit of work**: [`Transaction`] caches entities, collects a
//!   [`ChangeSet`] and flushes it atomically with revision checks.
//!
//! - **Process virtual machine**: [`ExecutionTree`] and [`AtomicOperation`]
//!   with an explicit transition table, see [`pvm`].
//!
//! - **Jobs**: [`Job`], [`JobHandler`] and the [`JobExecutor`] with retries,
//!   backoff, incidents and lock expiry.
//!
//! - **Batches**: bulk operations split into seed, execution and monitor
//!   jobs, see [`batch`].
//!
//! # Feature Flags
//!
//! - `postgres` - PostgreSQL store via sqlx
//! - `metrics` - Prometheus collectors
//!
//! # Example
//!
//! ```ignore
//! use flowcore::*;
//!
//! let definition = ProcessDefinition::builder("order")
//!     .start("start")
//!     .service_task("charge")
//!     .async_before()
//!     .end("end")
//!     .flow("start", "charge")
//!     .flow("charge", "end")
//!     .build()?;
//!
//! let engine = ProcessEngine::builder(EngineConfig::default())
//!     .with_store(Arc::new(InMemoryStore::new()))
//!     .with_definition(definition)
//!     .build()?;
//! engine.start().await?;
//! let instance = engine.start_process_instance("order").await?;
//! ```

/// Authentication, permissions and authorization providers.
pub mod auth;

/// Retry delay strategies for failed jobs and lost claims.
pub mod backoff;

/// Bulk operations tracked as batches.
///
/// The `batch` module provides [`Batch`], the batch commands and the seed,
/// execution and monitor job handlers.
pub mod batch;

/// Time source used for due dates and lock expiration.
pub mod clock;

/// The [`Command`] trait and type-erased command output.
pub mod command;

/// Built-in commands for process instances, jobs and incidents.
pub mod commands;

/// Engine, job executor, retry and batch settings.
pub mod config;

/// Shared services, the unit of work and the per-command context.
pub mod context;

/// Process engine facade and builder.
pub mod engine;

/// Engine error type.
pub mod error;

/// Events published after commit.
pub mod events;

/// Job acquisition and bounded dispatch.
pub mod executor;

/// Strongly typed entity identifiers.
pub mod ids;

/// Incidents raised for failures needing attention.
pub mod incident;

/// Interceptor chain and command executor.
pub mod interceptor;

/// Jobs, job queries and job handlers.
pub mod job;

#[cfg(feature = "metrics")]
/// Prometheus collectors, registered on first use.
pub mod metrics;

/// Store implementations.
///
/// The `persistence` module provides the in-memory store and, with the
/// `postgres` feature, a PostgreSQL store.
pub mod persistence;

/// Process virtual machine.
pub mod pvm;

/// Store abstraction: entities, change sets and preconditions.
pub mod store;

/// Tracing spans and per-engine counters.
pub mod telemetry;

pub use auth::{AllowAll, Authentication, AuthorizationProvider, Permission, StaticAuthorizations};
pub use backoff::{
    BackoffStrategy, ExponentialBackoff, FixedBackoff, ImmediateBackoff, LinearBackoff,
};
pub use batch::{Batch, BatchJobHandler, BatchStatistics};
pub use clock::{Clock, ManualClock, SystemClock};
pub use command::Command;
pub use commands::*;
pub use config::*;
pub use context::{CancellationToken, CommandContext, EngineServices, Transaction};
pub use engine::{ProcessEngine, ProcessEngineBuilder};
pub use error::{EngineError, Result};
pub use events::{EngineEvent, InProcEventBus};
pub use executor::{AcquisitionReport, JobExecutor, WorkerPool};
pub use ids::*;
pub use incident::{Incident, IncidentQuery, FAILED_JOB_INCIDENT};
pub use interceptor::{CommandExecutor, CommandInterceptor};
pub use job::{Job, JobHandler, JobHandlerRegistry, JobOutcome, JobQuery};
pub use persistence::InMemoryStore;
#[cfg(feature = "postgres")]
pub use persistence::PostgresStore;
pub use pvm::{
    ActivityKind, AtomicOperation, Execution, ExecutionListener, ExecutionQuery, ExecutionState,
    ExecutionTree, ListenerEvent, ListenerEventKind, ProcessDefinition, ProcessDefinitionBuilder,
};
pub use store::{ChangeSet, EngineStore, LockExpiryScanner, Store};
pub use telemetry::{EngineMetrics, MetricsSnapshot};
