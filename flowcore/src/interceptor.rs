//! Interceptor chain wrapped around every command invocation.
//!
//! The default chain, outer to inner:
//!
//! 1. [`LogInterceptor`]
//! 2. [`ConflictRetryInterceptor`]
//! 3. [`TransactionInterceptor`]
//! 4. [`ContextInterceptor`]
//! 5. [`AuthorizationInterceptor`]
//! 6. [`CommandInvoker`]
//!
//! Conflicts surface when the transaction flushes, so the retry interceptor
//! sits outside the transaction and every retry gets a fresh transaction and
//! context.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::Instrument;

use crate::auth::Authentication;
use crate::backoff::{exponential_delay, with_jitter};
use crate::command::{Command, CommandOutput, DynCommand};
use crate::config::RetryConfig;
use crate::context::{CancellationToken, CommandContext, EngineServices, Transaction};
use crate::error::{EngineError, Result};
use crate::telemetry;

/// State of one command invocation as it passes down the chain.
pub struct Invocation<'a> {
    command: &'a dyn DynCommand,
    services: Arc<EngineServices>,
    authentication: Option<Authentication>,
    cancellation: CancellationToken,
    transaction: Option<Transaction>,
    context: Option<CommandContext>,
    attempt: u32,
}

impl fmt::Debug for Invocation<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invocation")
            .field("command", &self.command.name())
            .field("authentication", &self.authentication)
            .field("attempt", &self.attempt)
            .field("has_transaction", &self.transaction.is_some())
            .field("has_context", &self.context.is_some())
            .finish()
    }
}

impl<'a> Invocation<'a> {
    pub fn new(
        command: &'a dyn DynCommand,
        services: Arc<EngineServices>,
        authentication: Option<Authentication>,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            command,
            services,
            authentication,
            cancellation,
            transaction: None,
            context: None,
            attempt: 0,
        }
    }

    pub fn command(&self) -> &'a dyn DynCommand {
        self.command
    }

    pub fn services(&self) -> &Arc<EngineServices> {
        &self.services
    }

    pub fn authentication(&self) -> Option<&Authentication> {
        self.authentication.as_ref()
    }

    /// Zero-based count of conflict retries so far.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn context_mut(&mut self) -> Result<&mut CommandContext> {
        self.context
            .as_mut()
            .ok_or_else(|| EngineError::Internal("no command context in scope".into()))
    }

    fn take_transaction(&mut self) -> Result<Transaction> {
        self.transaction
            .take()
            .ok_or_else(|| EngineError::Internal("no transaction in scope".into()))
    }
}

/// Remainder of the chain after the current interceptor.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    rest: &'a [Arc<dyn CommandInterceptor>],
}

impl fmt::Debug for Next<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.rest.iter().map(|i| i.name()).collect();
        f.debug_struct("Next").field("rest", &names).finish()
    }
}

impl<'a> Next<'a> {
    pub fn new(chain: &'a [Arc<dyn CommandInterceptor>]) -> Self {
        Self { rest: chain }
    }

    pub async fn run(self, invocation: &mut Invocation<'_>) -> Result<CommandOutput> {
        match self.rest.split_first() {
            Some((head, tail)) => head.invoke(invocation, Next { rest: tail }).await,
            None => Err(EngineError::Internal(
                "interceptor chain ended without invoking the command".into(),
            )),
        }
    }
}

/// Middleware around command execution.
///
/// Interceptors are shared by all invocations and keep no per-invocation
/// state; everything an invocation needs travels in [`Invocation`].
#[async_trait]
pub trait CommandInterceptor: Send + Sync {
    fn name(&self) -> &'static str;

    async fn invoke(&self, invocation: &mut Invocation<'_>, next: Next<'_>) -> Result<CommandOutput>;
}

/// Span, debug logging and counters per command.
#[derive(Debug, Default)]
pub struct LogInterceptor;

#[async_trait]
impl CommandInterceptor for LogInterceptor {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn invoke(&self, invocation: &mut Invocation<'_>, next: Next<'_>) -> Result<CommandOutput> {
        let command = invocation.command().name();
        let span = telemetry::command_span(command);
        let started = Instant::now();

        let result = async {
            tracing::debug!("command started");
            let result = next.run(&mut *invocation).await;
            match &result {
                Ok(_) => tracing::debug!("command finished"),
                Err(err) if err.is_conflict() => tracing::warn!(error = %err, "command conflicted"),
                Err(EngineError::JobHandler { .. }) => {
                    tracing::debug!("command failed in job handler")
                }
                Err(err) => tracing::warn!(error = %err, "command failed"),
            }
            result
        }
        .instrument(span)
        .await;

        let status = match &result {
            Ok(_) => "ok",
            Err(err) if err.is_conflict() => "conflict",
            Err(_) => "error",
        };
        invocation
            .services()
            .metrics
            .record_command(command, status, started.elapsed().as_secs_f64());
        result
    }
}

/// Re-runs the inner chain after optimistic lock conflicts.
#[derive(Debug, Clone)]
pub struct ConflictRetryInterceptor {
    retries: u32,
    base_ms: u64,
    jitter_ratio: f32,
}

impl ConflictRetryInterceptor {
    pub fn new(retries: u32, base_ms: u64, jitter_ratio: f32) -> Self {
        Self {
            retries,
            base_ms,
            jitter_ratio,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.conflict_retries,
            config.conflict_backoff_ms,
            config.conflict_jitter_ratio,
        )
    }
}

#[async_trait]
impl CommandInterceptor for ConflictRetryInterceptor {
    fn name(&self) -> &'static str {
        "conflict-retry"
    }

    async fn invoke(&self, invocation: &mut Invocation<'_>, next: Next<'_>) -> Result<CommandOutput> {
        loop {
            let result = next.run(invocation).await;
            match result {
                Err(err)
                    if err.is_conflict()
                        && invocation.command().retry_on_conflict()
                        && invocation.attempt < self.retries =>
                {
                    let max_ms = self.base_ms.saturating_mul(1 << self.retries.min(16));
                    let delay = with_jitter(
                        exponential_delay(invocation.attempt + 1, self.base_ms, max_ms),
                        self.jitter_ratio,
                    );
                    invocation.attempt += 1;
                    tracing::warn!(
                        attempt = invocation.attempt,
                        delay_ms = delay.num_milliseconds(),
                        error = %err,
                        "retrying command after conflict"
                    );
                    invocation.transaction = None;
                    invocation.context = None;
                    if let Ok(delay) = delay.to_std() {
                        tokio::time::sleep(delay).await;
                    }
                }
                other => return other,
            }
        }
    }
}

/// Demarcates the unit of work.
///
/// Commits on success, then publishes the queued events and wakes the job
/// executor when jobs were created. Rolls back on failure.
#[derive(Debug, Default)]
pub struct TransactionInterceptor;

#[async_trait]
impl CommandInterceptor for TransactionInterceptor {
    fn name(&self) -> &'static str {
        "transaction"
    }

    async fn invoke(&self, invocation: &mut Invocation<'_>, next: Next<'_>) -> Result<CommandOutput> {
        invocation.transaction = Some(Transaction::begin(invocation.services.store.clone()));
        let result = next.run(invocation).await;
        let transaction = invocation.take_transaction()?;

        match result {
            Ok(output) => {
                let committed = transaction.commit().await?;
                let services = invocation.services();
                tracing::debug!(changes = committed.changes, "transaction committed");
                services.events.publish_all(committed.events);
                if committed.job_added {
                    services.job_added.notify_one();
                }
                Ok(output)
            }
            Err(err) => {
                transaction.rollback();
                Err(err)
            }
        }
    }
}

/// Builds the [`CommandContext`] around the transaction and tears it down
/// on every exit path.
#[derive(Debug, Default)]
pub struct ContextInterceptor;

#[async_trait]
impl CommandInterceptor for ContextInterceptor {
    fn name(&self) -> &'static str {
        "context"
    }

    async fn invoke(&self, invocation: &mut Invocation<'_>, next: Next<'_>) -> Result<CommandOutput> {
        let transaction = invocation.take_transaction()?;
        invocation.context = Some(CommandContext::new(
            transaction,
            invocation.services.clone(),
            invocation.authentication.clone(),
            invocation.cancellation.clone(),
            invocation.command.name(),
        ));

        let result = next.run(invocation).await;

        let context = invocation
            .context
            .take()
            .ok_or_else(|| EngineError::Internal("command context vanished".into()))?;
        invocation.transaction = Some(context.into_transaction());
        result
    }
}

/// Checks the command's permission for authenticated callers.
#[derive(Debug, Default)]
pub struct AuthorizationInterceptor;

#[async_trait]
impl CommandInterceptor for AuthorizationInterceptor {
    fn name(&self) -> &'static str {
        "authorization"
    }

    async fn invoke(&self, invocation: &mut Invocation<'_>, next: Next<'_>) -> Result<CommandOutput> {
        if let (Some(authentication), Some(permission)) =
            (invocation.authentication(), invocation.command().permission())
        {
            if !invocation
                .services()
                .authorization
                .is_authorized(authentication, &permission)
            {
                return Err(EngineError::Unauthorized {
                    user: authentication.user_id.clone(),
                    action: permission.action,
                    resource: permission.resource,
                });
            }
        }
        next.run(invocation).await
    }
}

/// Innermost link: runs the command itself.
#[derive(Debug, Default)]
pub struct CommandInvoker;

#[async_trait]
impl CommandInterceptor for CommandInvoker {
    fn name(&self) -> &'static str {
        "command-invoker"
    }

    async fn invoke(&self, invocation: &mut Invocation<'_>, _next: Next<'_>) -> Result<CommandOutput> {
        let command = invocation.command();
        let ctx = invocation.context_mut()?;
        command.execute_dyn(ctx).await
    }
}

/// The standard chain in its required order.
pub fn default_chain(retry: &RetryConfig) -> Vec<Arc<dyn CommandInterceptor>> {
    vec![
        Arc::new(LogInterceptor),
        Arc::new(ConflictRetryInterceptor::from_config(retry)),
        Arc::new(TransactionInterceptor),
        Arc::new(ContextInterceptor),
        Arc::new(AuthorizationInterceptor),
        Arc::new(CommandInvoker),
    ]
}

/// Entry point running commands through a composed chain.
#[derive(Clone)]
pub struct CommandExecutor {
    services: Arc<EngineServices>,
    chain: Arc<[Arc<dyn CommandInterceptor>]>,
}

impl fmt::Debug for CommandExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.chain.iter().map(|i| i.name()).collect();
        f.debug_struct("CommandExecutor")
            .field("chain", &names)
            .finish()
    }
}

impl CommandExecutor {
    pub fn new(services: Arc<EngineServices>, chain: Vec<Arc<dyn CommandInterceptor>>) -> Self {
        Self {
            services,
            chain: chain.into(),
        }
    }

    pub fn with_default_chain(services: Arc<EngineServices>) -> Self {
        let chain = default_chain(&services.config.retry);
        Self::new(services, chain)
    }

    pub fn services(&self) -> &Arc<EngineServices> {
        &self.services
    }

    pub async fn execute<C: Command>(&self, command: C) -> Result<C::Output> {
        self.run(&command, None, CancellationToken::new()).await
    }

    pub async fn execute_as<C: Command>(
        &self,
        command: C,
        authentication: Authentication,
    ) -> Result<C::Output> {
        self.run(&command, Some(authentication), CancellationToken::new())
            .await
    }

    /// Execute with a token that can cancel the command between atomic
    /// operations.
    pub async fn execute_cancellable<C: Command>(
        &self,
        command: C,
        cancellation: CancellationToken,
    ) -> Result<C::Output> {
        self.run(&command, None, cancellation).await
    }

    async fn run<C: Command>(
        &self,
        command: &C,
        authentication: Option<Authentication>,
        cancellation: CancellationToken,
    ) -> Result<C::Output> {
        let mut invocation =
            Invocation::new(command, self.services.clone(), authentication, cancellation);
        let output = Next::new(&self.chain).run(&mut invocation).await?;
        output
            .downcast::<C::Output>()
            .map(|output| *output)
            .map_err(|_| {
                EngineError::Internal(format!(
                    "command {} returned an unexpected output type",
                    Command::name(command)
                ))
            })
    }
}
