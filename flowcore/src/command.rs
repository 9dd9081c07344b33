use std::any::Any;

use async_trait::async_trait;

use crate::auth::Permission;
use crate::context::CommandContext;
use crate::error::Result;

/// A unit of work requesting a state change.
///
/// Commands hold immutable input. `execute` runs inside the interceptor
/// chain with a fresh [`CommandContext`]; everything it writes through the
/// context is committed atomically when it returns `Ok`.
#[async_trait]
pub trait Command: Send + Sync + 'static {
    type Output: Send + 'static;

    /// Stable name used in spans, logs and metrics.
    fn name(&self) -> &'static str;

    /// Permission the caller needs; `None` when unrestricted.
    fn permission(&self) -> Option<Permission> {
        None
    }

    /// Whether an optimistic lock conflict may re-run the command.
    fn retry_on_conflict(&self) -> bool {
        true
    }

    async fn execute(&self, ctx: &mut CommandContext) -> Result<Self::Output>;
}

/// Type-erased command output carried through the interceptor chain.
pub type CommandOutput = Box<dyn Any + Send>;

/// Object-safe view of a [`Command`] used by interceptors.
#[async_trait]
pub trait DynCommand: Send + Sync {
    fn name(&self) -> &'static str;

    fn permission(&self) -> Option<Permission>;

    fn retry_on_conflict(&self) -> bool;

    async fn execute_dyn(&self, ctx: &mut CommandContext) -> Result<CommandOutput>;
}

#[async_trait]
impl<C: Command> DynCommand for C {
    fn name(&self) -> &'static str {
        Command::name(self)
    }

    fn permission(&self) -> Option<Permission> {
        Command::permission(self)
    }

    fn retry_on_conflict(&self) -> bool {
        Command::retry_on_conflict(self)
    }

    async fn execute_dyn(&self, ctx: &mut CommandContext) -> Result<CommandOutput> {
        let output = Command::execute(self, ctx).await?;
        Ok(Box::new(output))
    }
}
