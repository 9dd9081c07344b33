use thiserror::Error;

/// Typed failure surfaced by command execution and the store boundary.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A concurrent writer changed the entity since it was read.
    #[error("optimistic lock conflict on {entity}: {detail}")]
    OptimisticLock {
        /// Entity reference, e.g. `job:0190...`.
        entity: String,
        /// What did not match.
        detail: String,
    },

    /// A job handler failed while executing its job.
    #[error("job handler failed: {message}")]
    JobHandler {
        message: String,
        stacktrace: Option<String>,
    },

    /// Malformed command input or an illegal state for the request.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("user {user} is not authorized to {action} {resource}")]
    Unauthorized {
        user: String,
        action: &'static str,
        resource: &'static str,
    },

    #[error("command cancelled")]
    Cancelled,

    /// Broken invariant inside the engine itself.
    #[error("internal error: {0}")]
    Internal(String),

    /// Infrastructure failure, e.g. the store is unavailable.
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    pub fn conflict(entity: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::OptimisticLock {
            entity: entity.into(),
            detail: detail.into(),
        }
    }

    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn handler(err: impl Into<anyhow::Error>) -> Self {
        let err = err.into();
        Self::JobHandler {
            message: err.to_string(),
            stacktrace: Some(format!("{err:?}")),
        }
    }

    /// True for revision mismatches, which callers may retry.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::OptimisticLock { .. })
    }

    /// Whether a failed job execution should use up one of the job's retries.
    ///
    /// Conflicts, cancellation and a job that vanished meanwhile are not the
    /// job's fault.
    pub fn counts_as_job_failure(&self) -> bool {
        !matches!(
            self,
            Self::OptimisticLock { .. } | Self::Cancelled | Self::NotFound { entity: "job", .. }
        )
    }

    /// Message and stack trace persisted on a failed job.
    pub fn failure_details(&self) -> (String, Option<String>) {
        match self {
            Self::JobHandler {
                message,
                stacktrace,
            } => (message.clone(), stacktrace.clone()),
            Self::Store(err) => (err.to_string(), Some(format!("{err:?}"))),
            other => (other.to_string(), None),
        }
    }
}
