//! Built-in commands for process instances, jobs and incidents.

mod incident;
mod job;
mod process;

pub use incident::{CreateIncidentCommand, FindIncidentsCommand, ResolveIncidentCommand};
pub use job::{
    ActivateJobCommand, ClaimJobCommand, ExecuteJobCommand, FindJobsCommand,
    HandleJobFailureCommand, JobFailure, SetJobDueDateCommand, SetJobRetriesCommand,
    SuspendJobCommand, UnlockJobCommand,
};
pub use process::{
    CancelProcessInstanceCommand, FindExecutionsCommand, SignalExecutionCommand,
    StartProcessInstanceCommand,
};

pub(crate) use incident::close_incident;
pub(crate) use job::set_job_retries;
