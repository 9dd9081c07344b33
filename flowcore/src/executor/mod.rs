//! Job execution: acquisition, claiming and bounded dispatch.
//!
//! The [`JobExecutor`] polls the store for due jobs, claims each one with a
//! revision-checked [`ClaimJobCommand`](crate::commands::ClaimJobCommand)
//! and hands it to the [`WorkerPool`]. Failures go through
//! [`HandleJobFailureCommand`](crate::commands::HandleJobFailureCommand) in a
//! separate transaction so the handler's own writes are rolled back.

/// Acquisition loop, lock sweep and job lifecycle.
pub mod supervisor;
/// Fixed-size pool of worker slots.
pub mod worker;

pub use supervisor::{AcquisitionReport, JobExecutor};
pub use worker::WorkerPool;
