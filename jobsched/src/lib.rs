//! A cooperative, rule-based job scheduler.
//!
//! Work is packaged into [`Job`]s which are scheduled on a [`JobManager`] and run on a pool of
//! worker threads the manager grows and shrinks on demand. Jobs can be delayed, put to sleep
//! and woken up, re-prioritised, and cancelled. Cancellation is cooperative: a running job
//! polls its [`monitor::ProgressMonitor`] to learn that it should stop.
//!
//! Jobs may carry a [`rule::SchedulingRule`]. Two jobs whose rules conflict never run at the
//! same time; a job which would conflict with a running one waits until it is done.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//!
//! use jobsched::prelude::*;
//! use jobsched::testing::assert_state;
//!
//! let manager = JobManager::new();
//! let job = manager.new_job("count", |_job: &Job, monitor: &Monitor| {
//!     monitor.begin_task("count", Some(3));
//!     for _ in 0..3 {
//!         if monitor.is_canceled() {
//!             return ExecutionResult::cancel();
//!         }
//!         monitor.worked(1);
//!     }
//!     monitor.done();
//!     ExecutionResult::ok()
//! });
//!
//! job.schedule().unwrap();
//!
//! assert_state!(job, JobState::None, within: Duration::from_secs(5));
//! assert_eq!(job.result(), Some(Status::ok()));
//! manager.shutdown();
//! ```
use thiserror::Error;

pub mod config;
pub mod executor;
pub mod job;
pub mod listener;
pub mod manager;
pub mod monitor;
mod pool;
pub mod prelude;
pub mod rule;
pub mod status;
pub mod testing;

use chrono::TimeDelta;
pub use executor::ExecutionResult;
pub use job::{builder::JobBuilder, Job, JobId, JobState, Priority};
pub use manager::JobManager;
pub use status::Status;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum JobsError {
    #[error("The job manager has been shut down")]
    ShutDown,
    #[error("Delays must not be negative, got {0}")]
    NegativeDelay(TimeDelta),
    #[error("Job {job} cannot be changed while {state:?}")]
    IllegalState { job: JobId, state: JobState },
    #[error("Invalid scheduling rule: {0}")]
    InvalidRule(&'static str),
}
