use std::fmt::Display;

use crate::{job::Job, monitor::Monitor, status::Status};

/// The body of a job.
///
/// Implemented automatically for closures of the form
/// `Fn(&Job, &Monitor) -> ExecutionResult`, which covers most jobs:
///
/// ```
/// # use jobsched::prelude::*;
/// let manager = JobManager::new();
/// let job = manager.new_job("tidy", |_job: &Job, monitor: &Monitor| {
///     monitor.begin_task("tidy", Some(1));
///     monitor.worked(1);
///     monitor.done();
///     ExecutionResult::ok()
/// });
/// # manager.shutdown();
/// ```
///
/// Implement the trait directly to veto scheduling or running, or to react to cancellation.
pub trait Executor: Send + Sync + 'static {
    /// Runs the job on a worker thread.
    ///
    /// Long running jobs should poll [`crate::monitor::ProgressMonitor::is_canceled`] and
    /// return [`Status::cancel`] when it becomes `true`. Returning
    /// [`ExecutionResult::PendingAsync`] releases the worker while the job keeps running;
    /// the job must then be finished with [`Job::done`].
    ///
    /// A panic inside `run` does not take down the scheduler: it becomes the job's result as
    /// an error status, or a cancel status when the panic payload is [`OperationCanceled`].
    fn run(&self, job: &Job, monitor: &Monitor) -> ExecutionResult;

    /// Consulted by [`Job::schedule`]; returning `false` silently skips the schedule.
    fn should_schedule(&self) -> bool {
        true
    }

    /// Consulted just before the job is started; returning `false` ends the job with a cancel
    /// status instead of running it.
    fn should_run(&self) -> bool {
        true
    }

    /// Called at most once per run when a running job is cancelled.
    ///
    /// Called without any scheduler lock held.
    fn canceling(&self) {}
}

impl<F> Executor for F
where
    F: Fn(&Job, &Monitor) -> ExecutionResult + Send + Sync + 'static,
{
    fn run(&self, job: &Job, monitor: &Monitor) -> ExecutionResult {
        self(job, monitor)
    }
}

/// What a run hands back to the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionResult {
    /// The job is finished with the given status.
    Completed(Status),
    /// The job keeps running after `run` returned and will call [`Job::done`] itself.
    PendingAsync,
}

impl ExecutionResult {
    pub fn ok() -> Self {
        Self::Completed(Status::ok())
    }

    pub fn cancel() -> Self {
        Self::Completed(Status::cancel())
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Completed(Status::error(message))
    }
}

impl From<Status> for ExecutionResult {
    fn from(value: Status) -> Self {
        Self::Completed(value)
    }
}

/// Panic payload signalling deliberate cancellation.
///
/// Raise it with [`std::panic::panic_any`] from inside a job or a listener to abort the
/// current operation. The scheduler treats it as expected control flow: a job ends with
/// [`Status::cancel`], a listener's panic is absorbed without being logged as an error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OperationCanceled;

impl Display for OperationCanceled {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "operation cancelled")
    }
}

/// Extracts a readable message from a panic payload.
pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_owned())
}
