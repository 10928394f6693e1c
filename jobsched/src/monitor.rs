//! Progress reporting and cooperative cancellation.
//!
//! Every running job is handed a [`Monitor`]. The job reports progress through it and polls
//! [`ProgressMonitor::is_canceled`] to find out whether [`crate::Job::cancel`] was called
//! while it was running.
//!
//! Host applications can customise monitor creation by installing a [`ProgressProvider`] via
//! [`crate::JobManager::set_progress_provider`]. Without one every job gets a
//! [`NullProgressMonitor`].
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use crate::job::Job;

/// A shared handle to a progress monitor.
pub type Monitor = Arc<dyn ProgressMonitor>;

pub trait ProgressMonitor: Send + Sync {
    /// Notifies that the main task is beginning. `total_work` of `None` means unknown.
    fn begin_task(&self, name: &str, total_work: Option<u32>);

    /// Notifies that a given number of work units of the main task has been completed.
    fn worked(&self, work: u32);

    /// Notifies that the work is done.
    fn done(&self);

    fn is_canceled(&self) -> bool;

    fn set_canceled(&self, canceled: bool);

    fn set_task_name(&self, _name: &str) {}

    fn sub_task(&self, _name: &str) {}
}

/// A monitor which records nothing but cancellation.
#[derive(Debug, Default)]
pub struct NullProgressMonitor {
    canceled: AtomicBool,
}

impl NullProgressMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Monitor {
        Arc::new(Self::new())
    }
}

impl ProgressMonitor for NullProgressMonitor {
    fn begin_task(&self, _name: &str, _total_work: Option<u32>) {}

    fn worked(&self, _work: u32) {}

    fn done(&self) {}

    fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    fn set_canceled(&self, canceled: bool) {
        self.canceled.store(canceled, Ordering::SeqCst);
    }
}

/// Factory for the monitors handed to running jobs.
///
/// Providers are called without any scheduler lock held, so they are free to call back into
/// the [`crate::JobManager`].
pub trait ProgressProvider: Send + Sync {
    /// Returns the monitor for `job`'s next run, or `None` to fall back to a
    /// [`NullProgressMonitor`].
    fn create_monitor(&self, job: &Job) -> Option<Monitor>;

    fn default_monitor(&self) -> Option<Monitor> {
        None
    }

    fn create_progress_group(&self) -> Option<Monitor> {
        None
    }
}
