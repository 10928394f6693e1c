//! Helpers for testing code which schedules jobs.
//!
//! Jobs run on worker threads, so tests typically schedule work and then wait for it to reach
//! some state. [`wait_until`] and [`assert_state!`] poll for that, and an [`EventRecorder`]
//! keeps a log of every lifecycle change it observes.
//!
//! # Example
//!
//! ```
//! # use std::time::Duration;
//! # use jobsched::prelude::*;
//! use jobsched::testing::{assert_state, EventRecorder};
//!
//! let manager = JobManager::new();
//! let recorder = EventRecorder::new();
//! manager.add_job_change_listener(recorder.clone());
//!
//! let job = manager.new_job("hello", |_job: &Job, _monitor: &Monitor| ExecutionResult::ok());
//! job.schedule().unwrap();
//!
//! assert_state!(job, JobState::None, within: Duration::from_secs(5));
//! assert!(recorder.wait_for(&job, JobChangeKind::Done, Duration::from_secs(5)));
//! assert_eq!(
//!     recorder.kinds(&job),
//!     [
//!         JobChangeKind::Scheduled,
//!         JobChangeKind::AboutToRun,
//!         JobChangeKind::Running,
//!         JobChangeKind::Done,
//!     ]
//! );
//! manager.shutdown();
//! ```
use std::{
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use chrono::TimeDelta;
use parking_lot::Mutex;

use crate::{
    job::{Job, JobId},
    listener::{JobChangeEvent, JobChangeKind, JobChangeListener},
    status::Status,
};

/// A lifecycle change as seen by an [`EventRecorder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    pub kind: JobChangeKind,
    pub job: JobId,
    pub delay: Option<TimeDelta>,
    pub result: Option<Status>,
    pub reschedule: bool,
    pub thread: Option<String>,
}

/// A listener which records every event it receives.
#[derive(Debug, Default)]
pub struct EventRecorder {
    events: Mutex<Vec<RecordedEvent>>,
}

impl EventRecorder {
    pub fn new() -> Arc<Self> {
        Arc::default()
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().clone()
    }

    /// The events recorded for `job`, oldest first.
    pub fn events_for(&self, job: &Job) -> Vec<RecordedEvent> {
        let id = job.id();
        self.events
            .lock()
            .iter()
            .filter(|event| event.job == id)
            .cloned()
            .collect()
    }

    pub fn kinds(&self, job: &Job) -> Vec<JobChangeKind> {
        self.events_for(job)
            .into_iter()
            .map(|event| event.kind)
            .collect()
    }

    pub fn count(&self, job: &Job, kind: JobChangeKind) -> usize {
        self.kinds(job).into_iter().filter(|k| *k == kind).count()
    }

    /// Waits until an event of `kind` was recorded for `job`.
    pub fn wait_for(&self, job: &Job, kind: JobChangeKind, timeout: Duration) -> bool {
        wait_until(timeout, || self.count(job, kind) > 0)
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }

    fn record(&self, event: &JobChangeEvent) {
        self.events.lock().push(RecordedEvent {
            kind: event.kind,
            job: event.job.id(),
            delay: event.delay,
            result: event.result.clone(),
            reschedule: event.reschedule,
            thread: thread::current().name().map(ToOwned::to_owned),
        });
    }
}

impl JobChangeListener for EventRecorder {
    fn scheduled(&self, event: &JobChangeEvent) {
        self.record(event)
    }

    fn about_to_run(&self, event: &JobChangeEvent) {
        self.record(event)
    }

    fn running(&self, event: &JobChangeEvent) {
        self.record(event)
    }

    fn sleeping(&self, event: &JobChangeEvent) {
        self.record(event)
    }

    fn awake(&self, event: &JobChangeEvent) {
        self.record(event)
    }

    fn done(&self, event: &JobChangeEvent) {
        self.record(event)
    }
}

/// Polls `condition` until it holds or `timeout` elapses, returning whether it held.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(1));
    }
}

/// Asserts the externally visible state of a job, optionally waiting for it to be reached.
///
/// ```
/// # use std::time::Duration;
/// # use jobsched::prelude::*;
/// # use jobsched::testing::assert_state;
/// let manager = JobManager::new();
/// let job = manager.new_job("idle", |_job: &Job, _monitor: &Monitor| ExecutionResult::ok());
///
/// assert_state!(job, JobState::None);
///
/// manager.suspend();
/// job.schedule().unwrap();
/// assert_state!(job, JobState::Waiting, within: Duration::from_millis(100));
/// # manager.shutdown();
/// ```
#[macro_export]
macro_rules! assert_state {
    ($job:expr, $state:expr) => {{
        let job: &$crate::job::Job = &$job;
        let expected: $crate::job::JobState = $state;
        assert_eq!(
            job.state(),
            expected,
            "job {} ({}) is not {:?}",
            job.id(),
            job.name(),
            expected
        );
    }};
    ($job:expr, $state:expr, within: $timeout:expr) => {{
        let job: &$crate::job::Job = &$job;
        let expected: $crate::job::JobState = $state;
        let timeout: ::std::time::Duration = $timeout;
        assert!(
            $crate::testing::wait_until(timeout, || job.state() == expected),
            "job {} ({}) did not become {:?} within {:?}, it is {:?}",
            job.id(),
            job.name(),
            expected,
            timeout,
            job.state()
        );
    }};
}

pub use assert_state;
