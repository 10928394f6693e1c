//! Observing job lifecycle changes.
//!
//! Listeners can be registered on the [`crate::JobManager`], where they observe every job, or
//! on a single [`Job`]. Global listeners are notified before a job's own listeners.
//!
//! Notifications are delivered synchronously on the thread causing the change, never while the
//! manager's lock is held, so listeners may call back into the manager. A panicking listener
//! is logged and skipped; it neither prevents the remaining listeners from being notified nor
//! disturbs the scheduler.
//!
//! An [`mpsc::UnboundedSender`] is itself a listener, which is the easiest way to observe jobs
//! from async code:
//!
//! ```
//! # use std::sync::Arc;
//! # use jobsched::prelude::*;
//! # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
//! let manager = JobManager::new();
//! let (sender, mut events) = tokio::sync::mpsc::unbounded_channel();
//! manager.add_job_change_listener(Arc::new(sender));
//!
//! let job = manager.new_job("hello", |_job: &Job, _monitor: &Monitor| ExecutionResult::ok());
//! job.schedule().unwrap();
//!
//! while let Some(event) = events.recv().await {
//!     if event.kind == JobChangeKind::Done {
//!         assert_eq!(event.result, Some(Status::ok()));
//!         break;
//!     }
//! }
//! manager.shutdown();
//! # });
//! ```
use std::{
    fmt::Display,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
};

use chrono::TimeDelta;
use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::{
    executor::{panic_message, OperationCanceled},
    job::Job,
    status::Status,
};

pub type Listener = Arc<dyn JobChangeListener>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobChangeKind {
    Scheduled,
    AboutToRun,
    Running,
    Sleeping,
    Awake,
    Done,
}

impl Display for JobChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            Self::Scheduled => "scheduled",
            Self::AboutToRun => "about to run",
            Self::Running => "running",
            Self::Sleeping => "sleeping",
            Self::Awake => "awake",
            Self::Done => "done",
        };
        f.write_str(kind)
    }
}

#[derive(Debug, Clone)]
pub struct JobChangeEvent {
    pub kind: JobChangeKind,
    pub job: Job,
    /// The requested delay, for [`JobChangeKind::Scheduled`].
    pub delay: Option<TimeDelta>,
    /// The outcome of the run, for [`JobChangeKind::Done`].
    pub result: Option<Status>,
    /// Whether the job is scheduled again right away, for [`JobChangeKind::Done`].
    pub reschedule: bool,
}

impl JobChangeEvent {
    pub(crate) fn new(kind: JobChangeKind, job: &Job) -> Self {
        Self {
            kind,
            job: job.clone(),
            delay: None,
            result: None,
            reschedule: false,
        }
    }

    pub(crate) fn scheduled(job: &Job, delay: TimeDelta, reschedule: bool) -> Self {
        Self {
            delay: Some(delay),
            reschedule,
            ..Self::new(JobChangeKind::Scheduled, job)
        }
    }

    pub(crate) fn done(job: &Job, result: Status, reschedule: bool) -> Self {
        Self {
            result: Some(result),
            reschedule,
            ..Self::new(JobChangeKind::Done, job)
        }
    }
}

/// Callbacks for job lifecycle changes. Every method defaults to doing nothing.
pub trait JobChangeListener: Send + Sync {
    fn scheduled(&self, _event: &JobChangeEvent) {}

    fn about_to_run(&self, _event: &JobChangeEvent) {}

    fn running(&self, _event: &JobChangeEvent) {}

    fn sleeping(&self, _event: &JobChangeEvent) {}

    fn awake(&self, _event: &JobChangeEvent) {}

    fn done(&self, _event: &JobChangeEvent) {}
}

impl JobChangeListener for mpsc::UnboundedSender<JobChangeEvent> {
    fn scheduled(&self, event: &JobChangeEvent) {
        forward(self, event)
    }

    fn about_to_run(&self, event: &JobChangeEvent) {
        forward(self, event)
    }

    fn running(&self, event: &JobChangeEvent) {
        forward(self, event)
    }

    fn sleeping(&self, event: &JobChangeEvent) {
        forward(self, event)
    }

    fn awake(&self, event: &JobChangeEvent) {
        forward(self, event)
    }

    fn done(&self, event: &JobChangeEvent) {
        forward(self, event)
    }
}

fn forward(sender: &mpsc::UnboundedSender<JobChangeEvent>, event: &JobChangeEvent) {
    // A dropped receiver just means nobody is interested any more.
    if sender.send(event.clone()).is_err() {
        tracing::trace!(kind = %event.kind, "Dropped {} event, receiver closed", event.kind);
    }
}

/// The manager's global listeners and the delivery of events.
#[derive(Default)]
pub(crate) struct JobListeners {
    global: RwLock<Vec<Listener>>,
}

impl JobListeners {
    pub(crate) fn add(&self, listener: Listener) {
        self.global.write().push(listener);
    }

    pub(crate) fn remove(&self, listener: &Listener) {
        self.global
            .write()
            .retain(|registered| !Arc::ptr_eq(registered, listener));
    }

    pub(crate) fn scheduled(&self, job: &Job, delay: TimeDelta, reschedule: bool) {
        self.notify(JobChangeEvent::scheduled(job, delay, reschedule))
    }

    pub(crate) fn about_to_run(&self, job: &Job) {
        self.notify(JobChangeEvent::new(JobChangeKind::AboutToRun, job))
    }

    pub(crate) fn running(&self, job: &Job) {
        self.notify(JobChangeEvent::new(JobChangeKind::Running, job))
    }

    pub(crate) fn sleeping(&self, job: &Job) {
        self.notify(JobChangeEvent::new(JobChangeKind::Sleeping, job))
    }

    pub(crate) fn awake(&self, job: &Job) {
        self.notify(JobChangeEvent::new(JobChangeKind::Awake, job))
    }

    pub(crate) fn done(&self, job: &Job, result: Status, reschedule: bool) {
        self.notify(JobChangeEvent::done(job, result, reschedule))
    }

    fn notify(&self, event: JobChangeEvent) {
        let global = self.global.read().clone();
        let local = event.job.listeners();
        for listener in global.iter().chain(local.iter()) {
            deliver(listener.as_ref(), &event);
        }
    }
}

fn deliver(listener: &dyn JobChangeListener, event: &JobChangeEvent) {
    let result = catch_unwind(AssertUnwindSafe(|| match event.kind {
        JobChangeKind::Scheduled => listener.scheduled(event),
        JobChangeKind::AboutToRun => listener.about_to_run(event),
        JobChangeKind::Running => listener.running(event),
        JobChangeKind::Sleeping => listener.sleeping(event),
        JobChangeKind::Awake => listener.awake(event),
        JobChangeKind::Done => listener.done(event),
    }));

    if let Err(panic) = result {
        if panic.is::<OperationCanceled>() {
            return;
        }
        let job_id = event.job.id();
        let message = panic_message(panic.as_ref());
        tracing::error!(
            %job_id,
            kind = %event.kind,
            "Listener panicked handling {} event for job {job_id}: {message}",
            event.kind,
        );
    }
}
