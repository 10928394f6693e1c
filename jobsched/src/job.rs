use std::{
    fmt::Display,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    thread::Thread,
};

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::{
    executor::Executor,
    listener::Listener,
    manager::JobManager,
    monitor::Monitor,
    rule::Rule,
    status::Status,
    JobsError,
};

pub mod builder;
pub(crate) mod queue;

type Result<T> = std::result::Result<T, JobsError>;

#[derive(Debug, Eq, PartialEq, Clone, Copy, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(u64);

static JOB_IDS: AtomicU64 = AtomicU64::new(1);

impl JobId {
    fn next() -> Self {
        Self(JOB_IDS.fetch_add(1, Ordering::Relaxed))
    }
}

impl From<u64> for JobId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<JobId> for u64 {
    fn from(value: JobId) -> Self {
        value.0
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JobId({})", self.0)
    }
}

/// Job priorities, from most to least urgent.
///
/// The priority decides the order in which waiting jobs are started and the default delay a
/// job waits in the queue after being scheduled.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum Priority {
    /// Short jobs a user is waiting for.
    Interactive = 10,
    /// Jobs which complete quickly, such as refreshing a view.
    Short = 20,
    #[default]
    Long = 30,
    Build = 40,
    /// Cosmetic work which only runs once the system is quiet.
    Decorate = 50,
}

impl Priority {
    /// How long a job of this priority waits in the queue before it is eligible to run.
    pub fn default_delay(self) -> TimeDelta {
        match self {
            Self::Interactive => TimeDelta::zero(),
            Self::Short => TimeDelta::milliseconds(50),
            Self::Long => TimeDelta::milliseconds(100),
            Self::Build => TimeDelta::milliseconds(500),
            Self::Decorate => TimeDelta::milliseconds(1000),
        }
    }
}

/// The state of a job as observed by clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    /// Not scheduled.
    None,
    /// Scheduled, waiting for its delay to elapse or to be woken up.
    Sleeping,
    /// Waiting for a worker or for a conflicting job to finish.
    Waiting,
    Running,
}

/// The state of a job as tracked by the manager.
///
/// The three refinements collapse onto client visible states, see [`InternalState::external`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum InternalState {
    #[default]
    None,
    Sleeping,
    Waiting,
    Running,
    /// Waiting behind a running job with a conflicting rule.
    Blocked,
    /// Taken off the wait queue and in the running set, but not yet handed to the executor.
    AboutToRun,
    /// Between the schedule request and the job landing in a queue.
    AboutToSchedule,
}

impl InternalState {
    pub(crate) fn external(self) -> JobState {
        match self {
            Self::None => JobState::None,
            Self::Sleeping => JobState::Sleeping,
            Self::Waiting | Self::Blocked | Self::AboutToSchedule => JobState::Waiting,
            Self::Running | Self::AboutToRun => JobState::Running,
        }
    }
}

/// When a job is due, read according to its state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum StartTime {
    #[default]
    None,
    /// Run at (waiting) or wake at (sleeping).
    At(DateTime<Utc>),
    /// Sleeping until explicitly woken.
    Never,
    /// Running, and to be scheduled again with this delay once done.
    RescheduleIn(TimeDelta),
}

impl StartTime {
    /// Whether a job starting at `self` is due strictly after one starting at `other`.
    pub(crate) fn is_after(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::At(this), Self::At(other)) => this > other,
            (Self::Never, Self::Never) => false,
            (Self::Never, _) => true,
            _ => false,
        }
    }

    pub(crate) fn is_due(&self, now: DateTime<Utc>) -> bool {
        matches!(self, Self::At(at) if *at < now)
    }

    pub(crate) fn shifted(self, delta: TimeDelta) -> Self {
        match self {
            Self::At(at) => Self::At(at + delta),
            other => other,
        }
    }
}

/// Scheduling fields of a job.
///
/// Mutated only by the manager while it holds its own lock, with the exception of
/// configuration fields a client may change while the job is not scheduled. This lock is a
/// leaf: no other lock is ever acquired while it is held.
#[derive(Default)]
pub(crate) struct JobFields {
    pub(crate) name: String,
    pub(crate) state: InternalState,
    pub(crate) priority: Priority,
    pub(crate) rule: Option<Rule>,
    pub(crate) system: bool,
    pub(crate) user: bool,
    pub(crate) about_to_run_canceled: bool,
    pub(crate) run_canceled: bool,
    pub(crate) result: Option<Status>,
    pub(crate) start_time: StartTime,
    pub(crate) wait_queue_stamp: Option<u64>,
    pub(crate) thread: Option<Thread>,
    pub(crate) monitor: Option<Monitor>,
}

struct JobInner {
    id: JobId,
    manager: JobManager,
    executor: Box<dyn Executor>,
    fields: Mutex<JobFields>,
    listeners: RwLock<Vec<Listener>>,
}

/// A unit of work scheduled on a [`JobManager`].
///
/// `Job` is a cheap handle; clones refer to the same job. A job can be scheduled any number of
/// times, but is only ever queued or running once at a time.
#[derive(Clone)]
pub struct Job(Arc<JobInner>);

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("state", &self.internal_state())
            .finish()
    }
}

impl PartialEq for Job {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Job {}

impl Job {
    pub(crate) fn new(
        manager: JobManager,
        fields: JobFields,
        executor: Box<dyn Executor>,
    ) -> Self {
        Self(Arc::new(JobInner {
            id: JobId::next(),
            manager,
            executor,
            fields: Mutex::new(fields),
            listeners: Default::default(),
        }))
    }

    pub fn id(&self) -> JobId {
        self.0.id
    }

    pub fn manager(&self) -> &JobManager {
        &self.0.manager
    }

    pub fn name(&self) -> String {
        self.with_fields(|fields| fields.name.clone())
    }

    pub fn set_name(&self, name: impl Into<String>) {
        let name = name.into();
        self.update(|fields| fields.name = name);
    }

    pub fn priority(&self) -> Priority {
        self.with_fields(|fields| fields.priority)
    }

    /// Changes the priority. A waiting job is re-sorted within the wait queue.
    pub fn set_priority(&self, priority: Priority) {
        self.0.manager.set_priority(self, priority)
    }

    pub fn rule(&self) -> Option<Rule> {
        self.with_fields(|fields| fields.rule.clone())
    }

    /// Sets the scheduling rule.
    ///
    /// Fails with [`JobsError::IllegalState`] unless the job is [`JobState::None`], and with
    /// [`JobsError::InvalidRule`] if the rule does not obey the [`crate::rule`] contract.
    pub fn set_rule(&self, rule: Option<Rule>) -> Result<()> {
        self.0.manager.set_rule(self, rule)
    }

    pub fn is_system(&self) -> bool {
        self.with_fields(|fields| fields.system)
    }

    /// Marks the job as an internal one not interesting to users.
    pub fn set_system(&self, system: bool) -> Result<()> {
        self.update_while_idle(|fields| fields.system = system)
    }

    pub fn is_user(&self) -> bool {
        self.with_fields(|fields| fields.user)
    }

    /// Marks the job as one a user initiated and is waiting for.
    pub fn set_user(&self, user: bool) -> Result<()> {
        self.update_while_idle(|fields| fields.user = user)
    }

    pub fn state(&self) -> JobState {
        self.internal_state().external()
    }

    /// The status of the last completed run, `None` if the job never ran.
    pub fn result(&self) -> Option<Status> {
        self.with_fields(|fields| fields.result.clone())
    }

    /// The worker thread running this job, if it is running.
    pub fn thread(&self) -> Option<Thread> {
        self.with_fields(|fields| fields.thread.clone())
    }

    /// Schedules the job to run as soon as possible.
    pub fn schedule(&self) -> Result<()> {
        self.schedule_in(TimeDelta::zero())
    }

    /// Schedules the job to run after `delay`.
    ///
    /// Scheduling a waiting or sleeping job does nothing. Scheduling a running job schedules
    /// it again once the current run completes.
    pub fn schedule_in(&self, delay: TimeDelta) -> Result<()> {
        if !self.0.executor.should_schedule() {
            tracing::debug!(job_id = %self.id(), "Schedule vetoed by job {}", self.id());
            return Ok(());
        }
        self.0.manager.schedule(self, delay, false)
    }

    /// Stops the job from running.
    ///
    /// Returns `true` if the job was not running, in which case it is guaranteed not to run
    /// unless scheduled again. Returns `false` if the job is running or about to; its monitor
    /// is flagged as cancelled and it is up to the job to stop.
    pub fn cancel(&self) -> bool {
        self.0.manager.cancel(self)
    }

    /// Puts a waiting job to sleep until [`Job::wake_up`] is called.
    ///
    /// Returns `false` if the job is running and cannot be put to sleep.
    pub fn sleep(&self) -> bool {
        self.0.manager.sleep(self)
    }

    pub fn wake_up(&self) -> Result<()> {
        self.wake_up_in(TimeDelta::zero())
    }

    /// Moves a sleeping job back to the wait queue after `delay`. Does nothing to jobs which
    /// are not sleeping.
    pub fn wake_up_in(&self, delay: TimeDelta) -> Result<()> {
        self.0.manager.wake_up(self, delay)
    }

    /// Finishes a job whose run returned [`crate::ExecutionResult::PendingAsync`].
    ///
    /// Calling this on a job which is not running has no effect.
    pub fn done(&self, status: Status) {
        self.0.manager.end_job(self, status, true)
    }

    /// Whether this running job is holding up a waiting job of higher priority.
    pub fn is_blocking(&self) -> bool {
        self.0.manager.is_blocking(self)
    }

    pub fn add_job_change_listener(&self, listener: Listener) {
        self.0.listeners.write().push(listener);
    }

    pub fn remove_job_change_listener(&self, listener: &Listener) {
        self.0
            .listeners
            .write()
            .retain(|registered| !Arc::ptr_eq(registered, listener));
    }

    pub(crate) fn listeners(&self) -> Vec<Listener> {
        self.0.listeners.read().clone()
    }

    pub(crate) fn executor(&self) -> &dyn Executor {
        self.0.executor.as_ref()
    }

    pub(crate) fn internal_state(&self) -> InternalState {
        self.with_fields(|fields| fields.state)
    }

    pub(crate) fn with_fields<T>(&self, f: impl FnOnce(&JobFields) -> T) -> T {
        f(&self.0.fields.lock())
    }

    pub(crate) fn update<T>(&self, f: impl FnOnce(&mut JobFields) -> T) -> T {
        f(&mut self.0.fields.lock())
    }

    fn update_while_idle(&self, f: impl FnOnce(&mut JobFields)) -> Result<()> {
        self.update(|fields| match fields.state {
            InternalState::None => {
                f(fields);
                Ok(())
            }
            state => Err(JobsError::IllegalState {
                job: self.id(),
                state: state.external(),
            }),
        })
    }
}
