//! The job manager: owner of the queues and arbiter of every job state change.
//!
//! All scheduling state lives behind a single lock. Listener callbacks, executor hooks, the
//! progress provider and the worker pool are only ever invoked with that lock released; a
//! state change which requires a worker to be woken records the request and the pool is
//! poked once the lock is dropped.
use std::{
    collections::VecDeque,
    ops::{Deref, DerefMut},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    thread,
    time::Duration,
};

use chrono::{TimeDelta, Utc};
use fxhash::FxHashMap;
use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::{
    config::ManagerConfig,
    executor::Executor,
    job::{
        queue::{BlockedChains, JobQueue},
        InternalState, Job, JobFields, JobId, JobState, Priority, StartTime,
    },
    listener::{JobListeners, Listener},
    monitor::{Monitor, NullProgressMonitor, ProgressProvider},
    pool::WorkerPool,
    rule::{conflicting, Rule, UnknownRule},
    status::Status,
    JobsError,
};

type Result<T> = std::result::Result<T, JobsError>;

/// Minimum delay per running job imposed on rule-less decoration jobs.
const DECORATE_DELAY_PER_RUNNING_JOB_MS: i64 = 100;

/// Schedules [`Job`]s onto a pool of worker threads.
///
/// `JobManager` is a cheap handle; clones share the same scheduler. Call
/// [`JobManager::shutdown`] when done: jobs hold a handle on their manager, so a manager with
/// outstanding jobs is never dropped implicitly.
///
/// # Example
///
/// ```
/// # use std::time::Duration;
/// # use jobsched::prelude::*;
/// # use jobsched::testing::assert_state;
/// let manager = JobManager::with_config(ManagerConfig::new().with_max_workers(2));
/// let rule = MutexRule::new("output").into_rule();
///
/// let first = JobBuilder::new("first")
///     .with_rule(rule.clone())
///     .build(&manager, |_job: &Job, _monitor: &Monitor| ExecutionResult::ok())
///     .unwrap();
/// let second = JobBuilder::new("second")
///     .with_rule(rule)
///     .build(&manager, |_job: &Job, _monitor: &Monitor| ExecutionResult::ok())
///     .unwrap();
///
/// // The rule guarantees that the two never run at the same time.
/// first.schedule().unwrap();
/// second.schedule().unwrap();
///
/// assert_state!(first, JobState::None, within: Duration::from_secs(5));
/// assert_state!(second, JobState::None, within: Duration::from_secs(5));
/// manager.shutdown();
/// ```
#[derive(Clone)]
pub struct JobManager {
    inner: Arc<ManagerInner>,
}

/// A non-owning handle held by the worker pool.
#[derive(Clone)]
pub(crate) struct WeakManager(Weak<ManagerInner>);

impl WeakManager {
    pub(crate) fn upgrade(&self) -> Option<JobManager> {
        self.0.upgrade().map(|inner| JobManager { inner })
    }
}

struct ManagerInner {
    state: Mutex<ManagerState>,
    active: AtomicBool,
    pool: Arc<WorkerPool>,
    listeners: JobListeners,
    progress_provider: RwLock<Option<Arc<dyn ProgressProvider>>>,
    config: ManagerConfig,
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        self.pool.shutdown();
    }
}

struct ManagerState {
    running: FxHashMap<JobId, Job>,
    waiting: JobQueue,
    sleeping: JobQueue,
    blocked: BlockedChains,
    suspended: bool,
    wait_queue_counter: u64,
    /// Set when the pool should be poked once the lock is released.
    wake_pool: bool,
}

/// The manager lock. Dropping it pokes the pool if a state change asked for it, after the
/// lock has been released.
struct StateGuard<'a> {
    guard: MutexGuard<'a, ManagerState>,
    pool: &'a Arc<WorkerPool>,
}

impl Deref for StateGuard<'_> {
    type Target = ManagerState;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl DerefMut for StateGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}

impl Drop for StateGuard<'_> {
    fn drop(&mut self) {
        if std::mem::take(&mut self.guard.wake_pool) {
            let queued = self.guard.queued();
            let pool = self.pool;
            MutexGuard::unlocked(&mut self.guard, || pool.job_queued(queued));
        }
    }
}

impl ManagerState {
    fn new() -> Self {
        Self {
            running: Default::default(),
            waiting: JobQueue::new(false),
            sleeping: JobQueue::new(true),
            blocked: Default::default(),
            suspended: false,
            wait_queue_counter: 0,
            wake_pool: false,
        }
    }

    fn queued(&self) -> usize {
        self.waiting.len() + self.sleeping.len()
    }

    fn next_stamp(&mut self) -> u64 {
        self.wait_queue_counter += 1;
        self.wait_queue_counter
    }

    /// Moves `job` to `new`, maintaining queue and running-set membership.
    fn change_state(&mut self, job: &Job, new: InternalState) {
        let id = job.id();
        let old = job.internal_state();

        if old == InternalState::AboutToRun && new == InternalState::Running {
            job.update(|fields| fields.state = new);
            return;
        }

        let mut freed = VecDeque::new();
        match old {
            InternalState::None | InternalState::AboutToSchedule => {}
            InternalState::Blocked => {
                self.blocked.unblock(id);
            }
            InternalState::Waiting => {
                self.waiting.remove(id);
            }
            InternalState::Sleeping => {
                self.sleeping.remove(id);
            }
            InternalState::Running | InternalState::AboutToRun => {
                self.running.remove(&id);
                freed = self.blocked.release(id);
                if !freed.is_empty() {
                    self.wake_pool = true;
                }
            }
        }

        job.update(|fields| {
            fields.state = new;
            match new {
                InternalState::None => {
                    fields.start_time = StartTime::None;
                    fields.wait_queue_stamp = None;
                    fields.run_canceled = false;
                    fields.about_to_run_canceled = false;
                }
                // A sleeper is re-stamped when it wakes.
                InternalState::Sleeping => fields.wait_queue_stamp = None,
                InternalState::Running | InternalState::AboutToRun => {
                    fields.start_time = StartTime::None;
                    fields.wait_queue_stamp = None;
                }
                _ => {}
            }
        });
        match new {
            InternalState::Waiting => self.waiting.enqueue(job.clone()),
            InternalState::Sleeping => self.sleeping.enqueue(job.clone()),
            InternalState::Running | InternalState::AboutToRun => {
                self.running.insert(id, job.clone());
            }
            _ => {}
        }

        for blocked in freed {
            self.change_state(&blocked, InternalState::Waiting);
        }
    }

    /// Queues a job which is about to be scheduled or is sleeping.
    fn do_schedule(&mut self, job: &Job, delay: TimeDelta) {
        let (state, priority, has_rule) =
            job.with_fields(|fields| (fields.state, fields.priority, fields.rule.is_some()));
        if !matches!(
            state,
            InternalState::AboutToSchedule | InternalState::Sleeping
        ) {
            return;
        }

        let mut delay = delay;
        if priority == Priority::Decorate && !has_rule {
            let running = i32::try_from(self.running.len()).unwrap_or(i32::MAX);
            let throttle = TimeDelta::milliseconds(DECORATE_DELAY_PER_RUNNING_JOB_MS) * running;
            delay = delay.max(throttle);
        }

        let now = Utc::now();
        if delay > TimeDelta::zero() {
            job.update(|fields| fields.start_time = StartTime::At(now + delay));
            self.change_state(job, InternalState::Sleeping);
        } else {
            let stamp = self.next_stamp();
            job.update(|fields| {
                fields.start_time = StartTime::At(now + priority.default_delay());
                fields.wait_queue_stamp = Some(stamp);
            });
            self.change_state(job, InternalState::Waiting);
        }
    }

    /// The job holding up `job`: a running job with a conflicting rule, or a job with a
    /// conflicting rule already blocked behind one.
    fn find_blocking_job(&self, job: &Job) -> Option<JobId> {
        let rule = job.rule()?;
        let id = job.id();
        let conflicts = |other: &&Job| {
            other.id() != id && conflicting(Some(&rule), other.rule().as_ref())
        };
        self.running
            .values()
            .find(conflicts)
            .or_else(|| self.blocked.iter().find(conflicts))
            .map(Job::id)
    }

    /// Picks the next job to run and moves it into the running set.
    fn next_job(&mut self, active: bool) -> Option<Job> {
        if self.suspended || !active {
            return None;
        }

        let now = Utc::now();
        while let Some(job) = self.sleeping.peek() {
            let due = job.with_fields(|fields| fields.start_time.is_due(now));
            if !due {
                break;
            }
            let stamp = self.next_stamp();
            job.update(|fields| {
                fields.start_time = StartTime::At(now + fields.priority.default_delay());
                fields.wait_queue_stamp = Some(stamp);
            });
            self.change_state(&job, InternalState::Waiting);
        }

        while let Some(job) = self.waiting.peek() {
            match self.find_blocking_job(&job) {
                Some(blocker) => {
                    tracing::trace!(job_id = %job.id(), %blocker, "Job {} blocked by {blocker}", job.id());
                    self.change_state(&job, InternalState::Blocked);
                    self.blocked.block_behind(blocker, job);
                }
                None => {
                    self.change_state(&job, InternalState::AboutToRun);
                    return Some(job);
                }
            }
        }
        None
    }
}

enum Cancellation {
    Idle,
    Deferred,
    Running {
        monitor: Option<Monitor>,
        first: bool,
    },
    Dequeued,
}

impl Default for JobManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for JobManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobManager")
            .field("active", &self.is_active())
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl JobManager {
    pub fn new() -> Self {
        Self::with_config(Default::default())
    }

    pub fn with_config(config: ManagerConfig) -> Self {
        let inner = Arc::new_cyclic(|weak| ManagerInner {
            state: Mutex::new(ManagerState::new()),
            active: AtomicBool::new(true),
            pool: Arc::new(WorkerPool::new(WeakManager(weak.clone()), config.clone())),
            listeners: Default::default(),
            progress_provider: Default::default(),
            config,
        });
        Self { inner }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    /// Creates a job running `executor`. Use [`crate::JobBuilder`] to configure it further.
    pub fn new_job(&self, name: impl Into<String>, executor: impl Executor) -> Job {
        Job::new(
            self.clone(),
            JobFields {
                name: name.into(),
                ..Default::default()
            },
            Box::new(executor),
        )
    }

    pub fn add_job_change_listener(&self, listener: Listener) {
        self.inner.listeners.add(listener)
    }

    pub fn remove_job_change_listener(&self, listener: &Listener) {
        self.inner.listeners.remove(listener)
    }

    pub fn set_progress_provider(&self, provider: Option<Arc<dyn ProgressProvider>>) {
        *self.inner.progress_provider.write() = provider;
    }

    /// A monitor for work done outside of a job, from the progress provider if one is set.
    pub fn default_monitor(&self) -> Monitor {
        self.progress_provider()
            .and_then(|provider| provider.default_monitor())
            .unwrap_or_else(NullProgressMonitor::shared)
    }

    /// A monitor grouping the progress of several jobs, from the progress provider if one is
    /// set.
    pub fn create_progress_group(&self) -> Monitor {
        self.progress_provider()
            .and_then(|provider| provider.create_progress_group())
            .unwrap_or_else(NullProgressMonitor::shared)
    }

    /// Checks that `rule` obeys the [`crate::rule`] contract.
    pub fn validate_rule(&self, rule: &Rule) -> Result<()> {
        let rule = rule.as_ref();
        if !rule.contains(rule) {
            return Err(JobsError::InvalidRule("a rule must contain itself"));
        }
        if !rule.is_conflicting(rule) {
            return Err(JobsError::InvalidRule("a rule must conflict with itself"));
        }
        if rule.contains(&UnknownRule) || rule.is_conflicting(&UnknownRule) {
            return Err(JobsError::InvalidRule(
                "a rule must neither contain nor conflict with unknown rules",
            ));
        }
        Ok(())
    }

    /// Prevents jobs from starting until [`JobManager::resume`] is called. Running jobs are
    /// unaffected.
    pub fn suspend(&self) {
        tracing::debug!("Suspending job manager");
        self.lock_state().suspended = true;
    }

    pub fn resume(&self) {
        tracing::debug!("Resuming job manager");
        let mut state = self.lock_state();
        state.suspended = false;
        state.wake_pool = true;
    }

    pub fn is_suspended(&self) -> bool {
        self.lock_state().suspended
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Whether no job is running or waiting to run. Sleeping jobs do not count.
    pub fn is_idle(&self) -> bool {
        let state = self.lock_state();
        state.running.is_empty() && state.waiting.is_empty()
    }

    pub fn worker_count(&self) -> usize {
        self.inner.pool.worker_count()
    }

    /// The job running on the calling thread, if it is a worker running one.
    pub fn current_job(&self) -> Option<Job> {
        let current = thread::current().id();
        self.lock_state()
            .running
            .values()
            .find(|job| {
                job.with_fields(|fields| {
                    fields
                        .thread
                        .as_ref()
                        .is_some_and(|thread| thread.id() == current)
                })
            })
            .cloned()
    }

    /// How long until a job may become runnable: zero when jobs are waiting, the time until
    /// the next sleeping job wakes otherwise. `None` means no job will become runnable
    /// without outside intervention.
    pub fn sleep_hint(&self) -> Option<Duration> {
        let state = self.lock_state();
        if state.suspended {
            return None;
        }
        if !state.waiting.is_empty() {
            return Some(Duration::ZERO);
        }
        let next = state.sleeping.peek()?;
        match next.with_fields(|fields| fields.start_time) {
            StartTime::At(at) => Some((at - Utc::now()).to_std().unwrap_or(Duration::ZERO)),
            _ => None,
        }
    }

    /// Stops the manager.
    ///
    /// Queued jobs are discarded, running jobs are cancelled and given
    /// `shutdown_attempts × shutdown_wait` to finish before being abandoned, and the worker
    /// pool is stopped. Calling this more than once has no further effect.
    pub fn shutdown(&self) {
        if self
            .inner
            .active
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        tracing::debug!("Shutting down job manager");

        let (running, discarded) = {
            let mut state = self.lock_state();
            let running: Vec<Job> = state.running.values().cloned().collect();
            let mut discarded = state.waiting.clear();
            discarded.extend(state.sleeping.clear());
            discarded.extend(state.blocked.clear());
            for job in &discarded {
                state.change_state(job, InternalState::None);
            }
            (running, discarded)
        };
        if !discarded.is_empty() {
            tracing::debug!("Discarded {} queued jobs", discarded.len());
        }
        drop(discarded);

        for job in &running {
            self.cancel(job);
        }

        let config = &self.inner.config;
        for _ in 0..config.shutdown_attempts {
            if running
                .iter()
                .all(|job| job.internal_state() == InternalState::None)
            {
                break;
            }
            thread::sleep(config.shutdown_wait);
        }
        for job in running
            .iter()
            .filter(|job| job.internal_state() != InternalState::None)
        {
            let job_id = job.id();
            tracing::warn!(
                %job_id,
                job = %job.name(),
                "Job {job_id} did not finish during shutdown and was abandoned",
            );
        }

        self.inner.pool.shutdown();
    }

    pub(crate) fn schedule(&self, job: &Job, delay: TimeDelta, reschedule: bool) -> Result<()> {
        if !self.is_active() {
            return Err(JobsError::ShutDown);
        }
        if delay < TimeDelta::zero() {
            return Err(JobsError::NegativeDelay(delay));
        }

        {
            let mut state = self.lock_state();
            match job.internal_state() {
                InternalState::None => {}
                InternalState::Running | InternalState::AboutToRun => {
                    job.update(|fields| fields.start_time = StartTime::RescheduleIn(delay));
                    return Ok(());
                }
                _ => return Ok(()),
            }
            state.change_state(job, InternalState::AboutToSchedule);
        }

        let job_id = job.id();
        tracing::debug!(%job_id, "Scheduling job {job_id} in {delay}");
        self.inner.listeners.scheduled(job, delay, reschedule);

        let mut state = self.lock_state();
        if !self.is_active() {
            state.change_state(job, InternalState::None);
            return Err(JobsError::ShutDown);
        }
        state.do_schedule(job, delay);
        state.wake_pool = true;
        Ok(())
    }

    /// Hands the next runnable job to a worker, or `None` if there is none.
    pub(crate) fn start_job(&self) -> Option<Job> {
        loop {
            let job = {
                let active = self.is_active();
                self.lock_state().next_job(active)?
            };

            let should_run = job.executor().should_run();
            if should_run {
                self.inner.listeners.about_to_run(&job);
            }
            let monitor = self.create_monitor(&job);

            let mut state = self.lock_state();
            if job.internal_state() != InternalState::AboutToRun {
                continue;
            }
            let canceled = job.update(|fields| std::mem::take(&mut fields.about_to_run_canceled));
            if should_run && !canceled {
                job.update(|fields| {
                    fields.monitor = Some(monitor);
                    fields.thread = Some(thread::current());
                });
                state.change_state(&job, InternalState::Running);
                drop(state);

                let job_id = job.id();
                tracing::debug!(%job_id, job = %job.name(), "Starting job {job_id}");
                self.inner.listeners.running(&job);
                return Some(job);
            }
            drop(state);

            let job_id = job.id();
            tracing::debug!(%job_id, "Job {job_id} was cancelled before it started");
            self.end_job(&job, Status::cancel(), true);
        }
    }

    /// Finishes a run of `job` with `result`, rescheduling it if that was requested while it
    /// was running. Jobs which are not running are left alone.
    pub(crate) fn end_job(&self, job: &Job, result: Status, notify: bool) {
        let reschedule_in = {
            let mut state = self.lock_state();
            if !matches!(
                job.internal_state(),
                InternalState::Running | InternalState::AboutToRun
            ) {
                return;
            }
            let reschedule_in = job.update(|fields| {
                fields.result = Some(result.clone());
                fields.monitor = None;
                fields.thread = None;
                match fields.start_time {
                    StartTime::RescheduleIn(delay) => Some(delay),
                    _ => None,
                }
            });
            state.change_state(job, InternalState::None);
            reschedule_in
        };

        let job_id = job.id();
        tracing::debug!(%job_id, %result, "Job {job_id} complete");

        let reschedule_in = reschedule_in
            .filter(|_| self.is_active() && job.executor().should_schedule());
        if notify {
            self.inner
                .listeners
                .done(job, result, reschedule_in.is_some());
        }
        if let Some(delay) = reschedule_in {
            if let Err(error) = self.schedule(job, delay, true) {
                tracing::warn!(?error, %job_id, "Failed to reschedule job {job_id}: {error}");
            }
        }
    }

    pub(crate) fn cancel(&self, job: &Job) -> bool {
        let cancellation = {
            let mut state = self.lock_state();
            match job.internal_state() {
                InternalState::None => Cancellation::Idle,
                InternalState::AboutToRun => {
                    job.update(|fields| fields.about_to_run_canceled = true);
                    Cancellation::Deferred
                }
                InternalState::Running => job.update(|fields| {
                    let first = !fields.run_canceled;
                    fields.run_canceled = true;
                    Cancellation::Running {
                        monitor: fields.monitor.clone(),
                        first,
                    }
                }),
                _ => {
                    state.change_state(job, InternalState::None);
                    Cancellation::Dequeued
                }
            }
        };

        let job_id = job.id();
        match cancellation {
            Cancellation::Idle => true,
            Cancellation::Deferred => {
                tracing::debug!(%job_id, "Job {job_id} will be cancelled before it starts");
                false
            }
            Cancellation::Running { monitor, first } => {
                if first {
                    tracing::debug!(%job_id, "Cancelling running job {job_id}");
                    if let Some(monitor) = monitor.filter(|monitor| !monitor.is_canceled()) {
                        monitor.set_canceled(true);
                    }
                    job.executor().canceling();
                }
                false
            }
            Cancellation::Dequeued => {
                tracing::debug!(%job_id, "Cancelled job {job_id}");
                self.inner.listeners.done(job, Status::cancel(), false);
                true
            }
        }
    }

    pub(crate) fn sleep(&self, job: &Job) -> bool {
        {
            let mut state = self.lock_state();
            match job.internal_state() {
                InternalState::Running => return false,
                InternalState::None => return true,
                InternalState::Sleeping => {
                    job.update(|fields| fields.start_time = StartTime::Never);
                    state.change_state(job, InternalState::Sleeping);
                    return true;
                }
                _ => {
                    job.update(|fields| fields.start_time = StartTime::Never);
                    state.change_state(job, InternalState::Sleeping);
                }
            }
        }
        self.inner.listeners.sleeping(job);
        true
    }

    pub(crate) fn wake_up(&self, job: &Job, delay: TimeDelta) -> Result<()> {
        if delay < TimeDelta::zero() {
            return Err(JobsError::NegativeDelay(delay));
        }
        {
            let mut state = self.lock_state();
            if job.state() != JobState::Sleeping {
                return Ok(());
            }
            state.do_schedule(job, delay);
            state.wake_pool = true;
        }
        if delay == TimeDelta::zero() {
            self.inner.listeners.awake(job);
        }
        Ok(())
    }

    pub(crate) fn set_priority(&self, job: &Job, priority: Priority) {
        let mut state = self.lock_state();
        let old = job.update(|fields| std::mem::replace(&mut fields.priority, priority));
        if old == priority {
            return;
        }
        let internal = job.update(|fields| {
            if fields.state.external() == JobState::Waiting {
                fields.start_time = fields
                    .start_time
                    .shifted(priority.default_delay() - old.default_delay());
            }
            fields.state
        });
        if internal == InternalState::Waiting {
            state.waiting.resort(job.id());
        }
    }

    pub(crate) fn set_rule(&self, job: &Job, rule: Option<Rule>) -> Result<()> {
        if let Some(rule) = &rule {
            self.validate_rule(rule)?;
        }
        let _state = self.lock_state();
        job.update(|fields| match fields.state {
            InternalState::None => {
                fields.rule = rule;
                Ok(())
            }
            state => Err(JobsError::IllegalState {
                job: job.id(),
                state: state.external(),
            }),
        })
    }

    /// Whether `job` is running while a more urgent, non-system job waits behind it.
    pub(crate) fn is_blocking(&self, job: &Job) -> bool {
        let state = self.lock_state();
        let (internal, priority) = job.with_fields(|fields| (fields.state, fields.priority));
        if internal != InternalState::Running {
            return false;
        }
        let blocking = state
            .blocked
            .blocked_by(job.id())
            .any(|blocked| blocked.with_fields(|fields| fields.priority < priority && !fields.system));
        blocking
    }

    /// Number of jobs waiting or sleeping.
    pub(crate) fn queued(&self) -> usize {
        self.inner.state.lock().queued()
    }

    fn lock_state(&self) -> StateGuard<'_> {
        StateGuard {
            guard: self.inner.state.lock(),
            pool: &self.inner.pool,
        }
    }

    fn progress_provider(&self) -> Option<Arc<dyn ProgressProvider>> {
        self.inner.progress_provider.read().clone()
    }

    fn create_monitor(&self, job: &Job) -> Monitor {
        self.progress_provider()
            .and_then(|provider| provider.create_monitor(job))
            .unwrap_or_else(NullProgressMonitor::shared)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use assert_matches::assert_matches;
    use rand::Rng;

    use super::*;
    use crate::{
        assert_state,
        executor::{
            test::{GatedExecutor, Reluctant},
            ExecutionResult,
        },
        job::builder::JobBuilder,
        listener::{JobChangeEvent, JobChangeKind, JobChangeListener},
        monitor::ProgressMonitor,
        rule::{
            test::{ForgetfulRule, GreedyRule},
            MutexRule,
        },
        testing::{wait_until, EventRecorder},
    };

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn manager() -> JobManager {
        JobManager::with_config(
            ManagerConfig::new()
                .with_max_workers(4)
                .with_shutdown_wait(Duration::from_millis(10), 3),
        )
    }

    fn ok_job(manager: &JobManager, name: &str) -> Job {
        manager.new_job(name, |_job: &Job, _monitor: &Monitor| ExecutionResult::ok())
    }

    fn gated_job(manager: &JobManager, name: &str, rule: Option<&Rule>) -> (Job, GatedExecutor) {
        let executor = GatedExecutor::default();
        let mut builder = JobBuilder::new(name);
        if let Some(rule) = rule {
            builder = builder.with_rule(rule.clone());
        }
        let job = builder.build(manager, executor.clone()).unwrap();
        (job, executor)
    }

    fn running(job: &Job, executor: &GatedExecutor) {
        assert!(wait_until(TIMEOUT, || executor.runs.load(Ordering::SeqCst) > 0));
        assert_state!(*job, JobState::Running);
    }

    fn recording(manager: &JobManager) -> Arc<EventRecorder> {
        let recorder = EventRecorder::new();
        manager.add_job_change_listener(recorder.clone());
        recorder
    }

    #[test]
    fn scheduled_jobs_run_to_completion() {
        let manager = manager();
        let recorder = recording(&manager);
        let job = ok_job(&manager, "simple");

        job.schedule().unwrap();

        assert!(recorder.wait_for(&job, JobChangeKind::Done, TIMEOUT));
        assert_state!(job, JobState::None);
        assert_eq!(job.result(), Some(Status::ok()));
        assert_eq!(
            recorder.kinds(&job),
            [
                JobChangeKind::Scheduled,
                JobChangeKind::AboutToRun,
                JobChangeKind::Running,
                JobChangeKind::Done,
            ]
        );
        let events = recorder.events_for(&job);
        assert!(events[2]
            .thread
            .as_deref()
            .is_some_and(|name| name.starts_with("jobsched-worker-")));
        assert!(manager.worker_count() >= 1);
        manager.shutdown();
    }

    #[test]
    fn cancelling_idle_jobs_is_true_and_idempotent() {
        let manager = manager();
        let recorder = recording(&manager);
        let job = ok_job(&manager, "idle");

        assert!(job.cancel());
        assert!(job.cancel());
        assert_state!(job, JobState::None);
        assert!(recorder.events().is_empty());
        manager.shutdown();
    }

    #[test]
    fn cancelling_waiting_jobs_removes_them() {
        let manager = manager();
        let recorder = recording(&manager);
        let executor = GatedExecutor::default();
        let job = manager.new_job("waiting", executor.clone());
        manager.suspend();
        job.schedule().unwrap();
        assert_state!(job, JobState::Waiting);

        assert!(job.cancel());

        assert_state!(job, JobState::None);
        let done = recorder.events_for(&job).pop().unwrap();
        assert_eq!(done.kind, JobChangeKind::Done);
        assert_matches!(done.result, Some(status) if status.is_cancel());
        assert!(!done.reschedule);

        manager.resume();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(executor.runs.load(Ordering::SeqCst), 0);
        assert!(manager.is_idle());
        manager.shutdown();
    }

    #[test]
    fn cancelling_running_jobs_is_cooperative() {
        let manager = manager();
        let (job, executor) = gated_job(&manager, "running", None);
        job.schedule().unwrap();
        running(&job, &executor);
        let monitor = job.with_fields(|fields| fields.monitor.clone()).unwrap();
        assert!(!monitor.is_canceled());

        assert!(!job.cancel());
        assert!(!job.cancel());

        assert!(monitor.is_canceled());
        assert_eq!(executor.cancellations.load(Ordering::SeqCst), 1);
        assert_state!(job, JobState::Running);

        executor.gate.open();
        assert_state!(job, JobState::None, within: TIMEOUT);
        assert_eq!(job.result(), Some(Status::ok()));
        manager.shutdown();
    }

    #[test]
    fn concurrent_cancels_notify_the_executor_once() {
        let manager = manager();
        let (job, executor) = gated_job(&manager, "contested", None);
        job.schedule().unwrap();
        running(&job, &executor);
        let barrier = std::sync::Barrier::new(8);

        let results: Vec<bool> = thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    scope.spawn(|| {
                        barrier.wait();
                        job.cancel()
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().unwrap())
                .collect()
        });

        assert!(results.iter().all(|cancelled| !cancelled));
        assert_eq!(executor.cancellations.load(Ordering::SeqCst), 1);
        executor.gate.open();
        assert_state!(job, JobState::None, within: TIMEOUT);
        manager.shutdown();
    }

    #[test]
    fn jobs_observe_cancellation_through_their_monitor() {
        let manager = manager();
        let started = Arc::new(AtomicBool::new(false));
        let job = manager.new_job("polling", {
            let started = started.clone();
            move |_job: &Job, monitor: &Monitor| {
                started.store(true, Ordering::SeqCst);
                while !monitor.is_canceled() {
                    thread::sleep(Duration::from_millis(1));
                }
                ExecutionResult::cancel()
            }
        });
        job.schedule().unwrap();
        assert!(wait_until(TIMEOUT, || started.load(Ordering::SeqCst)));

        assert!(!job.cancel());

        assert_state!(job, JobState::None, within: TIMEOUT);
        assert_matches!(job.result(), Some(status) if status.is_cancel());
        manager.shutdown();
    }

    #[test]
    fn negative_delays_are_rejected() {
        let manager = manager();
        let job = ok_job(&manager, "negative");

        assert_matches!(
            job.schedule_in(TimeDelta::milliseconds(-1)),
            Err(JobsError::NegativeDelay(delay)) if delay == TimeDelta::milliseconds(-1)
        );
        assert_matches!(
            job.wake_up_in(TimeDelta::milliseconds(-1)),
            Err(JobsError::NegativeDelay(_))
        );
        assert_state!(job, JobState::None);
        manager.shutdown();
    }

    #[test]
    fn immediate_schedules_go_straight_to_waiting() {
        let manager = manager();
        let recorder = recording(&manager);
        let job = ok_job(&manager, "immediate");
        manager.suspend();

        job.schedule().unwrap();

        assert_eq!(job.internal_state(), InternalState::Waiting);
        assert_eq!(recorder.kinds(&job), [JobChangeKind::Scheduled]);
        assert_eq!(
            recorder.events_for(&job)[0].delay,
            Some(TimeDelta::zero())
        );
        assert_eq!(manager.sleep_hint(), None);

        manager.resume();
        assert_state!(job, JobState::None, within: TIMEOUT);
        assert_eq!(recorder.count(&job, JobChangeKind::Sleeping), 0);
        manager.shutdown();
    }

    #[test]
    fn delayed_jobs_sleep_until_due() {
        let manager = manager();
        let started_at = Arc::new(Mutex::new(None));
        let job = manager.new_job("delayed", {
            let started_at = started_at.clone();
            move |_job: &Job, _monitor: &Monitor| {
                *started_at.lock() = Some(std::time::Instant::now());
                ExecutionResult::ok()
            }
        });
        let scheduled_at = std::time::Instant::now();

        job.schedule_in(TimeDelta::milliseconds(150)).unwrap();
        assert_state!(job, JobState::Sleeping);
        let hint = manager.sleep_hint().unwrap();
        assert!(hint <= Duration::from_millis(150));

        assert_state!(job, JobState::None, within: TIMEOUT);
        let started_at = started_at.lock().unwrap();
        assert!(started_at - scheduled_at >= Duration::from_millis(150));
        manager.shutdown();
    }

    #[test]
    fn sleeping_and_waking() {
        let manager = manager();
        let recorder = recording(&manager);
        let job = ok_job(&manager, "sleepy");
        manager.suspend();
        job.schedule().unwrap();

        assert!(job.sleep());
        assert_state!(job, JobState::Sleeping);
        assert_eq!(job.with_fields(|fields| fields.start_time), StartTime::Never);
        assert!(job.sleep());

        manager.resume();
        assert_eq!(manager.sleep_hint(), None);
        thread::sleep(Duration::from_millis(50));
        assert_state!(job, JobState::Sleeping);

        job.wake_up().unwrap();
        assert_state!(job, JobState::None, within: TIMEOUT);
        assert_eq!(recorder.count(&job, JobChangeKind::Sleeping), 1);
        assert_eq!(recorder.count(&job, JobChangeKind::Awake), 1);
        assert_eq!(recorder.count(&job, JobChangeKind::Done), 1);

        // Neither sleeping nor waking an idle job does anything.
        assert!(job.sleep());
        job.wake_up().unwrap();
        assert_state!(job, JobState::None);
        manager.shutdown();
    }

    #[test]
    fn running_jobs_cannot_sleep() {
        let manager = manager();
        let (job, executor) = gated_job(&manager, "busy", None);
        job.schedule().unwrap();
        running(&job, &executor);

        assert!(!job.sleep());

        executor.gate.open();
        assert_state!(job, JobState::None, within: TIMEOUT);
        manager.shutdown();
    }

    #[test]
    fn sleep_hint_reports_next_wake_up() {
        let manager = manager();
        assert_eq!(manager.sleep_hint(), None);
        let job = ok_job(&manager, "later");

        job.schedule_in(TimeDelta::seconds(10)).unwrap();

        let hint = manager.sleep_hint().unwrap();
        assert!(hint <= Duration::from_secs(10));
        assert!(hint > Duration::from_secs(9));
        assert!(job.cancel());
        assert_eq!(manager.sleep_hint(), None);
        manager.shutdown();
    }

    #[test]
    fn priority_changes_shift_waiting_jobs() {
        let manager = manager();
        manager.suspend();
        let (first, second) = (ok_job(&manager, "first"), ok_job(&manager, "second"));
        first.schedule().unwrap();
        second.schedule().unwrap();
        let before = first.with_fields(|fields| fields.start_time);

        first.set_priority(Priority::Decorate);

        assert_eq!(first.priority(), Priority::Decorate);
        assert_eq!(
            first.with_fields(|fields| fields.start_time),
            before.shifted(Priority::Decorate.default_delay() - Priority::Long.default_delay())
        );
        let order: Vec<Job> = manager.lock_state().waiting.iter().cloned().collect();
        assert_eq!(order, [second.clone(), first.clone()]);

        // Unchanged priorities leave the job alone.
        let unchanged = second.with_fields(|fields| fields.start_time);
        second.set_priority(Priority::Long);
        assert_eq!(second.with_fields(|fields| fields.start_time), unchanged);
        manager.shutdown();
    }

    #[test]
    fn priority_of_idle_jobs_just_changes() {
        let manager = manager();
        let job = ok_job(&manager, "idle");

        job.set_priority(Priority::Interactive);

        assert_eq!(job.priority(), Priority::Interactive);
        assert_eq!(job.with_fields(|fields| fields.start_time), StartTime::None);
        manager.shutdown();
    }

    #[test]
    fn asynchronous_jobs_finish_with_done() {
        let manager = JobManager::with_config(ManagerConfig::new().with_max_workers(1));
        let recorder = recording(&manager);
        let (sender, receiver) = std::sync::mpsc::channel();
        let detached = manager.new_job("detached", move |job: &Job, _monitor: &Monitor| {
            let _ = sender.send(job.clone());
            ExecutionResult::PendingAsync
        });
        let follower = ok_job(&manager, "follower");

        detached.schedule().unwrap();
        let handle = receiver.recv_timeout(TIMEOUT).unwrap();
        assert_eq!(handle, detached);

        // The worker is free again while the detached job is still running.
        follower.schedule().unwrap();
        assert_state!(follower, JobState::None, within: TIMEOUT);
        assert_state!(detached, JobState::Running);
        assert_eq!(recorder.count(&detached, JobChangeKind::Done), 0);

        thread::spawn(move || handle.done(Status::info("finished elsewhere")))
            .join()
            .unwrap();

        assert_state!(detached, JobState::None);
        assert_eq!(detached.result(), Some(Status::info("finished elsewhere")));
        detached.done(Status::error("late"));
        assert_eq!(detached.result(), Some(Status::info("finished elsewhere")));
        assert_eq!(recorder.count(&detached, JobChangeKind::Done), 1);
        manager.shutdown();
    }

    #[test]
    fn shutdown_is_idempotent() {
        let manager = manager();
        let (job, executor) = gated_job(&manager, "stubborn", None);
        let queued = ok_job(&manager, "queued");
        job.schedule().unwrap();
        running(&job, &executor);
        queued.schedule_in(TimeDelta::seconds(60)).unwrap();

        manager.shutdown();

        assert!(!manager.is_active());
        assert_eq!(executor.cancellations.load(Ordering::SeqCst), 1);
        assert_state!(queued, JobState::None);
        assert_state!(job, JobState::Running);

        manager.shutdown();
        assert_eq!(executor.cancellations.load(Ordering::SeqCst), 1);
        assert_matches!(queued.schedule(), Err(JobsError::ShutDown));

        executor.gate.open();
        assert_state!(job, JobState::None, within: TIMEOUT);
    }

    #[test]
    fn shutdown_resets_discarded_jobs() {
        let manager = manager();
        let rule = MutexRule::new("held").into_rule();
        let (holder, executor) = gated_job(&manager, "holder", Some(&rule));
        let (blocked, _) = gated_job(&manager, "blocked", Some(&rule));
        let (waiting, sleeping) = (ok_job(&manager, "waiting"), ok_job(&manager, "sleeping"));
        holder.schedule().unwrap();
        running(&holder, &executor);
        blocked.schedule().unwrap();
        assert!(wait_until(TIMEOUT, || {
            blocked.internal_state() == InternalState::Blocked
        }));
        manager.suspend();
        waiting.schedule().unwrap();
        sleeping.schedule_in(TimeDelta::seconds(60)).unwrap();

        manager.shutdown();

        for job in [&blocked, &waiting, &sleeping] {
            assert_eq!(job.internal_state(), InternalState::None);
            job.with_fields(|fields| {
                assert_eq!(fields.start_time, StartTime::None);
                assert_eq!(fields.wait_queue_stamp, None);
                assert!(!fields.run_canceled && !fields.about_to_run_canceled);
            });
        }
        assert_eq!(manager.lock_state().queued(), 0);
        assert_eq!(manager.lock_state().blocked.len(), 0);

        executor.gate.open();
        assert_state!(holder, JobState::None, within: TIMEOUT);
    }

    #[test]
    fn shutdown_waits_for_cancelled_jobs() {
        let manager = JobManager::with_config(
            ManagerConfig::new().with_shutdown_wait(Duration::from_millis(10), 500),
        );
        let job = manager.new_job("cooperative", |_job: &Job, monitor: &Monitor| {
            while !monitor.is_canceled() {
                thread::sleep(Duration::from_millis(1));
            }
            ExecutionResult::cancel()
        });
        job.schedule().unwrap();
        assert_state!(job, JobState::Running, within: TIMEOUT);

        manager.shutdown();

        assert_state!(job, JobState::None);
        assert_matches!(job.result(), Some(status) if status.is_cancel());
    }

    #[test]
    fn conflicting_jobs_take_turns() {
        let manager = manager();
        let rule = MutexRule::new("shared").into_rule();
        let (first, first_executor) = gated_job(&manager, "first", Some(&rule));
        let (second, second_executor) = gated_job(&manager, "second", Some(&rule));

        first.schedule().unwrap();
        running(&first, &first_executor);
        second.schedule().unwrap();

        assert!(wait_until(TIMEOUT, || second.internal_state()
            == InternalState::Blocked));
        assert_state!(second, JobState::Waiting);
        assert_eq!(second_executor.runs.load(Ordering::SeqCst), 0);
        assert!(!first.is_blocking());

        first_executor.gate.open();
        assert_state!(first, JobState::None, within: TIMEOUT);
        running(&second, &second_executor);
        second_executor.gate.open();
        assert_state!(second, JobState::None, within: TIMEOUT);

        assert_eq!(first.result(), Some(Status::ok()));
        assert_eq!(second.result(), Some(Status::ok()));
        manager.shutdown();
    }

    #[test]
    fn blocked_jobs_keep_their_order() {
        let manager = JobManager::with_config(ManagerConfig::new().with_max_workers(2));
        let rule = MutexRule::new("ordered").into_rule();
        let order = Arc::new(Mutex::new(Vec::new()));
        let (holder, holder_executor) = gated_job(&manager, "holder", Some(&rule));
        let recorded = |name: &'static str| {
            let order = order.clone();
            JobBuilder::new(name)
                .with_rule(rule.clone())
                .build(&manager, move |_job: &Job, _monitor: &Monitor| {
                    order.lock().push(name);
                    ExecutionResult::ok()
                })
                .unwrap()
        };
        let jobs = [recorded("a"), recorded("b"), recorded("c")];

        holder.schedule().unwrap();
        running(&holder, &holder_executor);
        for job in &jobs {
            job.schedule().unwrap();
        }
        assert!(wait_until(TIMEOUT, || jobs
            .iter()
            .all(|job| job.internal_state() == InternalState::Blocked)));

        holder_executor.gate.open();
        assert!(wait_until(TIMEOUT, || order.lock().len() == 3));
        assert_eq!(*order.lock(), ["a", "b", "c"]);
        manager.shutdown();
    }

    #[test]
    fn equal_priority_jobs_run_first_in_first_out() {
        let manager = JobManager::with_config(ManagerConfig::new().with_max_workers(1));
        let order = Arc::new(Mutex::new(Vec::new()));
        manager.suspend();
        for index in 0..5 {
            let order = order.clone();
            manager
                .new_job(format!("job-{index}"), move |_job: &Job, _monitor: &Monitor| {
                    order.lock().push(index);
                    ExecutionResult::ok()
                })
                .schedule()
                .unwrap();
        }

        manager.resume();

        assert!(wait_until(TIMEOUT, || order.lock().len() == 5));
        assert_eq!(*order.lock(), [0, 1, 2, 3, 4]);
        manager.shutdown();
    }

    #[test]
    fn conflicting_jobs_never_overlap() {
        const RULES: usize = 3;
        const JOBS: usize = 40;

        let manager = manager();
        let rules: Vec<Rule> = (0..RULES)
            .map(|index| MutexRule::new(format!("rule-{index}")).into_rule())
            .collect();
        let in_use: Arc<Vec<AtomicBool>> =
            Arc::new((0..RULES).map(|_| AtomicBool::new(false)).collect());
        let overlaps = Arc::new(AtomicUsize::new(0));
        let mut rng = rand::thread_rng();

        let jobs: Vec<Job> = (0..JOBS)
            .map(|index| {
                let rule = rng.gen_range(0..RULES);
                let work = Duration::from_micros(rng.gen_range(0..2_000));
                let delay = TimeDelta::milliseconds(rng.gen_range(0..20));
                let in_use = in_use.clone();
                let overlaps = overlaps.clone();
                let job = JobBuilder::new(format!("job-{index}"))
                    .with_rule(rules[rule].clone())
                    .build(&manager, move |_job: &Job, _monitor: &Monitor| {
                        if in_use[rule].swap(true, Ordering::SeqCst) {
                            overlaps.fetch_add(1, Ordering::SeqCst);
                        }
                        thread::sleep(work);
                        in_use[rule].store(false, Ordering::SeqCst);
                        ExecutionResult::ok()
                    })
                    .unwrap();
                job.schedule_in(delay).unwrap();
                job
            })
            .collect();

        assert!(wait_until(Duration::from_secs(20), || jobs
            .iter()
            .all(|job| job.result().is_some() && job.state() == JobState::None)));
        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
        assert!(manager.is_idle());
        manager.shutdown();
    }

    #[test]
    fn decorations_wait_for_a_quiet_system() {
        let manager = manager();
        let (first, first_executor) = gated_job(&manager, "first", None);
        let (second, second_executor) = gated_job(&manager, "second", None);
        first.schedule().unwrap();
        second.schedule().unwrap();
        running(&first, &first_executor);
        running(&second, &second_executor);
        let decoration = JobBuilder::new("decoration")
            .with_priority(Priority::Decorate)
            .build(&manager, |_job: &Job, _monitor: &Monitor| ExecutionResult::ok())
            .unwrap();
        let scheduled_at = Utc::now();

        decoration.schedule().unwrap();

        assert_state!(decoration, JobState::Sleeping);
        assert_matches!(
            decoration.with_fields(|fields| fields.start_time),
            StartTime::At(at) if at >= scheduled_at + TimeDelta::milliseconds(200)
        );

        first_executor.gate.open();
        second_executor.gate.open();
        assert_state!(decoration, JobState::None, within: TIMEOUT);
        manager.shutdown();
    }

    #[test]
    fn suspended_managers_start_nothing() {
        let manager = manager();
        let job = ok_job(&manager, "patient");
        manager.suspend();
        assert!(manager.is_suspended());

        job.schedule().unwrap();
        thread::sleep(Duration::from_millis(50));
        assert_state!(job, JobState::Waiting);
        assert!(!manager.is_idle());

        manager.resume();
        assert!(!manager.is_suspended());
        assert_state!(job, JobState::None, within: TIMEOUT);
        assert!(manager.is_idle());
        manager.shutdown();
    }

    struct Exploding;

    impl JobChangeListener for Exploding {
        fn scheduled(&self, _event: &JobChangeEvent) {
            panic!("scheduled");
        }

        fn about_to_run(&self, _event: &JobChangeEvent) {
            panic!("about to run");
        }

        fn running(&self, _event: &JobChangeEvent) {
            panic!("running");
        }

        fn done(&self, _event: &JobChangeEvent) {
            panic!("done");
        }
    }

    #[test]
    fn panicking_listeners_do_not_disturb_jobs() {
        let manager = manager();
        manager.add_job_change_listener(Arc::new(Exploding));
        let recorder = recording(&manager);
        let job = ok_job(&manager, "resilient");

        job.schedule().unwrap();

        assert!(recorder.wait_for(&job, JobChangeKind::Done, TIMEOUT));
        assert_eq!(job.result(), Some(Status::ok()));
        manager.shutdown();
    }

    #[test]
    fn vetoed_jobs_do_not_run() {
        let manager = manager();
        let recorder = recording(&manager);
        let unrunnable = manager.new_job(
            "unrunnable",
            Reluctant {
                schedule: true,
                run: false,
            },
        );
        let unschedulable = manager.new_job(
            "unschedulable",
            Reluctant {
                schedule: false,
                run: true,
            },
        );

        unrunnable.schedule().unwrap();
        unschedulable.schedule().unwrap();

        assert!(recorder.wait_for(&unrunnable, JobChangeKind::Done, TIMEOUT));
        assert_matches!(unrunnable.result(), Some(status) if status.is_cancel());
        assert_eq!(recorder.count(&unrunnable, JobChangeKind::AboutToRun), 0);
        assert_eq!(recorder.count(&unrunnable, JobChangeKind::Running), 0);
        assert_state!(unschedulable, JobState::None);
        assert!(recorder.events_for(&unschedulable).is_empty());
        manager.shutdown();
    }

    #[test]
    fn jobs_cancelled_before_running_are_ended() {
        struct CancelOnAboutToRun;

        impl JobChangeListener for CancelOnAboutToRun {
            fn about_to_run(&self, event: &JobChangeEvent) {
                assert!(!event.job.cancel());
            }
        }

        let manager = manager();
        let recorder = recording(&manager);
        let executor = GatedExecutor::default();
        let job = manager.new_job("cancelled early", executor.clone());
        job.add_job_change_listener(Arc::new(CancelOnAboutToRun));

        job.schedule().unwrap();

        assert!(recorder.wait_for(&job, JobChangeKind::Done, TIMEOUT));
        assert_matches!(job.result(), Some(status) if status.is_cancel());
        assert_eq!(executor.runs.load(Ordering::SeqCst), 0);
        manager.shutdown();
    }

    #[test]
    fn running_jobs_can_reschedule_themselves() {
        let manager = manager();
        let recorder = recording(&manager);
        let runs = Arc::new(AtomicUsize::new(0));
        let job = manager.new_job("again", {
            let runs = runs.clone();
            move |job: &Job, _monitor: &Monitor| {
                if runs.fetch_add(1, Ordering::SeqCst) == 0 {
                    job.schedule().unwrap();
                }
                ExecutionResult::ok()
            }
        });

        job.schedule().unwrap();

        assert!(wait_until(TIMEOUT, || recorder.count(&job, JobChangeKind::Done) == 2));
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        let reschedules: Vec<bool> = recorder
            .events_for(&job)
            .into_iter()
            .filter(|event| event.kind == JobChangeKind::Done)
            .map(|event| event.reschedule)
            .collect();
        assert_eq!(reschedules, [true, false]);
        let scheduled: Vec<bool> = recorder
            .events_for(&job)
            .into_iter()
            .filter(|event| event.kind == JobChangeKind::Scheduled)
            .map(|event| event.reschedule)
            .collect();
        assert_eq!(scheduled, [false, true]);
        manager.shutdown();
    }

    #[test]
    fn timed_sleepers_wake_behind_indefinite_sleepers() {
        let manager = manager();
        manager.suspend();
        let (forever, timed) = (ok_job(&manager, "forever"), ok_job(&manager, "timed"));
        forever.schedule().unwrap();
        timed.schedule().unwrap();

        // Both carry wait queue stamps, the indefinite sleeper the older one.
        assert!(timed.sleep());
        timed.wake_up_in(TimeDelta::milliseconds(50)).unwrap();
        assert!(forever.sleep());
        let order: Vec<Job> = manager.lock_state().sleeping.iter().cloned().collect();
        assert_eq!(order, [timed.clone(), forever.clone()]);
        manager.resume();

        assert_state!(timed, JobState::None, within: TIMEOUT);
        assert_eq!(timed.result(), Some(Status::ok()));
        assert_state!(forever, JobState::Sleeping);
        assert_eq!(manager.sleep_hint(), None);
        manager.shutdown();
    }

    #[test]
    fn current_job_is_the_one_on_this_thread() {
        let manager = manager();
        let matched = Arc::new(AtomicBool::new(false));
        let job = manager.new_job("introspective", {
            let matched = matched.clone();
            move |job: &Job, _monitor: &Monitor| {
                let current = job.manager().current_job();
                matched.store(current.as_ref() == Some(job), Ordering::SeqCst);
                ExecutionResult::ok()
            }
        });

        job.schedule().unwrap();

        assert_state!(job, JobState::None, within: TIMEOUT);
        assert!(matched.load(Ordering::SeqCst));
        assert!(manager.current_job().is_none());
        manager.shutdown();
    }

    #[test]
    fn urgent_waiters_make_running_jobs_blocking() {
        let manager = manager();
        let rule = MutexRule::new("contended").into_rule();
        let (holder, holder_executor) = gated_job(&manager, "holder", Some(&rule));
        let waiter = |system: bool| {
            let mut builder = JobBuilder::new("waiter")
                .with_priority(Priority::Interactive)
                .with_rule(rule.clone());
            if system {
                builder = builder.system();
            }
            builder
                .build(&manager, |_job: &Job, _monitor: &Monitor| ExecutionResult::ok())
                .unwrap()
        };
        holder.schedule().unwrap();
        running(&holder, &holder_executor);

        let system = waiter(true);
        system.schedule().unwrap();
        assert!(wait_until(TIMEOUT, || system.internal_state() == InternalState::Blocked));
        assert!(!holder.is_blocking());
        assert!(system.cancel());

        let user = waiter(false);
        user.schedule().unwrap();
        assert!(wait_until(TIMEOUT, || user.internal_state() == InternalState::Blocked));
        assert!(holder.is_blocking());

        holder_executor.gate.open();
        assert_state!(user, JobState::None, within: TIMEOUT);
        assert!(!holder.is_blocking());
        assert_eq!(system.result(), None);
        manager.shutdown();
    }

    #[test]
    fn rules_are_validated() {
        let manager = manager();
        let job = ok_job(&manager, "ruled");

        assert_matches!(
            job.set_rule(Some(Arc::new(ForgetfulRule))),
            Err(JobsError::InvalidRule(_))
        );
        assert_matches!(
            job.set_rule(Some(Arc::new(GreedyRule))),
            Err(JobsError::InvalidRule(_))
        );
        assert!(job.rule().is_none());

        job.set_rule(Some(MutexRule::new("valid").into_rule())).unwrap();
        assert!(job.rule().is_some());
        job.set_rule(None).unwrap();
        assert!(job.rule().is_none());
        manager.shutdown();
    }

    #[derive(Default)]
    struct CountingMonitor {
        worked: AtomicUsize,
        canceled: AtomicBool,
    }

    impl ProgressMonitor for CountingMonitor {
        fn begin_task(&self, _name: &str, _total_work: Option<u32>) {}

        fn worked(&self, work: u32) {
            self.worked.fetch_add(work as usize, Ordering::SeqCst);
        }

        fn done(&self) {}

        fn is_canceled(&self) -> bool {
            self.canceled.load(Ordering::SeqCst)
        }

        fn set_canceled(&self, canceled: bool) {
            self.canceled.store(canceled, Ordering::SeqCst);
        }
    }

    struct SharedProvider(Arc<CountingMonitor>);

    impl ProgressProvider for SharedProvider {
        fn create_monitor(&self, _job: &Job) -> Option<Monitor> {
            Some(self.0.clone())
        }

        fn create_progress_group(&self) -> Option<Monitor> {
            Some(self.0.clone())
        }
    }

    #[test]
    fn progress_provider_supplies_monitors() {
        let manager = manager();
        let monitor = Arc::new(CountingMonitor::default());
        manager.set_progress_provider(Some(Arc::new(SharedProvider(monitor.clone()))));
        let job = manager.new_job("reporting", |_job: &Job, monitor: &Monitor| {
            monitor.begin_task("reporting", Some(3));
            monitor.worked(3);
            monitor.done();
            ExecutionResult::ok()
        });

        job.schedule().unwrap();

        assert_state!(job, JobState::None, within: TIMEOUT);
        assert_eq!(monitor.worked.load(Ordering::SeqCst), 3);
        manager.create_progress_group().worked(2);
        assert_eq!(monitor.worked.load(Ordering::SeqCst), 5);
        assert!(!manager.default_monitor().is_canceled());

        manager.set_progress_provider(None);
        manager.create_progress_group().worked(2);
        assert_eq!(monitor.worked.load(Ordering::SeqCst), 5);
        manager.shutdown();
    }

    #[test]
    fn scheduling_twice_queues_once() {
        let manager = manager();
        let recorder = recording(&manager);
        let job = ok_job(&manager, "once");
        manager.suspend();

        job.schedule().unwrap();
        job.schedule().unwrap();
        job.schedule_in(TimeDelta::seconds(1)).unwrap();

        assert_eq!(recorder.count(&job, JobChangeKind::Scheduled), 1);
        assert_eq!(manager.queued(), 1);
        manager.shutdown();
    }
}
