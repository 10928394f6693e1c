//! Worker threads which pull jobs from the manager.
//!
//! The pool grows on demand when jobs are queued while every worker is busy, up to a limit
//! derived from the amount of queued work and capped by [`ManagerConfig::max_workers`].
//! Workers above [`ManagerConfig::min_workers`] which find nothing to do for
//! [`ManagerConfig::idle_timeout`] exit.
use std::{
    fmt::Display,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use fxhash::FxHashSet;
use parking_lot::{Condvar, Mutex};

use crate::{
    config::ManagerConfig, executor::ExecutionResult, job::Job, manager::WeakManager,
};

pub(crate) mod worker;

use worker::Worker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct WorkerId(u64);

impl Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Default)]
struct PoolState {
    active: bool,
    busy: usize,
    sleeping: usize,
    /// A job was queued while no worker was asleep to take it.
    pending: bool,
    workers: FxHashSet<WorkerId>,
    next_id: u64,
}

pub(crate) struct WorkerPool {
    manager: WeakManager,
    state: Mutex<PoolState>,
    condvar: Condvar,
    config: ManagerConfig,
}

impl WorkerPool {
    pub(crate) fn new(manager: WeakManager, config: ManagerConfig) -> Self {
        Self {
            manager,
            state: Mutex::new(PoolState {
                active: true,
                ..Default::default()
            }),
            condvar: Condvar::new(),
            config,
        }
    }

    pub(crate) fn worker_count(&self) -> usize {
        self.state.lock().workers.len()
    }

    /// Called whenever work may have become available, with the number of queued jobs.
    pub(crate) fn job_queued(self: &Arc<Self>, queued: usize) {
        let mut state = self.state.lock();
        if !state.active {
            return;
        }
        if state.sleeping > 0 {
            self.condvar.notify_one();
            return;
        }
        state.pending = true;

        let (min, max) = self.config.worker_bounds();
        let workers = state.workers.len();
        if state.busy >= workers && workers < (state.busy + queued).clamp(min, max) {
            self.spawn_worker(&mut state);
        }
    }

    /// Finds a job for `worker`, waiting for one to become available.
    ///
    /// Returns `None` when the worker should exit: the pool was shut down or the worker was
    /// idle for too long while enough others are.
    pub(crate) fn start_job(self: &Arc<Self>, worker: WorkerId) -> Option<Job> {
        {
            let mut state = self.state.lock();
            if !state.active {
                Self::remove_worker(&mut state, worker);
                return None;
            }
            state.busy += 1;
        }

        let job = self.find_job(worker);
        if job.is_none() {
            self.decrement_busy();
        }
        job
    }

    fn find_job(self: &Arc<Self>, worker: WorkerId) -> Option<Job> {
        let mut job = self.manager.upgrade()?.start_job();
        let idle_since = Instant::now();

        while job.is_none() {
            let manager = self.manager.upgrade().filter(|manager| manager.is_active())?;
            let hint = manager.sleep_hint().unwrap_or(self.config.idle_timeout);
            drop(manager);
            if !hint.is_zero() {
                self.sleep(hint.min(self.config.idle_timeout));
            }
            job = self.manager.upgrade()?.start_job();

            if job.is_none() && idle_since.elapsed() > self.config.idle_timeout {
                let mut state = self.state.lock();
                // This worker still counts as busy.
                let idle = state.workers.len().saturating_sub(state.busy) + 1;
                if idle > self.config.worker_bounds().0 {
                    tracing::debug!(%worker, "Worker {worker} idle for too long, retiring");
                    Self::remove_worker(&mut state, worker);
                    return None;
                }
            }
        }

        // More jobs are ready, make sure someone else picks them up.
        if let Some(manager) = self.manager.upgrade() {
            if manager.sleep_hint() == Some(Duration::ZERO) {
                self.job_queued(manager.queued());
            }
        }
        job
    }

    /// Hands the outcome of a run back to the manager.
    pub(crate) fn end_job(&self, job: &Job, result: ExecutionResult) {
        self.decrement_busy();
        match result {
            ExecutionResult::Completed(status) => job.manager().end_job(job, status, true),
            ExecutionResult::PendingAsync => {
                let current = thread::current().id();
                job.update(|fields| {
                    if fields.thread.as_ref().is_some_and(|thread| thread.id() == current) {
                        fields.thread = None;
                    }
                });
                let job_id = job.id();
                tracing::debug!(%job_id, "Job {job_id} continues asynchronously");
            }
        }
    }

    pub(crate) fn end_worker(&self, worker: WorkerId) {
        Self::remove_worker(&mut self.state.lock(), worker);
    }

    pub(crate) fn shutdown(&self) {
        let mut state = self.state.lock();
        if !state.active {
            return;
        }
        tracing::debug!("Shutting down worker pool of {} workers", state.workers.len());
        state.active = false;
        self.condvar.notify_all();
    }

    fn sleep(&self, duration: Duration) {
        let mut state = self.state.lock();
        if std::mem::take(&mut state.pending) || !state.active {
            return;
        }
        state.sleeping += 1;
        state.busy = state.busy.saturating_sub(1);
        self.condvar.wait_for(&mut state, duration);
        state.sleeping -= 1;
        state.busy += 1;
    }

    fn decrement_busy(&self) {
        let mut state = self.state.lock();
        state.busy = state.busy.saturating_sub(1);
    }

    fn remove_worker(state: &mut PoolState, worker: WorkerId) {
        state.workers.remove(&worker);
    }

    fn spawn_worker(self: &Arc<Self>, state: &mut PoolState) {
        let id = WorkerId(state.next_id);
        state.next_id += 1;
        let worker = Worker::new(id, self.clone());
        let spawned = thread::Builder::new()
            .name(format!("{}-{id}", self.config.thread_name_prefix))
            .spawn(move || worker.run());

        match spawned {
            Ok(_) => {
                state.workers.insert(id);
                tracing::debug!(worker = %id, "Spawned worker {id}");
            }
            Err(error) => {
                tracing::error!(?error, "Failed to spawn worker thread: {error}");
            }
        }
    }
}
