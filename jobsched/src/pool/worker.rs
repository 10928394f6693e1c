use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
};

use tracing::instrument;

use crate::{
    executor::{panic_message, ExecutionResult, OperationCanceled},
    job::Job,
    monitor::NullProgressMonitor,
    status::{Severity, Status},
};

use super::{WorkerId, WorkerPool};

pub(crate) struct Worker {
    id: WorkerId,
    pool: Arc<WorkerPool>,
}

/// Deregisters the worker however its thread ends.
struct Retire<'a> {
    id: WorkerId,
    pool: &'a WorkerPool,
}

impl Drop for Retire<'_> {
    fn drop(&mut self) {
        self.pool.end_worker(self.id);
        tracing::debug!(worker = %self.id, "Worker {} exited", self.id);
    }
}

impl Worker {
    pub(crate) fn new(id: WorkerId, pool: Arc<WorkerPool>) -> Self {
        Self { id, pool }
    }

    pub(crate) fn run(self) {
        let _retire = Retire {
            id: self.id,
            pool: &self.pool,
        };
        while let Some(job) = self.pool.start_job(self.id) {
            let result = self.execute(&job);
            self.pool.end_job(&job, result);
        }
    }

    #[instrument(skip(self, job), fields(worker = %self.id, job_id = %job.id()))]
    fn execute(&self, job: &Job) -> ExecutionResult {
        let job_id = job.id();
        let name = job.name();
        let monitor = job
            .with_fields(|fields| fields.monitor.clone())
            .unwrap_or_else(NullProgressMonitor::shared);

        tracing::debug!(%job_id, "Executing job {job_id}");
        let result = catch_unwind(AssertUnwindSafe(|| job.executor().run(job, &monitor)))
            .unwrap_or_else(|panic| {
                if panic.is::<OperationCanceled>() {
                    return ExecutionResult::Completed(Status::cancel());
                }
                let message = panic_message(panic.as_ref());
                ExecutionResult::Completed(
                    Status::error(format!(
                        "An internal error occurred during: \"{name}\": {message}"
                    ))
                    .for_job(job_id),
                )
            });

        if let ExecutionResult::Completed(status) = &result {
            match status.severity {
                Severity::Error => tracing::error!(
                    %job_id,
                    job = %name,
                    "Job {job_id} failed: {}",
                    status.message
                ),
                Severity::Warning => tracing::warn!(
                    %job_id,
                    job = %name,
                    "Job {job_id} completed with a warning: {}",
                    status.message
                ),
                _ => {}
            }
        }
        result
    }
}
