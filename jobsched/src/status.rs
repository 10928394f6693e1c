use std::fmt::Display;

use serde::{Deserialize, Serialize};

use crate::job::JobId;

/// How a job's run turned out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Ok,
    Info,
    Warning,
    Error,
    Cancel,
}

/// The outcome of a job run, stored as the job's result and delivered to `done` listeners.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub severity: Severity,
    pub message: String,
    pub job: Option<JobId>,
}

impl Status {
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            severity,
            message: message.into(),
            job: None,
        }
    }

    pub fn ok() -> Self {
        Self::new(Severity::Ok, "ok")
    }

    pub fn cancel() -> Self {
        Self::new(Severity::Cancel, "cancelled")
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(Severity::Info, message)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(Severity::Warning, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(Severity::Error, message)
    }

    /// Attribute this status to a job.
    pub fn for_job(self, job: JobId) -> Self {
        Self {
            job: Some(job),
            ..self
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self.severity, Severity::Ok | Severity::Info)
    }

    pub fn is_cancel(&self) -> bool {
        self.severity == Severity::Cancel
    }
}

impl Default for Status {
    fn default() -> Self {
        Self::ok()
    }
}

impl Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.job {
            Some(job) => write!(f, "{:?} ({job}): {}", self.severity, self.message),
            None => write!(f, "{:?}: {}", self.severity, self.message),
        }
    }
}
