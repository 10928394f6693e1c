//! Tuning for a [`crate::JobManager`] and its worker pool.
//!
//! The defaults suit most applications. [`ManagerConfig`] can also be loaded from any serde
//! format, with missing fields taking their defaults and durations given in milliseconds:
//!
//! ```
//! # use std::time::Duration;
//! # use jobsched::config::ManagerConfig;
//! let config: ManagerConfig =
//!     serde_json::from_str(r#"{ "max_workers": 4, "idle_timeout": 5000 }"#).unwrap();
//!
//! assert_eq!(config.max_workers, 4);
//! assert_eq!(config.idle_timeout, Duration::from_secs(5));
//! assert_eq!(config.min_workers, ManagerConfig::default().min_workers);
//! ```
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Workers kept alive while idle.
    pub min_workers: usize,
    /// Upper bound on the number of worker threads.
    pub max_workers: usize,
    /// How long a worker above the minimum waits for work before exiting.
    #[serde(with = "millis")]
    pub idle_timeout: Duration,
    /// Interval between checks for running jobs to finish during shutdown.
    #[serde(with = "millis")]
    pub shutdown_wait: Duration,
    /// Number of intervals shutdown waits before abandoning running jobs.
    pub shutdown_attempts: u32,
    pub thread_name_prefix: String,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            min_workers: 1,
            max_workers: 16,
            idle_timeout: Duration::from_secs(60),
            shutdown_wait: Duration::from_millis(100),
            shutdown_attempts: 3,
            thread_name_prefix: "jobsched-worker".to_owned(),
        }
    }
}

impl ManagerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_min_workers(self, min_workers: usize) -> Self {
        Self {
            min_workers,
            ..self
        }
    }

    pub fn with_max_workers(self, max_workers: usize) -> Self {
        Self {
            max_workers,
            ..self
        }
    }

    pub fn with_idle_timeout(self, idle_timeout: Duration) -> Self {
        Self {
            idle_timeout,
            ..self
        }
    }

    pub fn with_shutdown_wait(self, shutdown_wait: Duration, shutdown_attempts: u32) -> Self {
        Self {
            shutdown_wait,
            shutdown_attempts,
            ..self
        }
    }

    pub fn with_thread_name_prefix(self, prefix: impl Into<String>) -> Self {
        Self {
            thread_name_prefix: prefix.into(),
            ..self
        }
    }

    /// The bounds actually enforced by the pool: at least one worker may run.
    pub(crate) fn worker_bounds(&self) -> (usize, usize) {
        let max = self.max_workers.max(1);
        (self.min_workers.min(max), max)
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
