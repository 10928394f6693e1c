//! The purpose of this module is to alleviate the need to import many of the [`crate`] types.
//!
//! ```
//! # #![allow(unused_imports)]
//! use jobsched::prelude::*;
//! ```
pub use crate::config::ManagerConfig;
pub use crate::executor::{ExecutionResult, Executor, OperationCanceled};
pub use crate::job::builder::JobBuilder;
pub use crate::job::{Job, JobId, JobState, Priority};
pub use crate::listener::{JobChangeEvent, JobChangeKind, JobChangeListener, Listener};
pub use crate::manager::JobManager;
pub use crate::monitor::{Monitor, NullProgressMonitor, ProgressMonitor, ProgressProvider};
pub use crate::rule::{MutexRule, Rule, SchedulingRule};
pub use crate::status::{Severity, Status};
pub use crate::JobsError;
