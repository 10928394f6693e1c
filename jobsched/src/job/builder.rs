use crate::{
    executor::Executor,
    job::{Job, JobFields, Priority},
    manager::JobManager,
    rule::Rule,
    JobsError,
};

/// Configures a [`Job`] before it is created.
///
/// # Example
///
/// ```
/// # use jobsched::prelude::*;
/// let manager = JobManager::new();
/// let rule = MutexRule::new("index").into_rule();
///
/// let job = JobBuilder::new("reindex")
///     .with_priority(Priority::Build)
///     .with_rule(rule)
///     .system()
///     .build(&manager, |_job: &Job, _monitor: &Monitor| ExecutionResult::ok())
///     .unwrap();
///
/// assert_eq!(job.priority(), Priority::Build);
/// assert!(job.is_system());
/// # manager.shutdown();
/// ```
#[derive(Debug, Default)]
pub struct JobBuilder {
    name: String,
    priority: Priority,
    rule: Option<Rule>,
    system: bool,
    user: bool,
}

impl JobBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_priority(self, priority: Priority) -> Self {
        Self { priority, ..self }
    }

    pub fn with_rule(self, rule: Rule) -> Self {
        Self {
            rule: Some(rule),
            ..self
        }
    }

    pub fn system(self) -> Self {
        Self {
            system: true,
            ..self
        }
    }

    pub fn user(self) -> Self {
        Self { user: true, ..self }
    }

    /// Creates the job on `manager`.
    ///
    /// Fails with [`JobsError::InvalidRule`] if the rule does not obey the [`crate::rule`]
    /// contract.
    pub fn build(self, manager: &JobManager, executor: impl Executor) -> Result<Job, JobsError> {
        if let Some(rule) = &self.rule {
            manager.validate_rule(rule)?;
        }
        Ok(Job::new(
            manager.clone(),
            JobFields {
                name: self.name,
                priority: self.priority,
                rule: self.rule,
                system: self.system,
                user: self.user,
                ..Default::default()
            },
            Box::new(executor),
        ))
    }
}
