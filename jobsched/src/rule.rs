//! Scheduling rules establish mutual exclusion between jobs.
//!
//! A job may carry a [`SchedulingRule`]. The [`crate::JobManager`] guarantees that two jobs
//! whose rules conflict are never running at the same time. Rules are shared between jobs via
//! [`Rule`], an `Arc<dyn SchedulingRule>`.
//!
//! Implementations must obey a small algebra which is checked by
//! [`crate::JobManager::validate_rule`] whenever a rule is attached to a job:
//!
//! - [`SchedulingRule::contains`] is reflexive, antisymmetric and transitive,
//! - [`SchedulingRule::is_conflicting`] is reflexive and symmetric, and
//! - both return `false` for rule types the implementation does not recognise.
//!
//! # Example
//!
//! ```
//! # use jobsched::rule::{MutexRule, Rule, SchedulingRule};
//! let database: Rule = MutexRule::new("database").into_rule();
//! let same_database = database.clone();
//! let cache: Rule = MutexRule::new("cache").into_rule();
//!
//! assert!(database.is_conflicting(same_database.as_ref()));
//! assert!(!database.is_conflicting(cache.as_ref()));
//! ```
use std::{
    any::Any,
    fmt::Debug,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

/// A shared handle to a scheduling rule.
pub type Rule = Arc<dyn SchedulingRule>;

/// Upcast helper enabling rules to recognise their own kind via [`Any::downcast_ref`].
pub trait AsAny {
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A conflict predicate over some abstract resource.
pub trait SchedulingRule: AsAny + Debug + Send + Sync + 'static {
    /// Whether this rule contains `other`, i.e. a thread owning this rule may also acquire
    /// `other`.
    fn contains(&self, other: &dyn SchedulingRule) -> bool;

    /// Whether a job with this rule may not run at the same time as a job with `other`.
    fn is_conflicting(&self, other: &dyn SchedulingRule) -> bool;
}

/// Two optional rules conflict if either side declares the conflict.
pub(crate) fn conflicting(a: Option<&Rule>, b: Option<&Rule>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a.is_conflicting(b.as_ref()) || b.is_conflicting(a.as_ref()),
        _ => false,
    }
}

static MUTEX_RULE_IDS: AtomicU64 = AtomicU64::new(0);

/// An exclusive resource.
///
/// Clones of a [`MutexRule`] share its identity and conflict with one another. Two rules
/// created by separate calls to [`MutexRule::new`] never conflict, even when given the same
/// name; the name is only used for diagnostics.
#[derive(Debug, Clone)]
pub struct MutexRule {
    id: u64,
    name: Arc<str>,
}

impl MutexRule {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self {
            id: MUTEX_RULE_IDS.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn into_rule(self) -> Rule {
        Arc::new(self)
    }

    fn same_resource(&self, other: &dyn SchedulingRule) -> bool {
        other
            .as_any()
            .downcast_ref::<Self>()
            .is_some_and(|other| other.id == self.id)
    }
}

impl SchedulingRule for MutexRule {
    fn contains(&self, other: &dyn SchedulingRule) -> bool {
        self.same_resource(other)
    }

    fn is_conflicting(&self, other: &dyn SchedulingRule) -> bool {
        self.same_resource(other)
    }
}

/// A rule no client can know about, used to check the closed-world property of client rules.
#[derive(Debug)]
pub(crate) struct UnknownRule;

impl SchedulingRule for UnknownRule {
    fn contains(&self, other: &dyn SchedulingRule) -> bool {
        other.as_any().is::<Self>()
    }

    fn is_conflicting(&self, other: &dyn SchedulingRule) -> bool {
        other.as_any().is::<Self>()
    }
}
