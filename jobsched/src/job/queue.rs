//! The manager's job queues.
//!
//! [`JobQueue`] is a circular doubly linked list threaded through a sentinel, ordered by start
//! time with ties broken by arrival. [`BlockedChains`] records which waiting jobs are parked
//! behind which running job.
use std::collections::VecDeque;

use fxhash::FxHashMap;

use crate::{
    job::{Job, JobId, StartTime},
    rule::{conflicting, Rule},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Slot {
    Sentinel,
    Job(JobId),
}

/// Link towards the head is `next`, towards the back is `previous`.
struct Node {
    job: Option<Job>,
    next: Slot,
    previous: Slot,
}

/// The ordering-relevant fields of a job, copied out so that two jobs are never locked at
/// once.
struct Entry {
    id: JobId,
    start_time: StartTime,
    stamp: Option<u64>,
    rule: Option<Rule>,
}

impl Entry {
    fn of(job: &Job) -> Self {
        job.with_fields(|fields| Self {
            id: job.id(),
            start_time: fields.start_time,
            stamp: fields.wait_queue_stamp,
            rule: fields.rule.clone(),
        })
    }
}

pub(crate) struct JobQueue {
    nodes: FxHashMap<Slot, Node>,
    allow_conflict_overtaking: bool,
}

impl JobQueue {
    /// A queue where a job may only overtake jobs it does not conflict with when
    /// `allow_conflict_overtaking` is `false`.
    pub(crate) fn new(allow_conflict_overtaking: bool) -> Self {
        let mut nodes = FxHashMap::default();
        nodes.insert(
            Slot::Sentinel,
            Node {
                job: None,
                next: Slot::Sentinel,
                previous: Slot::Sentinel,
            },
        );
        Self {
            nodes,
            allow_conflict_overtaking,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.nodes.len() == 1
    }

    pub(crate) fn len(&self) -> usize {
        self.nodes.len() - 1
    }

    pub(crate) fn contains(&self, id: JobId) -> bool {
        self.nodes.contains_key(&Slot::Job(id))
    }

    /// Inserts `job` behind every job it may not overtake.
    pub(crate) fn enqueue(&mut self, job: Job) {
        let new = Entry::of(&job);
        if self.contains(new.id) {
            tracing::warn!(job_id = %new.id, "Job {} is already queued", new.id);
            return;
        }

        let mut tail = self.next(Slot::Sentinel);
        while self.can_overtake(&new, tail) {
            tail = self.next(tail);
        }

        let tail_previous = self.previous(tail);
        self.nodes.insert(
            Slot::Job(new.id),
            Node {
                job: Some(job),
                next: tail,
                previous: tail_previous,
            },
        );
        self.link(tail_previous, tail, Slot::Job(new.id));
    }

    /// Removes and returns the job at the head of the queue.
    pub(crate) fn dequeue(&mut self) -> Option<Job> {
        match self.previous(Slot::Sentinel) {
            Slot::Sentinel => None,
            Slot::Job(id) => self.remove(id),
        }
    }

    /// The job at the head of the queue.
    pub(crate) fn peek(&self) -> Option<Job> {
        match self.previous(Slot::Sentinel) {
            Slot::Sentinel => None,
            slot => self.nodes.get(&slot).and_then(|node| node.job.clone()),
        }
    }

    pub(crate) fn remove(&mut self, id: JobId) -> Option<Job> {
        let node = self.nodes.remove(&Slot::Job(id))?;
        if let Some(next) = self.nodes.get_mut(&node.next) {
            next.previous = node.previous;
        }
        if let Some(previous) = self.nodes.get_mut(&node.previous) {
            previous.next = node.next;
        }
        node.job
    }

    /// Moves a queued job to the position matching its current fields.
    pub(crate) fn resort(&mut self, id: JobId) {
        if let Some(job) = self.remove(id) {
            self.enqueue(job);
        }
    }

    /// Jobs from the head of the queue to its back.
    pub(crate) fn iter(&self) -> impl Iterator<Item = &Job> + '_ {
        let mut slot = self.previous(Slot::Sentinel);
        std::iter::from_fn(move || {
            let node = self.nodes.get(&slot).filter(|_| slot != Slot::Sentinel)?;
            slot = node.previous;
            node.job.as_ref()
        })
    }

    /// Empties the queue, returning its jobs head first.
    pub(crate) fn clear(&mut self) -> Vec<Job> {
        let jobs = self.iter().cloned().collect();
        self.nodes.retain(|slot, _| *slot == Slot::Sentinel);
        if let Some(sentinel) = self.nodes.get_mut(&Slot::Sentinel) {
            sentinel.next = Slot::Sentinel;
            sentinel.previous = Slot::Sentinel;
        }
        jobs
    }

    fn can_overtake(&self, new: &Entry, slot: Slot) -> bool {
        let Some(existing) = self.nodes.get(&slot).and_then(|node| node.job.as_ref()) else {
            return false;
        };
        let existing = Entry::of(existing);

        if new.id == existing.id {
            return false;
        }
        // Jobs returning to the queue regain their place ahead of later arrivals, unless those
        // are now due first.
        if let (Some(new_stamp), Some(existing_stamp)) = (new.stamp, existing.stamp) {
            if new_stamp < existing_stamp && !new.start_time.is_after(&existing.start_time) {
                return true;
            }
        }
        if !existing.start_time.is_after(&new.start_time) {
            return false;
        }
        self.allow_conflict_overtaking
            || !conflicting(new.rule.as_ref(), existing.rule.as_ref())
    }

    fn next(&self, slot: Slot) -> Slot {
        self.nodes
            .get(&slot)
            .map_or(Slot::Sentinel, |node| node.next)
    }

    fn previous(&self, slot: Slot) -> Slot {
        self.nodes
            .get(&slot)
            .map_or(Slot::Sentinel, |node| node.previous)
    }

    fn link(&mut self, previous: Slot, next: Slot, new: Slot) {
        if let Some(node) = self.nodes.get_mut(&previous) {
            node.next = new;
        }
        if let Some(node) = self.nodes.get_mut(&next) {
            node.previous = new;
        }
    }
}

/// Waiting jobs parked behind the running job they conflict with.
///
/// Each chain belongs to a running job. A job found conflicting with a job which is itself
/// blocked joins the chain of that job's owner, so freeing a running job releases everything
/// queued behind it in arrival order.
#[derive(Default)]
pub(crate) struct BlockedChains {
    chains: FxHashMap<JobId, VecDeque<Job>>,
    owner: FxHashMap<JobId, JobId>,
}

impl BlockedChains {
    pub(crate) fn block_behind(&mut self, blocker: JobId, job: Job) {
        let owner = self.owner.get(&blocker).copied().unwrap_or(blocker);
        self.owner.insert(job.id(), owner);
        self.chains.entry(owner).or_default().push_back(job);
    }

    pub(crate) fn unblock(&mut self, id: JobId) -> Option<Job> {
        let owner = self.owner.remove(&id)?;
        let chain = self.chains.get_mut(&owner)?;
        let position = chain.iter().position(|job| job.id() == id)?;
        let job = chain.remove(position);
        if chain.is_empty() {
            self.chains.remove(&owner);
        }
        job
    }

    /// Detaches and returns the chain of a running job.
    pub(crate) fn release(&mut self, running: JobId) -> VecDeque<Job> {
        let chain = self.chains.remove(&running).unwrap_or_default();
        for job in &chain {
            self.owner.remove(&job.id());
        }
        chain
    }

    /// The jobs blocked behind `running`, oldest first.
    pub(crate) fn blocked_by(&self, running: JobId) -> impl Iterator<Item = &Job> + '_ {
        self.chains.get(&running).into_iter().flatten()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Job> + '_ {
        self.chains.values().flatten()
    }

    pub(crate) fn len(&self) -> usize {
        self.owner.len()
    }

    pub(crate) fn clear(&mut self) -> Vec<Job> {
        self.owner.clear();
        self.chains.drain().flat_map(|(_, chain)| chain).collect()
    }
}
