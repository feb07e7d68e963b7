//! Background work queue for the inference scheduler. Plain FIFO with one
//! twist: the head may be invalidated in place while a pass for it is in
//! flight, so the pass can finish and be discarded atomically.

use std::collections::VecDeque;

use crate::tree::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Score,
    Predict,
    Branch,
}

impl JobKind {
    fn is_prediction(self) -> bool {
        matches!(self, JobKind::Predict | JobKind::Branch)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Job {
    pub kind: JobKind,
    pub target: NodeId,
    /// Target depth at enqueue time; purges match against this even if the
    /// node has since been relocated.
    pub depth: usize,
    /// How many follow-up jobs this one may spawn down the chain.
    pub budget: i32,
}

#[derive(Default)]
pub struct WorkQueue {
    jobs: VecDeque<Job>,
    head_invalid: bool,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn head(&self) -> Option<&Job> {
        self.jobs.front()
    }

    pub fn head_invalid(&self) -> bool {
        self.head_invalid
    }

    pub fn pop_head(&mut self) -> Option<Job> {
        self.head_invalid = false;
        self.jobs.pop_front()
    }

    /// Append; runs after everything already queued.
    pub fn push_back(&mut self, job: Job) {
        self.jobs.push_back(job);
    }

    /// Run as soon as possible without disturbing an in-flight head.
    pub fn push_after_head(&mut self, job: Job, pass_in_flight: bool) {
        if !pass_in_flight || self.jobs.is_empty() {
            self.jobs.push_front(job);
        } else {
            self.jobs.insert(1, job);
        }
    }

    /// Drop queued work at or below `start_depth`. The in-flight head cannot
    /// be removed; it is flagged so its result will be discarded.
    pub fn purge_at_or_below(&mut self, start_depth: usize, pass_in_flight: bool) {
        if self.jobs.is_empty() {
            return;
        }
        if pass_in_flight {
            if self.jobs[0].depth >= start_depth {
                self.head_invalid = true;
            }
            let head = self.jobs.pop_front();
            self.jobs.retain(|j| j.depth < start_depth);
            if let Some(head) = head {
                self.jobs.push_front(head);
            }
        } else {
            self.jobs.retain(|j| j.depth < start_depth);
        }
    }

    /// Drop queued exploration work; the frontier it was mapping is stale.
    /// A prediction head in flight is flagged for discard.
    pub fn purge_predictions(&mut self, pass_in_flight: bool) {
        if self.jobs.is_empty() {
            return;
        }
        if pass_in_flight {
            if self.jobs[0].kind.is_prediction() {
                self.head_invalid = true;
            }
            let head = self.jobs.pop_front();
            self.jobs.retain(|j| !j.kind.is_prediction());
            if let Some(head) = head {
                self.jobs.push_front(head);
            }
        } else {
            self.jobs.retain(|j| !j.kind.is_prediction());
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Job> {
        self.jobs.iter()
    }
}
