//! Waiting queue and concurrency gate.
//!
//! The waiting queue is an unbounded FIFO of jobs that have been submitted
//! but not admitted. The gate tracks how many admitted jobs are in flight and
//! refuses admission once the configured limit is reached. Neither type is
//! shared: both are owned by the dispatch loop.

use std::collections::VecDeque;

use super::job::Job;

/// FIFO of submitted, not yet admitted jobs.
#[derive(Debug, Default)]
pub(crate) struct WaitingQueue {
    jobs: VecDeque<Job>,
}

impl WaitingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, job: Job) {
        self.jobs.push_back(job);
    }

    /// Removes the oldest waiting job.
    pub fn pop(&mut self) -> Option<Job> {
        self.jobs.pop_front()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Removes every waiting job, oldest first.
    pub fn drain(&mut self) -> impl Iterator<Item = Job> + '_ {
        self.jobs.drain(..)
    }
}

/// Counting gate enforcing `in_flight <= limit`.
#[derive(Debug)]
pub(crate) struct ConcurrencyGate {
    limit: usize,
    in_flight: usize,
    peak: usize,
}

impl ConcurrencyGate {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            in_flight: 0,
            peak: 0,
        }
    }

    /// Takes a slot if one is free.
    pub fn try_acquire(&mut self) -> bool {
        if self.in_flight >= self.limit {
            return false;
        }
        self.in_flight += 1;
        self.peak = self.peak.max(self.in_flight);
        true
    }

    /// Returns a slot. Releasing more than was acquired is a bookkeeping bug.
    pub fn release(&mut self) -> bool {
        match self.in_flight.checked_sub(1) {
            Some(n) => {
                self.in_flight = n;
                true
            }
            None => false,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Highest `in_flight` value ever observed.
    pub fn peak(&self) -> usize {
        self.peak
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}
