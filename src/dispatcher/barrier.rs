//! Epoch accounting: drain barrier and error aggregation.
//!
//! An epoch opens when a job is submitted to an idle dispatcher and closes
//! the moment nothing is waiting or pending. Every caller of
//! `Dispatcher::drained()` during an epoch registers on that epoch's
//! barrier and is released with the same outcome when it closes.

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::error::{DispatchError, FailedJobs, JobError};

pub(crate) type DrainResult = Result<(), DispatchError>;

/// Completion signal of one epoch.
#[derive(Debug, Default)]
pub(crate) struct DrainBarrier {
    waiters: Vec<oneshot::Sender<DrainResult>>,
}

impl DrainBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a waiter to be released when the epoch closes.
    pub fn register(&mut self, waiter: oneshot::Sender<DrainResult>) {
        self.waiters.push(waiter);
    }

    pub fn waiters(&self) -> usize {
        self.waiters.len()
    }

    /// Releases every waiter with `result`.
    pub fn settle(self, result: DrainResult) {
        for waiter in self.waiters {
            // A waiter that stopped listening is not an error.
            let _ = waiter.send(result.clone());
        }
    }
}

/// Ordered list of terminal failures of one epoch.
#[derive(Debug, Default)]
pub(crate) struct ErrorAggregator {
    errors: Vec<JobError>,
}

impl ErrorAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, error: JobError) {
        self.errors.push(error);
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// `Ok(())` when nothing failed, otherwise every failure in order.
    pub fn into_result(self, epoch: Uuid) -> DrainResult {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(DispatchError::JobsFailed(FailedJobs::new(epoch, self.errors)))
        }
    }
}

/// One accounting period of the dispatcher.
#[derive(Debug)]
pub(crate) struct Epoch {
    pub id: Uuid,
    pub opened_at: DateTime<Utc>,
    pub barrier: DrainBarrier,
    pub errors: ErrorAggregator,
    /// Jobs submitted during this epoch.
    pub submitted: u64,
}

impl Epoch {
    pub fn open() -> Self {
        Self {
            id: Uuid::new_v4(),
            opened_at: Utc::now(),
            barrier: DrainBarrier::new(),
            errors: ErrorAggregator::new(),
            submitted: 0,
        }
    }

    /// Settles the barrier with the aggregated outcome and returns it.
    pub fn close(self) -> DrainResult {
        let result = self.errors.into_result(self.id);
        self.barrier.settle(result.clone());
        result
    }

    /// Settles the barrier with an outcome unrelated to job results.
    pub fn abort(self, error: DispatchError) {
        self.barrier.settle(Err(error));
    }
}
