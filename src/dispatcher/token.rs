//! Cooperative cancellation context handed to every job attempt.
//!
//! The dispatcher never aborts a job. When an attempt times out its token is
//! cancelled with a [`TimeoutError`]; the job is expected to notice (via
//! [`CancelToken::cancelled`], [`CancelToken::check`] or
//! [`CancelToken::run_until_cancelled`]) and stop without reporting a result.

use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use super::job::JobId;
use crate::error::TimeoutError;

/// Cancellation signal and deadline of one job attempt.
#[derive(Debug, Clone)]
pub struct CancelToken {
    job_id: JobId,
    attempt: u32,
    deadline: Instant,
    inner: CancellationToken,
    reason: Arc<OnceLock<TimeoutError>>,
}

impl CancelToken {
    pub(crate) fn new(job_id: JobId, attempt: u32, timeout: Duration) -> Self {
        Self {
            job_id,
            attempt,
            deadline: Instant::now() + timeout,
            inner: CancellationToken::new(),
            reason: Arc::new(OnceLock::new()),
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Attempt number (1-based) this token belongs to.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Instant at which the dispatcher gives up on this attempt.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Time left before the deadline, zero once it has passed.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }

    /// Completes once the attempt has been cancelled.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.inner.cancelled()
    }

    /// Why the attempt was cancelled, if it was cancelled by a timeout.
    pub fn reason(&self) -> Option<&TimeoutError> {
        self.reason.get()
    }

    /// Returns the timeout error if the attempt was cancelled.
    ///
    /// Intended as a checkpoint between steps of a long job.
    pub fn check(&self) -> Result<(), TimeoutError> {
        if self.is_cancelled() {
            return Err(self.cancellation_error());
        }
        Ok(())
    }

    /// Runs `fut` until it completes or the attempt is cancelled.
    pub async fn run_until_cancelled<F>(&self, fut: F) -> Result<F::Output, TimeoutError>
    where
        F: Future,
    {
        tokio::select! {
            biased;
            _ = self.inner.cancelled() => Err(self.cancellation_error()),
            output = fut => Ok(output),
        }
    }

    fn cancellation_error(&self) -> TimeoutError {
        self.reason().cloned().unwrap_or(TimeoutError {
            job_id: self.job_id,
            attempt: self.attempt,
            timeout: Duration::ZERO,
        })
    }

    /// Records `reason` and signals cancellation. The first reason wins.
    pub(crate) fn cancel_with(&self, reason: TimeoutError) {
        let _ = self.reason.set(reason);
        self.inner.cancel();
    }

    /// Signals cancellation without a timeout reason (dispatcher shutdown).
    pub(crate) fn cancel(&self) {
        self.inner.cancel();
    }
}
