//! Error types for jobgate operations.
//!
//! Three layers of failure exist:
//! - `TimeoutError`: an attempt outlived its deadline
//! - `JobError`: a terminal (or retry-candidate) failure of one job attempt
//! - `DispatchError`: what callers of the dispatcher see, including the
//!   aggregated failures of a drained epoch

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::dispatcher::JobId;

/// An attempt exceeded the configured per-attempt timeout.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("job {job_id} timed out on attempt {attempt} after {timeout:?}")]
pub struct TimeoutError {
    pub job_id: JobId,
    pub attempt: u32,
    pub timeout: Duration,
}

/// Failure of a single job attempt.
///
/// This is the value handed to a [`RetryPolicy`](crate::dispatcher::RetryPolicy)
/// and, once terminal, the element type of an epoch's error list.
#[derive(Debug, Error)]
pub enum JobError {
    /// The dispatcher's own timer fired before the job settled.
    #[error(transparent)]
    Timeout(#[from] TimeoutError),

    /// The job returned an error (or panicked).
    #[error("job {job_id} failed on attempt {attempt}: {error:#}")]
    Failed {
        job_id: JobId,
        attempt: u32,
        error: anyhow::Error,
    },
}

impl JobError {
    /// Identifier of the job this error belongs to.
    pub fn job_id(&self) -> JobId {
        match self {
            JobError::Timeout(t) => t.job_id,
            JobError::Failed { job_id, .. } => *job_id,
        }
    }

    /// Attempt number (1-based) that produced this error.
    pub fn attempt(&self) -> u32 {
        match self {
            JobError::Timeout(t) => t.attempt,
            JobError::Failed { attempt, .. } => *attempt,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, JobError::Timeout(_))
    }

    /// The job's own error, if this is not a timeout.
    pub fn application_error(&self) -> Option<&anyhow::Error> {
        match self {
            JobError::Timeout(_) => None,
            JobError::Failed { error, .. } => Some(error),
        }
    }

    /// Attempts to downcast the job's own error to a concrete type.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        self.application_error().and_then(|e| e.downcast_ref::<E>())
    }
}

/// The ordered list of terminal failures of one epoch.
///
/// Errors appear in the order their jobs settled, not submission order.
/// Cheap to clone; every waiter on the same epoch receives the same list.
#[derive(Debug, Clone)]
pub struct FailedJobs {
    epoch: Uuid,
    errors: Arc<[JobError]>,
}

impl FailedJobs {
    pub(crate) fn new(epoch: Uuid, errors: Vec<JobError>) -> Self {
        Self {
            epoch,
            errors: errors.into(),
        }
    }

    /// Identifier of the epoch these failures belong to.
    pub fn epoch(&self) -> Uuid {
        self.epoch
    }

    pub fn errors(&self) -> &[JobError] {
        &self.errors
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, JobError> {
        self.errors.iter()
    }
}

impl fmt::Display for FailedJobs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} job(s) failed", self.errors.len())?;
        if let Some(first) = self.errors.first() {
            write!(f, "; first: {}", first)?;
        }
        Ok(())
    }
}

impl<'a> IntoIterator for &'a FailedJobs {
    type Item = &'a JobError;
    type IntoIter = std::slice::Iter<'a, JobError>;

    fn into_iter(self) -> Self::IntoIter {
        self.errors.iter()
    }
}

/// Errors surfaced by the [`Dispatcher`](crate::dispatcher::Dispatcher) API.
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    /// `drained()` was called while no epoch is open.
    #[error("No epoch is open: nothing has been submitted since the last drain")]
    Idle,

    /// The epoch drained with at least one terminal job failure.
    #[error("Epoch drained with failures: {0}")]
    JobsFailed(FailedJobs),

    /// The dispatch loop observed a reference to an unknown job or attempt.
    #[error("Dispatcher consistency violated: {0}")]
    Consistency(String),

    /// The dispatch loop is no longer running.
    #[error("Dispatcher has shut down")]
    Closed,
}

impl DispatchError {
    /// Returns the aggregated failures if this is a failed drain.
    pub fn failed_jobs(&self) -> Option<&FailedJobs> {
        match self {
            DispatchError::JobsFailed(failed) => Some(failed),
            _ => None,
        }
    }
}
