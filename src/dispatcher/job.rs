//! Job definitions for the dispatcher.
//!
//! - `JobId`: identifier assigned when a job is admitted
//! - `Job`: an opaque, re-invocable unit of work
//! - `PendingAttempt`: the dispatcher's record of an in-flight job

use std::fmt;
use std::future::Future;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::token::CancelToken;

/// Identifier of an admitted job.
///
/// Identifiers are issued in increasing order by a single dispatcher and are
/// never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(u64);

impl JobId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The future one attempt of a job evaluates to.
pub type JobFuture = BoxFuture<'static, anyhow::Result<()>>;

type JobFn = Box<dyn FnMut(CancelToken) -> JobFuture + Send>;

/// A unit of work submitted to the dispatcher.
///
/// The closure is invoked once per attempt with a fresh [`CancelToken`]. It
/// should only build the future; the work itself happens when the future is
/// polled on its own task.
pub struct Job {
    label: Option<String>,
    run: JobFn,
}

impl Job {
    /// Wraps a closure producing one attempt's future.
    pub fn new<F, Fut>(mut f: F) -> Self
    where
        F: FnMut(CancelToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            label: None,
            run: Box::new(move |token| f(token).boxed()),
        }
    }

    /// Like [`Job::new`], with a human-readable label used in logs.
    pub fn labeled<F, Fut>(label: impl Into<String>, f: F) -> Self
    where
        F: FnMut(CancelToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self::new(f).with_label(label)
    }

    /// Sets the label.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub(crate) fn start(&mut self, token: CancelToken) -> JobFuture {
        (self.run)(token)
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

/// The dispatcher's record of an admitted job.
///
/// One record lives for the whole life of the job. A retry replaces the
/// token and timer in place and bumps `attempt`, which doubles as the
/// record's generation: a settlement tagged with an older attempt number is
/// stale.
#[derive(Debug)]
pub(crate) struct PendingAttempt {
    pub id: JobId,
    pub job: Job,
    /// Number of the attempt currently in flight (1-based).
    pub attempt: u32,
    pub token: Option<CancelToken>,
    pub timer: Option<JoinHandle<()>>,
    pub admitted_at: Instant,
}

impl PendingAttempt {
    pub fn new(id: JobId, job: Job) -> Self {
        Self {
            id,
            job,
            attempt: 0,
            token: None,
            timer: None,
            admitted_at: Instant::now(),
        }
    }

    /// Number of retries already made for this job.
    pub fn retries(&self) -> u32 {
        self.attempt.saturating_sub(1)
    }

    /// Stops the timeout timer of the current attempt, if any.
    pub fn disarm(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

impl Drop for PendingAttempt {
    fn drop(&mut self) {
        self.disarm();
    }
}
