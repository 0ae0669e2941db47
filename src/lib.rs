//! jobgate: a bounded-concurrency job dispatcher.
//!
//! Submit async jobs to a [`Dispatcher`]; at most `concurrency_limit` run at
//! once, each attempt is bounded by a timeout, failed attempts are retried
//! according to a [`RetryPolicy`], and [`Dispatcher::drained`] reports every
//! terminal failure of the current epoch.

pub mod cli;
pub mod dispatcher;
pub mod error;

pub use dispatcher::{
    CancelToken, ConfigError, Dispatcher, DispatcherConfig, DispatcherStats, Job, JobFuture,
    JobId, NeverRetry, RetryAll, RetryOnTimeout, RetryPolicy,
};
pub use error::{DispatchError, FailedJobs, JobError, TimeoutError};
