//! Public handle to a running dispatcher.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{info_span, Instrument, Span};

use super::config::{ConfigError, DispatcherConfig};
use super::dispatch_loop::{Command, DispatchLoop};
use super::job::Job;
use super::retry::{RetryOnTimeout, RetryPolicy};
use super::stats::{DispatcherStats, SharedStats};
use super::token::CancelToken;
use crate::error::DispatchError;

/// Handle to a bounded-concurrency job dispatcher.
///
/// Cloning is cheap; all clones drive the same dispatch loop. The loop stops
/// when [`shutdown`](Self::shutdown) is called or the last handle is dropped.
/// Jobs may hold a clone to submit follow-up work.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

struct Inner {
    commands: mpsc::UnboundedSender<Command>,
    stats: Arc<SharedStats>,
    config: DispatcherConfig,
    shutdown: CancellationToken,
    _stop_on_drop: DropGuard,
}

impl Dispatcher {
    /// Creates a dispatcher that retries timed-out attempts only.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the configuration is invalid.
    pub fn new(config: DispatcherConfig) -> Result<Self, ConfigError> {
        Self::with_retry_policy(config, RetryOnTimeout)
    }

    /// Creates a dispatcher with a custom retry policy.
    pub fn with_retry_policy<P: RetryPolicy>(
        config: DispatcherConfig,
        policy: P,
    ) -> Result<Self, ConfigError> {
        let span = info_span!("dispatcher", limit = config.concurrency_limit);
        Self::with_parts(config, Arc::new(policy), span)
    }

    /// Creates a dispatcher whose loop logs inside `span`.
    pub fn with_parts(
        config: DispatcherConfig,
        policy: Arc<dyn RetryPolicy>,
        span: Span,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let (commands, inbox) = mpsc::unbounded_channel();
        let stats = Arc::new(SharedStats::new());
        let shutdown = CancellationToken::new();

        let dispatch_loop = DispatchLoop::new(
            config.clone(),
            policy,
            commands.clone(),
            inbox,
            Arc::clone(&stats),
            shutdown.clone(),
        );
        tokio::spawn(dispatch_loop.run().instrument(span));

        Ok(Self {
            inner: Arc::new(Inner {
                commands,
                stats,
                config,
                _stop_on_drop: shutdown.clone().drop_guard(),
                shutdown,
            }),
        })
    }

    /// Submits a job built from a closure.
    ///
    /// The closure is called once per attempt. Submission never waits; it
    /// fails only once the dispatcher has shut down.
    pub fn add<F, Fut>(&self, f: F) -> Result<(), DispatchError>
    where
        F: FnMut(CancelToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.add_job(Job::new(f))
    }

    /// Submits a prepared [`Job`].
    pub fn add_job(&self, job: Job) -> Result<(), DispatchError> {
        self.inner
            .commands
            .send(Command::Submit(job))
            .map_err(|_| DispatchError::Closed)
    }

    /// Waits until the current epoch drains.
    ///
    /// # Errors
    ///
    /// - `DispatchError::Idle` if nothing has been submitted since the last drain
    /// - `DispatchError::JobsFailed` with every terminal failure of the epoch
    /// - `DispatchError::Closed` if the dispatcher stopped first
    pub async fn drained(&self) -> Result<(), DispatchError> {
        let (reply, outcome) = oneshot::channel();
        self.inner
            .commands
            .send(Command::Drained(reply))
            .map_err(|_| DispatchError::Closed)?;
        outcome.await.unwrap_or(Err(DispatchError::Closed))
    }

    /// Jobs with an attempt in flight.
    ///
    /// The loop publishes this after applying each command, so it does not
    /// yet include a job whose `add` the loop has not received: a read right
    /// after [`add`](Self::add) may still show the old value.
    pub fn pending_count(&self) -> usize {
        self.inner.stats.pending()
    }

    /// Jobs waiting for a slot. Lags submissions like
    /// [`pending_count`](Self::pending_count).
    pub fn waiting_count(&self) -> usize {
        self.inner.stats.waiting()
    }

    /// Returns current dispatcher statistics.
    pub fn stats(&self) -> DispatcherStats {
        self.inner.stats.snapshot(self.inner.config.concurrency_limit)
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.inner.config
    }

    /// Stops the dispatch loop.
    ///
    /// In-flight attempts are cancelled, waiting jobs are dropped, and an
    /// open epoch fails with `DispatchError::Closed`.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    /// Returns whether the dispatch loop has stopped.
    pub fn is_closed(&self) -> bool {
        self.inner.commands.is_closed()
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("config", &self.inner.config)
            .field("pending", &self.pending_count())
            .field("waiting", &self.waiting_count())
            .finish()
    }
}
