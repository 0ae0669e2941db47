//! The dispatch loop: the single task that owns all dispatcher state.
//!
//! Handles and job tasks never touch the queue, the pending table or the
//! epoch directly; they send a [`Command`] and the loop applies it. Because
//! one task applies every mutation, bookkeeping needs no locks and never
//! suspends.
//!
//! The epoch is checked for drain after every command, so it closes the
//! instant nothing is waiting or pending. A job that submits follow-up work
//! before returning has sent that submission ahead of its own settlement, so
//! the follow-up is always counted in the parent's epoch. Work that arrives
//! after the settlement which drained an epoch opens a new one.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::barrier::{DrainResult, Epoch};
use super::config::DispatcherConfig;
use super::job::{Job, JobId, PendingAttempt};
use super::queue::{ConcurrencyGate, WaitingQueue};
use super::retry::{self, RetryPolicy};
use super::runner::{AttemptEvent, AttemptOutcome, JobRunner};
use super::stats::SharedStats;
use crate::error::{DispatchError, JobError, TimeoutError};

/// Messages understood by the dispatch loop.
#[derive(Debug)]
pub(crate) enum Command {
    /// Queue a job, opening an epoch if the dispatcher is idle.
    Submit(Job),
    /// Reply once the current epoch drains, or immediately with `Idle`.
    Drained(oneshot::Sender<DrainResult>),
    /// An attempt settled or its timer fired.
    Attempt(AttemptEvent),
}

pub(crate) struct DispatchLoop {
    config: DispatcherConfig,
    policy: Arc<dyn RetryPolicy>,
    inbox: UnboundedReceiver<Command>,
    runner: JobRunner,
    queue: WaitingQueue,
    gate: ConcurrencyGate,
    pending: HashMap<JobId, PendingAttempt>,
    next_id: u64,
    epoch: Option<Epoch>,
    stats: Arc<SharedStats>,
    shutdown: CancellationToken,
}

impl DispatchLoop {
    pub fn new(
        config: DispatcherConfig,
        policy: Arc<dyn RetryPolicy>,
        outbox: UnboundedSender<Command>,
        inbox: UnboundedReceiver<Command>,
        stats: Arc<SharedStats>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            runner: JobRunner::new(outbox, config.attempt_timeout),
            gate: ConcurrencyGate::new(config.concurrency_limit),
            config,
            policy,
            inbox,
            queue: WaitingQueue::new(),
            pending: HashMap::new(),
            next_id: 1,
            epoch: None,
            stats,
            shutdown,
        }
    }

    /// Runs until shutdown or a consistency violation.
    pub async fn run(mut self) {
        info!(
            limit = self.config.concurrency_limit,
            retry_limit = self.config.retry_limit,
            timeout = ?self.config.attempt_timeout,
            "Dispatch loop started"
        );

        let exit = loop {
            let command = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break DispatchError::Closed,
                command = self.inbox.recv() => match command {
                    Some(command) => command,
                    None => break DispatchError::Closed,
                },
            };

            if let Err(e) = self.process(command) {
                error!(error = %e, "Dispatch loop stopping");
                break e;
            }
        };

        self.teardown(exit);
        info!("Dispatch loop stopped");
    }

    /// Applies one command, admits what fits, and settles the epoch if
    /// nothing is left.
    fn process(&mut self, command: Command) -> Result<(), DispatchError> {
        self.handle(command)?;
        self.dispatch();
        self.settle_if_drained();
        self.publish();
        Ok(())
    }

    fn handle(&mut self, command: Command) -> Result<(), DispatchError> {
        match command {
            Command::Submit(job) => {
                self.submit(job);
                Ok(())
            }
            Command::Drained(reply) => {
                self.register_waiter(reply);
                Ok(())
            }
            Command::Attempt(event) => self.on_attempt_event(event),
        }
    }

    fn submit(&mut self, job: Job) {
        let epoch = self.epoch.get_or_insert_with(|| {
            let epoch = Epoch::open();
            info!(epoch_id = %epoch.id, "Epoch opened");
            epoch
        });
        epoch.submitted += 1;
        self.queue.push(job);
    }

    fn register_waiter(&mut self, reply: oneshot::Sender<DrainResult>) {
        match self.epoch.as_mut() {
            Some(epoch) => epoch.barrier.register(reply),
            None => {
                let _ = reply.send(Err(DispatchError::Idle));
            }
        }
    }

    /// Admits waiting jobs, oldest first, while the gate has room.
    fn dispatch(&mut self) {
        while !self.queue.is_empty() && self.gate.try_acquire() {
            if let Some(job) = self.queue.pop() {
                self.admit(job);
            }
        }
    }

    fn admit(&mut self, job: Job) {
        let id = JobId::new(self.next_id);
        self.next_id += 1;

        let mut pending = PendingAttempt::new(id, job);
        self.runner.launch(&mut pending);
        self.stats.record_attempt(false);

        debug!(
            job_id = %id,
            label = pending.job.label().unwrap_or(""),
            in_flight = self.gate.in_flight(),
            limit = self.gate.limit(),
            waiting = self.queue.len(),
            "Job admitted"
        );
        self.pending.insert(id, pending);
    }

    fn on_attempt_event(&mut self, event: AttemptEvent) -> Result<(), DispatchError> {
        let AttemptEvent {
            id,
            attempt,
            outcome,
        } = event;

        if id.get() >= self.next_id {
            return Err(DispatchError::Consistency(format!(
                "settlement for job {} which was never issued",
                id
            )));
        }

        let Some(pending) = self.pending.get(&id) else {
            debug!(job_id = %id, attempt, "Discarding settlement of retired job");
            self.stats.record_stale();
            return Ok(());
        };

        if attempt > pending.attempt {
            return Err(DispatchError::Consistency(format!(
                "settlement for attempt {} of job {} which is on attempt {}",
                attempt, id, pending.attempt
            )));
        }

        if attempt < pending.attempt {
            debug!(
                job_id = %id,
                attempt,
                current_attempt = pending.attempt,
                "Discarding settlement of superseded attempt"
            );
            self.stats.record_stale();
            return Ok(());
        }

        match outcome {
            AttemptOutcome::Finished(Ok(())) => self.complete(id),
            AttemptOutcome::Finished(Err(error)) => self.fail(
                id,
                JobError::Failed {
                    job_id: id,
                    attempt,
                    error,
                },
            ),
            AttemptOutcome::TimedOut => {
                let timeout = TimeoutError {
                    job_id: id,
                    attempt,
                    timeout: self.runner.timeout(),
                };
                if let Some(token) = pending.token.as_ref() {
                    token.cancel_with(timeout.clone());
                }
                self.stats.record_timeout();
                debug!(job_id = %id, attempt, "Attempt timed out, cancellation signalled");
                self.fail(id, JobError::Timeout(timeout))
            }
        }
    }

    fn complete(&mut self, id: JobId) -> Result<(), DispatchError> {
        let pending = self.retire(id)?;
        let duration = pending.admitted_at.elapsed();
        self.stats.record_completion(duration);
        debug!(
            job_id = %id,
            attempts = pending.attempt,
            duration = ?duration,
            "Job completed"
        );
        Ok(())
    }

    fn fail(&mut self, id: JobId, error: JobError) -> Result<(), DispatchError> {
        let pending = self
            .pending
            .get_mut(&id)
            .ok_or_else(|| not_pending(id))?;

        let decision = retry::decide(
            self.policy.as_ref(),
            &error,
            pending.retries(),
            self.config.retry_limit,
        );

        if decision.is_retry() {
            warn!(
                job_id = %id,
                attempt = pending.attempt,
                error = %error,
                remaining_attempts = self.config.max_attempts() - pending.attempt,
                "Attempt failed, retrying"
            );
            self.runner.launch(pending);
            self.stats.record_attempt(true);
            return Ok(());
        }

        let pending = self.retire(id)?;
        let duration = pending.admitted_at.elapsed();
        self.stats.record_failure(duration);
        warn!(
            job_id = %id,
            attempts = pending.attempt,
            reason = %decision,
            error = %error,
            "Job failed"
        );

        let epoch = self.epoch.as_mut().ok_or_else(|| {
            DispatchError::Consistency(format!("job {} failed outside of an open epoch", id))
        })?;
        epoch.errors.push(error);
        Ok(())
    }

    /// Removes a job from the pending table and frees its slot.
    fn retire(&mut self, id: JobId) -> Result<PendingAttempt, DispatchError> {
        let mut pending = self.pending.remove(&id).ok_or_else(|| not_pending(id))?;
        pending.disarm();
        if !self.gate.release() {
            return Err(DispatchError::Consistency(format!(
                "released a concurrency slot for job {} that was never acquired",
                id
            )));
        }
        Ok(pending)
    }

    fn settle_if_drained(&mut self) {
        if !self.queue.is_empty() || !self.pending.is_empty() {
            return;
        }
        let Some(epoch) = self.epoch.take() else {
            return;
        };

        let epoch_id = epoch.id;
        let submitted = epoch.submitted;
        let waiters = epoch.barrier.waiters();
        let failed = epoch.errors.len();
        let duration_ms = (chrono::Utc::now() - epoch.opened_at).num_milliseconds();

        let result = epoch.close();
        self.stats.record_epoch();

        match result {
            Ok(()) => info!(
                epoch_id = %epoch_id,
                jobs = submitted,
                waiters,
                duration_ms,
                "Epoch drained"
            ),
            Err(_) => warn!(
                epoch_id = %epoch_id,
                jobs = submitted,
                failed,
                waiters,
                duration_ms,
                "Epoch drained with failures"
            ),
        }
    }

    fn publish(&self) {
        self.stats
            .publish_counts(self.pending.len(), self.queue.len(), self.gate.peak());
    }

    /// Cancels in-flight attempts and releases everyone still waiting.
    fn teardown(&mut self, exit: DispatchError) {
        let in_flight = self.pending.len();
        for (_, pending) in self.pending.drain() {
            if let Some(token) = pending.token.as_ref() {
                token.cancel();
            }
        }
        let dropped = self.queue.drain().count();

        if let Some(epoch) = self.epoch.take() {
            epoch.abort(exit.clone());
        }

        self.inbox.close();
        while let Ok(command) = self.inbox.try_recv() {
            if let Command::Drained(reply) = command {
                let _ = reply.send(Err(exit.clone()));
            }
        }

        if in_flight > 0 || dropped > 0 {
            warn!(in_flight, dropped, "Dispatcher stopped with unfinished jobs");
        }
        self.stats.publish_counts(0, 0, self.gate.peak());
    }
}

fn not_pending(id: JobId) -> DispatchError {
    DispatchError::Consistency(format!("job {} is not pending", id))
}
