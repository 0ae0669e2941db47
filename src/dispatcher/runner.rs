//! Executes one attempt of a job against its timeout.
//!
//! Each attempt gets two tasks: the job's own future, and a timer. Whichever
//! finishes first reports to the dispatch loop, tagged with the job id and
//! attempt number. The loser reports too, later, and the loop discards that
//! report as stale. The job task is never aborted; the timer is aborted when
//! the attempt settles.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::mpsc::UnboundedSender;

use super::dispatch_loop::Command;
use super::job::{JobFuture, JobId, PendingAttempt};
use super::token::CancelToken;

/// How an attempt ended, as seen by the task that reports it.
#[derive(Debug)]
pub(crate) enum AttemptOutcome {
    Finished(anyhow::Result<()>),
    TimedOut,
}

/// Report of one attempt's settlement.
#[derive(Debug)]
pub(crate) struct AttemptEvent {
    pub id: JobId,
    pub attempt: u32,
    pub outcome: AttemptOutcome,
}

pub(crate) struct JobRunner {
    events: UnboundedSender<Command>,
    timeout: Duration,
}

impl JobRunner {
    pub fn new(events: UnboundedSender<Command>, timeout: Duration) -> Self {
        Self { events, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Starts the next attempt of `pending` in place.
    ///
    /// Bumps the attempt number, replaces the token, and re-arms the timer.
    pub fn launch(&self, pending: &mut PendingAttempt) {
        pending.disarm();
        pending.attempt += 1;

        let id = pending.id;
        let attempt = pending.attempt;
        let token = CancelToken::new(id, attempt, self.timeout);

        let future = start_job(pending, token.clone());
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = match AssertUnwindSafe(future).catch_unwind().await {
                Ok(result) => result,
                Err(panic) => Err(anyhow::anyhow!("job panicked: {}", panic_message(&*panic))),
            };
            // The loop may already be gone; nobody is left to tell.
            let _ = events.send(Command::Attempt(AttemptEvent {
                id,
                attempt,
                outcome: AttemptOutcome::Finished(result),
            }));
        });

        let events = self.events.clone();
        let expiry = tokio::time::sleep_until(token.deadline());
        pending.timer = Some(tokio::spawn(async move {
            expiry.await;
            let _ = events.send(Command::Attempt(AttemptEvent {
                id,
                attempt,
                outcome: AttemptOutcome::TimedOut,
            }));
        }));
        pending.token = Some(token);
    }
}

/// Builds the attempt's future. A panic while building it becomes a failed
/// attempt instead of unwinding through the dispatch loop.
fn start_job(pending: &mut PendingAttempt, token: CancelToken) -> JobFuture {
    let job = &mut pending.job;
    match std::panic::catch_unwind(AssertUnwindSafe(|| job.start(token))) {
        Ok(future) => future,
        Err(panic) => {
            let error = anyhow::anyhow!("job panicked: {}", panic_message(&*panic));
            futures::future::ready(Err(error)).boxed()
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::job::Job;
    use tokio::sync::mpsc;

    fn attempt_event(command: Command) -> AttemptEvent {
        match command {
            Command::Attempt(event) => event,
            other => panic!("expected attempt event, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_attempt_reports_once_timer_disarmed() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let runner = JobRunner::new(tx, Duration::from_millis(50));
        let mut pending = PendingAttempt::new(
            JobId::new(1),
            Job::new(|_token| async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(())
            }),
        );

        runner.launch(&mut pending);
        assert_eq!(pending.attempt, 1);
        assert!(pending.token.is_some());

        let event = attempt_event(rx.recv().await.expect("event"));
        assert_eq!(event.id, JobId::new(1));
        assert_eq!(event.attempt, 1);
        assert!(matches!(event.outcome, AttemptOutcome::Finished(Ok(()))));

        pending.disarm();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_attempt_times_out_first() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let runner = JobRunner::new(tx, Duration::from_millis(50));
        let mut pending = PendingAttempt::new(
            JobId::new(2),
            Job::new(|_token| async {
                tokio::time::sleep(Duration::from_millis(80)).await;
                Ok(())
            }),
        );
        runner.launch(&mut pending);

        let first = attempt_event(rx.recv().await.expect("event"));
        assert!(matches!(first.outcome, AttemptOutcome::TimedOut));

        // The job is not aborted and still reports, tagged with its attempt.
        let late = attempt_event(rx.recv().await.expect("event"));
        assert_eq!(late.attempt, 1);
        assert!(matches!(late.outcome, AttemptOutcome::Finished(Ok(()))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_relaunch_bumps_attempt_and_token() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let runner = JobRunner::new(tx, Duration::from_millis(50));
        let mut pending =
            PendingAttempt::new(JobId::new(3), Job::new(|_token| async { Ok(()) }));

        runner.launch(&mut pending);
        let first = pending.token.clone().expect("token");
        runner.launch(&mut pending);
        let second = pending.token.clone().expect("token");

        assert_eq!(pending.attempt, 2);
        assert_eq!(first.attempt(), 1);
        assert_eq!(second.attempt(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_job_is_reported_as_failure() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let runner = JobRunner::new(tx, Duration::from_millis(50));

        let mut pending = PendingAttempt::new(
            JobId::new(4),
            Job::new(|_token| async { panic!("lint engine crashed") }),
        );
        runner.launch(&mut pending);
        let event = attempt_event(rx.recv().await.expect("event"));
        match event.outcome {
            AttemptOutcome::Finished(Err(e)) => assert!(e.to_string().contains("lint engine crashed")),
            other => panic!("unexpected outcome {:?}", other),
        }

        let mut eager = PendingAttempt::new(
            JobId::new(5),
            Job::new(|_token| -> futures::future::Ready<anyhow::Result<()>> {
                panic!("bad closure")
            }),
        );
        runner.launch(&mut eager);
        let event = attempt_event(rx.recv().await.expect("event"));
        assert_eq!(event.id, JobId::new(5));
        assert!(matches!(event.outcome, AttemptOutcome::Finished(Err(_))));
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("static message");
        assert_eq!(panic_message(&*payload), "static message");
        let payload: Box<dyn Any + Send> = Box::new(String::from("owned message"));
        assert_eq!(panic_message(&*payload), "owned message");
        let payload: Box<dyn Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(&*payload), "unknown panic payload");
    }
}
