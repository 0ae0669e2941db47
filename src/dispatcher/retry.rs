//! Retry policy.
//!
//! A policy only answers "is this error worth another attempt?". The retry
//! budget (`retry_limit`) is enforced separately by [`decide`], so a policy
//! can never push a job past `retry_limit + 1` attempts.

use std::fmt;

use crate::error::JobError;

/// Decides whether a failed or timed-out attempt may be retried.
///
/// Any `Fn(&JobError) -> bool + Send + Sync` closure is a policy.
pub trait RetryPolicy: Send + Sync + 'static {
    fn should_retry(&self, error: &JobError) -> bool;
}

impl<F> RetryPolicy for F
where
    F: Fn(&JobError) -> bool + Send + Sync + 'static,
{
    fn should_retry(&self, error: &JobError) -> bool {
        self(error)
    }
}

/// Retries only the dispatcher's own timeout errors. This is the default.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryOnTimeout;

impl RetryPolicy for RetryOnTimeout {
    fn should_retry(&self, error: &JobError) -> bool {
        error.is_timeout()
    }
}

/// Retries every failure.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryAll;

impl RetryPolicy for RetryAll {
    fn should_retry(&self, _error: &JobError) -> bool {
        true
    }
}

/// Never retries.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverRetry;

impl RetryPolicy for NeverRetry {
    fn should_retry(&self, _error: &JobError) -> bool {
        false
    }
}

/// What to do with a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RetryDecision {
    /// Run the same job again in its current slot.
    Retry,
    /// Budget left, but the policy declined.
    Rejected,
    /// The policy would retry, but `retry_limit` retries were already made.
    Exhausted,
}

impl RetryDecision {
    pub fn is_retry(self) -> bool {
        self == RetryDecision::Retry
    }
}

impl fmt::Display for RetryDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryDecision::Retry => write!(f, "retry"),
            RetryDecision::Rejected => write!(f, "not retriable"),
            RetryDecision::Exhausted => write!(f, "retries exhausted"),
        }
    }
}

/// Applies `policy` and the retry budget to a failed attempt.
///
/// `retries_made` is the number of retries already spent on the job (the
/// failed attempt's number minus one).
pub(crate) fn decide(
    policy: &dyn RetryPolicy,
    error: &JobError,
    retries_made: u32,
    retry_limit: u32,
) -> RetryDecision {
    if !policy.should_retry(error) {
        RetryDecision::Rejected
    } else if retries_made < retry_limit {
        RetryDecision::Retry
    } else {
        RetryDecision::Exhausted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::JobId;
    use crate::error::TimeoutError;
    use std::time::Duration;

    fn timeout_error() -> JobError {
        JobError::Timeout(TimeoutError {
            job_id: JobId::new(1),
            attempt: 1,
            timeout: Duration::from_millis(10),
        })
    }

    fn app_error(msg: &str) -> JobError {
        JobError::Failed {
            job_id: JobId::new(1),
            attempt: 1,
            error: anyhow::anyhow!("{}", msg),
        }
    }

    #[test]
    fn test_builtin_policies() {
        assert!(RetryOnTimeout.should_retry(&timeout_error()));
        assert!(!RetryOnTimeout.should_retry(&app_error("boom")));

        assert!(RetryAll.should_retry(&timeout_error()));
        assert!(RetryAll.should_retry(&app_error("boom")));

        assert!(!NeverRetry.should_retry(&timeout_error()));
        assert!(!NeverRetry.should_retry(&app_error("boom")));
    }

    #[test]
    fn test_closure_policy() {
        let policy = |e: &JobError| {
            e.application_error()
                .map(|err| err.to_string().contains("transient"))
                .unwrap_or(false)
        };
        assert!(policy.should_retry(&app_error("transient network error")));
        assert!(!policy.should_retry(&app_error("bad request")));
        assert!(!policy.should_retry(&timeout_error()));
    }

    #[test]
    fn test_decide_respects_budget() {
        let err = timeout_error();
        assert_eq!(decide(&RetryOnTimeout, &err, 0, 3), RetryDecision::Retry);
        assert_eq!(decide(&RetryOnTimeout, &err, 2, 3), RetryDecision::Retry);
        assert_eq!(decide(&RetryOnTimeout, &err, 3, 3), RetryDecision::Exhausted);
        assert_eq!(decide(&RetryOnTimeout, &err, 0, 0), RetryDecision::Exhausted);
    }

    #[test]
    fn test_decide_policy_rejection() {
        let err = app_error("boom");
        let decision = decide(&RetryOnTimeout, &err, 0, 3);
        assert_eq!(decision, RetryDecision::Rejected);
        assert!(!decision.is_retry());
        assert_eq!(decision.to_string(), "not retriable");
    }
}
