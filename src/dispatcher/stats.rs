//! Dispatcher statistics.
//!
//! The dispatch loop is the only writer; handles read the counters without
//! going through the loop, so values observed from outside may lag the
//! loop's state by one message.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::config::millis;

/// Point-in-time view of a dispatcher.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DispatcherStats {
    /// Configured concurrency limit.
    pub limit: usize,
    /// Jobs with an attempt in flight.
    pub pending: usize,
    /// Jobs submitted but not yet admitted.
    pub waiting: usize,
    /// Highest `pending` value ever observed.
    pub peak_pending: usize,
    /// Attempts started, first attempts and retries alike.
    pub attempts_started: u64,
    /// Attempts started as retries.
    pub retries: u64,
    /// Attempts that ended in a timeout.
    pub timeouts: u64,
    /// Jobs that eventually succeeded.
    pub jobs_completed: u64,
    /// Jobs recorded as terminal failures.
    pub jobs_failed: u64,
    /// Settlements discarded because their attempt was already superseded.
    pub stale_settlements: u64,
    /// Epochs that have drained.
    pub epochs_completed: u64,
    /// Average time from admission to terminal settlement.
    #[serde(rename = "average_job_duration_ms", with = "millis")]
    pub average_job_duration: Duration,
}

impl DispatcherStats {
    /// Returns the total number of jobs settled (completed + failed).
    pub fn total_processed(&self) -> u64 {
        self.jobs_completed + self.jobs_failed
    }

    /// Returns the success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        (self.jobs_completed as f64 / total as f64) * 100.0
    }

    /// True when nothing is waiting or pending.
    pub fn is_idle(&self) -> bool {
        self.pending == 0 && self.waiting == 0
    }
}

/// Counters shared between the dispatch loop and its handles.
#[derive(Debug, Default)]
pub(crate) struct SharedStats {
    pending: AtomicUsize,
    waiting: AtomicUsize,
    peak_pending: AtomicUsize,
    attempts_started: AtomicU64,
    retries: AtomicU64,
    timeouts: AtomicU64,
    jobs_completed: AtomicU64,
    jobs_failed: AtomicU64,
    stale_settlements: AtomicU64,
    epochs_completed: AtomicU64,
    total_duration_ms: AtomicU64,
}

impl SharedStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes the loop's current queue depths.
    pub fn publish_counts(&self, pending: usize, waiting: usize, peak_pending: usize) {
        self.pending.store(pending, Ordering::SeqCst);
        self.waiting.store(waiting, Ordering::SeqCst);
        self.peak_pending.store(peak_pending, Ordering::SeqCst);
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    pub fn record_attempt(&self, is_retry: bool) {
        self.attempts_started.fetch_add(1, Ordering::SeqCst);
        if is_retry {
            self.retries.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_completion(&self, duration: Duration) {
        self.jobs_completed.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(millis::saturating(duration), Ordering::SeqCst);
    }

    pub fn record_failure(&self, duration: Duration) {
        self.jobs_failed.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(millis::saturating(duration), Ordering::SeqCst);
    }

    pub fn record_stale(&self) {
        self.stale_settlements.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_epoch(&self) {
        self.epochs_completed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn snapshot(&self, limit: usize) -> DispatcherStats {
        let completed = self.jobs_completed.load(Ordering::SeqCst);
        let failed = self.jobs_failed.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);

        let total_jobs = completed + failed;
        let average_job_duration = if total_jobs > 0 {
            Duration::from_millis(total_duration_ms / total_jobs)
        } else {
            Duration::ZERO
        };

        DispatcherStats {
            limit,
            pending: self.pending.load(Ordering::SeqCst),
            waiting: self.waiting.load(Ordering::SeqCst),
            peak_pending: self.peak_pending.load(Ordering::SeqCst),
            attempts_started: self.attempts_started.load(Ordering::SeqCst),
            retries: self.retries.load(Ordering::SeqCst),
            timeouts: self.timeouts.load(Ordering::SeqCst),
            jobs_completed: completed,
            jobs_failed: failed,
            stale_settlements: self.stale_settlements.load(Ordering::SeqCst),
            epochs_completed: self.epochs_completed.load(Ordering::SeqCst),
            average_job_duration,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_default() {
        let stats = DispatcherStats::default();

        assert_eq!(stats.pending, 0);
        assert_eq!(stats.jobs_completed, 0);
        assert_eq!(stats.average_job_duration, Duration::ZERO);
        assert_eq!(stats.total_processed(), 0);
        assert!((stats.success_rate() - 0.0).abs() < f64::EPSILON);
        assert!(stats.is_idle());
    }

    #[test]
    fn test_stats_calculations() {
        let stats = DispatcherStats {
            limit: 4,
            pending: 2,
            jobs_completed: 80,
            jobs_failed: 20,
            ..Default::default()
        };

        assert_eq!(stats.total_processed(), 100);
        assert!((stats.success_rate() - 80.0).abs() < f64::EPSILON);
        assert!(!stats.is_idle());
    }

    #[test]
    fn test_shared_stats_snapshot() {
        let stats = SharedStats::new();

        stats.record_attempt(false);
        stats.record_attempt(true);
        stats.record_attempt(false);
        stats.record_timeout();
        stats.record_completion(Duration::from_millis(100));
        stats.record_completion(Duration::from_millis(200));
        stats.record_failure(Duration::from_millis(50));
        stats.record_stale();
        stats.record_epoch();
        stats.publish_counts(1, 5, 3);

        let snapshot = stats.snapshot(3);
        assert_eq!(snapshot.limit, 3);
        assert_eq!(snapshot.pending, 1);
        assert_eq!(snapshot.waiting, 5);
        assert_eq!(snapshot.peak_pending, 3);
        assert_eq!(snapshot.attempts_started, 3);
        assert_eq!(snapshot.retries, 1);
        assert_eq!(snapshot.timeouts, 1);
        assert_eq!(snapshot.jobs_completed, 2);
        assert_eq!(snapshot.jobs_failed, 1);
        assert_eq!(snapshot.stale_settlements, 1);
        assert_eq!(snapshot.epochs_completed, 1);
        // (100 + 200 + 50) / 3
        assert_eq!(snapshot.average_job_duration, Duration::from_millis(116));
    }

    #[test]
    fn test_stats_serialization() {
        let stats = DispatcherStats {
            limit: 2,
            average_job_duration: Duration::from_millis(1500),
            ..Default::default()
        };
        let json = serde_json::to_value(&stats).expect("serialization should work");
        assert_eq!(json["average_job_duration_ms"], 1500);

        let parsed: DispatcherStats =
            serde_json::from_value(json).expect("deserialization should work");
        assert_eq!(parsed, stats);
    }
}
