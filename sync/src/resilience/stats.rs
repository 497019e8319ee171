//! Call statistics.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Counters updated by the resilience layer.
#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    attempts: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    retries: AtomicU64,
    retries_before_success: AtomicU64,
    rate_limit_hits: AtomicU64,
    circuit_trips: AtomicU64,
    circuit_rejections: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResilienceStats {
    /// Individual invocations of the wrapped operation
    pub attempts: u64,
    /// Calls that eventually succeeded
    pub successes: u64,
    /// Calls that ultimately failed
    pub failures: u64,
    pub retries: u64,
    pub rate_limit_hits: u64,
    pub circuit_trips: u64,
    /// Calls rejected without running because the breaker was open
    pub circuit_rejections: u64,
    pub avg_retries_per_success: f64,
}

impl StatsCounters {
    pub(crate) fn attempt(&self) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn success(&self, retries: u32) {
        self.successes.fetch_add(1, Ordering::Relaxed);
        self.retries_before_success
            .fetch_add(u64::from(retries), Ordering::Relaxed);
    }

    pub(crate) fn failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn rate_limit_hit(&self) {
        self.rate_limit_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn circuit_trip(&self) {
        self.circuit_trips.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn circuit_rejection(&self) {
        self.circuit_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> ResilienceStats {
        let successes = self.successes.load(Ordering::Relaxed);
        let retries_before_success = self.retries_before_success.load(Ordering::Relaxed);
        ResilienceStats {
            attempts: self.attempts.load(Ordering::Relaxed),
            successes,
            failures: self.failures.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            rate_limit_hits: self.rate_limit_hits.load(Ordering::Relaxed),
            circuit_trips: self.circuit_trips.load(Ordering::Relaxed),
            circuit_rejections: self.circuit_rejections.load(Ordering::Relaxed),
            avg_retries_per_success: if successes == 0 {
                0.0
            } else {
                retries_before_success as f64 / successes as f64
            },
        }
    }

    pub(crate) fn reset(&self) {
        for counter in [
            &self.attempts,
            &self.successes,
            &self.failures,
            &self.retries,
            &self.retries_before_success,
            &self.rate_limit_hits,
            &self.circuit_trips,
            &self.circuit_rejections,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn average_counts_only_successful_calls() {
        let stats = StatsCounters::default();
        stats.success(2);
        stats.success(0);
        stats.retry();
        stats.retry();
        stats.retry();
        stats.failure();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.retries, 3);
        assert_eq!(snapshot.avg_retries_per_success, 1.0);

        stats.reset();
        assert_eq!(stats.snapshot(), ResilienceStats::default());
    }
}
