//! Build-level execution metrics
//!
//! Aggregates fed back to the documentation pipeline's own reporting:
//! totals, cache-hit ratio, per-status counts and duration percentiles.
//! This subsystem never renders them.

use parking_lot::Mutex;
use snipbox_core::ExecutionStatus;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Shared metrics accumulator
#[derive(Debug, Default)]
pub struct BuildMetrics {
    submitted: AtomicU64,
    cache_hits: AtomicU64,
    by_status: Mutex<BTreeMap<ExecutionStatus, u64>>,
    durations: Mutex<Vec<Duration>>,
}

impl BuildMetrics {
    /// Create an empty accumulator
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one submission entering the scheduler
    #[inline]
    pub fn record_submission(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a cache hit
    #[inline]
    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a terminal result and its execution duration
    pub fn record_result(&self, status: ExecutionStatus, duration: Duration) {
        *self.by_status.lock().entry(status).or_insert(0) += 1;
        self.durations.lock().push(duration);
    }

    /// Snapshot the current aggregates
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let submitted = self.submitted.load(Ordering::Relaxed);
        let cache_hits = self.cache_hits.load(Ordering::Relaxed);
        let by_status = self.by_status.lock().clone();
        let mut durations = self.durations.lock().clone();
        durations.sort_unstable();

        MetricsSnapshot {
            total_submitted: submitted,
            executed: durations.len() as u64,
            cache_hits,
            cache_hit_ratio: if submitted == 0 {
                0.0
            } else {
                cache_hits as f64 / submitted as f64
            },
            by_status,
            p50_duration: percentile(&durations, 0.50),
            p95_duration: percentile(&durations, 0.95),
        }
    }
}

/// Point-in-time view of the build metrics
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSnapshot {
    /// Submissions accepted by the scheduler
    pub total_submitted: u64,
    /// Submissions that produced a (possibly cached-later) execution result
    pub executed: u64,
    /// Submissions served from the result cache
    pub cache_hits: u64,
    /// `cache_hits / total_submitted`
    pub cache_hit_ratio: f64,
    /// Result counts keyed by terminal status
    pub by_status: BTreeMap<ExecutionStatus, u64>,
    /// Median execution duration
    pub p50_duration: Option<Duration>,
    /// 95th-percentile execution duration
    pub p95_duration: Option<Duration>,
}

impl MetricsSnapshot {
    /// Count for one status (zero when unseen)
    #[inline]
    #[must_use]
    pub fn count(&self, status: ExecutionStatus) -> u64 {
        self.by_status.get(&status).copied().unwrap_or(0)
    }
}

fn percentile(sorted: &[Duration], q: f64) -> Option<Duration> {
    if sorted.is_empty() {
        return None;
    }
    let rank = ((sorted.len() - 1) as f64 * q).round() as usize;
    sorted.get(rank).copied()
}
