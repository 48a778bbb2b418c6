//! Cache metrics
//!
//! Lock-free counters updated on the hot path, with a point-in-time
//! [`MetricsSnapshot`] for reporting. A metrics pipeline is intentionally not
//! a dependency; callers that export metrics read the snapshot on their own
//! schedule.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Aggregate for a duration series: count, running total, observed maximum.
#[derive(Debug, Default)]
pub(crate) struct DurationStat {
    count: AtomicU64,
    total_ms: AtomicU64,
    max_ms: AtomicU64,
}

impl DurationStat {
    pub(crate) fn record(&self, elapsed: Duration) {
        let ms = elapsed.as_millis() as u64;
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_ms.fetch_add(ms, Ordering::Relaxed);
        self.max_ms.fetch_max(ms, Ordering::Relaxed);
    }

    fn snapshot(&self) -> DurationSnapshot {
        DurationSnapshot {
            count: self.count.load(Ordering::Relaxed),
            total: Duration::from_millis(self.total_ms.load(Ordering::Relaxed)),
            max: Duration::from_millis(self.max_ms.load(Ordering::Relaxed)),
        }
    }
}

/// Internal metrics collector; all fields atomic for lock-free updates.
#[derive(Debug, Default)]
pub(crate) struct CacheMetrics {
    pub(crate) hits: AtomicU64,
    pub(crate) misses: AtomicU64,
    pub(crate) stale_served: AtomicU64,
    pub(crate) refresh_started: AtomicU64,
    pub(crate) refresh_completed: AtomicU64,
    pub(crate) deserialize_failures: AtomicU64,
    pub(crate) lock_wait: DurationStat,
    pub(crate) compute: DurationStat,
}

impl CacheMetrics {
    pub(crate) fn snapshot(&self) -> MetricsSnapshot {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total_lookups = hits + misses;

        MetricsSnapshot {
            hits,
            misses,
            hit_ratio: if total_lookups == 0 {
                0.0
            } else {
                hits as f64 / total_lookups as f64
            },
            stale_served: self.stale_served.load(Ordering::Relaxed),
            refresh_started: self.refresh_started.load(Ordering::Relaxed),
            refresh_completed: self.refresh_completed.load(Ordering::Relaxed),
            deserialize_failures: self.deserialize_failures.load(Ordering::Relaxed),
            lock_wait: self.lock_wait.snapshot(),
            compute: self.compute.snapshot(),
        }
    }
}

/// Point-in-time aggregate of a duration series.
#[derive(Debug, Clone, Copy)]
pub struct DurationSnapshot {
    /// Number of recorded observations
    pub count: u64,
    /// Sum of all observations
    pub total: Duration,
    /// Largest single observation
    pub max: Duration,
}

impl DurationSnapshot {
    /// Mean observation, or zero when nothing was recorded.
    pub fn mean(&self) -> Duration {
        if self.count == 0 {
            Duration::ZERO
        } else {
            self.total / self.count as u32
        }
    }
}

/// A point-in-time, public-facing snapshot of the cache's metrics.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    /// Lookups served from the backend (fresh or stale)
    pub hits: u64,
    /// Lookups that took the compute path
    pub misses: u64,
    /// hits / (hits + misses)
    pub hit_ratio: f64,
    /// Hits served past their soft expiry
    pub stale_served: u64,
    /// Background refreshes that acquired the gate and began computing
    pub refresh_started: u64,
    /// Background refreshes that stored a new payload
    pub refresh_completed: u64,
    /// Cache hits whose payload failed to decode
    pub deserialize_failures: u64,
    /// Time spent waiting on per-key gates
    pub lock_wait: DurationSnapshot,
    /// Time spent in compute functions
    pub compute: DurationSnapshot,
}
