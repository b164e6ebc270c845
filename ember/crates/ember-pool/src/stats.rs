//! Pool statistics: lock-free counters bumped on the hot paths, read
//! out as a consistent snapshot under the pool lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

/// Atomic counters the pool maintains.
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Successful acquisitions.
    pub acquisitions: AtomicU64,
    /// Failed acquisitions (pool exhausted, rate limited, ...).
    pub acquisition_failures: AtomicU64,
    /// Entries created beyond the initial set.
    pub pool_expansions: AtomicU64,
    /// Tasks accepted by `submit`.
    pub total_requests: AtomicU64,
    /// Total script execution time, nanoseconds.
    pub total_execution_nanos: AtomicU64,
    /// Total compilation time, nanoseconds.
    pub total_compilation_nanos: AtomicU64,
}

impl PoolStats {
    /// Bumps a counter.
    #[inline]
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Adds a duration to a nanosecond accumulator.
    #[inline]
    pub fn add_time(counter: &AtomicU64, elapsed: Duration) {
        counter.fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }
}

/// A consistent, serializable view of pool state.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatsSnapshot {
    /// Entries currently in the pool.
    pub total_vms: usize,
    /// Entries in the idle state.
    pub idle_vms: usize,
    /// Entries in the executing state.
    pub executing_vms: usize,
    /// Successful acquisitions.
    pub acquisitions: u64,
    /// Failed acquisitions.
    pub acquisition_failures: u64,
    /// Entries created on demand.
    pub pool_expansions: u64,
    /// Tasks accepted.
    pub total_requests: u64,
    /// Total execution time.
    pub total_execution_time: Duration,
    /// Total compilation time.
    pub total_compilation_time: Duration,
    /// Bytecode cache hits.
    pub cache_hits: u64,
    /// Bytecode cache misses.
    pub cache_misses: u64,
    /// Scripts currently cached.
    pub cached_script_count: usize,
    /// Tasks queued but not yet started.
    pub pending_requests: usize,
    /// Executing entries as a share of the pool, 0–100.
    pub utilization_percent: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_accumulation() {
        let stats = PoolStats::default();
        PoolStats::add_time(&stats.total_execution_nanos, Duration::from_micros(100));
        PoolStats::add_time(&stats.total_execution_nanos, Duration::from_micros(150));
        assert_eq!(
            stats.total_execution_nanos.load(Ordering::Relaxed),
            250_000
        );
    }

    #[test]
    fn test_snapshot_serializes() {
        let snapshot = PoolStatsSnapshot {
            total_vms: 4,
            idle_vms: 3,
            executing_vms: 1,
            acquisitions: 10,
            acquisition_failures: 0,
            pool_expansions: 2,
            total_requests: 10,
            total_execution_time: Duration::from_millis(5),
            total_compilation_time: Duration::from_millis(1),
            cache_hits: 7,
            cache_misses: 3,
            cached_script_count: 3,
            pending_requests: 0,
            utilization_percent: 25.0,
        };
        let json = serde_json::to_string(&snapshot).unwrap();
        assert!(json.contains("\"total_vms\":4"), "{json}");
        assert!(json.contains("utilization_percent"), "{json}");
    }
}
