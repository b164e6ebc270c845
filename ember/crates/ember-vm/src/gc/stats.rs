//! GC statistics.
//!
//! Counters the collector bumps on every cycle, plus a snapshot struct
//! for reporting. The VM is single-threaded, so plain fields suffice; a
//! snapshot is taken by value.

use std::time::Duration;

/// Running totals for the collector.
#[derive(Debug, Default, Clone)]
pub struct GcStats {
    /// Completed collection cycles.
    pub collections: u64,
    /// Objects reclaimed across all cycles.
    pub objects_freed: u64,
    /// Bytes reclaimed across all cycles.
    pub bytes_freed: u64,
    /// Total time spent collecting.
    pub total_pause: Duration,
    /// Longest single pause.
    pub max_pause: Duration,
}

impl GcStats {
    /// Records one completed cycle.
    pub fn record_cycle(&mut self, objects_freed: u64, bytes_freed: u64, pause: Duration) {
        self.collections += 1;
        self.objects_freed += objects_freed;
        self.bytes_freed += bytes_freed;
        self.total_pause += pause;
        if pause > self.max_pause {
            self.max_pause = pause;
        }
    }

    /// A point-in-time copy for reporting.
    pub fn snapshot(&self) -> GcStats {
        self.clone()
    }
}
