//! Pool entries: one owned interpreter plus its lock and counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use ember_vm::Vm;
use parking_lot::Mutex;

/// Lifecycle state of a pool entry.
///
/// The invariant the pool maintains: an entry is `Executing` exactly
/// while some task holds it between acquire and release.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryState {
    /// Available for acquisition.
    Idle,
    /// Held by a task.
    Executing,
    /// Last execution failed; cleared on release.
    Error,
    /// Being torn down.
    Cleanup,
}

/// One interpreter slot in the pool.
#[derive(Debug)]
pub struct PoolEntry {
    /// Stable id for logs and stats.
    pub id: usize,
    /// The interpreter. The mutex is what serializes two tasks that
    /// would otherwise share the instance.
    pub vm: Mutex<Vm>,
    /// Lifecycle state, guarded separately so state can be inspected
    /// without touching the interpreter lock.
    pub state: Mutex<EntryState>,
    /// Times this entry was handed out.
    pub acquisitions: AtomicU64,
    /// Total busy time, nanoseconds.
    pub busy_nanos: AtomicU64,
    /// When the entry last went idle.
    pub last_released: Mutex<Instant>,
}

impl PoolEntry {
    /// A fresh idle entry.
    pub fn new(id: usize) -> Self {
        Self {
            id,
            vm: Mutex::new(Vm::new()),
            state: Mutex::new(EntryState::Idle),
            acquisitions: AtomicU64::new(0),
            busy_nanos: AtomicU64::new(0),
            last_released: Mutex::new(Instant::now()),
        }
    }

    /// Current state.
    pub fn state(&self) -> EntryState {
        *self.state.lock()
    }

    /// Records a completed hold.
    pub fn record_release(&self, busy: Duration) {
        self.busy_nanos
            .fetch_add(busy.as_nanos() as u64, Ordering::Relaxed);
        *self.last_released.lock() = Instant::now();
    }

    /// How long the entry has been idle.
    pub fn idle_for(&self) -> Duration {
        self.last_released.lock().elapsed()
    }
}
