//! ember-pool - Concurrent VM pool and bytecode cache for the Ember
//! runtime.
//!
//! Serves many concurrent scripts over a bounded set of interpreters:
//! a work-stealing worker pool drains submitted tasks, each task leases
//! an idle [`ember_vm::Vm`] (growing the pool up to a cap), and repeated
//! compilations of the same script are short-circuited by a
//! process-scoped [`BytecodeCache`] with LRU eviction and optional
//! hot-reload invalidation.
//!
//! # Example
//!
//! ```
//! use ember_pool::{PoolConfig, TaskPayload, VmPool};
//! use std::sync::mpsc;
//!
//! let pool = VmPool::new(PoolConfig {
//!     initial_vm_count: 1,
//!     max_vm_count: 2,
//!     ..Default::default()
//! })
//! .unwrap();
//! pool.start().unwrap();
//!
//! let (tx, rx) = mpsc::channel();
//! pool.submit_request(
//!     TaskPayload::Source {
//!         name: "job".to_string(),
//!         source: "x = 1 + 1".to_string(),
//!     },
//!     Some(Box::new(move |result| {
//!         tx.send(result).unwrap();
//!     })),
//! )
//! .unwrap();
//!
//! let result = rx.recv().unwrap();
//! assert!(result.is_success());
//! pool.shutdown(true);
//! ```

pub mod cache;
pub mod config;
pub mod entry;
pub mod hot_reload;
pub mod pool;
pub mod stats;
pub mod task;
pub mod worker;

pub use cache::{fingerprint, BytecodeCache, CacheEntry};
pub use config::{PoolConfig, SecurityConfig};
pub use entry::{EntryState, PoolEntry};
pub use hot_reload::HotReloadWatcher;
pub use pool::{VmHandle, VmPool};
pub use stats::{PoolStats, PoolStatsSnapshot};
pub use task::{ExecutionResult, ExecutionTask, TaskCallback, TaskPayload};
pub use worker::WorkerPool;

use thiserror::Error;

/// Pool-level failures.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Every interpreter is busy and the pool is at its cap.
    #[error("pool exhausted: all interpreters busy at cap")]
    Exhausted,

    /// The pool is shutting down and no longer accepts work.
    #[error("pool is shutting down")]
    ShuttingDown,

    /// `start()` has not been called.
    #[error("pool not started")]
    NotStarted,

    /// The acquisition rate limit was hit.
    #[error("request rate limit exceeded")]
    RateLimited,

    /// The per-thread interpreter limit was hit.
    #[error("per-thread interpreter limit exceeded")]
    ThreadLimit,

    /// Configuration rejected by validation.
    #[error("invalid pool configuration: {0}")]
    InvalidConfig(String),
}
