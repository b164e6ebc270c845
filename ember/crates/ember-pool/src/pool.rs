//! The concurrent VM pool: a bounded set of interpreters multiplexed
//! across tasks.
//!
//! Locking: the pool mutex (the entries list) orders acquisition and
//! growth; each entry's own mutex serializes use of its interpreter; the
//! cache rwlock is only ever taken from task execution, after the pool
//! mutex is released. That order - pool mutex, then entry mutex, then
//! cache rwlock - is never reversed.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use ember_compile::compile;
use ember_util::Handler;
use ember_vm::{ExecStatus, Vm};
use parking_lot::{Condvar, Mutex, MutexGuard};
use rustc_hash::FxHashMap;

use crate::cache::{fingerprint, BytecodeCache};
use crate::config::PoolConfig;
use crate::entry::{EntryState, PoolEntry};
use crate::hot_reload::HotReloadWatcher;
use crate::stats::{PoolStats, PoolStatsSnapshot};
use crate::task::{ExecutionResult, ExecutionTask, TaskCallback, TaskPayload};
use crate::worker::WorkerPool;
use crate::PoolError;

/// State shared between the pool handle, its workers, and outstanding
/// [`VmHandle`]s.
pub(crate) struct PoolShared {
    /// Resolved configuration.
    config: PoolConfig,
    /// The entries list; this mutex is the pool mutex.
    entries: Mutex<Vec<Arc<PoolEntry>>>,
    /// Signaled when an entry goes idle.
    available: Condvar,
    /// The bytecode cache.
    cache: Arc<BytecodeCache>,
    /// Counters.
    stats: PoolStats,
    /// Set once `shutdown` begins.
    shutting_down: AtomicBool,
    /// Task id source.
    next_task_id: AtomicU64,
    /// Next entry id.
    next_entry_id: AtomicU64,
    /// Acquisition timestamps inside the rate-limit window.
    rate_window: Mutex<VecDeque<Instant>>,
    /// Interpreters currently held, per thread.
    thread_holds: Mutex<FxHashMap<ThreadId, usize>>,
}

/// A leased interpreter.
///
/// Dropping the handle releases the entry; `VmPool::release` is the
/// explicit spelling of the same thing. Acquire and release are
/// symmetric per task by construction.
pub struct VmHandle {
    shared: Arc<PoolShared>,
    entry: Arc<PoolEntry>,
    acquired_at: Instant,
}

impl VmHandle {
    /// Locks and borrows the interpreter.
    pub fn vm(&self) -> MutexGuard<'_, Vm> {
        self.entry.vm.lock()
    }

    /// The entry's stable id.
    pub fn entry_id(&self) -> usize {
        self.entry.id
    }
}

impl Drop for VmHandle {
    fn drop(&mut self) {
        self.shared
            .release_entry(&self.entry, self.acquired_at.elapsed());
    }
}

/// A thread-safe pool of Ember interpreters with a shared bytecode
/// cache and a work-stealing task queue.
pub struct VmPool {
    shared: Arc<PoolShared>,
    workers: Mutex<Option<WorkerPool>>,
    watcher: Mutex<Option<HotReloadWatcher>>,
}

impl VmPool {
    /// Creates a pool from a validated configuration. No interpreters or
    /// threads exist until [`VmPool::start`].
    pub fn new(config: PoolConfig) -> Result<Self, PoolError> {
        config.validate()?;
        let config = config.resolved();
        let cache = Arc::new(BytecodeCache::new(
            config.max_script_cache_size,
            config.script_cache_ttl,
        ));
        let shared = Arc::new(PoolShared {
            config,
            entries: Mutex::new(Vec::new()),
            available: Condvar::new(),
            cache,
            stats: PoolStats::default(),
            shutting_down: AtomicBool::new(false),
            next_task_id: AtomicU64::new(1),
            next_entry_id: AtomicU64::new(0),
            rate_window: Mutex::new(VecDeque::new()),
            thread_holds: Mutex::new(FxHashMap::default()),
        });
        Ok(Self {
            shared,
            workers: Mutex::new(None),
            watcher: Mutex::new(None),
        })
    }

    /// Pre-creates the initial interpreters and spawns the worker
    /// threads.
    pub fn start(&self) -> Result<(), PoolError> {
        if self.shared.shutting_down.load(Ordering::SeqCst) {
            return Err(PoolError::ShuttingDown);
        }
        {
            let mut entries = self.shared.entries.lock();
            while entries.len() < self.shared.config.initial_vm_count {
                let entry = self.shared.new_entry();
                entries.push(entry);
            }
        }

        let mut workers = self.workers.lock();
        if workers.is_none() {
            let shared = self.shared.clone();
            let runner = Arc::new(move |task: ExecutionTask| {
                PoolShared::run_task(&shared, task);
            });
            *workers = Some(WorkerPool::start(self.shared.config.worker_threads, runner));
        }
        log::debug!(
            "[CALL] pool started: {} interpreters, cap {}",
            self.shared.config.initial_vm_count,
            self.shared.config.max_vm_count
        );
        Ok(())
    }

    /// Leases an idle interpreter, growing the pool up to its cap.
    ///
    /// Fails fast when every entry is busy and the cap is reached; the
    /// embedder decides whether to queue (use [`VmPool::submit_request`])
    /// or reject.
    pub fn acquire(&self) -> Result<VmHandle, PoolError> {
        PoolShared::acquire_entry(&self.shared)
    }

    /// Returns a leased interpreter (explicit form of dropping the
    /// handle).
    pub fn release(&self, handle: VmHandle) {
        drop(handle);
    }

    /// Enqueues a task for the worker pool. Returns the task id.
    pub fn submit_request(
        &self,
        payload: TaskPayload,
        callback: Option<TaskCallback>,
    ) -> Result<u64, PoolError> {
        if self.shared.shutting_down.load(Ordering::SeqCst) {
            return Err(PoolError::ShuttingDown);
        }
        let workers = self.workers.lock();
        let Some(workers) = workers.as_ref() else {
            return Err(PoolError::NotStarted);
        };
        let id = self.shared.next_task_id.fetch_add(1, Ordering::Relaxed);
        PoolStats::bump(&self.shared.stats.total_requests);
        workers.submit(ExecutionTask {
            id,
            payload,
            callback,
        });
        Ok(id)
    }

    /// Convenience: submit a script file for execution.
    pub fn submit_script_execution(
        &self,
        path: &Path,
        callback: Option<TaskCallback>,
    ) -> Result<u64, PoolError> {
        self.submit_request(TaskPayload::ScriptPath(path.to_path_buf()), callback)
    }

    /// A consistent statistics snapshot.
    pub fn get_stats(&self) -> PoolStatsSnapshot {
        let (total, idle, executing) = {
            let entries = self.shared.entries.lock();
            let mut idle = 0;
            let mut executing = 0;
            for entry in entries.iter() {
                match entry.state() {
                    EntryState::Idle => idle += 1,
                    EntryState::Executing => executing += 1,
                    EntryState::Error | EntryState::Cleanup => {}
                }
            }
            (entries.len(), idle, executing)
        };
        let stats = &self.shared.stats;
        let pending = self
            .workers
            .lock()
            .as_ref()
            .map(WorkerPool::pending)
            .unwrap_or(0);
        PoolStatsSnapshot {
            total_vms: total,
            idle_vms: idle,
            executing_vms: executing,
            acquisitions: stats.acquisitions.load(Ordering::Relaxed),
            acquisition_failures: stats.acquisition_failures.load(Ordering::Relaxed),
            pool_expansions: stats.pool_expansions.load(Ordering::Relaxed),
            total_requests: stats.total_requests.load(Ordering::Relaxed),
            total_execution_time: Duration::from_nanos(
                stats.total_execution_nanos.load(Ordering::Relaxed),
            ),
            total_compilation_time: Duration::from_nanos(
                stats.total_compilation_nanos.load(Ordering::Relaxed),
            ),
            cache_hits: self.shared.cache.hits(),
            cache_misses: self.shared.cache.misses(),
            cached_script_count: self.shared.cache.len(),
            pending_requests: pending,
            utilization_percent: if total == 0 {
                0.0
            } else {
                executing as f64 * 100.0 / total as f64
            },
        }
    }

    /// Tears down idle interpreters that have been unused longer than
    /// `vm_idle_timeout`, keeping at least the initial set. Returns how
    /// many entries were removed.
    ///
    /// Embedders call this on whatever cadence suits them; the pool does
    /// not run its own maintenance timer.
    pub fn maintain(&self) -> usize {
        let timeout = self.shared.config.vm_idle_timeout;
        let keep = self.shared.config.initial_vm_count;
        let mut removed = 0;

        let mut entries = self.shared.entries.lock();
        let mut index = 0;
        while index < entries.len() {
            if entries.len() <= keep {
                break;
            }
            let expired = {
                let entry = &entries[index];
                let mut state = entry.state.lock();
                if *state == EntryState::Idle && entry.idle_for() > timeout {
                    *state = EntryState::Cleanup;
                    true
                } else {
                    false
                }
            };
            if expired {
                entries.remove(index);
                removed += 1;
            } else {
                index += 1;
            }
        }
        if removed > 0 {
            log::debug!("[CALL] pool maintenance removed {removed} idle interpreter(s)");
        }
        removed
    }

    /// The shared bytecode cache.
    pub fn cache(&self) -> &Arc<BytecodeCache> {
        &self.shared.cache
    }

    /// Drops a cached script.
    pub fn invalidate_cache(&self, path: &Path) -> bool {
        self.shared.cache.invalidate(path)
    }

    /// Starts the hot-reload watcher over `dir`.
    pub fn enable_hot_reload(&self, dir: &Path) -> Result<(), PoolError> {
        let mut watcher = self.watcher.lock();
        if watcher.is_some() {
            return Err(PoolError::InvalidConfig(
                "hot reload already enabled".to_string(),
            ));
        }
        let started = HotReloadWatcher::start(dir, self.shared.cache.clone())
            .map_err(|error| PoolError::InvalidConfig(error.to_string()))?;
        *watcher = Some(started);
        Ok(())
    }

    /// Stops the watcher, joining its thread.
    pub fn disable_hot_reload(&self) {
        if let Some(watcher) = self.watcher.lock().take() {
            watcher.stop();
        }
    }

    /// Stops accepting tasks, optionally waits for in-flight work, then
    /// tears down entries, the cache, and the watcher.
    pub fn shutdown(&self, wait: bool) {
        if self.shared.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.available.notify_all();
        if let Some(workers) = self.workers.lock().take() {
            workers.shutdown(wait);
        }
        self.disable_hot_reload();

        let mut entries = self.shared.entries.lock();
        for entry in entries.iter() {
            *entry.state.lock() = EntryState::Cleanup;
        }
        entries.clear();
        drop(entries);

        self.shared.cache.clear();
        log::debug!("[CALL] pool shut down (wait={wait})");
    }
}

impl Drop for VmPool {
    fn drop(&mut self) {
        self.shutdown(false);
    }
}

impl PoolShared {
    fn new_entry(&self) -> Arc<PoolEntry> {
        let id = self.next_entry_id.fetch_add(1, Ordering::Relaxed) as usize;
        Arc::new(PoolEntry::new(id))
    }

    /// The acquire path: pool mutex first, then the chosen entry's state.
    fn acquire_entry(shared: &Arc<PoolShared>) -> Result<VmHandle, PoolError> {
        if shared.shutting_down.load(Ordering::SeqCst) {
            return Err(PoolError::ShuttingDown);
        }
        shared.check_rate_limit()?;
        shared.check_thread_limit()?;

        let entry = {
            let mut entries = shared.entries.lock();
            let idle = entries.iter().find(|entry| {
                let mut state = entry.state.lock();
                if *state == EntryState::Idle {
                    *state = EntryState::Executing;
                    true
                } else {
                    false
                }
            });
            match idle {
                Some(entry) => entry.clone(),
                None if entries.len() < shared.config.max_vm_count => {
                    let entry = shared.new_entry();
                    *entry.state.lock() = EntryState::Executing;
                    entries.push(entry.clone());
                    PoolStats::bump(&shared.stats.pool_expansions);
                    entry
                }
                None => {
                    PoolStats::bump(&shared.stats.acquisition_failures);
                    return Err(PoolError::Exhausted);
                }
            }
        };

        entry.acquisitions.fetch_add(1, Ordering::Relaxed);
        PoolStats::bump(&shared.stats.acquisitions);
        *shared
            .thread_holds
            .lock()
            .entry(std::thread::current().id())
            .or_insert(0) += 1;

        Ok(VmHandle {
            shared: shared.clone(),
            entry,
            acquired_at: Instant::now(),
        })
    }

    /// The release path: clean the interpreter, mark idle, wake a
    /// waiter.
    fn release_entry(&self, entry: &Arc<PoolEntry>, busy: Duration) {
        {
            let mut vm = entry.vm.lock();
            vm.clear_error_state();
            if self.config.security.clear_globals_on_release {
                log::debug!("[SECURITY] clearing interpreter {} on release", entry.id);
                vm.reset_for_reuse();
            } else if !self.config.enable_vm_reuse {
                *vm = Vm::new();
            }
        }
        entry.record_release(busy);
        *entry.state.lock() = EntryState::Idle;

        let mut holds = self.thread_holds.lock();
        if let Some(count) = holds.get_mut(&std::thread::current().id()) {
            *count = count.saturating_sub(1);
        }
        drop(holds);

        self.available.notify_one();
    }

    fn check_rate_limit(&self) -> Result<(), PoolError> {
        let max = self.config.security.rate_limit_max_requests;
        if max == 0 {
            return Ok(());
        }
        let window = self.config.security.rate_limit_window;
        let now = Instant::now();
        let mut timestamps = self.rate_window.lock();
        while timestamps
            .front()
            .is_some_and(|t| now.duration_since(*t) > window)
        {
            timestamps.pop_front();
        }
        if timestamps.len() >= max {
            log::warn!("[SECURITY] rate limit exceeded ({max} requests per window)");
            PoolStats::bump(&self.stats.acquisition_failures);
            return Err(PoolError::RateLimited);
        }
        timestamps.push_back(now);
        Ok(())
    }

    fn check_thread_limit(&self) -> Result<(), PoolError> {
        let max = self.config.security.max_vms_per_thread;
        if max == 0 {
            return Ok(());
        }
        let holds = self.thread_holds.lock();
        let current = holds
            .get(&std::thread::current().id())
            .copied()
            .unwrap_or(0);
        if current >= max {
            log::warn!("[SECURITY] thread VM limit exceeded ({max} per thread)");
            PoolStats::bump(&self.stats.acquisition_failures);
            return Err(PoolError::ThreadLimit);
        }
        Ok(())
    }

    /// Worker entry point: lease an interpreter (waiting out transient
    /// exhaustion), execute, release, report.
    fn run_task(shared: &Arc<PoolShared>, mut task: ExecutionTask) {
        let started = Instant::now();
        let handle = loop {
            match Self::acquire_entry(shared) {
                Ok(handle) => break Some(handle),
                Err(PoolError::Exhausted) => {
                    if shared.shutting_down.load(Ordering::SeqCst) {
                        break None;
                    }
                    // Pool mutex + condvar: woken on release, bounded
                    // wait so shutdown is never missed.
                    let mut entries = shared.entries.lock();
                    shared
                        .available
                        .wait_for(&mut entries, Duration::from_millis(50));
                }
                Err(error) => {
                    let result = ExecutionResult {
                        task_id: task.id,
                        status: ExecStatus::RuntimeError,
                        error: Some(error.to_string()),
                        elapsed: started.elapsed(),
                    };
                    if let Some(callback) = task.callback.take() {
                        callback(result);
                    }
                    return;
                }
            }
        };

        let Some(handle) = handle else {
            let result = ExecutionResult {
                task_id: task.id,
                status: ExecStatus::RuntimeError,
                error: Some(PoolError::ShuttingDown.to_string()),
                elapsed: started.elapsed(),
            };
            if let Some(callback) = task.callback.take() {
                callback(result);
            }
            return;
        };

        let (status, error) = shared.execute_payload(&handle, &task.payload);
        let elapsed = started.elapsed();
        PoolStats::add_time(&shared.stats.total_execution_nanos, elapsed);
        drop(handle); // release

        let result = ExecutionResult {
            task_id: task.id,
            status,
            error,
            elapsed,
        };
        if let Some(callback) = task.callback.take() {
            callback(result);
        }
    }

    /// Compiles (or fetches from the cache) and runs one payload on the
    /// leased interpreter.
    fn execute_payload(
        &self,
        handle: &VmHandle,
        payload: &TaskPayload,
    ) -> (ExecStatus, Option<String>) {
        match payload {
            TaskPayload::Source { name, source } => {
                let compiled = {
                    let handler = Handler::new();
                    let compile_start = Instant::now();
                    let result = compile(source, name, &handler);
                    PoolStats::add_time(
                        &self.stats.total_compilation_nanos,
                        compile_start.elapsed(),
                    );
                    result
                };
                match compiled {
                    Ok(script) => {
                        let mut vm = handle.vm();
                        let status = vm.run_compiled(script);
                        let error = (!status.is_success())
                            .then(|| vm.pending_exception_trace())
                            .flatten();
                        (status, error)
                    }
                    Err(error) => (ExecStatus::CompileError, Some(error.to_string())),
                }
            }
            TaskPayload::ScriptPath(path) => {
                let canonical = match path.canonicalize() {
                    Ok(canonical) => canonical,
                    Err(error) => {
                        return (
                            ExecStatus::RuntimeError,
                            Some(format!("cannot resolve {}: {error}", path.display())),
                        );
                    }
                };
                let source = match std::fs::read_to_string(&canonical) {
                    Ok(source) => source,
                    Err(error) => {
                        return (
                            ExecStatus::RuntimeError,
                            Some(format!("cannot read {}: {error}", canonical.display())),
                        );
                    }
                };

                let script = if self.config.enable_bytecode_caching {
                    let fp = fingerprint(&source);
                    match self.cache.fetch(&canonical, fp) {
                        Some(entry) => Ok(entry.script.clone()),
                        None => {
                            let handler = Handler::new();
                            let compile_start = Instant::now();
                            let compiled = compile(
                                &source,
                                &canonical.to_string_lossy(),
                                &handler,
                            );
                            PoolStats::add_time(
                                &self.stats.total_compilation_nanos,
                                compile_start.elapsed(),
                            );
                            compiled.map(|script| {
                                let mtime = std::fs::metadata(&canonical)
                                    .and_then(|m| m.modified())
                                    .ok();
                                self.cache
                                    .insert(&canonical, &source, script, mtime)
                                    .script
                                    .clone()
                            })
                        }
                    }
                } else {
                    let handler = Handler::new();
                    let compile_start = Instant::now();
                    let compiled = compile(&source, &canonical.to_string_lossy(), &handler);
                    PoolStats::add_time(
                        &self.stats.total_compilation_nanos,
                        compile_start.elapsed(),
                    );
                    compiled
                };

                match script {
                    Ok(script) => {
                        let mut vm = handle.vm();
                        let status = vm.run_compiled(script);
                        let error = (!status.is_success())
                            .then(|| vm.pending_exception_trace())
                            .flatten();
                        (status, error)
                    }
                    Err(error) => (ExecStatus::CompileError, Some(error.to_string())),
                }
            }
        }
    }
}
