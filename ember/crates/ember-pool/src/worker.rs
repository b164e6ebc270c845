//! The work-stealing worker pool that drains submitted tasks.
//!
//! Topology: one global injector queue, one local deque per worker, and
//! a stealer handle onto every local deque. A worker prefers its own
//! deque, then batches from the injector, then steals from siblings.
//! Idle workers park on a condvar with a jittered timeout so a burst of
//! submissions doesn't wake the whole fleet against one task.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_deque::{Injector, Stealer, Worker};
use parking_lot::{Condvar, Mutex};
use rand::Rng;

use crate::task::ExecutionTask;

/// The function each worker runs per task.
pub type TaskRunner = Arc<dyn Fn(ExecutionTask) + Send + Sync + 'static>;

/// A fixed set of worker threads around a shared injector.
pub struct WorkerPool {
    injector: Arc<Injector<ExecutionTask>>,
    shutdown: Arc<AtomicBool>,
    wakeup: Arc<(Mutex<()>, Condvar)>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `threads` workers that feed tasks into `runner`.
    pub fn start(threads: usize, runner: TaskRunner) -> Self {
        let injector = Arc::new(Injector::new());
        let shutdown = Arc::new(AtomicBool::new(false));
        let wakeup = Arc::new((Mutex::new(()), Condvar::new()));

        let locals: Vec<Worker<ExecutionTask>> =
            (0..threads.max(1)).map(|_| Worker::new_fifo()).collect();
        let stealers: Arc<Vec<Stealer<ExecutionTask>>> =
            Arc::new(locals.iter().map(Worker::stealer).collect());

        let mut handles = Vec::with_capacity(locals.len());
        for (index, local) in locals.into_iter().enumerate() {
            let injector = injector.clone();
            let stealers = stealers.clone();
            let shutdown = shutdown.clone();
            let wakeup = wakeup.clone();
            let runner = runner.clone();

            let handle = std::thread::Builder::new()
                .name(format!("ember-worker-{index}"))
                .spawn(move || {
                    worker_loop(index, local, injector, stealers, shutdown, wakeup, runner)
                })
                .expect("failed to spawn worker thread");
            handles.push(handle);
        }

        Self {
            injector,
            shutdown,
            wakeup,
            handles,
        }
    }

    /// Enqueues a task and wakes a worker.
    pub fn submit(&self, task: ExecutionTask) {
        self.injector.push(task);
        self.wakeup.1.notify_one();
    }

    /// Tasks waiting in the injector (local deques not counted).
    pub fn pending(&self) -> usize {
        self.injector.len()
    }

    /// Stops the workers. Queued tasks are still drained; `wait` joins
    /// the threads before returning.
    pub fn shutdown(mut self, wait: bool) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.wakeup.1.notify_all();
        if wait {
            for handle in self.handles.drain(..) {
                let _ = handle.join();
            }
        }
    }
}

fn worker_loop(
    index: usize,
    local: Worker<ExecutionTask>,
    injector: Arc<Injector<ExecutionTask>>,
    stealers: Arc<Vec<Stealer<ExecutionTask>>>,
    shutdown: Arc<AtomicBool>,
    wakeup: Arc<(Mutex<()>, Condvar)>,
    runner: TaskRunner,
) {
    log::debug!("[CALL] worker {index} started");
    loop {
        if let Some(task) = find_task(&local, &injector, &stealers) {
            runner(task);
            continue;
        }
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        // Jittered park so simultaneous idlers don't wake in lockstep.
        let timeout = Duration::from_millis(10 + rand::thread_rng().gen_range(0..10));
        let mut guard = wakeup.0.lock();
        wakeup.1.wait_for(&mut guard, timeout);
    }
    log::debug!("[CALL] worker {index} stopped");
}

/// The standard crossbeam-deque scavenging order: local deque, injector
/// batch, then sibling steals; retry while any source reports Retry.
fn find_task(
    local: &Worker<ExecutionTask>,
    injector: &Injector<ExecutionTask>,
    stealers: &[Stealer<ExecutionTask>],
) -> Option<ExecutionTask> {
    local.pop().or_else(|| {
        std::iter::repeat_with(|| {
            injector
                .steal_batch_and_pop(local)
                .or_else(|| stealers.iter().map(Stealer::steal).collect())
        })
        .find(|steal| !steal.is_retry())
        .and_then(|steal| steal.success())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskPayload;
    use std::sync::atomic::AtomicU64;

    fn task(id: u64) -> ExecutionTask {
        ExecutionTask {
            id,
            payload: TaskPayload::Source {
                name: "test".to_string(),
                source: String::new(),
            },
            callback: None,
        }
    }

    #[test]
    fn test_all_submitted_tasks_run() {
        let counter = Arc::new(AtomicU64::new(0));
        let seen = counter.clone();
        let pool = WorkerPool::start(4, Arc::new(move |_task| {
            seen.fetch_add(1, Ordering::SeqCst);
        }));

        for i in 0..100 {
            pool.submit(task(i));
        }
        pool.shutdown(true);
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn test_shutdown_with_empty_queue() {
        let pool = WorkerPool::start(2, Arc::new(|_task| {}));
        pool.shutdown(true);
    }
}
