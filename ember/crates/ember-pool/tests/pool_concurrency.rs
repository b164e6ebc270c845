//! Pool concurrency tests: exclusivity under load, growth to cap,
//! fail-fast exhaustion, security limits, and shutdown ordering.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use ember_pool::{PoolConfig, SecurityConfig, TaskPayload, VmPool};
use ember_vm::Value;

fn small_pool(initial: usize, max: usize) -> VmPool {
    let pool = VmPool::new(PoolConfig {
        initial_vm_count: initial,
        max_vm_count: max,
        worker_threads: 4,
        ..Default::default()
    })
    .expect("config is valid");
    pool.start().expect("pool starts");
    pool
}

fn source_task(source: &str) -> TaskPayload {
    TaskPayload::Source {
        name: "test".to_string(),
        source: source.to_string(),
    }
}

#[test]
fn test_acquire_release_cycle() {
    let pool = small_pool(1, 2);
    let handle = pool.acquire().expect("one idle interpreter");
    {
        let mut vm = handle.vm();
        assert!(vm.eval("x = 21 * 2\nx").is_success());
        assert!(matches!(vm.pop_result(), Some(Value::Number(n)) if n == 42.0));
    }
    pool.release(handle);

    let stats = pool.get_stats();
    assert_eq!(stats.acquisitions, 1);
    assert_eq!(stats.idle_vms, stats.total_vms);
    pool.shutdown(true);
}

#[test]
fn test_pool_grows_to_cap_then_fails_fast() {
    let pool = small_pool(1, 3);
    let first = pool.acquire().unwrap();
    let second = pool.acquire().unwrap();
    let third = pool.acquire().unwrap();

    // Cap reached and everything busy: fail, don't block.
    assert!(pool.acquire().is_err());

    let stats = pool.get_stats();
    assert_eq!(stats.total_vms, 3);
    assert_eq!(stats.executing_vms, 3);
    assert_eq!(stats.pool_expansions, 2);
    assert_eq!(stats.acquisition_failures, 1);

    pool.release(first);
    assert!(pool.acquire().is_ok(), "released entry is reusable");

    drop(second);
    drop(third);
    pool.shutdown(true);
}

#[test]
fn test_sixty_four_tasks_over_cap_four() {
    let pool = Arc::new(small_pool(2, 4));

    // Watch the executing count from a sampler thread while the tasks
    // run; it must never exceed the cap.
    let max_seen = Arc::new(AtomicUsize::new(0));
    let sampler_stop = Arc::new(AtomicUsize::new(0));
    let sampler = {
        let pool = pool.clone();
        let max_seen = max_seen.clone();
        let stop = sampler_stop.clone();
        std::thread::spawn(move || {
            while stop.load(Ordering::SeqCst) == 0 {
                let executing = pool.get_stats().executing_vms;
                max_seen.fetch_max(executing, Ordering::SeqCst);
                std::thread::sleep(Duration::from_micros(200));
            }
        })
    };

    let (tx, rx) = mpsc::channel();
    for i in 0..64 {
        let tx = tx.clone();
        pool.submit_request(
            source_task(&format!(
                "total = 0\nfor (j = 0; j < 500; j = j + 1) {{ total = total + j }}\nassert(total == 124750, \"task {i}\")"
            )),
            Some(Box::new(move |result| {
                tx.send(result).unwrap();
            })),
        )
        .unwrap();
    }
    drop(tx);

    let mut completed = 0;
    for result in rx.iter() {
        assert!(
            result.is_success(),
            "task {} failed: {:?}",
            result.task_id,
            result.error
        );
        completed += 1;
    }
    assert_eq!(completed, 64);

    sampler_stop.store(1, Ordering::SeqCst);
    sampler.join().unwrap();
    assert!(
        max_seen.load(Ordering::SeqCst) <= 4,
        "executing count exceeded the cap: {}",
        max_seen.load(Ordering::SeqCst)
    );

    let stats = pool.get_stats();
    assert!(stats.total_vms <= 4);
    assert_eq!(stats.total_requests, 64);
    pool.shutdown(true);
}

#[test]
fn test_task_callback_reports_script_errors() {
    let pool = small_pool(1, 2);
    let (tx, rx) = mpsc::channel();
    pool.submit_request(
        source_task("throw \"deliberate\""),
        Some(Box::new(move |result| {
            tx.send(result).unwrap();
        })),
    )
    .unwrap();

    let result = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(!result.is_success());
    assert!(
        result.error.as_deref().unwrap_or("").contains("deliberate"),
        "{:?}",
        result.error
    );
    pool.shutdown(true);
}

#[test]
fn test_interpreters_are_isolated_between_tasks() {
    let pool = small_pool(1, 1);

    // First tenant leaves a global behind.
    let handle = pool.acquire().unwrap();
    assert!(handle.vm().eval("leftover = 99").is_success());
    pool.release(handle);

    // With reuse enabled (default) the global persists on the same
    // interpreter; embedders that need isolation set
    // clear_globals_on_release.
    let handle = pool.acquire().unwrap();
    let status = {
        let mut vm = handle.vm();
        let status = vm.eval("leftover");
        vm.pop_result();
        status
    };
    assert!(status.is_success());
    pool.release(handle);
    pool.shutdown(true);

    // Now the hardened configuration.
    let pool = VmPool::new(PoolConfig {
        initial_vm_count: 1,
        max_vm_count: 1,
        security: SecurityConfig {
            clear_globals_on_release: true,
            ..Default::default()
        },
        ..Default::default()
    })
    .unwrap();
    pool.start().unwrap();

    let handle = pool.acquire().unwrap();
    assert!(handle.vm().eval("secret = 42").is_success());
    pool.release(handle);

    let handle = pool.acquire().unwrap();
    let status = handle.vm().eval("secret");
    assert!(!status.is_success(), "globals must be wiped on release");
    pool.release(handle);
    pool.shutdown(true);
}

#[test]
fn test_rate_limit_rejects_burst() {
    let pool = VmPool::new(PoolConfig {
        initial_vm_count: 1,
        max_vm_count: 8,
        security: SecurityConfig {
            rate_limit_window: Duration::from_secs(10),
            rate_limit_max_requests: 3,
            ..Default::default()
        },
        ..Default::default()
    })
    .unwrap();
    pool.start().unwrap();

    let a = pool.acquire().unwrap();
    let b = pool.acquire().unwrap();
    let c = pool.acquire().unwrap();
    assert!(matches!(
        pool.acquire(),
        Err(ember_pool::PoolError::RateLimited)
    ));

    drop(a);
    drop(b);
    drop(c);
    pool.shutdown(true);
}

#[test]
fn test_thread_vm_limit() {
    let pool = VmPool::new(PoolConfig {
        initial_vm_count: 2,
        max_vm_count: 8,
        security: SecurityConfig {
            max_vms_per_thread: 1,
            ..Default::default()
        },
        ..Default::default()
    })
    .unwrap();
    pool.start().unwrap();

    let first = pool.acquire().unwrap();
    assert!(matches!(
        pool.acquire(),
        Err(ember_pool::PoolError::ThreadLimit)
    ));
    drop(first);
    assert!(pool.acquire().is_ok(), "limit frees up on release");
    pool.shutdown(true);
}

#[test]
fn test_shutdown_rejects_new_work_but_finishes_queued() {
    let pool = small_pool(1, 2);
    let completed = Arc::new(Mutex::new(Vec::new()));

    for i in 0..8 {
        let completed = completed.clone();
        pool.submit_request(
            source_task("x = 1"),
            Some(Box::new(move |result| {
                completed.lock().unwrap().push((i, result.is_success()));
            })),
        )
        .unwrap();
    }

    pool.shutdown(true);
    assert_eq!(completed.lock().unwrap().len(), 8, "queued work drains");
    assert!(pool.submit_request(source_task("x = 1"), None).is_err());
    assert!(pool.acquire().is_err());
}

#[test]
fn test_maintain_prunes_idle_entries_down_to_initial() {
    let pool = VmPool::new(PoolConfig {
        initial_vm_count: 1,
        max_vm_count: 4,
        vm_idle_timeout: Duration::ZERO,
        ..Default::default()
    })
    .unwrap();
    pool.start().unwrap();

    // Grow past the initial size, then release everything.
    let a = pool.acquire().unwrap();
    let b = pool.acquire().unwrap();
    let c = pool.acquire().unwrap();
    drop(a);
    drop(b);
    drop(c);
    assert_eq!(pool.get_stats().total_vms, 3);

    std::thread::sleep(Duration::from_millis(5));
    let removed = pool.maintain();
    assert_eq!(removed, 2);
    assert_eq!(pool.get_stats().total_vms, 1);
    pool.shutdown(true);
}

#[test]
fn test_stats_utilization() {
    let pool = small_pool(2, 4);
    let handle = pool.acquire().unwrap();
    let stats = pool.get_stats();
    assert_eq!(stats.executing_vms, 1);
    assert!(stats.utilization_percent > 0.0);
    assert!(stats.utilization_percent <= 100.0);
    drop(handle);
    pool.shutdown(true);
}

#[test]
fn test_parallel_acquire_from_many_threads() {
    let pool = Arc::new(small_pool(4, 8));
    let barrier = Arc::new(std::sync::Barrier::new(8));
    let mut threads = Vec::new();

    for t in 0..8 {
        let pool = pool.clone();
        let barrier = barrier.clone();
        threads.push(std::thread::spawn(move || {
            barrier.wait();
            for i in 0..20 {
                loop {
                    match pool.acquire() {
                        Ok(handle) => {
                            let mut vm = handle.vm();
                            let status =
                                vm.eval(&format!("v = {t} * 1000 + {i}\nv"));
                            assert!(status.is_success());
                            let value = vm.pop_result();
                            assert!(matches!(
                                value,
                                Some(Value::Number(n)) if n == (t * 1000 + i) as f64
                            ));
                            drop(vm);
                            drop(handle);
                            break;
                        }
                        Err(ember_pool::PoolError::Exhausted) => {
                            std::thread::yield_now();
                        }
                        Err(other) => panic!("unexpected error: {other}"),
                    }
                }
            }
        }));
    }
    for thread in threads {
        thread.join().unwrap();
    }

    let stats = pool.get_stats();
    assert_eq!(stats.acquisitions, 160);
    assert_eq!(stats.executing_vms, 0);
    pool.shutdown(true);
}
