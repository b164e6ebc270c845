//! Bytecode cache behavior through the pool: hit/miss counters across
//! repeated executions, explicit invalidation, staleness on source
//! change, and hot-reload invalidation.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use ember_pool::{PoolConfig, VmPool};
use tempfile::TempDir;

fn pool() -> VmPool {
    let pool = VmPool::new(PoolConfig {
        initial_vm_count: 1,
        max_vm_count: 2,
        worker_threads: 2,
        ..Default::default()
    })
    .unwrap();
    pool.start().unwrap();
    pool
}

fn write_script(dir: &Path, name: &str, source: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, source).unwrap();
    path
}

/// Runs a script file through the pool and waits for its result.
fn run_script(pool: &VmPool, path: &Path) -> ember_pool::ExecutionResult {
    let (tx, rx) = mpsc::channel();
    pool.submit_script_execution(
        path,
        Some(Box::new(move |result| {
            tx.send(result).unwrap();
        })),
    )
    .unwrap();
    rx.recv_timeout(Duration::from_secs(5)).unwrap()
}

#[test]
fn test_second_execution_is_a_cache_hit() {
    let dir = TempDir::new().unwrap();
    let script = write_script(dir.path(), "job.ember", "x = 6 * 7");
    let pool = pool();

    assert!(run_script(&pool, &script).is_success());
    let after_first = pool.get_stats();
    assert_eq!(after_first.cache_hits, 0);
    assert_eq!(after_first.cache_misses, 1);
    assert_eq!(after_first.cached_script_count, 1);

    assert!(run_script(&pool, &script).is_success());
    let after_second = pool.get_stats();
    assert_eq!(after_second.cache_hits, 1);
    assert_eq!(after_second.cache_misses, 1);

    pool.shutdown(true);
}

#[test]
fn test_invalidate_forces_a_miss() {
    let dir = TempDir::new().unwrap();
    let script = write_script(dir.path(), "job.ember", "x = 1");
    let pool = pool();

    assert!(run_script(&pool, &script).is_success());
    assert!(run_script(&pool, &script).is_success());
    let before = pool.get_stats();
    assert_eq!(before.cache_hits, 1);

    let canonical = script.canonicalize().unwrap();
    assert!(pool.invalidate_cache(&canonical));

    assert!(run_script(&pool, &script).is_success());
    let after = pool.get_stats();
    assert_eq!(after.cache_hits, 1, "post-invalidate execution must miss");
    assert_eq!(after.cache_misses, before.cache_misses + 1);

    pool.shutdown(true);
}

#[test]
fn test_changed_source_is_recompiled() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let script = write_script(dir.path(), "job.ember", "result = 1");
    let pool = pool();

    assert!(run_script(&pool, &script).is_success());

    // Change the content; the fingerprint check must reject the cached
    // entry even though the path is the same.
    fs::write(&script, "result = 2")?;
    assert!(run_script(&pool, &script).is_success());

    let stats = pool.get_stats();
    assert_eq!(stats.cache_hits, 0);
    assert_eq!(stats.cache_misses, 2);

    pool.shutdown(true);
    Ok(())
}

#[test]
fn test_compile_error_is_reported_not_cached() {
    let dir = TempDir::new().unwrap();
    let script = write_script(dir.path(), "bad.ember", "fn (");
    let pool = pool();

    let result = run_script(&pool, &script);
    assert!(!result.is_success());
    assert!(result.error.is_some());
    assert_eq!(pool.get_stats().cached_script_count, 0);

    pool.shutdown(true);
}

#[test]
fn test_compilation_time_is_tracked() {
    let dir = TempDir::new().unwrap();
    let script = write_script(
        dir.path(),
        "job.ember",
        "fn work(n) { return n * 2 }\nwork(21)",
    );
    let pool = pool();
    assert!(run_script(&pool, &script).is_success());

    let stats = pool.get_stats();
    assert!(stats.total_compilation_time > Duration::ZERO);
    assert!(stats.total_execution_time > Duration::ZERO);

    // A cache hit adds no compilation time.
    assert!(run_script(&pool, &script).is_success());
    let after = pool.get_stats();
    assert_eq!(after.total_compilation_time, stats.total_compilation_time);

    pool.shutdown(true);
}

#[test]
fn test_hot_reload_invalidates_changed_scripts() {
    let dir = TempDir::new().unwrap();
    let script = write_script(dir.path(), "watched.ember", "v = 1");
    let pool = pool();

    assert!(run_script(&pool, &script).is_success());
    assert_eq!(pool.get_stats().cached_script_count, 1);

    pool.enable_hot_reload(dir.path()).unwrap();
    // Give the watcher a beat to prime, then touch the file with
    // different content (content implies a new mtime granularity-proof
    // change is detected either way via the fingerprint, but the
    // watcher should drop the entry on its own).
    std::thread::sleep(Duration::from_millis(300));
    fs::write(&script, "v = 2").unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    let mut invalidated = false;
    while Instant::now() < deadline {
        if pool.get_stats().cached_script_count == 0 {
            invalidated = true;
            break;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    assert!(invalidated, "watcher should invalidate the changed script");

    pool.disable_hot_reload();
    pool.shutdown(true);
}

#[test]
fn test_lru_eviction_under_pressure() {
    let dir = TempDir::new().unwrap();
    let pool = VmPool::new(PoolConfig {
        initial_vm_count: 1,
        max_vm_count: 2,
        max_script_cache_size: 4,
        worker_threads: 1,
        ..Default::default()
    })
    .unwrap();
    pool.start().unwrap();

    for i in 0..10 {
        let script = write_script(dir.path(), &format!("s{i}.ember"), &format!("x = {i}"));
        assert!(run_script(&pool, &script).is_success());
    }

    let stats = pool.get_stats();
    assert!(
        stats.cached_script_count <= 4,
        "capacity must bound the cache, got {}",
        stats.cached_script_count
    );

    pool.shutdown(true);
}
