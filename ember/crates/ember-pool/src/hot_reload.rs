//! Hot-reload watcher: a polling thread that invalidates cache entries
//! when `.ember` sources change on disk.
//!
//! The watcher is deliberately simple - an mtime sweep on an interval,
//! interruptible through a channel so `disable` joins promptly instead
//! of waiting out a poll. Its only contract with the cache is
//! `invalidate(path)`; an embedder with a native file-notification
//! source can drive the same call itself.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime};

use crossbeam::channel::{bounded, RecvTimeoutError, Sender};

use crate::cache::BytecodeCache;

/// Files with this extension are watched.
const WATCHED_EXT: &str = "ember";

/// Poll interval.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// A running watcher thread.
pub struct HotReloadWatcher {
    stop: Sender<()>,
    handle: Option<JoinHandle<()>>,
    /// The directory being watched.
    pub dir: PathBuf,
}

impl HotReloadWatcher {
    /// Starts watching `dir` (recursively), invalidating `cache` entries
    /// for scripts whose mtime changes.
    pub fn start(dir: &Path, cache: Arc<BytecodeCache>) -> std::io::Result<Self> {
        if !dir.is_dir() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("watch target is not a directory: {}", dir.display()),
            ));
        }

        let (stop_tx, stop_rx) = bounded::<()>(1);
        let watched = dir.to_path_buf();

        let handle = std::thread::Builder::new()
            .name("ember-hot-reload".to_string())
            .spawn(move || {
                // Prime with the current state so pre-existing files
                // don't trigger a spurious invalidation wave.
                let mut seen = scan(&watched);
                log::debug!(
                    "[MODULE] hot reload watching {} ({} files)",
                    watched.display(),
                    seen.len()
                );
                loop {
                    match stop_rx.recv_timeout(POLL_INTERVAL) {
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                        Err(RecvTimeoutError::Timeout) => {}
                    }
                    let current = scan(&watched);
                    for (path, mtime) in &current {
                        if seen.get(path) != Some(mtime) {
                            log::debug!("[MODULE] hot reload: {} changed", path.display());
                            cache.invalidate(path);
                        }
                    }
                    // Deleted files invalidate too.
                    for path in seen.keys() {
                        if !current.contains_key(path) {
                            log::debug!("[MODULE] hot reload: {} removed", path.display());
                            cache.invalidate(path);
                        }
                    }
                    seen = current;
                }
            })?;

        Ok(Self {
            stop: stop_tx,
            handle: Some(handle),
            dir: dir.to_path_buf(),
        })
    }

    /// Stops the watcher and joins its thread.
    pub fn stop(mut self) {
        let _ = self.stop.try_send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for HotReloadWatcher {
    fn drop(&mut self) {
        let _ = self.stop.try_send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Collects mtimes of watched files under `dir`, recursively.
fn scan(dir: &Path) -> HashMap<PathBuf, SystemTime> {
    let mut out = HashMap::new();
    scan_into(dir, &mut out, 0);
    out
}

fn scan_into(dir: &Path, out: &mut HashMap<PathBuf, SystemTime>, depth: usize) {
    // Symlink loops are cut off by a depth bound.
    if depth > 16 {
        return;
    }
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            scan_into(&path, out, depth + 1);
        } else if path.extension().is_some_and(|ext| ext == WATCHED_EXT) {
            if let Ok(metadata) = entry.metadata() {
                if let Ok(mtime) = metadata.modified() {
                    // Canonical keys match what the cache stores.
                    let key = path.canonicalize().unwrap_or(path);
                    out.insert(key, mtime);
                }
            }
        }
    }
}
