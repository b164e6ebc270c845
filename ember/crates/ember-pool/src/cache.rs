//! The process-scoped bytecode cache.
//!
//! Keyed by script path, guarded by a reader/writer lock. Entries are
//! `Arc`-shared: a reader's handle stays valid even if eviction or
//! invalidation removes the entry from the index while the reader is
//! still using it - the refcount is what makes eviction safe without
//! copying bytecode out under the read lock.
//!
//! Staleness is two-layered: a content fingerprint (FNV-1a of the
//! source) that the caller re-checks on every hit, and an optional TTL /
//! source-mtime check for embedders that would rather not read the file.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use ember_compile::Function;
use ember_util::fnv1a_64;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;

/// One cached compilation.
#[derive(Debug)]
pub struct CacheEntry {
    /// The script path this entry caches.
    pub path: PathBuf,
    /// FNV-1a fingerprint of the source that was compiled.
    pub fingerprint: u64,
    /// The compiled script.
    pub script: Arc<Function>,
    /// Source size in bytes.
    pub size: usize,
    /// When the compilation happened.
    pub compiled_at: SystemTime,
    /// Source file mtime at compile time, when known.
    pub source_mtime: Option<SystemTime>,
    /// Number of lookups that returned this entry.
    access_count: AtomicU64,
    /// Monotonic timestamp (nanos since the cache was created) of the
    /// last lookup.
    last_access: AtomicU64,
}

impl CacheEntry {
    /// Number of hits this entry has served.
    pub fn access_count(&self) -> u64 {
        self.access_count.load(Ordering::Relaxed)
    }

    fn last_access(&self) -> u64 {
        self.last_access.load(Ordering::Relaxed)
    }
}

/// Fingerprints a source text.
pub fn fingerprint(source: &str) -> u64 {
    fnv1a_64(source.as_bytes())
}

/// A bounded, thread-safe map from script path to compiled bytecode.
#[derive(Debug)]
pub struct BytecodeCache {
    /// The index. Insert/invalidate/clear take the write lock; lookups
    /// share the read lock.
    entries: RwLock<FxHashMap<PathBuf, Arc<CacheEntry>>>,
    /// Maximum entries before LRU eviction.
    capacity: usize,
    /// Entries older than this are stale regardless of fingerprint.
    ttl: Duration,
    /// Base for last-access timestamps.
    epoch: Instant,
    /// Lookup hits.
    hits: AtomicU64,
    /// Lookup misses (including stale hits).
    misses: AtomicU64,
}

impl BytecodeCache {
    /// Creates a cache holding at most `capacity` entries.
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(FxHashMap::default()),
            capacity: capacity.max(1),
            ttl,
            epoch: Instant::now(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Number of cached scripts.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Lookup hits so far.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Lookup misses so far.
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Looks up a fresh entry for `path`.
    ///
    /// A hit requires the stored fingerprint to match the current
    /// source's; a mismatch (the file changed) invalidates the entry and
    /// counts as a miss, falling through to recompilation.
    pub fn fetch(&self, path: &Path, current_fingerprint: u64) -> Option<Arc<CacheEntry>> {
        let entry = {
            let entries = self.entries.read();
            entries.get(path).cloned()
        };

        let Some(entry) = entry else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        let fresh = entry.fingerprint == current_fingerprint && !self.expired(&entry);
        if !fresh {
            self.misses.fetch_add(1, Ordering::Relaxed);
            self.invalidate(path);
            return None;
        }

        entry.access_count.fetch_add(1, Ordering::Relaxed);
        entry
            .last_access
            .store(self.now_nanos(), Ordering::Relaxed);
        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(entry)
    }

    /// Inserts a compilation, evicting the least recently used entry if
    /// the cache is full.
    ///
    /// An existing entry for the same path is swapped atomically:
    /// concurrent readers observe either the old `Arc` or the new one.
    pub fn insert(
        &self,
        path: &Path,
        source: &str,
        script: Arc<Function>,
        source_mtime: Option<SystemTime>,
    ) -> Arc<CacheEntry> {
        let entry = Arc::new(CacheEntry {
            path: path.to_path_buf(),
            fingerprint: fingerprint(source),
            script,
            size: source.len(),
            compiled_at: SystemTime::now(),
            source_mtime,
            access_count: AtomicU64::new(0),
            last_access: AtomicU64::new(self.now_nanos()),
        });

        let mut entries = self.entries.write();
        if !entries.contains_key(path) && entries.len() >= self.capacity {
            if let Some(victim) = Self::pick_lru(&entries) {
                log::debug!(
                    "[MODULE] cache evicting {} (last access {}ns, {} hits)",
                    victim.display(),
                    entries[&victim].last_access(),
                    entries[&victim].access_count()
                );
                entries.remove(&victim);
            }
        }
        entries.insert(path.to_path_buf(), entry.clone());
        entry
    }

    /// Removes one path.
    pub fn invalidate(&self, path: &Path) -> bool {
        self.entries.write().remove(path).is_some()
    }

    /// Removes every entry.
    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// The eviction victim: oldest last-access, ties broken by lowest
    /// access count.
    fn pick_lru(entries: &FxHashMap<PathBuf, Arc<CacheEntry>>) -> Option<PathBuf> {
        entries
            .iter()
            .min_by_key(|(_, entry)| (entry.last_access(), entry.access_count()))
            .map(|(path, _)| path.clone())
    }

    fn expired(&self, entry: &CacheEntry) -> bool {
        if self.ttl.is_zero() {
            return false;
        }
        entry
            .compiled_at
            .elapsed()
            .map(|age| age > self.ttl)
            .unwrap_or(false)
    }

    fn now_nanos(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }
}
