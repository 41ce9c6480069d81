//! In-memory path → content-hash cache
//!
//! Avoids disk I/O on read-through checks and short-circuits unchanged files
//! during sync. Not persisted; a new process starts cold.
//!
//! # Thread Safety
//!
//! Entries live behind a `parking_lot::RwLock`; hit/miss counters are atomics
//! so lookups only take the read lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub hash: String,
    /// Modification time (ms) observed when the hash was computed
    pub mtime: i64,
}

/// Snapshot of cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct HashCacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}

#[derive(Debug, Default)]
pub struct HashCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl HashCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a path, counting the hit or miss
    pub fn lookup(&self, path: &str) -> Option<CacheEntry> {
        let found = self.entries.read().get(path).cloned();
        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    /// Hash only
    pub fn get(&self, path: &str) -> Option<String> {
        self.lookup(path).map(|e| e.hash)
    }

    pub fn set(&self, path: impl Into<String>, hash: impl Into<String>, mtime: i64) {
        self.entries.write().insert(
            path.into(),
            CacheEntry {
                hash: hash.into(),
                mtime,
            },
        );
    }

    /// Remove one path; returns whether it was present
    pub fn evict(&self, path: &str) -> bool {
        self.entries.write().remove(path).is_some()
    }

    /// Remove a path and everything beneath it (directory removal)
    pub fn evict_prefix(&self, dir: &str) -> usize {
        let prefix = format!("{}/", dir.trim_end_matches('/'));
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|path, _| path != dir && !path.starts_with(&prefix));
        before - entries.len()
    }

    pub fn evict_batch<'a, I>(&self, paths: I) -> usize
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut entries = self.entries.write();
        paths
            .into_iter()
            .filter(|p| entries.remove(*p).is_some())
            .count()
    }

    /// Drop every entry and reset counters
    pub fn clear(&self) {
        self.entries.write().clear();
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let total = hits + self.misses.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    pub fn stats(&self) -> HashCacheStats {
        HashCacheStats {
            entries: self.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            hit_rate: self.hit_rate(),
        }
    }
}
