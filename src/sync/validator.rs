//! Read-through freshness validation
//!
//! Queries check each source they return against the disk. The hash cache
//! answers first; a miss (or an mtime that moved) falls back to hashing the
//! file. A stale or missing source is reported to the caller and the path is
//! enqueued with trigger `read_through`. Nothing blocks on the resync.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use rayon::prelude::*;
use serde::Serialize;

use crate::error::{KgError, Result};
use crate::fs_utils::{absolute_path, file_mtime, hash_file};
use crate::hash_cache::HashCache;
use crate::model::Trigger;

use super::queue::ResyncSink;

/// Freshness of one source file against its stored hash
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Freshness {
    pub stale: bool,
    pub deleted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_hash: Option<String>,
}

impl Freshness {
    fn fresh(hash: String) -> Self {
        Self {
            stale: false,
            deleted: false,
            current_hash: Some(hash),
        }
    }
}

pub struct ReadThroughValidator {
    root: PathBuf,
    cache: Arc<HashCache>,
    sink: Arc<dyn ResyncSink>,
    enabled: bool,
    pool: rayon::ThreadPool,
}

impl ReadThroughValidator {
    pub fn new(
        root: PathBuf,
        cache: Arc<HashCache>,
        sink: Arc<dyn ResyncSink>,
        enabled: bool,
        concurrency: usize,
    ) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(concurrency.max(1))
            .thread_name(|i| format!("kgraph-validate-{}", i))
            .build()
            .map_err(|e| KgError::config(format!("validation pool: {}", e)))?;
        Ok(Self {
            root,
            cache,
            sink,
            enabled,
            pool,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Check one path; enqueues a resync when the file moved on
    pub fn validate_source(&self, path: &str, stored_hash: &str) -> Freshness {
        if !self.enabled {
            return Freshness {
                current_hash: Some(stored_hash.to_string()),
                ..Freshness::default()
            };
        }

        let freshness = self.check(path, stored_hash);
        if freshness.stale && (freshness.deleted || freshness.current_hash.is_some()) {
            if self.sink.request_resync(path, Trigger::ReadThrough) {
                tracing::debug!("[SYNC] Read-through resync queued for {}", path);
            }
        }
        freshness
    }

    /// Validate many `(path, stored_hash)` pairs in parallel. Each distinct
    /// pair is checked once; a path recorded under two hashes gets one
    /// answer per hash.
    pub fn validate_batch<'a, I>(&self, sources: I) -> HashMap<(String, String), Freshness>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let unique: BTreeSet<(&str, &str)> = sources.into_iter().collect();
        let entry = |(path, hash): &(&str, &str)| {
            (
                (path.to_string(), hash.to_string()),
                self.validate_source(path, hash),
            )
        };
        if unique.len() <= 1 {
            return unique.iter().map(entry).collect();
        }
        let pairs: Vec<(&str, &str)> = unique.into_iter().collect();
        self.pool.install(|| pairs.par_iter().map(entry).collect())
    }

    fn check(&self, path: &str, stored_hash: &str) -> Freshness {
        let abs = absolute_path(&self.root, path);
        let mtime = match file_mtime(&abs) {
            Ok(mtime) => mtime,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.cache.evict(path);
                return Freshness {
                    stale: true,
                    deleted: true,
                    current_hash: None,
                };
            }
            Err(e) => {
                tracing::warn!("[SYNC] Cannot stat {}: {}", path, e);
                return Freshness {
                    stale: true,
                    ..Freshness::default()
                };
            }
        };

        let current = match self.cache.lookup(path) {
            Some(entry) if entry.mtime == mtime => entry.hash,
            _ => match hash_file(&abs) {
                Ok(hash) => {
                    self.cache.set(path, hash.clone(), mtime);
                    hash
                }
                Err(e) => {
                    // Unreadable right now; report stale without a resync
                    tracing::warn!("[SYNC] Cannot hash {}: {}", path, e);
                    return Freshness {
                        stale: true,
                        ..Freshness::default()
                    };
                }
            },
        };

        if current == stored_hash {
            Freshness::fresh(current)
        } else {
            Freshness {
                stale: true,
                deleted: false,
                current_hash: Some(current),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs_utils::hash_bytes;
    use crate::sync::queue::SyncQueue;
    use std::fs;
    use tempfile::TempDir;

    fn setup(enabled: bool) -> (TempDir, Arc<SyncQueue>, Arc<HashCache>, ReadThroughValidator) {
        let dir = TempDir::new().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let queue = Arc::new(SyncQueue::new());
        let cache = Arc::new(HashCache::new());
        let validator = ReadThroughValidator::new(
            root,
            Arc::clone(&cache),
            queue.clone() as Arc<dyn ResyncSink>,
            enabled,
            4,
        )
        .unwrap();
        (dir, queue, cache, validator)
    }

    #[test]
    fn test_fresh_source_populates_cache() {
        let (dir, queue, cache, validator) = setup(true);
        fs::write(dir.path().join("a.rs"), "fn a() {}").unwrap();
        let hash = hash_bytes(b"fn a() {}");

        let freshness = validator.validate_source("a.rs", &hash);
        assert!(!freshness.stale);
        assert_eq!(freshness.current_hash.as_deref(), Some(hash.as_str()));
        assert_eq!(cache.get("a.rs").as_deref(), Some(hash.as_str()));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_changed_and_deleted_sources_enqueue_read_through() {
        let (dir, queue, _cache, validator) = setup(true);
        fs::write(dir.path().join("a.rs"), "fn a() { changed }").unwrap();

        let changed = validator.validate_source("a.rs", "old-hash");
        assert!(changed.stale && !changed.deleted);

        let gone = validator.validate_source("gone.rs", "old-hash");
        assert!(gone.stale && gone.deleted);
        assert!(gone.current_hash.is_none());

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.get("a.rs").unwrap().trigger, Trigger::ReadThrough);
    }

    #[test]
    fn test_concurrent_validation_enqueues_once() {
        let (dir, queue, _cache, validator) = setup(true);
        fs::write(dir.path().join("a.rs"), "new").unwrap();
        let validator = Arc::new(validator);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let validator = Arc::clone(&validator);
                std::thread::spawn(move || validator.validate_source("a.rs", "old").stale)
            })
            .collect();
        assert!(handles.into_iter().all(|h| h.join().unwrap()));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_batch_dedups_paths() {
        let (dir, queue, _cache, validator) = setup(true);
        fs::write(dir.path().join("a.rs"), "a").unwrap();
        fs::write(dir.path().join("b.rs"), "b").unwrap();
        let a = hash_bytes(b"a");

        let result = validator.validate_batch(vec![("a.rs", a.as_str()), ("a.rs", a.as_str()), ("b.rs", "old")]);
        assert_eq!(result.len(), 2);
        assert!(!result[&("a.rs".to_string(), a.clone())].stale);
        assert!(result[&("b.rs".to_string(), "old".to_string())].stale);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_batch_answers_each_recorded_hash() {
        let (dir, queue, _cache, validator) = setup(true);
        fs::write(dir.path().join("a.rs"), "a").unwrap();
        let a = hash_bytes(b"a");

        let result = validator.validate_batch(vec![("a.rs", "old"), ("a.rs", a.as_str())]);
        assert_eq!(result.len(), 2);
        assert!(result[&("a.rs".to_string(), "old".to_string())].stale);
        assert!(!result[&("a.rs".to_string(), a.clone())].stale);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_disabled_reports_fresh() {
        let (_dir, queue, _cache, validator) = setup(false);
        let freshness = validator.validate_source("missing.rs", "h");
        assert!(!freshness.stale);
        assert!(queue.is_empty());
    }
}
