//! Incremental synchronization engine
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  watch   ┌─────────────┐  dequeue  ┌──────────────┐
//! │ FileWatcher  │────────> │  SyncQueue  │─────────> │  SyncWorker  │──> GraphStore
//! └──────────────┘          └─────────────┘           └──────────────┘    (one tx per file)
//!                                 ^  read_through
//!                                 │
//!                       ┌──────────────────────┐
//!                       │ ReadThroughValidator │ <── queries
//!                       └──────────────────────┘
//! ```
//!
//! [`SyncRuntime`] wires these together inside one process. The isolated
//! variant lives in [`crate::worker_process`] and runs the same runtime in a
//! child.
//!
//! # Modules
//!
//! - `queue` - priority queue, deduplicated by path
//! - `watcher` - notify watch with per-path debounce
//! - `commit` - transactional diff/commit of one extraction
//! - `worker` - single-writer worker loop and startup reconciliation
//! - `validator` - read-through freshness checks

pub mod commit;
pub mod queue;
pub mod validator;
pub mod watcher;
pub mod worker;

use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;

use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::error::Result;
use crate::model::Trigger;
use crate::parsers::ParserRegistry;
use crate::store::GraphStore;

pub use commit::{commit_extraction, CommitOutcome, EntityKeyCache, FileCommit};
pub use queue::{EnqueueOutcome, QueueItem, ResyncSink, SyncQueue};
pub use validator::{Freshness, ReadThroughValidator};
pub use watcher::{FileWatcher, WatchStatus, WatcherHandle};
pub use worker::{
    DiskDiff, FileOutcome, LastSync, StartupReport, SyncContext, SyncScope, SyncWorker,
    WorkerPhase, WorkerState,
};

/// Point-in-time view of the sync engine, pushed to the parent by the
/// isolated worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub phase: WorkerPhase,
    pub queue_depth: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sync_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sync_duration_ms: Option<u64>,
    pub startup_scan_complete: bool,
    pub hash_cache_size: usize,
    pub watch_healthy: bool,
    pub watched_dirs: Vec<String>,
    #[serde(default)]
    pub failed_dirs: Vec<String>,
    #[serde(default)]
    pub files_committed: u64,
    #[serde(default)]
    pub files_failed: u64,
}

impl SyncStatus {
    pub fn collect(ctx: &SyncContext, watch: Option<&WatchStatus>) -> Self {
        let last = ctx.state.last_sync();
        let watch = watch.cloned().unwrap_or_default();
        Self {
            phase: ctx.state.phase(),
            queue_depth: ctx.queue.len(),
            last_sync_at: last.as_ref().map(|l| l.at.clone()),
            last_sync_duration_ms: last.as_ref().map(|l| l.duration_ms),
            startup_scan_complete: ctx.state.startup_scan_complete(),
            hash_cache_size: ctx.cache.len(),
            watch_healthy: watch.healthy,
            watched_dirs: watch.watched_dirs,
            failed_dirs: watch.failed_dirs,
            files_committed: ctx.state.files_committed(),
            files_failed: ctx.state.files_failed(),
        }
    }
}

/// Operational control over a sync engine, wherever it runs
pub trait SyncControl: Send + Sync {
    /// Request a sync. `Some(n)` when the number of enqueued paths is known
    /// locally; an isolated worker only acknowledges the request.
    fn request_sync(&self, scope: &SyncScope) -> Result<Option<usize>>;

    /// Most recent status, `None` before the first one is available
    fn status(&self) -> Option<SyncStatus>;
}

/// Watcher + worker thread + queue + hash cache, running in this process
pub struct SyncRuntime {
    ctx: SyncContext,
    watcher: Option<WatcherHandle>,
    worker: Option<JoinHandle<()>>,
    read_through: bool,
    validation_concurrency: usize,
}

impl SyncRuntime {
    /// Start watching (if enabled) and spawn the worker thread, which runs
    /// startup reconciliation before entering its loop.
    pub fn start(
        root: &Path,
        config: &EngineConfig,
        store: GraphStore,
        registry: Arc<ParserRegistry>,
    ) -> Result<Self> {
        let ctx = SyncContext::new(root, config, store)?;

        // Watch before the startup scan so nothing changed during it is missed
        let watcher = if config.sync.watch_enabled {
            let handle = FileWatcher::new(Arc::clone(&ctx.scanner), config.sync.debounce_ms)
                .start(
                    Arc::clone(&ctx.cache),
                    Arc::clone(&ctx.queue) as Arc<dyn ResyncSink>,
                )?;
            if !handle.status().healthy {
                tracing::warn!(
                    "[SYNC] Watch degraded, failed dirs: {:?}",
                    handle.status().failed_dirs
                );
            }
            Some(handle)
        } else {
            None
        };

        let mut worker = SyncWorker::new(ctx.clone(), registry);
        let full_scan = config.sync.startup_full_scan;
        let thread = std::thread::Builder::new()
            .name("kgraph-sync-worker".to_string())
            .spawn(move || {
                if let Err(e) = worker.startup(full_scan) {
                    tracing::error!("[SYNC] Startup reconciliation failed: {}", e);
                }
                worker.run();
            })?;

        tracing::info!("[SYNC] Runtime started for {}", root.display());
        Ok(Self {
            ctx,
            watcher,
            worker: Some(thread),
            read_through: config.sync.read_through_validation,
            validation_concurrency: config.sync.validation_concurrency,
        })
    }

    pub fn context(&self) -> &SyncContext {
        &self.ctx
    }

    pub fn status(&self) -> SyncStatus {
        SyncStatus::collect(&self.ctx, self.watcher.as_ref().map(|w| w.status()))
    }

    pub fn enqueue(&self, paths: &[String], trigger: Trigger) -> usize {
        self.ctx.queue.enqueue_all(paths, trigger)
    }

    pub fn request_sync(&self, scope: &SyncScope) -> Result<usize> {
        self.ctx.request_sync(scope)
    }

    /// A validator feeding this runtime's queue
    pub fn validator(&self) -> Result<ReadThroughValidator> {
        ReadThroughValidator::new(
            self.ctx.root.clone(),
            Arc::clone(&self.ctx.cache),
            Arc::clone(&self.ctx.queue) as Arc<dyn ResyncSink>,
            self.read_through,
            self.validation_concurrency,
        )
    }

    pub fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Let the worker finish its current file, then release watch handles
    pub fn stop(&mut self) {
        self.ctx.state.request_stop();
        self.ctx.queue.close();
        if let Some(thread) = self.worker.take() {
            if thread.join().is_err() {
                tracing::error!("[SYNC] Worker thread panicked");
            }
        }
        if let Some(mut watcher) = self.watcher.take() {
            watcher.stop();
        }
    }
}

impl SyncControl for SyncRuntime {
    fn request_sync(&self, scope: &SyncScope) -> Result<Option<usize>> {
        self.ctx.request_sync(scope).map(Some)
    }

    fn status(&self) -> Option<SyncStatus> {
        Some(SyncRuntime::status(self))
    }
}

impl Drop for SyncRuntime {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::entities;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    #[test]
    fn test_runtime_syncs_and_stops() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().canonicalize().unwrap();
        std::fs::create_dir_all(root.join("src")).unwrap();
        std::fs::write(root.join("src/lib.rs"), "pub fn a() {}\n").unwrap();

        let mut config = EngineConfig::default();
        config.sync.watch_enabled = false;
        let store = GraphStore::in_memory().unwrap();
        let config_store = store.clone();
        let registry = Arc::new(ParserRegistry::with_builtin(&config.sync));
        let mut runtime = SyncRuntime::start(&root, &config, store, registry).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while runtime.status().files_committed == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        let status = runtime.status();
        assert!(status.startup_scan_complete);
        assert_eq!(status.files_committed, 1);
        assert!(!status.watch_healthy);

        let ws = runtime.context().workspace_id;
        let module = config_store
            .with_conn(|conn| entities::find_by_key(conn, ws, "module:src/lib.rs"))
            .unwrap();
        assert!(module.is_some());

        runtime.stop();
        assert!(!runtime.is_running());
        assert_eq!(runtime.status().phase, WorkerPhase::Stopped);
    }
}
