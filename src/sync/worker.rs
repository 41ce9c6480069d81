//! Single-writer sync worker
//!
//! Consumes the [`SyncQueue`] one path at a time. Each path is hash-checked,
//! extracted and committed in one transaction, with one audit run per
//! commit. A one-time startup reconciliation gates steady state.
//!
//! # States
//!
//! ```text
//! startup_scan ──> idle <──> running
//!                    │
//!                    └──> stopped
//! ```
//!
//! Per-file failures are logged and recorded as failed runs; they never end
//! the loop. Only [`WorkerState::request_stop`] plus closing the queue does.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::error::{KgError, Result};
use crate::fs_utils::{absolute_path, file_mtime, hash_file};
use crate::hash_cache::HashCache;
use crate::model::{now_timestamp, EventType, RunStatus, SyncStats, Trigger};
use crate::parsers::{EntityLookup, ExtractionContext, ParserRegistry};
use crate::scanner::Scanner;
use crate::store::{audit, entities, files, relations, sources, GraphStore};

use super::commit::{commit_extraction, EntityKeyCache, FileCommit};
use super::queue::{QueueItem, SyncQueue};

/// Worker lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerPhase {
    StartupScan,
    Idle,
    Running,
    Stopped,
}

impl WorkerPhase {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => WorkerPhase::StartupScan,
            1 => WorkerPhase::Idle,
            2 => WorkerPhase::Running,
            _ => WorkerPhase::Stopped,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            WorkerPhase::StartupScan => 0,
            WorkerPhase::Idle => 1,
            WorkerPhase::Running => 2,
            WorkerPhase::Stopped => 3,
        }
    }
}

/// Timing of the most recent commit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastSync {
    pub at: String,
    pub duration_ms: u64,
    pub path: String,
    pub status: RunStatus,
}

/// Worker state shared with status reporters
#[derive(Debug)]
pub struct WorkerState {
    phase: AtomicU8,
    startup_scan_complete: AtomicBool,
    stop: AtomicBool,
    files_committed: AtomicU64,
    files_failed: AtomicU64,
    last_sync: Mutex<Option<LastSync>>,
}

impl Default for WorkerState {
    fn default() -> Self {
        Self {
            phase: AtomicU8::new(WorkerPhase::StartupScan.as_u8()),
            startup_scan_complete: AtomicBool::new(false),
            stop: AtomicBool::new(false),
            files_committed: AtomicU64::new(0),
            files_failed: AtomicU64::new(0),
            last_sync: Mutex::new(None),
        }
    }
}

impl WorkerState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> WorkerPhase {
        WorkerPhase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    fn set_phase(&self, phase: WorkerPhase) {
        self.phase.store(phase.as_u8(), Ordering::SeqCst);
    }

    pub fn startup_scan_complete(&self) -> bool {
        self.startup_scan_complete.load(Ordering::SeqCst)
    }

    /// Ask the loop to exit after its current file
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub fn files_committed(&self) -> u64 {
        self.files_committed.load(Ordering::Relaxed)
    }

    pub fn files_failed(&self) -> u64 {
        self.files_failed.load(Ordering::Relaxed)
    }

    pub fn last_sync(&self) -> Option<LastSync> {
        self.last_sync.lock().clone()
    }

    fn record(&self, path: &str, started: Instant, status: RunStatus) {
        match status {
            RunStatus::Failed => self.files_failed.fetch_add(1, Ordering::Relaxed),
            _ => self.files_committed.fetch_add(1, Ordering::Relaxed),
        };
        *self.last_sync.lock() = Some(LastSync {
            at: now_timestamp(),
            duration_ms: started.elapsed().as_millis() as u64,
            path: path.to_string(),
            status,
        });
    }
}

/// What `sync(scope)` should cover
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum SyncScope {
    /// Rescan every include directory
    Full,
    /// Just these workspace-relative paths
    Paths { paths: Vec<String> },
}

/// Result of comparing the disk against the file ledger
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiskDiff {
    pub scanned: usize,
    /// New or changed paths
    pub changed: Vec<String>,
    /// Tracked paths no longer on disk
    pub vanished: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StartupReport {
    pub scanned: usize,
    pub enqueued: usize,
    pub vanished_paths: usize,
    pub entities_tombstoned: usize,
    pub duration_ms: u64,
}

/// What processing one path did
#[derive(Debug, Clone, PartialEq)]
pub enum FileOutcome {
    /// Stored hash matches; nothing written
    Unchanged,
    Committed(SyncStats),
    /// Path gone from disk; its sources were removed
    Removed(SyncStats),
    /// Path is a directory; its files were enqueued
    DirectoryQueued(usize),
    /// Over the size ceiling or otherwise not eligible
    Skipped,
    /// The commit failed and was recorded as a failed run
    Failed(String),
}

/// Handles shared by the worker, the watcher and status reporting
#[derive(Clone)]
pub struct SyncContext {
    pub root: PathBuf,
    pub workspace_id: i64,
    pub store: GraphStore,
    pub scanner: Arc<Scanner>,
    pub queue: Arc<SyncQueue>,
    pub cache: Arc<HashCache>,
    pub state: Arc<WorkerState>,
    tombstone_batch_size: usize,
}

impl SyncContext {
    pub fn new(root: &Path, config: &EngineConfig, store: GraphStore) -> Result<Self> {
        let workspace = store.ensure_local_workspace(root)?;
        Ok(Self {
            root: root.to_path_buf(),
            workspace_id: workspace.id,
            store,
            scanner: Arc::new(Scanner::new(root, &config.sync)?),
            queue: Arc::new(SyncQueue::new()),
            cache: Arc::new(HashCache::new()),
            state: Arc::new(WorkerState::new()),
            tombstone_batch_size: config.sync.tombstone_batch_size.max(1),
        })
    }

    /// Scan the workspace, warm the hash cache and diff against the ledger
    pub fn diff_against_disk(&self) -> Result<DiskDiff> {
        let report = self.scanner.scan();
        let tracked = self
            .store
            .with_conn(|conn| files::tracked(conn, self.workspace_id))?;

        let mut diff = DiskDiff {
            scanned: report.files.len(),
            ..DiskDiff::default()
        };
        let mut on_disk = BTreeSet::new();
        for file in report.files {
            self.cache.set(&file.path, &file.content_hash, file.mtime);
            if tracked.get(&file.path) != Some(&file.content_hash) {
                diff.changed.push(file.path.clone());
            }
            on_disk.insert(file.path);
        }

        // Files the scan could not hash or skipped for size are still on disk
        diff.vanished = tracked
            .into_keys()
            .filter(|path| !on_disk.contains(path))
            .filter(|path| !absolute_path(&self.root, path).exists())
            .collect();
        diff.vanished.sort();
        Ok(diff)
    }

    /// Enqueue the work `scope` describes with trigger `manual`; returns how
    /// many paths changed the queue
    pub fn request_sync(&self, scope: &SyncScope) -> Result<usize> {
        match scope {
            SyncScope::Full => {
                let diff = self.diff_against_disk()?;
                let paths = diff.changed.iter().chain(diff.vanished.iter());
                Ok(self.queue.enqueue_all(paths, Trigger::Manual))
            }
            SyncScope::Paths { paths } => {
                let normalized: Vec<String> = paths
                    .iter()
                    .map(|p| p.trim_start_matches("./").trim_end_matches('/').to_string())
                    .filter(|p| !p.is_empty() && !p.starts_with("../"))
                    .collect();
                if normalized.len() != paths.len() {
                    return Err(KgError::invalid(
                        "sync paths must be workspace-relative and non-empty",
                    ));
                }
                Ok(self.queue.enqueue_all(&normalized, Trigger::Manual))
            }
        }
    }
}

/// The single consumer of the sync queue
pub struct SyncWorker {
    ctx: SyncContext,
    registry: Arc<ParserRegistry>,
    keys: EntityKeyCache,
    /// Paths whose last commit left relation endpoints unresolved
    pending_links: HashMap<String, BTreeSet<String>>,
}

impl SyncWorker {
    pub fn new(ctx: SyncContext, registry: Arc<ParserRegistry>) -> Self {
        Self {
            ctx,
            registry,
            keys: EntityKeyCache::new(),
            pending_links: HashMap::new(),
        }
    }

    pub fn context(&self) -> &SyncContext {
        &self.ctx
    }

    /// One-time reconciliation before steady state: tombstone vanished
    /// paths in batches, enqueue new and changed ones, warm the key cache.
    pub fn startup(&mut self, full_scan: bool) -> Result<StartupReport> {
        let started = Instant::now();
        self.ctx.state.set_phase(WorkerPhase::StartupScan);
        let mut report = StartupReport::default();

        if full_scan {
            let diff = self.ctx.diff_against_disk()?;
            report.scanned = diff.scanned;
            report.vanished_paths = diff.vanished.len();
            report.entities_tombstoned = self.tombstone_vanished(&diff.vanished)?;
            report.enqueued = self.ctx.queue.enqueue_all(&diff.changed, Trigger::Startup);
        }

        let workspace_id = self.ctx.workspace_id;
        let keys = &mut self.keys;
        self.ctx
            .store
            .with_conn(|conn| keys.ensure_loaded(conn, workspace_id))?;

        report.duration_ms = started.elapsed().as_millis() as u64;
        self.ctx
            .state
            .startup_scan_complete
            .store(true, Ordering::SeqCst);
        self.ctx.state.set_phase(WorkerPhase::Idle);
        tracing::info!(
            "[WORKER] Startup scan: {} files, {} enqueued, {} vanished ({} entities tombstoned) in {}ms",
            report.scanned,
            report.enqueued,
            report.vanished_paths,
            report.entities_tombstoned,
            report.duration_ms
        );
        Ok(report)
    }

    /// One run for the whole startup pass, one transaction per batch
    fn tombstone_vanished(&mut self, paths: &[String]) -> Result<usize> {
        if paths.is_empty() {
            return Ok(0);
        }
        let ws = self.ctx.workspace_id;
        let run_id = self
            .ctx
            .store
            .with_conn(|conn| audit::begin_run(conn, ws, Trigger::Startup))?;

        let mut stats = SyncStats::default();
        let mut errors = Vec::new();
        for batch in paths.chunks(self.ctx.tombstone_batch_size) {
            let result = self.ctx.store.transaction(|tx| {
                let mut batch_stats = SyncStats::default();
                for path in batch {
                    batch_stats.merge(&remove_path(tx, ws, run_id, path)?);
                }
                Ok(batch_stats)
            });
            match result {
                Ok(batch_stats) => stats.merge(&batch_stats),
                Err(e) => {
                    tracing::error!("[WORKER] Tombstone batch failed: {}", e);
                    errors.push(format!("tombstone batch of {}: {}", batch.len(), e));
                }
            }
            for path in batch {
                self.ctx.cache.evict(path);
            }
        }

        let status = if errors.is_empty() {
            RunStatus::Completed
        } else {
            RunStatus::Failed
        };
        self.ctx
            .store
            .with_conn(|conn| audit::finish_run(conn, run_id, status, &stats, &errors))?;
        Ok(stats.entities_deleted)
    }

    /// Block on the queue until stopped
    pub fn run(&mut self) {
        self.ctx.state.set_phase(WorkerPhase::Idle);
        let mut drained = true;

        loop {
            if self.ctx.queue.is_empty() && !drained {
                self.on_queue_drained();
                drained = true;
            }
            if !self.ctx.queue.wait_for_item() || self.ctx.state.stop_requested() {
                break;
            }
            let Some(item) = self.ctx.queue.dequeue() else {
                continue;
            };
            drained = false;

            self.ctx.state.set_phase(WorkerPhase::Running);
            self.handle(&item);
            self.ctx.state.set_phase(WorkerPhase::Idle);

            if self.ctx.state.stop_requested() {
                break;
            }
        }

        self.ctx.state.set_phase(WorkerPhase::Stopped);
        tracing::info!("[WORKER] Stopped");
    }

    /// Process everything currently queued without blocking; returns how many
    /// items were handled
    pub fn drain(&mut self) -> usize {
        let mut handled = 0;
        while let Some(item) = self.ctx.queue.dequeue() {
            self.handle(&item);
            handled += 1;
        }
        if handled > 0 {
            self.on_queue_drained();
        }
        handled
    }

    fn handle(&mut self, item: &QueueItem) {
        match self.process_file(&item.path, item.trigger) {
            Ok(FileOutcome::Failed(e)) => {
                tracing::warn!("[WORKER] {} failed: {}", item.path, e);
            }
            Ok(outcome) => {
                tracing::debug!("[WORKER] {} ({}): {:?}", item.path, item.trigger, outcome);
            }
            Err(e) => {
                tracing::warn!("[WORKER] {} skipped: {}", item.path, e);
            }
        }
    }

    /// Retry files with unresolved relation endpoints, then drop the key cache
    fn on_queue_drained(&mut self) {
        if !self.pending_links.is_empty() {
            let ws = self.ctx.workspace_id;
            self.keys.invalidate();
            let keys = &mut self.keys;
            if let Err(e) = self.ctx.store.with_conn(|conn| keys.ensure_loaded(conn, ws)) {
                tracing::warn!("[WORKER] Could not reload entity keys: {}", e);
            } else {
                let ready: Vec<String> = self
                    .pending_links
                    .iter()
                    .filter(|(_, unresolved)| unresolved.iter().any(|k| self.keys.contains(k)))
                    .map(|(path, _)| path.clone())
                    .collect();
                for path in ready {
                    self.pending_links.remove(&path);
                    tracing::debug!("[WORKER] Re-linking {}", path);
                    if let Err(e) = self.process(&path, Trigger::Startup, true) {
                        tracing::warn!("[WORKER] Re-link of {} failed: {}", path, e);
                    }
                }
            }
        }
        self.keys.invalidate();
    }

    /// Bring one path in line with the disk
    pub fn process_file(&mut self, path: &str, trigger: Trigger) -> Result<FileOutcome> {
        self.process(path, trigger, false)
    }

    fn process(&mut self, path: &str, trigger: Trigger, force: bool) -> Result<FileOutcome> {
        let abs = absolute_path(&self.ctx.root, path);
        if !abs.exists() {
            return self.remove(path, trigger);
        }
        if abs.is_dir() {
            let report = self.ctx.scanner.scan_dir(path);
            let n = self
                .ctx
                .queue
                .enqueue_all(report.files.iter().map(|f| f.path.as_str()), trigger);
            return Ok(FileOutcome::DirectoryQueued(n));
        }
        if fs::metadata(&abs)?.len() > self.ctx.scanner.max_file_size() {
            tracing::debug!("[WORKER] {} is over the size ceiling", path);
            return Ok(FileOutcome::Skipped);
        }

        let hash = hash_file(&abs)?;
        self.ctx.cache.set(path, &hash, file_mtime(&abs)?);

        let ws = self.ctx.workspace_id;
        let keys = &mut self.keys;
        let previous = self.ctx.store.with_conn(|conn| {
            keys.ensure_loaded(conn, ws)?;
            files::stored_hash(conn, ws, path)
        })?;
        if !force && previous.as_deref() == Some(hash.as_str()) {
            return Ok(FileOutcome::Unchanged);
        }

        let bytes = fs::read(&abs)?;
        let content = String::from_utf8_lossy(&bytes);
        let started = Instant::now();

        let ctx = ExtractionContext::new(ws, &hash, &self.keys);
        let extraction = self.registry.extract_all(path, &content, &ctx);
        let errors: Vec<String> = extraction.errors.iter().map(|e| e.to_string()).collect();

        let file = FileCommit {
            workspace_id: ws,
            run_id: 0,
            path,
            content_hash: &hash,
            previous_hash: previous.as_deref(),
        };
        let known: &dyn EntityLookup = &self.keys;
        let committed = self.with_run(trigger, path, |tx, run_id| {
            commit_extraction(
                tx,
                FileCommit { run_id, ..file },
                &extraction.result,
                known,
                &errors,
            )
        });

        match committed {
            Ok(outcome) => {
                self.keys.extend(outcome.new_keys);
                if outcome.unresolved.is_empty() {
                    self.pending_links.remove(path);
                } else {
                    self.pending_links
                        .insert(path.to_string(), outcome.unresolved);
                }
                self.ctx.state.record(path, started, RunStatus::Completed);
                tracing::debug!(
                    "[SYNC] {} committed by [{}]",
                    path,
                    extraction.extractors.join(", ")
                );
                Ok(FileOutcome::Committed(outcome.stats))
            }
            Err(e) => {
                self.keys.invalidate();
                self.ctx.state.record(path, started, RunStatus::Failed);
                Ok(FileOutcome::Failed(e.to_string()))
            }
        }
    }

    /// The path is gone: drop its sources and relations, tombstone entities
    /// left without sources
    fn remove(&mut self, path: &str, trigger: Trigger) -> Result<FileOutcome> {
        let ws = self.ctx.workspace_id;
        let tracked = self
            .ctx
            .store
            .with_conn(|conn| files::is_tracked(conn, ws, path))?;
        self.ctx.cache.evict(path);
        self.ctx.cache.evict_prefix(path);
        self.pending_links.remove(path);
        if !tracked {
            return Ok(FileOutcome::Unchanged);
        }

        let started = Instant::now();
        let removed = self.with_run(trigger, path, |tx, run_id| {
            let stats = remove_path(tx, ws, run_id, path)?;
            audit::finish_run(tx, run_id, RunStatus::Completed, &stats, &[])?;
            Ok(stats)
        });
        match removed {
            Ok(stats) => {
                self.ctx.state.record(path, started, RunStatus::Completed);
                Ok(FileOutcome::Removed(stats))
            }
            Err(e) => {
                self.ctx.state.record(path, started, RunStatus::Failed);
                Ok(FileOutcome::Failed(e.to_string()))
            }
        }
    }

    /// Open a run, execute `f` in one transaction and, if it fails, record
    /// the run as failed with the cause
    fn with_run<T, F>(&self, trigger: Trigger, path: &str, f: F) -> Result<T>
    where
        F: FnOnce(&Connection, i64) -> Result<T>,
    {
        let ws = self.ctx.workspace_id;
        let run_id = self
            .ctx
            .store
            .with_conn(|conn| audit::begin_run(conn, ws, trigger))?;

        match self.ctx.store.transaction(|tx| f(tx, run_id)) {
            Ok(value) => Ok(value),
            Err(e) => {
                tracing::error!("[SYNC] Commit for {} rolled back: {}", path, e);
                let errors = vec![format!("{}: {}", path, e)];
                if let Err(audit_err) = self.ctx.store.with_conn(|conn| {
                    audit::finish_run(conn, run_id, RunStatus::Failed, &SyncStats::default(), &errors)
                }) {
                    tracing::error!("[SYNC] Could not record failed run {}: {}", run_id, audit_err);
                }
                Err(e)
            }
        }
    }

    /// Paths waiting for relation endpoints to appear
    pub fn pending_links(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.pending_links.keys().cloned().collect();
        paths.sort();
        paths
    }
}

/// Remove a vanished file (or directory) from the graph inside the ambient
/// transaction
fn remove_path(conn: &Connection, workspace_id: i64, run_id: i64, path: &str) -> Result<SyncStats> {
    let previous = files::stored_hash(conn, workspace_id, path)?;
    let mut stats = SyncStats {
        files_processed: 1,
        ..SyncStats::default()
    };

    let mut affected: BTreeSet<i64> = BTreeSet::new();
    let direct = sources::delete_for_path(conn, workspace_id, path)?;
    let nested = sources::delete_under(conn, workspace_id, path)?;
    stats.sources_deleted = direct.len() + nested.len();
    affected.extend(direct);
    affected.extend(nested);

    stats.relations_deleted = relations::delete_for_source_path(conn, workspace_id, path)?
        + relations::delete_under_source_dir(conn, workspace_id, path)?;

    let affected: Vec<i64> = affected.into_iter().collect();
    for id in entities::unsourced_among(conn, &affected)? {
        if entities::tombstone(conn, id, Some(run_id))? {
            stats.entities_deleted += 1;
            audit::record_event(
                conn,
                run_id,
                id,
                EventType::Deleted,
                previous.as_deref(),
                None,
            )?;
        }
    }

    files::forget(conn, workspace_id, path)?;
    files::forget_under(conn, workspace_id, path)?;
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        worker: SyncWorker,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let root = dir.path().canonicalize().unwrap();
            let config = EngineConfig::default();
            let ctx = SyncContext::new(&root, &config, GraphStore::in_memory().unwrap()).unwrap();
            let registry = Arc::new(ParserRegistry::with_builtin(&config.sync));
            Self {
                dir,
                worker: SyncWorker::new(ctx, registry),
            }
        }

        fn write(&self, rel: &str, content: &str) {
            let path = self.dir.path().join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, content).unwrap();
        }

        fn remove(&self, rel: &str) {
            fs::remove_file(self.dir.path().join(rel)).unwrap();
        }

        fn entity(&self, key: &str) -> Option<crate::model::Entity> {
            let ws = self.worker.ctx.workspace_id;
            self.worker
                .ctx
                .store
                .with_conn(|conn| entities::find_by_key(conn, ws, key))
                .unwrap()
        }

        fn run_count(&self) -> usize {
            let ws = self.worker.ctx.workspace_id;
            self.worker
                .ctx
                .store
                .with_conn(|conn| audit::recent_runs(conn, ws, 1000))
                .unwrap()
                .len()
        }
    }

    #[test]
    fn test_unchanged_file_is_a_noop() {
        let mut fx = Fixture::new();
        fx.write("src/lib.rs", "pub fn a() {}\n");

        let first = fx.worker.process_file("src/lib.rs", Trigger::Manual).unwrap();
        assert!(matches!(first, FileOutcome::Committed(ref s) if s.entities_created == 2));
        let runs = fx.run_count();

        let second = fx.worker.process_file("src/lib.rs", Trigger::Manual).unwrap();
        assert_eq!(second, FileOutcome::Unchanged);
        assert_eq!(fx.run_count(), runs);
    }

    #[test]
    fn test_deleted_file_tombstones_its_entities() {
        let mut fx = Fixture::new();
        fx.write("src/lib.rs", "pub fn a() {}\n");
        fx.worker.process_file("src/lib.rs", Trigger::Manual).unwrap();

        fx.remove("src/lib.rs");
        let outcome = fx.worker.process_file("src/lib.rs", Trigger::Watch).unwrap();
        assert!(matches!(outcome, FileOutcome::Removed(ref s) if s.entities_deleted == 2));
        assert!(fx.entity("module:src/lib.rs").unwrap().is_deleted);
        assert!(fx.worker.ctx.cache.get("src/lib.rs").is_none());

        // A second removal has nothing left to do
        let again = fx.worker.process_file("src/lib.rs", Trigger::Watch).unwrap();
        assert_eq!(again, FileOutcome::Unchanged);
    }

    #[test]
    fn test_startup_enqueues_changes_and_tombstones_vanished() {
        let mut fx = Fixture::new();
        fx.write("src/lib.rs", "pub fn a() {}\n");
        fx.write("src/old.rs", "pub fn b() {}\n");

        let report = fx.worker.startup(true).unwrap();
        assert_eq!(report.enqueued, 2);
        assert_eq!(fx.worker.ctx.queue.get("src/lib.rs").unwrap().trigger, Trigger::Startup);
        assert!(fx.worker.ctx.state.startup_scan_complete());
        assert_eq!(fx.worker.drain(), 2);

        fx.remove("src/old.rs");
        let report = fx.worker.startup(true).unwrap();
        assert_eq!(report.enqueued, 0);
        assert_eq!(report.vanished_paths, 1);
        assert_eq!(report.entities_tombstoned, 2);
        assert!(fx.entity("symbol:src/old.rs#b").unwrap().is_deleted);
        assert!(!fx.entity("symbol:src/lib.rs#a").unwrap().is_deleted);
    }

    #[test]
    fn test_unresolved_links_are_retried_after_drain() {
        let mut fx = Fixture::new();
        fx.write("src/lib.rs", "mod queue;\n");
        fx.write("src/queue.rs", "pub struct Queue;\n");

        // lib.rs first: its `mod queue;` target does not exist yet
        fx.worker.ctx.queue.enqueue("src/lib.rs", Trigger::Watch);
        fx.worker.ctx.queue.enqueue("src/queue.rs", Trigger::Startup);
        fx.worker.drain();
        assert!(fx.worker.pending_links().is_empty());

        let lib = fx.entity("module:src/lib.rs").unwrap();
        let queue = fx.entity("module:src/queue.rs").unwrap();
        let edges = fx
            .worker
            .ctx
            .store
            .with_conn(|conn| {
                relations::for_entity(conn, lib.id, relations::Direction::Outgoing, None, false)
            })
            .unwrap();
        assert!(edges.iter().any(|r| r.dst_entity_id == queue.id));
    }

    #[test]
    fn test_directory_event_enqueues_files() {
        let mut fx = Fixture::new();
        fx.write("src/nested/a.rs", "pub fn a() {}\n");
        fx.write("src/nested/b.rs", "pub fn b() {}\n");

        let outcome = fx.worker.process_file("src/nested", Trigger::Watch).unwrap();
        assert_eq!(outcome, FileOutcome::DirectoryQueued(2));
        assert_eq!(fx.worker.ctx.queue.len(), 2);
    }

    #[test]
    fn test_request_sync_paths_validates() {
        let fx = Fixture::new();
        let ctx = &fx.worker.ctx;
        let n = ctx
            .request_sync(&SyncScope::Paths {
                paths: vec!["./src/lib.rs".to_string()],
            })
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(ctx.queue.get("src/lib.rs").unwrap().trigger, Trigger::Manual);
        assert!(ctx
            .request_sync(&SyncScope::Paths {
                paths: vec!["../outside.rs".to_string()],
            })
            .is_err());
    }

    #[test]
    fn test_worker_loop_stops_on_close() {
        let fx = Fixture::new();
        fx.write("src/lib.rs", "pub fn a() {}\n");
        let ctx = fx.worker.ctx.clone();
        let mut worker = fx.worker;

        let handle = std::thread::spawn(move || {
            worker.run();
            worker
        });
        ctx.queue.enqueue("src/lib.rs", Trigger::Watch);
        let deadline = Instant::now() + std::time::Duration::from_secs(5);
        while ctx.state.files_committed() == 0 && Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        ctx.state.request_stop();
        ctx.queue.close();
        let worker = handle.join().unwrap();
        assert_eq!(worker.ctx.state.phase(), WorkerPhase::Stopped);
        assert_eq!(ctx.state.last_sync().unwrap().path, "src/lib.rs");
        drop(fx.dir);
    }
}
