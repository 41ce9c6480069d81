//! File system watcher
//!
//! Registers a recursive `notify` watch per include directory and feeds
//! changed paths into a [`ResyncSink`] after a per-path debounce.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌──────────────┐
//! │   notify    │────>│  debouncer  │────>│  HashCache   │ evict
//! │   watcher   │     │ (per path)  │────>│  ResyncSink  │ enqueue(watch)
//! └─────────────┘     └─────────────┘     └──────────────┘
//! ```
//!
//! A new event for a path restarts that path's timer. A directory that fails
//! to register is recorded in [`WatchStatus`]; it never fails the watcher.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use notify::{Event, EventKind, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};

use crate::error::{KgError, Result};
use crate::fs_utils::relative_key;
use crate::hash_cache::HashCache;
use crate::model::Trigger;
use crate::scanner::Scanner;

use super::queue::ResyncSink;

/// Upper bound on how long the debounce thread sleeps before re-checking
/// the running flag
const IDLE_TICK: Duration = Duration::from_millis(100);

/// Watch registration health
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchStatus {
    pub healthy: bool,
    pub watched_dirs: Vec<String>,
    pub failed_dirs: Vec<String>,
}

/// Per-path restartable timers
#[derive(Debug)]
struct Debouncer {
    delay: Duration,
    due: HashMap<String, Instant>,
}

impl Debouncer {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            due: HashMap::new(),
        }
    }

    /// (Re)start the timer for `path`
    fn touch(&mut self, path: String, now: Instant) {
        self.due.insert(path, now + self.delay);
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.due.values().min().copied()
    }

    /// Remove and return every path whose timer has fired, sorted
    fn take_due(&mut self, now: Instant) -> Vec<String> {
        let mut fired: Vec<String> = self
            .due
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(path, _)| path.clone())
            .collect();
        for path in &fired {
            self.due.remove(path);
        }
        fired.sort();
        fired
    }

    fn pending(&self) -> usize {
        self.due.len()
    }
}

/// Watches the workspace for changes
pub struct FileWatcher {
    scanner: Arc<Scanner>,
    debounce: Duration,
}

impl FileWatcher {
    pub fn new(scanner: Arc<Scanner>, debounce_ms: u64) -> Self {
        Self {
            scanner,
            debounce: Duration::from_millis(debounce_ms),
        }
    }

    /// Register watches and spawn the debounce thread.
    ///
    /// Only failure to create the platform watcher itself is an error.
    pub fn start(
        &self,
        cache: Arc<HashCache>,
        sink: Arc<dyn ResyncSink>,
    ) -> Result<WatcherHandle> {
        let (tx, rx) = mpsc::channel::<notify::Result<Event>>();

        let mut watcher = notify::recommended_watcher(move |res| {
            // Receiver gone means the watcher is shutting down
            let _ = tx.send(res);
        })
        .map_err(|e| KgError::Watch {
            message: e.to_string(),
        })?;

        let root = self.scanner.root().to_path_buf();
        let mut status = WatchStatus::default();
        for dir in self.scanner.include_paths() {
            let label = relative_key(&root, &dir).unwrap_or_else(|| ".".to_string());
            match watcher.watch(&dir, RecursiveMode::Recursive) {
                Ok(()) => {
                    tracing::debug!("[WATCHER] Watching {}", dir.display());
                    status.watched_dirs.push(label);
                }
                Err(e) => {
                    tracing::warn!("[WATCHER] Failed to watch {}: {}", dir.display(), e);
                    status.failed_dirs.push(label);
                }
            }
        }
        status.healthy = status.failed_dirs.is_empty() && !status.watched_dirs.is_empty();

        let running = Arc::new(AtomicBool::new(true));
        let thread_running = Arc::clone(&running);
        let scanner = Arc::clone(&self.scanner);
        let debounce = self.debounce;

        let thread = std::thread::Builder::new()
            .name("kgraph-watcher".to_string())
            .spawn(move || {
                // The watcher lives on this thread; dropping it closes the handles
                let _watcher = watcher;
                let mut debouncer = Debouncer::new(debounce);

                while thread_running.load(Ordering::SeqCst) {
                    let now = Instant::now();
                    let timeout = debouncer
                        .next_deadline()
                        .map(|at| at.saturating_duration_since(now).min(IDLE_TICK))
                        .unwrap_or(IDLE_TICK);

                    match rx.recv_timeout(timeout) {
                        Ok(Ok(event)) => {
                            let now = Instant::now();
                            for path in accepted_paths(&scanner, &event) {
                                tracing::trace!("[WATCHER] {:?} {}", event.kind, path);
                                debouncer.touch(path, now);
                            }
                        }
                        Ok(Err(e)) => tracing::warn!("[WATCHER] Watch error: {}", e),
                        Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => break,
                    }

                    let fired = debouncer.take_due(Instant::now());
                    if fired.is_empty() {
                        continue;
                    }
                    tracing::debug!(
                        "[WATCHER] {} paths settled ({} still pending)",
                        fired.len(),
                        debouncer.pending()
                    );
                    for path in fired {
                        cache.evict(&path);
                        cache.evict_prefix(&path);
                        sink.request_resync(&path, Trigger::Watch);
                    }
                }
                tracing::debug!("[WATCHER] Stopped");
            })?;

        Ok(WatcherHandle {
            running,
            status,
            thread: Some(thread),
        })
    }
}

/// Workspace-relative paths of an event that belong to the graph
fn accepted_paths(scanner: &Scanner, event: &Event) -> Vec<String> {
    if matches!(event.kind, EventKind::Access(_)) {
        return Vec::new();
    }
    event
        .paths
        .iter()
        .filter_map(|path| {
            let rel = relative_key(scanner.root(), path)?;
            accepts(scanner, &rel, path).then_some(rel)
        })
        .collect()
}

fn accepts(scanner: &Scanner, rel: &str, abs: &Path) -> bool {
    if abs.is_dir() {
        return scanner.accepts_dir(rel);
    }
    scanner.accepts(rel)
}

/// Handle for a running watcher; stops it on drop
pub struct WatcherHandle {
    running: Arc<AtomicBool>,
    status: WatchStatus,
    thread: Option<JoinHandle<()>>,
}

impl WatcherHandle {
    pub fn status(&self) -> &WatchStatus {
        &self.status
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop the debounce thread and release the watch handles
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("[WATCHER] Debounce thread panicked");
            }
        }
    }
}

impl Drop for WatcherHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
