//! TestRepo builder and a synced-workspace fixture
//!
//! `TestRepo::with_fixture()` lays out a tiny crate that exercises every
//! built-in extractor:
//!
//! ```text
//! Cargo.toml          package `demo`, depends on serde
//! docs/sync.md        spec with a `Queue` section
//! src/lib.rs          `mod queue;` + `use crate::queue::Queue;`
//! src/queue.rs        implements the Queue section, has an in-file test
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use kgraph_engine::model::Entity;
use kgraph_engine::store::entities;
use kgraph_engine::sync::{ResyncSink, StartupReport};
use kgraph_engine::{
    EngineConfig, GraphQuery, GraphStore, HashCache, ParserRegistry, ReadThroughValidator,
    SyncContext, SyncWorker,
};
use tempfile::TempDir;

pub const LIB_RS: &str = r#"//! Demo crate

mod queue;

use crate::queue::Queue;

pub fn make() -> Queue {
    Queue::default()
}
"#;

pub const QUEUE_RS: &str = r#"//! FIFO of pending paths
// implements: spec:docs/sync.md#queue

#[derive(Default)]
pub struct Queue {
    items: Vec<String>,
}

impl Queue {
    pub fn push(&mut self, item: String) {
        self.items.push(item);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push() {
        let mut q = Queue::default();
        q.push("a".into());
    }
}
"#;

pub const SYNC_MD: &str = "# Sync\n\nHow files reach the graph.\n\n## Queue\n\nOne entry per path.\n\n## Watcher\n\nDebounced events.\n";

pub const CARGO_TOML: &str = r#"[package]
name = "demo"
version = "0.1.0"
edition = "2021"

[dependencies]
serde = "1"
"#;

/// Builder for temporary workspaces
pub struct TestRepo {
    dir: TempDir,
    root: PathBuf,
}

impl TestRepo {
    /// Create a new empty workspace with the watcher disabled
    pub fn new() -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let root = dir.path().canonicalize().expect("Failed to canonicalize temp dir");
        let repo = Self { dir, root };
        repo.add_file(".kgraph/config.toml", "[sync]\nwatch_enabled = false\n");
        repo
    }

    /// The fixture crate described in the module docs
    pub fn with_fixture() -> Self {
        let repo = Self::new();
        repo.add_file("Cargo.toml", CARGO_TOML)
            .add_file("docs/sync.md", SYNC_MD)
            .add_file("src/lib.rs", LIB_RS)
            .add_file("src/queue.rs", QUEUE_RS);
        repo
    }

    /// Canonical workspace root
    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Add or overwrite a file
    pub fn add_file(&self, relative_path: &str, content: &str) -> &Self {
        let full_path = self.root.join(relative_path);
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).expect("Failed to create parent dirs");
        }
        fs::write(&full_path, content).expect("Failed to write file");
        self
    }

    pub fn remove_file(&self, relative_path: &str) -> &Self {
        fs::remove_file(self.root.join(relative_path)).expect("Failed to remove file");
        self
    }

    pub fn config(&self) -> EngineConfig {
        EngineConfig::load(&self.root, None).expect("Failed to load config")
    }
}

/// A workspace reconciled into an in-memory graph by a foreground worker
pub struct SyncedRepo {
    pub repo: TestRepo,
    pub config: EngineConfig,
    pub worker: SyncWorker,
}

impl SyncedRepo {
    pub fn new(repo: TestRepo) -> Self {
        let config = repo.config();
        let store = GraphStore::in_memory().expect("Failed to open store");
        let ctx = SyncContext::new(repo.path(), &config, store).expect("Failed to build context");
        let registry = Arc::new(ParserRegistry::with_builtin(&config.sync));
        Self {
            repo,
            config,
            worker: SyncWorker::new(ctx, registry),
        }
    }

    /// Fixture crate, fully synced
    pub fn fixture() -> Self {
        let mut synced = Self::new(TestRepo::with_fixture());
        synced.sync();
        synced
    }

    /// Full startup reconciliation followed by a drain of the queue
    pub fn sync(&mut self) -> StartupReport {
        let report = self.worker.startup(true).expect("startup failed");
        self.worker.drain();
        report
    }

    pub fn store(&self) -> &GraphStore {
        &self.worker.context().store
    }

    pub fn workspace_id(&self) -> i64 {
        self.worker.context().workspace_id
    }

    /// Query engine without read-through validation
    pub fn query(&self) -> GraphQuery {
        GraphQuery::new(
            self.store().clone(),
            self.workspace_id(),
            self.repo.path().to_path_buf(),
            &self.config,
        )
    }

    /// Query engine whose stale sources are reported to `sink`. The hash
    /// cache starts cold so every check hashes the file.
    pub fn validated_query(&self, sink: Arc<dyn ResyncSink>) -> GraphQuery {
        let validator = ReadThroughValidator::new(
            self.repo.path().to_path_buf(),
            Arc::new(HashCache::new()),
            sink,
            true,
            2,
        )
        .expect("Failed to build validator");
        self.query().with_validator(Arc::new(validator))
    }

    /// Entity by key, tombstoned included
    pub fn entity(&self, key: &str) -> Option<Entity> {
        let ws = self.workspace_id();
        self.store()
            .with_conn(|conn| entities::find_by_key(conn, ws, key))
            .expect("lookup failed")
    }
}
