//! kgraph-engine: an incrementally synchronized knowledge graph over a codebase
//!
//! Files in a workspace are scanned, hashed and run through a registry of
//! extractors. Each file's entities, sources, facts and relations are
//! committed to a SQLite graph in one transaction, and kept current by a
//! watcher feeding a per-path queue consumed by a single writer. Queries
//! check freshness on the way out and queue stale files for resync instead
//! of blocking on them.
//!
//! # Architecture
//!
//! ```text
//!  files ──> Scanner / FileWatcher ──> SyncQueue ──> SyncWorker ──> GraphStore
//!                                          ^                             │
//!                                          │ read_through                │
//!                               ReadThroughValidator <── GraphQuery <────┘
//!                                                            ^
//!                                                   ToolRouter / CLI
//! ```
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use kgraph_engine::{EngineConfig, GraphStore, ParserRegistry, SyncContext, SyncWorker};
//!
//! let root = std::path::Path::new(".");
//! let config = EngineConfig::load(root, None)?;
//! let store = GraphStore::open(&config.database_path(root), config.store.pool_size)?;
//! let registry = Arc::new(ParserRegistry::with_builtin(&config.sync));
//!
//! let mut worker = SyncWorker::new(SyncContext::new(root, &config, store)?, registry);
//! worker.startup(true)?;
//! worker.drain();
//! ```

pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod fs_utils;
pub mod hash_cache;
pub mod logging;
pub mod model;
pub mod parsers;
pub mod query;
pub mod scanner;
pub mod store;
pub mod sync;
pub mod tools;
pub mod worker_process;

pub use config::EngineConfig;
pub use error::{KgError, Result};
pub use hash_cache::HashCache;
pub use model::{Entity, ExtractionResult, Fact, Relation, Source, Trigger};
pub use parsers::{ExtractionContext, Parser, ParserRegistry};
pub use query::GraphQuery;
pub use scanner::Scanner;
pub use store::GraphStore;
pub use sync::{
    ReadThroughValidator, SyncContext, SyncControl, SyncQueue, SyncRuntime, SyncScope,
    SyncStatus, SyncWorker,
};
pub use tools::ToolRouter;
pub use worker_process::WorkerHost;
