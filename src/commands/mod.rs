//! Command modules for the kgraph-engine CLI
//!
//! ## Architecture
//!
//! Each command module implements one or more top-level commands:
//! - `scan` - list tracked files and hashes
//! - `sync` - one-shot reconciliation (`sync`) and the long-running `watch`
//! - `serve` - JSON-lines tool server on stdio
//! - `tool` - one-shot tool call, `purge`, `schema`
//!
//! All handlers take their `Args` struct from `cli.rs` and a shared
//! [`CommandContext`], and return the text to print on stdout.

pub mod scan;
pub mod serve;
pub mod sync;
pub mod tool;

pub use scan::run_scan;
pub use serve::run_serve;
pub use sync::{run_sync, run_watch};
pub use tool::{run_purge, run_schema, run_tool};

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;

use crate::cli::{Cli, OutputFormat};
use crate::config::EngineConfig;
use crate::error::{KgError, Result};
use crate::parsers::ParserRegistry;
use crate::query::GraphQuery;
use crate::store::GraphStore;
use crate::sync::{ReadThroughValidator, ResyncSink};
use crate::worker_process::InitParams;

/// Shared context passed to all command handlers
#[derive(Debug, Clone)]
pub struct CommandContext {
    /// Canonical workspace root
    pub root: PathBuf,
    /// Explicit `--config`, forwarded to the worker child
    pub config_path: Option<PathBuf>,
    pub config: EngineConfig,
    pub db_path: PathBuf,
    pub format: OutputFormat,
    pub verbose: bool,
}

impl CommandContext {
    /// Resolve root, configuration and database location from CLI flags
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        let root = match &cli.root {
            Some(root) => root.clone(),
            None => std::env::current_dir()?,
        };
        let root = std::fs::canonicalize(&root).map_err(|e| {
            KgError::config(format!("workspace root {}: {}", root.display(), e))
        })?;
        let config = EngineConfig::load(&root, cli.config.as_deref())?;
        config.validate()?;
        let db_path = cli
            .db
            .clone()
            .unwrap_or_else(|| config.database_path(&root));

        Ok(Self {
            root,
            config_path: cli.config.clone(),
            config,
            db_path,
            format: cli.format,
            verbose: cli.verbose,
        })
    }

    pub fn log_level(&self) -> &str {
        if self.verbose {
            "debug"
        } else {
            &self.config.logging.level
        }
    }

    pub fn open_store(&self) -> Result<GraphStore> {
        GraphStore::open(&self.db_path, self.config.store.pool_size)
    }

    pub fn registry(&self) -> Arc<ParserRegistry> {
        Arc::new(ParserRegistry::with_builtin(&self.config.sync))
    }

    /// Query engine for this workspace, with read-through validation feeding
    /// `sink`
    pub fn graph_query(&self, store: GraphStore, sink: Arc<dyn ResyncSink>) -> Result<GraphQuery> {
        let workspace = store.ensure_local_workspace(&self.root)?;
        let validator = ReadThroughValidator::new(
            self.root.clone(),
            Arc::new(crate::hash_cache::HashCache::new()),
            sink,
            self.config.sync.read_through_validation,
            self.config.sync.validation_concurrency,
        )?;
        Ok(GraphQuery::new(store, workspace.id, self.root.clone(), &self.config)
            .with_validator(Arc::new(validator)))
    }

    /// `init` for a worker child serving this workspace
    pub fn init_params(&self) -> InitParams {
        let mut init = InitParams::new(&self.root);
        init.config_path = self.config_path.clone();
        init.database_path = Some(self.db_path.clone());
        init.log_level = Some(self.log_level().to_string());
        init
    }

    /// JSON when `--format json`, otherwise the text rendering
    pub fn render<T, F>(&self, value: &T, text: F) -> Result<String>
    where
        T: Serialize,
        F: FnOnce(&T) -> String,
    {
        match self.format {
            OutputFormat::Json => {
                let mut out = serde_json::to_string_pretty(value)?;
                out.push('\n');
                Ok(out)
            }
            OutputFormat::Text => Ok(text(value)),
        }
    }
}
