//! Engine configuration.
//!
//! Loaded from `<root>/.kgraph/config.toml`, falling back to the user-level
//! file (`~/.config/kgraph/config.toml` on Linux), falling back to defaults.
//! Every field is optional in the TOML file.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{KgError, Result};

/// Directory (relative to the workspace root) holding engine state
pub const STATE_DIR: &str = ".kgraph";

/// Top-level engine configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct EngineConfig {
    #[serde(default)]
    pub sync: SyncConfig,

    #[serde(default)]
    pub search: SearchConfig,

    #[serde(default)]
    pub audit: AuditConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub store: StoreConfig,
}

/// Scanner / watcher / worker settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncConfig {
    /// Directories (relative to the workspace root) to scan and watch
    #[serde(default = "default_include_dirs")]
    pub include_dirs: Vec<String>,

    /// Per-path quiet period before a watch event is enqueued
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Files larger than this are never hashed or extracted
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,

    /// Run the startup reconciliation scan before steady-state syncing
    #[serde(default = "default_true")]
    pub startup_full_scan: bool,

    /// Validate source freshness on reads
    #[serde(default = "default_true")]
    pub read_through_validation: bool,

    /// Parallelism for batched freshness checks
    #[serde(default = "default_validation_concurrency")]
    pub validation_concurrency: usize,

    /// Register filesystem watches (disable for one-shot syncs)
    #[serde(default = "default_true")]
    pub watch_enabled: bool,

    /// Vanished paths tombstoned per transaction during startup reconciliation
    #[serde(default = "default_tombstone_batch_size")]
    pub tombstone_batch_size: usize,

    #[serde(default)]
    pub exclude: ExcludeRules,

    /// Per-extractor enable flags; extractors not listed are enabled
    #[serde(default)]
    pub extractors: HashMap<String, bool>,
}

/// Exclusion rules shared by the scanner and the watcher
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExcludeRules {
    /// Directory names excluded at any depth
    #[serde(default = "default_exclude_dirs")]
    pub dirs: Vec<String>,

    /// Exact file names
    #[serde(default = "default_exclude_files")]
    pub files: Vec<String>,

    /// Extensions without the leading dot
    #[serde(default = "default_exclude_extensions")]
    pub extensions: Vec<String>,

    /// Glob patterns matched against the file name (e.g. `*.min.js`)
    #[serde(default = "default_exclude_patterns")]
    pub patterns: Vec<String>,
}

/// Query defaults
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchConfig {
    #[serde(default = "default_limit")]
    pub default_limit: usize,

    #[serde(default = "default_max_limit")]
    pub max_limit: usize,

    #[serde(default = "default_depth")]
    pub default_depth: usize,

    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
}

/// Audit trail retention
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditConfig {
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// Graph store location and pool sizing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoreConfig {
    /// Database file; defaults to `<root>/.kgraph/graph.db`
    #[serde(default)]
    pub database_path: Option<PathBuf>,

    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
}

fn default_true() -> bool {
    true
}

fn default_include_dirs() -> Vec<String> {
    vec![".".to_string()]
}

fn default_debounce_ms() -> u64 {
    300
}

fn default_max_file_size() -> u64 {
    1024 * 1024
}

fn default_validation_concurrency() -> usize {
    16
}

fn default_tombstone_batch_size() -> usize {
    200
}

fn default_exclude_dirs() -> Vec<String> {
    [
        ".git",
        ".hg",
        ".svn",
        STATE_DIR,
        "target",
        "node_modules",
        "dist",
        "build",
        "__pycache__",
        ".venv",
        "venv",
        ".idea",
        ".vscode",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_exclude_files() -> Vec<String> {
    ["Cargo.lock", "package-lock.json", "yarn.lock", "pnpm-lock.yaml", ".DS_Store"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_exclude_extensions() -> Vec<String> {
    [
        "png", "jpg", "jpeg", "gif", "webp", "ico", "pdf", "zip", "gz", "tar", "so", "dylib",
        "dll", "exe", "bin", "o", "a", "rlib", "db", "sqlite", "wasm",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_exclude_patterns() -> Vec<String> {
    ["*.min.js", "*.min.css", "*.map", "*~", "*.swp"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_limit() -> usize {
    25
}

fn default_max_limit() -> usize {
    500
}

fn default_depth() -> usize {
    2
}

fn default_max_depth() -> usize {
    8
}

fn default_retention_days() -> u32 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_pool_size() -> u32 {
    8
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            include_dirs: default_include_dirs(),
            debounce_ms: default_debounce_ms(),
            max_file_size: default_max_file_size(),
            startup_full_scan: true,
            read_through_validation: true,
            validation_concurrency: default_validation_concurrency(),
            watch_enabled: true,
            tombstone_batch_size: default_tombstone_batch_size(),
            exclude: ExcludeRules::default(),
            extractors: HashMap::new(),
        }
    }
}

impl SyncConfig {
    /// Whether the named extractor is enabled
    pub fn extractor_enabled(&self, name: &str) -> bool {
        self.extractors.get(name).copied().unwrap_or(true)
    }
}

impl Default for ExcludeRules {
    fn default() -> Self {
        Self {
            dirs: default_exclude_dirs(),
            files: default_exclude_files(),
            extensions: default_exclude_extensions(),
            patterns: default_exclude_patterns(),
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_limit: default_limit(),
            max_limit: default_max_limit(),
            default_depth: default_depth(),
            max_depth: default_max_depth(),
        }
    }
}

impl SearchConfig {
    /// Clamp a caller-supplied limit into `1..=max_limit`
    pub fn limit(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.default_limit)
            .clamp(1, self.max_limit)
    }

    /// Clamp a caller-supplied depth into `1..=max_depth`
    pub fn depth(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.default_depth)
            .clamp(1, self.max_depth)
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            retention_days: default_retention_days(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            pool_size: default_pool_size(),
        }
    }
}

impl EngineConfig {
    /// Resolve configuration for a workspace.
    ///
    /// An explicit path must exist. Otherwise the workspace file is tried,
    /// then the user-level file, then defaults.
    pub fn load(root: &Path, explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            if !path.exists() {
                return Err(KgError::config(format!(
                    "config file not found: {}",
                    path.display()
                )));
            }
            return Self::load_from(path);
        }

        let workspace_file = root.join(STATE_DIR).join("config.toml");
        if workspace_file.exists() {
            return Self::load_from(&workspace_file);
        }

        if let Some(user_file) = dirs::config_dir().map(|d| d.join("kgraph").join("config.toml")) {
            if user_file.exists() {
                return Self::load_from(&user_file);
            }
        }

        Ok(Self::default())
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| KgError::config(format!("Failed to parse {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.sync.include_dirs.is_empty() {
            return Err(KgError::config("sync.include_dirs must not be empty"));
        }
        if self.sync.validation_concurrency == 0 {
            return Err(KgError::config("sync.validation_concurrency must be > 0"));
        }
        if self.sync.tombstone_batch_size == 0 {
            return Err(KgError::config("sync.tombstone_batch_size must be > 0"));
        }
        if self.search.default_limit == 0 || self.search.max_limit == 0 {
            return Err(KgError::config("search limits must be > 0"));
        }
        if self.search.max_depth == 0 {
            return Err(KgError::config("search.max_depth must be > 0"));
        }
        if self.store.pool_size == 0 {
            return Err(KgError::config("store.pool_size must be > 0"));
        }
        Ok(())
    }

    /// Database file for a workspace
    pub fn database_path(&self, root: &Path) -> PathBuf {
        self.store
            .database_path
            .clone()
            .unwrap_or_else(|| root.join(STATE_DIR).join("graph.db"))
    }
}
