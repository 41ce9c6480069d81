//! Graph store: SQLite behind an r2d2 pool
//!
//! Repository functions in the submodules take a plain `&Connection`, so any
//! of them can run inside the ambient transaction opened by
//! [`GraphStore::transaction`]. One transaction is one logical unit of work:
//! a single file's diff or a single tombstone batch.
//!
//! Never hold a pooled connection while requesting another one; the
//! in-memory store has a pool of exactly one connection.

pub mod audit;
pub mod entities;
pub mod facts;
pub mod files;
pub mod relations;
pub mod schema;
pub mod sources;
pub mod workspace;

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, Transaction};

use crate::error::Result;
use crate::model::Workspace;

pub type DbPool = Pool<SqliteConnectionManager>;
pub type DbConnection = PooledConnection<SqliteConnectionManager>;

/// Upper bound on ids bound into one `IN (...)` list
pub const MAX_BATCH_PARAMS: usize = 900;

/// `?,?,?` for `n` parameters
pub(crate) fn placeholders(n: usize) -> String {
    let mut s = String::with_capacity(n * 2);
    for i in 0..n {
        if i > 0 {
            s.push(',');
        }
        s.push('?');
    }
    s
}

/// Parse a JSON column, tolerating NULL and legacy non-JSON values
pub(crate) fn json_column(raw: Option<String>) -> serde_json::Value {
    raw.and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or(serde_json::Value::Null)
}

/// Serialize a JSON value for storage; `Null` is stored as SQL NULL
pub(crate) fn json_text(value: &serde_json::Value) -> Option<String> {
    if value.is_null() {
        None
    } else {
        Some(value.to_string())
    }
}

fn init_connection(conn: &mut Connection) -> std::result::Result<(), rusqlite::Error> {
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(())
}

/// Pooled handle to the graph database
#[derive(Clone)]
pub struct GraphStore {
    pool: DbPool,
    path: Option<PathBuf>,
}

impl GraphStore {
    /// Open (creating if needed) an on-disk store and migrate its schema
    pub fn open(path: &Path, pool_size: u32) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let manager = SqliteConnectionManager::file(path).with_init(|conn| {
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;
            init_connection(conn)
        });
        let pool = Pool::builder().max_size(pool_size.max(1)).build(manager)?;

        let store = Self {
            pool,
            path: Some(path.to_path_buf()),
        };
        store.with_conn(schema::migrate)?;
        tracing::debug!("[STORE] opened {}", path.display());
        Ok(store)
    }

    /// Private in-memory store (single connection), used by tests
    pub fn in_memory() -> Result<Self> {
        let manager = SqliteConnectionManager::memory().with_init(init_connection);
        let pool = Pool::builder()
            .max_size(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .build(manager)?;

        let store = Self { pool, path: None };
        store.with_conn(schema::migrate)?;
        Ok(store)
    }

    /// Database file, `None` for in-memory stores
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn connection(&self) -> Result<DbConnection> {
        Ok(self.pool.get()?)
    }

    /// Run read-only work on a pooled connection
    pub fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.pool.get()?;
        f(&conn)
    }

    /// Run `f` inside one transaction; committed on `Ok`, rolled back on `Err`
    pub fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T>,
    {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    /// Find or create the workspace row for `(host, root)`
    pub fn ensure_workspace(&self, host: &str, root: &str) -> Result<Workspace> {
        self.with_conn(|conn| workspace::ensure(conn, host, root))
    }

    /// Workspace for `root` on this machine
    pub fn ensure_local_workspace(&self, root: &Path) -> Result<Workspace> {
        let host = gethostname::gethostname().to_string_lossy().into_owned();
        self.ensure_workspace(&host, &root.to_string_lossy())
    }
}
