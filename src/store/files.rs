//! Processed-file ledger: the last content hash the worker committed for
//! each path, including files that produced no entities.

use std::collections::HashMap;

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::Result;
use crate::model::now_timestamp;

pub fn stored_hash(conn: &Connection, workspace_id: i64, path: &str) -> Result<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT content_hash FROM files WHERE workspace_id = ?1 AND path = ?2",
            params![workspace_id, path],
            |row| row.get(0),
        )
        .optional()?)
}

pub fn record(conn: &Connection, workspace_id: i64, path: &str, content_hash: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO files (workspace_id, path, content_hash, updated_at) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT (workspace_id, path) DO UPDATE
         SET content_hash = excluded.content_hash, updated_at = excluded.updated_at",
        params![workspace_id, path, content_hash, now_timestamp()],
    )?;
    Ok(())
}

pub fn forget(conn: &Connection, workspace_id: i64, path: &str) -> Result<bool> {
    let n = conn.execute(
        "DELETE FROM files WHERE workspace_id = ?1 AND path = ?2",
        params![workspace_id, path],
    )?;
    Ok(n > 0)
}

/// Forget every file under a directory; returns the removed paths
pub fn forget_under(conn: &Connection, workspace_id: i64, dir: &str) -> Result<Vec<String>> {
    let prefix = format!("{}/%", dir.trim_end_matches('/'));
    let mut stmt = conn.prepare(
        "DELETE FROM files WHERE workspace_id = ?1 AND path LIKE ?2 ESCAPE '\\' RETURNING path",
    )?;
    let rows = stmt.query_map(params![workspace_id, escape_prefix(&prefix)], |row| {
        row.get(0)
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Whether the graph knows anything about `path`, as a file or as a
/// directory prefix
pub fn is_tracked(conn: &Connection, workspace_id: i64, path: &str) -> Result<bool> {
    let prefix = escape_prefix(&format!("{}/%", path.trim_end_matches('/')));
    let found: i64 = conn.query_row(
        "SELECT EXISTS (SELECT 1 FROM files
                        WHERE workspace_id = ?1 AND (path = ?2 OR path LIKE ?3 ESCAPE '\\'))
             OR EXISTS (SELECT 1 FROM sources
                        WHERE workspace_id = ?1
                          AND (file_path = ?2 OR file_path LIKE ?3 ESCAPE '\\'))",
        params![workspace_id, path, prefix],
        |row| row.get(0),
    )?;
    Ok(found != 0)
}

/// Every tracked path with its stored hash. Paths that only appear in the
/// sources table are included so no source outlives its file unnoticed.
pub fn tracked(conn: &Connection, workspace_id: i64) -> Result<HashMap<String, String>> {
    let mut stmt = conn.prepare(
        "SELECT path, content_hash FROM files WHERE workspace_id = ?1
         UNION
         SELECT DISTINCT file_path, content_hash FROM sources
         WHERE workspace_id = ?1
           AND file_path NOT IN (SELECT path FROM files WHERE workspace_id = ?1)",
    )?;
    let rows = stmt.query_map(params![workspace_id], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;
    let mut out = HashMap::new();
    for row in rows {
        let (path, hash) = row?;
        out.insert(path, hash);
    }
    Ok(out)
}

/// Escape LIKE wildcards in everything but the trailing `%`
pub(crate) fn escape_prefix(pattern: &str) -> String {
    let body = pattern.strip_suffix('%').unwrap_or(pattern);
    let mut out = String::with_capacity(pattern.len() + 4);
    for c in body.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('%');
    out
}
