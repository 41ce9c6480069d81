use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::Result;
use crate::model::{now_timestamp, Workspace};

fn from_row(row: &Row<'_>) -> rusqlite::Result<Workspace> {
    Ok(Workspace {
        id: row.get(0)?,
        host: row.get(1)?,
        root_path: row.get(2)?,
        created_at: row.get(3)?,
    })
}

/// Find or create the workspace for `(host, root_path)`. Workspaces are
/// never modified after creation.
pub fn ensure(conn: &Connection, host: &str, root_path: &str) -> Result<Workspace> {
    conn.execute(
        "INSERT INTO workspaces (host, root_path, created_at) VALUES (?1, ?2, ?3)
         ON CONFLICT (host, root_path) DO NOTHING",
        params![host, root_path, now_timestamp()],
    )?;
    let ws = conn.query_row(
        "SELECT id, host, root_path, created_at FROM workspaces WHERE host = ?1 AND root_path = ?2",
        params![host, root_path],
        from_row,
    )?;
    Ok(ws)
}

pub fn get(conn: &Connection, id: i64) -> Result<Option<Workspace>> {
    Ok(conn
        .query_row(
            "SELECT id, host, root_path, created_at FROM workspaces WHERE id = ?1",
            params![id],
            from_row,
        )
        .optional()?)
}
