//! Source repository: entity → file location pointers

use std::collections::BTreeSet;

use rusqlite::{params, params_from_iter, Connection, Row};

use super::files::escape_prefix;
use super::{placeholders, MAX_BATCH_PARAMS};
use crate::error::Result;
use crate::model::{now_timestamp, Source, SourceDraft, Span};

const COLUMNS: &str =
    "id, workspace_id, entity_id, kind, file_path, span_start, span_end, content_hash, updated_at";

fn from_row(row: &Row<'_>) -> rusqlite::Result<Source> {
    let start: i64 = row.get(5)?;
    let end: i64 = row.get(6)?;
    Ok(Source {
        id: row.get(0)?,
        workspace_id: row.get(1)?,
        entity_id: row.get(2)?,
        kind: row.get(3)?,
        file_path: row.get(4)?,
        span: (start >= 0 && end >= 0).then_some(Span { start, end }),
        content_hash: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

fn span_columns(span: Option<Span>) -> (i64, i64) {
    span.map(|s| (s.start, s.end)).unwrap_or((-1, -1))
}

/// Insert or refresh a source row; the location tuple is the identity
pub fn upsert(
    conn: &Connection,
    workspace_id: i64,
    entity_id: i64,
    draft: &SourceDraft,
    content_hash: &str,
) -> Result<i64> {
    let (start, end) = span_columns(draft.span);
    let id = conn.query_row(
        "INSERT INTO sources (workspace_id, entity_id, kind, file_path, span_start, span_end,
                              content_hash, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT (workspace_id, kind, file_path, span_start, span_end) DO UPDATE
         SET entity_id = excluded.entity_id,
             content_hash = excluded.content_hash,
             updated_at = excluded.updated_at
         RETURNING id",
        params![
            workspace_id,
            entity_id,
            draft.kind,
            draft.file_path,
            start,
            end,
            content_hash,
            now_timestamp()
        ],
        |row| row.get(0),
    )?;
    Ok(id)
}

pub fn for_path(conn: &Connection, workspace_id: i64, path: &str) -> Result<Vec<Source>> {
    let sql = format!(
        "SELECT {} FROM sources WHERE workspace_id = ?1 AND file_path = ?2 ORDER BY id",
        COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![workspace_id, path], from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn for_entity(conn: &Connection, entity_id: i64) -> Result<Vec<Source>> {
    let sql = format!(
        "SELECT {} FROM sources WHERE entity_id = ?1 ORDER BY file_path, span_start",
        COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![entity_id], from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn for_entities(conn: &Connection, entity_ids: &[i64]) -> Result<Vec<Source>> {
    let mut out = Vec::new();
    for chunk in entity_ids.chunks(MAX_BATCH_PARAMS) {
        let sql = format!(
            "SELECT {} FROM sources WHERE entity_id IN ({}) ORDER BY entity_id, file_path",
            COLUMNS,
            placeholders(chunk.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(chunk.iter()), from_row)?;
        for row in rows {
            out.push(row?);
        }
    }
    Ok(out)
}

/// Delete a path's source rows whose ids are not in `keep`; returns the
/// entity ids that lost a source
pub fn delete_for_path_except(
    conn: &Connection,
    workspace_id: i64,
    path: &str,
    keep: &BTreeSet<i64>,
) -> Result<Vec<i64>> {
    let stale: Vec<Source> = for_path(conn, workspace_id, path)?
        .into_iter()
        .filter(|s| !keep.contains(&s.id))
        .collect();

    let mut affected = BTreeSet::new();
    let mut stmt = conn.prepare_cached("DELETE FROM sources WHERE id = ?1")?;
    for source in &stale {
        stmt.execute(params![source.id])?;
        affected.insert(source.entity_id);
    }
    Ok(affected.into_iter().collect())
}

/// Delete every source row for a path; returns the affected entity ids
pub fn delete_for_path(conn: &Connection, workspace_id: i64, path: &str) -> Result<Vec<i64>> {
    delete_for_path_except(conn, workspace_id, path, &BTreeSet::new())
}

/// Delete every source row under a directory; returns affected entity ids
pub fn delete_under(conn: &Connection, workspace_id: i64, dir: &str) -> Result<Vec<i64>> {
    let pattern = escape_prefix(&format!("{}/%", dir.trim_end_matches('/')));
    let mut stmt = conn.prepare(
        "DELETE FROM sources WHERE workspace_id = ?1 AND file_path LIKE ?2 ESCAPE '\\'
         RETURNING entity_id",
    )?;
    let rows = stmt.query_map(params![workspace_id, pattern], |row| row.get::<_, i64>(0))?;
    let ids: BTreeSet<i64> = rows.collect::<rusqlite::Result<_>>()?;
    Ok(ids.into_iter().collect())
}

/// Every source row whose file is missing according to `exists`
pub fn missing_on_disk<F>(conn: &Connection, workspace_id: i64, exists: F) -> Result<Vec<Source>>
where
    F: Fn(&str) -> bool,
{
    let sql = format!(
        "SELECT {} FROM sources WHERE workspace_id = ?1 ORDER BY file_path",
        COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![workspace_id], from_row)?;
    let mut out = Vec::new();
    for row in rows {
        let source = row?;
        if !exists(&source.file_path) {
            out.push(source);
        }
    }
    Ok(out)
}

pub fn count(conn: &Connection, workspace_id: i64) -> Result<usize> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sources WHERE workspace_id = ?1",
        params![workspace_id],
        |row| row.get(0),
    )?;
    Ok(n as usize)
}
