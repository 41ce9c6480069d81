//! Entity repository

use std::collections::HashMap;

use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};

use super::{json_column, json_text, placeholders, MAX_BATCH_PARAMS};
use crate::error::Result;
use crate::model::{now_timestamp, Entity, EntityDraft};

pub(crate) const COLUMNS: &str = "id, workspace_id, entity_key, entity_type, summary, metadata, \
     is_deleted, deleted_at, last_sync_run_id, created_at, updated_at";

pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Entity> {
    Ok(Entity {
        id: row.get(0)?,
        workspace_id: row.get(1)?,
        key: row.get(2)?,
        entity_type: row.get(3)?,
        summary: row.get(4)?,
        metadata: json_column(row.get(5)?),
        is_deleted: row.get::<_, i64>(6)? != 0,
        deleted_at: row.get(7)?,
        last_sync_run_id: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

/// What an upsert did to the stored entity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityChange {
    Created,
    Updated,
    Restored,
    Unchanged,
}

/// Insert or update an entity by `(workspace, key)`.
///
/// A tombstoned entity is restored. `last_sync_run_id` is stamped on every
/// call, even when nothing else changed.
pub fn upsert(
    conn: &Connection,
    workspace_id: i64,
    draft: &EntityDraft,
    run_id: Option<i64>,
) -> Result<(i64, EntityChange)> {
    let now = now_timestamp();
    let metadata = json_text(&draft.metadata);

    let Some(existing) = find_by_key(conn, workspace_id, &draft.key)? else {
        let id: i64 = conn.query_row(
            "INSERT INTO entities (workspace_id, entity_key, entity_type, summary, metadata,
                                   last_sync_run_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
             ON CONFLICT (workspace_id, entity_key) DO UPDATE SET updated_at = excluded.updated_at
             RETURNING id",
            params![
                workspace_id,
                draft.key,
                draft.entity_type,
                draft.summary,
                metadata,
                run_id,
                now
            ],
            |row| row.get(0),
        )?;
        return Ok((id, EntityChange::Created));
    };

    let content_changed = existing.entity_type != draft.entity_type
        || existing.summary != draft.summary
        || existing.metadata != draft.metadata;

    let change = if existing.is_deleted {
        EntityChange::Restored
    } else if content_changed {
        EntityChange::Updated
    } else {
        EntityChange::Unchanged
    };

    if change == EntityChange::Unchanged {
        conn.execute(
            "UPDATE entities SET last_sync_run_id = ?2 WHERE id = ?1",
            params![existing.id, run_id],
        )?;
    } else {
        conn.execute(
            "UPDATE entities
             SET entity_type = ?2, summary = ?3, metadata = ?4, is_deleted = 0, deleted_at = NULL,
                 last_sync_run_id = ?5, updated_at = ?6
             WHERE id = ?1",
            params![
                existing.id,
                draft.entity_type,
                draft.summary,
                metadata,
                run_id,
                now
            ],
        )?;
    }
    Ok((existing.id, change))
}

pub fn find_by_key(conn: &Connection, workspace_id: i64, key: &str) -> Result<Option<Entity>> {
    let sql = format!(
        "SELECT {} FROM entities WHERE workspace_id = ?1 AND entity_key = ?2",
        COLUMNS
    );
    Ok(conn
        .query_row(&sql, params![workspace_id, key], from_row)
        .optional()?)
}

pub fn find_by_id(conn: &Connection, id: i64) -> Result<Option<Entity>> {
    let sql = format!("SELECT {} FROM entities WHERE id = ?1", COLUMNS);
    Ok(conn.query_row(&sql, params![id], from_row).optional()?)
}

/// Batch lookup by id, chunked to stay under SQLite's parameter limit
pub fn find_by_ids(conn: &Connection, ids: &[i64]) -> Result<Vec<Entity>> {
    let mut out = Vec::with_capacity(ids.len());
    for chunk in ids.chunks(MAX_BATCH_PARAMS) {
        let sql = format!(
            "SELECT {} FROM entities WHERE id IN ({})",
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

/// Batch lookup by key
pub fn find_by_keys(conn: &Connection, workspace_id: i64, keys: &[String]) -> Result<Vec<Entity>> {
    let mut out = Vec::with_capacity(keys.len());
    for chunk in keys.chunks(MAX_BATCH_PARAMS) {
        let sql = format!(
            "SELECT {} FROM entities WHERE workspace_id = ? AND entity_key IN ({})",
            COLUMNS,
            placeholders(chunk.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        let params = std::iter::once(rusqlite::types::Value::Integer(workspace_id)).chain(
            chunk
                .iter()
                .map(|k| rusqlite::types::Value::Text(k.clone())),
        );
        let rows = stmt.query_map(params_from_iter(params), from_row)?;
        for row in rows {
            out.push(row?);
        }
    }
    Ok(out)
}

/// Every key → id in the workspace (tombstoned included), used to warm the
/// sync worker's entity-key cache
pub fn key_index(conn: &Connection, workspace_id: i64) -> Result<HashMap<String, i64>> {
    let mut stmt = conn.prepare("SELECT entity_key, id FROM entities WHERE workspace_id = ?1")?;
    let rows = stmt.query_map(params![workspace_id], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
    })?;
    let mut map = HashMap::new();
    for row in rows {
        let (key, id) = row?;
        map.insert(key, id);
    }
    Ok(map)
}

/// Soft-delete an entity. Returns false if it was already tombstoned.
pub fn tombstone(conn: &Connection, id: i64, run_id: Option<i64>) -> Result<bool> {
    let now = now_timestamp();
    let changed = conn.execute(
        "UPDATE entities SET is_deleted = 1, deleted_at = ?2, updated_at = ?2, last_sync_run_id = ?3
         WHERE id = ?1 AND is_deleted = 0",
        params![id, now, run_id],
    )?;
    Ok(changed > 0)
}

/// Clear the tombstone flag. Returns false if the entity was live.
pub fn restore(conn: &Connection, id: i64, run_id: Option<i64>) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE entities SET is_deleted = 0, deleted_at = NULL, updated_at = ?2, last_sync_run_id = ?3
         WHERE id = ?1 AND is_deleted = 1",
        params![id, now_timestamp(), run_id],
    )?;
    Ok(changed > 0)
}

/// Live entities among `ids` that no longer have any source row
pub fn unsourced_among(conn: &Connection, ids: &[i64]) -> Result<Vec<i64>> {
    let mut out = Vec::new();
    for chunk in ids.chunks(MAX_BATCH_PARAMS) {
        let sql = format!(
            "SELECT e.id FROM entities e
             WHERE e.id IN ({}) AND e.is_deleted = 0
               AND NOT EXISTS (SELECT 1 FROM sources s WHERE s.entity_id = e.id)",
            placeholders(chunk.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(chunk.iter()), |row| row.get(0))?;
        for row in rows {
            out.push(row?);
        }
    }
    Ok(out)
}

/// Substring search over key and summary
pub fn search(
    conn: &Connection,
    workspace_id: i64,
    query: &str,
    entity_type: Option<&str>,
    include_deleted: bool,
    limit: usize,
) -> Result<Vec<Entity>> {
    let pattern = format!("%{}%", escape_like(query));
    let sql = format!(
        "SELECT {} FROM entities
         WHERE workspace_id = ?1
           AND (entity_key LIKE ?2 ESCAPE '\\' OR IFNULL(summary, '') LIKE ?2 ESCAPE '\\')
           AND (?3 IS NULL OR entity_type = ?3)
           AND (?4 OR is_deleted = 0)
         ORDER BY (entity_key = ?5) DESC, length(entity_key), entity_key
         LIMIT ?6",
        COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(
        params![
            workspace_id,
            pattern,
            entity_type,
            include_deleted,
            query,
            limit as i64
        ],
        from_row,
    )?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

fn escape_like(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Live entities with no relation in either direction
pub fn orphans(
    conn: &Connection,
    workspace_id: i64,
    entity_type: Option<&str>,
    limit: usize,
) -> Result<Vec<Entity>> {
    let sql = format!(
        "SELECT {} FROM entities
         WHERE workspace_id = ?1 AND is_deleted = 0
           AND (?2 IS NULL OR entity_type = ?2)
           AND NOT EXISTS (SELECT 1 FROM relations r WHERE r.src_entity_id = entities.id)
           AND NOT EXISTS (SELECT 1 FROM relations r WHERE r.dst_entity_id = entities.id)
         ORDER BY entity_key
         LIMIT ?3",
        COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![workspace_id, entity_type, limit as i64], from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Live entities of a type, ordered by key
pub fn list_by_type(
    conn: &Connection,
    workspace_id: i64,
    entity_type: &str,
    limit: usize,
) -> Result<Vec<Entity>> {
    let sql = format!(
        "SELECT {} FROM entities
         WHERE workspace_id = ?1 AND entity_type = ?2 AND is_deleted = 0
         ORDER BY entity_key LIMIT ?3",
        COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![workspace_id, entity_type, limit as i64], from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// `(live, tombstoned)` counts
pub fn counts(conn: &Connection, workspace_id: i64) -> Result<(usize, usize)> {
    let (live, dead): (i64, i64) = conn.query_row(
        "SELECT COALESCE(SUM(is_deleted = 0), 0), COALESCE(SUM(is_deleted = 1), 0)
         FROM entities WHERE workspace_id = ?1",
        params![workspace_id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    Ok((live as usize, dead as usize))
}

/// Live entities with no source row, excluding `exempt_types`
pub fn count_without_sources(
    conn: &Connection,
    workspace_id: i64,
    exempt_types: &[&str],
) -> Result<usize> {
    let mut sql = String::from(
        "SELECT COUNT(*) FROM entities
         WHERE workspace_id = ? AND is_deleted = 0
           AND NOT EXISTS (SELECT 1 FROM sources s WHERE s.entity_id = entities.id)",
    );
    if !exempt_types.is_empty() {
        sql.push_str(&format!(
            " AND entity_type NOT IN ({})",
            placeholders(exempt_types.len())
        ));
    }
    let mut values: Vec<rusqlite::types::Value> = vec![workspace_id.into()];
    values.extend(exempt_types.iter().map(|t| t.to_string().into()));
    let n: i64 = conn.query_row(&sql, params_from_iter(values), |row| row.get(0))?;
    Ok(n as usize)
}

/// Live entities that have no source row, excluding stub types that are
/// never file-backed
pub fn without_sources(
    conn: &Connection,
    workspace_id: i64,
    exempt_types: &[&str],
    limit: usize,
) -> Result<Vec<Entity>> {
    let mut sql = format!(
        "SELECT {} FROM entities
         WHERE workspace_id = ? AND is_deleted = 0
           AND NOT EXISTS (SELECT 1 FROM sources s WHERE s.entity_id = entities.id)",
        COLUMNS
    );
    if !exempt_types.is_empty() {
        sql.push_str(&format!(
            " AND entity_type NOT IN ({})",
            placeholders(exempt_types.len())
        ));
    }
    sql.push_str(" ORDER BY entity_key LIMIT ?");

    let mut values: Vec<rusqlite::types::Value> = vec![workspace_id.into()];
    values.extend(exempt_types.iter().map(|t| t.to_string().into()));
    values.push((limit as i64).into());

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(values), from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Live spec entities nothing implements, directly or through one of the
/// sections they contain
pub fn unimplemented_specs(
    conn: &Connection,
    workspace_id: i64,
    spec_types: &[&str],
    limit: usize,
) -> Result<Vec<Entity>> {
    if spec_types.is_empty() {
        return Ok(Vec::new());
    }
    let sql = format!(
        "SELECT {} FROM entities
         WHERE workspace_id = ? AND is_deleted = 0 AND entity_type IN ({})
           AND NOT EXISTS (
               SELECT 1 FROM relations i
               WHERE i.dst_entity_id = entities.id AND i.relation_type = 'implements')
           AND NOT EXISTS (
               SELECT 1 FROM relations c
               JOIN relations i ON i.dst_entity_id = c.dst_entity_id
               WHERE c.src_entity_id = entities.id AND c.relation_type = 'contains'
                 AND i.relation_type = 'implements')
         ORDER BY entity_key LIMIT ?",
        COLUMNS,
        placeholders(spec_types.len())
    );
    let mut values: Vec<rusqlite::types::Value> = vec![workspace_id.into()];
    values.extend(spec_types.iter().map(|t| t.to_string().into()));
    values.push((limit as i64).into());

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(values), from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Live entities of `code_types` that nothing tests. An entity counts as
/// tested when it has an incoming `tests` edge, when a test entity shares
/// its file, or when the entity containing it is tested directly.
pub fn untested(
    conn: &Connection,
    workspace_id: i64,
    code_types: &[&str],
    limit: usize,
) -> Result<Vec<Entity>> {
    if code_types.is_empty() {
        return Ok(Vec::new());
    }
    let sql = format!(
        "SELECT {} FROM entities
         WHERE workspace_id = ? AND is_deleted = 0 AND entity_type IN ({})
           AND NOT EXISTS (
               SELECT 1 FROM relations t
               WHERE t.dst_entity_id = entities.id AND t.relation_type = 'tests')
           AND NOT EXISTS (
               SELECT 1 FROM relations c
               JOIN relations t ON t.dst_entity_id = c.src_entity_id
               WHERE c.dst_entity_id = entities.id AND c.relation_type = 'contains'
                 AND t.relation_type = 'tests')
           AND NOT EXISTS (
               SELECT 1 FROM sources s
               JOIN sources ts ON ts.workspace_id = s.workspace_id AND ts.file_path = s.file_path
               JOIN entities te ON te.id = ts.entity_id
               WHERE s.entity_id = entities.id AND te.entity_type = 'test')
         ORDER BY entity_key LIMIT ?",
        COLUMNS,
        placeholders(code_types.len())
    );
    let mut values: Vec<rusqlite::types::Value> = vec![workspace_id.into()];
    values.extend(code_types.iter().map(|t| t.to_string().into()));
    values.push((limit as i64).into());

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(values), from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Hard-delete entities tombstoned before `cutoff`. Sources, facts,
/// relations, evidence and events go with them.
pub fn purge_tombstoned(conn: &Connection, workspace_id: i64, cutoff: &str) -> Result<usize> {
    Ok(conn.execute(
        "DELETE FROM entities
         WHERE workspace_id = ?1 AND is_deleted = 1 AND deleted_at IS NOT NULL AND deleted_at < ?2",
        params![workspace_id, cutoff],
    )?)
}
