//! Relation and relation-evidence repository

use std::collections::{BTreeSet, HashMap};

use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::{json_column, json_text, placeholders, MAX_BATCH_PARAMS};
use crate::error::Result;
use crate::model::{now_timestamp, Fact, Relation, RelationDraft};

const COLUMNS: &str = "r.id, r.workspace_id, r.src_entity_id, r.dst_entity_id, r.relation_type, \
     r.strength_type, r.metadata, r.source_path, r.created_at, r.updated_at";

fn from_row(row: &Row<'_>) -> rusqlite::Result<Relation> {
    Ok(Relation {
        id: row.get(0)?,
        workspace_id: row.get(1)?,
        src_entity_id: row.get(2)?,
        dst_entity_id: row.get(3)?,
        relation_type: row.get(4)?,
        strength_type: row.get(5)?,
        metadata: json_column(row.get(6)?),
        source_path: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

/// Edge direction relative to the entity being expanded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Edges pointing at the entity
    Incoming,
    /// Edges leaving the entity
    Outgoing,
    Both,
}

/// Insert or refresh a relation and record `source_path` as asserting it.
/// The first asserting path stays the reported owner. Self-loops are
/// rejected with `None`.
pub fn upsert(
    conn: &Connection,
    workspace_id: i64,
    src_entity_id: i64,
    dst_entity_id: i64,
    draft: &RelationDraft,
    source_path: Option<&str>,
) -> Result<Option<i64>> {
    if src_entity_id == dst_entity_id {
        return Ok(None);
    }
    let now = now_timestamp();
    let id: i64 = conn.query_row(
        "INSERT INTO relations (workspace_id, src_entity_id, dst_entity_id, relation_type,
                                strength_type, metadata, source_path, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
         ON CONFLICT (src_entity_id, dst_entity_id, relation_type, strength_type) DO UPDATE
         SET metadata = excluded.metadata,
             source_path = COALESCE(relations.source_path, excluded.source_path),
             updated_at = excluded.updated_at
         RETURNING id",
        params![
            workspace_id,
            src_entity_id,
            dst_entity_id,
            draft.relation_type,
            draft.strength,
            json_text(&draft.metadata),
            source_path,
            now
        ],
        |row| row.get(0),
    )?;
    if let Some(path) = source_path {
        conn.prepare_cached(
            "INSERT OR IGNORE INTO relation_assertions (relation_id, workspace_id, path)
             VALUES (?1, ?2, ?3)",
        )?
        .execute(params![id, workspace_id, path])?;
    }
    Ok(Some(id))
}

pub fn get(conn: &Connection, id: i64) -> Result<Option<Relation>> {
    let sql = format!("SELECT {} FROM relations r WHERE r.id = ?1", COLUMNS);
    Ok(conn.query_row(&sql, params![id], from_row).optional()?)
}

/// Paths currently asserting a relation, sorted
pub fn asserted_by(conn: &Connection, relation_id: i64) -> Result<Vec<String>> {
    let mut stmt = conn.prepare_cached(
        "SELECT path FROM relation_assertions WHERE relation_id = ?1 ORDER BY path",
    )?;
    let paths = stmt
        .query_map(params![relation_id], |row| row.get(0))?
        .collect::<rusqlite::Result<_>>()?;
    Ok(paths)
}

/// Withdraw the assertions in `links`. A relation no file asserts any more
/// is deleted; one still asserted elsewhere is handed to its next path.
/// Returns the number of relations deleted.
fn retract(conn: &Connection, links: &[(i64, String)]) -> Result<usize> {
    let mut unlink = conn
        .prepare_cached("DELETE FROM relation_assertions WHERE relation_id = ?1 AND path = ?2")?;
    let mut remaining = conn.prepare_cached(
        "SELECT MIN(path) FROM relation_assertions WHERE relation_id = ?1",
    )?;
    let mut delete = conn.prepare_cached("DELETE FROM relations WHERE id = ?1")?;
    let mut reassign = conn.prepare_cached(
        "UPDATE relations SET source_path = ?2 WHERE id = ?1 AND source_path = ?3",
    )?;

    let mut removed = 0;
    for (id, path) in links {
        unlink.execute(params![id, path])?;
        let next: Option<String> = remaining.query_row(params![id], |row| row.get(0))?;
        match next {
            None => removed += delete.execute(params![id])?,
            Some(next) => {
                reassign.execute(params![id, next, path])?;
            }
        }
    }
    Ok(removed)
}

/// Withdraw `path`'s assertions except those in `keep`
pub fn delete_for_source_path_except(
    conn: &Connection,
    workspace_id: i64,
    path: &str,
    keep: &BTreeSet<i64>,
) -> Result<usize> {
    let mut stmt = conn.prepare_cached(
        "SELECT relation_id FROM relation_assertions WHERE workspace_id = ?1 AND path = ?2",
    )?;
    let links: Vec<(i64, String)> = stmt
        .query_map(params![workspace_id, path], |row| row.get::<_, i64>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?
        .into_iter()
        .filter(|id| !keep.contains(id))
        .map(|id| (id, path.to_string()))
        .collect();
    retract(conn, &links)
}

pub fn delete_for_source_path(conn: &Connection, workspace_id: i64, path: &str) -> Result<usize> {
    delete_for_source_path_except(conn, workspace_id, path, &BTreeSet::new())
}

pub fn delete_under_source_dir(conn: &Connection, workspace_id: i64, dir: &str) -> Result<usize> {
    let pattern = super::files::escape_prefix(&format!("{}/%", dir.trim_end_matches('/')));
    let mut stmt = conn.prepare_cached(
        "SELECT relation_id, path FROM relation_assertions
         WHERE workspace_id = ?1 AND path LIKE ?2 ESCAPE '\\'",
    )?;
    let links: Vec<(i64, String)> = stmt
        .query_map(params![workspace_id, pattern], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<rusqlite::Result<_>>()?;
    retract(conn, &links)
}

/// One batched query for every edge touching a whole BFS frontier.
///
/// Edges whose endpoints are tombstoned are omitted unless
/// `include_deleted` is set.
pub fn for_frontier(
    conn: &Connection,
    frontier: &[i64],
    direction: Direction,
    include_deleted: bool,
) -> Result<Vec<Relation>> {
    let mut out = Vec::new();
    // Both binds the chunk twice
    let chunk_size = match direction {
        Direction::Both => MAX_BATCH_PARAMS / 2,
        _ => MAX_BATCH_PARAMS,
    };
    let live_filter = if include_deleted {
        ""
    } else {
        " AND s.is_deleted = 0 AND d.is_deleted = 0"
    };

    for chunk in frontier.chunks(chunk_size) {
        let ph = placeholders(chunk.len());
        let predicate = match direction {
            Direction::Outgoing => format!("r.src_entity_id IN ({})", ph),
            Direction::Incoming => format!("r.dst_entity_id IN ({})", ph),
            Direction::Both => format!("(r.src_entity_id IN ({ph}) OR r.dst_entity_id IN ({ph}))"),
        };
        let sql = format!(
            "SELECT {} FROM relations r
             JOIN entities s ON s.id = r.src_entity_id
             JOIN entities d ON d.id = r.dst_entity_id
             WHERE {}{}
             ORDER BY r.id",
            COLUMNS, predicate, live_filter
        );

        let mut stmt = conn.prepare(&sql)?;
        let rows = match direction {
            Direction::Both => stmt.query_map(
                params_from_iter(chunk.iter().chain(chunk.iter())),
                from_row,
            )?,
            _ => stmt.query_map(params_from_iter(chunk.iter()), from_row)?,
        };
        for row in rows {
            out.push(row?);
        }
    }

    if matches!(direction, Direction::Both) && frontier.len() > chunk_size {
        let mut seen = BTreeSet::new();
        out.retain(|r| seen.insert(r.id));
    }
    Ok(out)
}

/// Filtered edges of a single entity
pub fn for_entity(
    conn: &Connection,
    entity_id: i64,
    direction: Direction,
    relation_type: Option<&str>,
    include_deleted: bool,
) -> Result<Vec<Relation>> {
    let mut rels = for_frontier(conn, &[entity_id], direction, include_deleted)?;
    if let Some(ty) = relation_type {
        rels.retain(|r| r.relation_type == ty);
    }
    Ok(rels)
}

/// `(outgoing, incoming)` edge counts for a batch of entities. Entities
/// without edges are absent.
pub fn counts_for_entities(
    conn: &Connection,
    entity_ids: &[i64],
) -> Result<HashMap<i64, (usize, usize)>> {
    let mut counts: HashMap<i64, (usize, usize)> = HashMap::new();
    for chunk in entity_ids.chunks(MAX_BATCH_PARAMS) {
        let ph = placeholders(chunk.len());
        for (column, outgoing) in [("src_entity_id", true), ("dst_entity_id", false)] {
            let sql = format!(
                "SELECT {col}, COUNT(*) FROM relations WHERE {col} IN ({ph}) GROUP BY {col}",
                col = column,
                ph = ph
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(chunk.iter()), |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
            })?;
            for row in rows {
                let (id, n) = row?;
                let entry = counts.entry(id).or_default();
                if outgoing {
                    entry.0 = n as usize;
                } else {
                    entry.1 = n as usize;
                }
            }
        }
    }
    Ok(counts)
}

/// Relations with at least one tombstoned endpoint
pub fn with_tombstoned_endpoint(
    conn: &Connection,
    workspace_id: i64,
    limit: usize,
) -> Result<Vec<Relation>> {
    let sql = format!(
        "SELECT {} FROM relations r
         JOIN entities s ON s.id = r.src_entity_id
         JOIN entities d ON d.id = r.dst_entity_id
         WHERE r.workspace_id = ?1 AND (s.is_deleted = 1 OR d.is_deleted = 1)
         ORDER BY r.id LIMIT ?2",
        COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![workspace_id, limit as i64], from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Relations with no linked evidence
pub fn without_evidence(
    conn: &Connection,
    workspace_id: i64,
    limit: usize,
) -> Result<Vec<Relation>> {
    let sql = format!(
        "SELECT {} FROM relations r
         WHERE r.workspace_id = ?1
           AND NOT EXISTS (SELECT 1 FROM relation_evidence ev WHERE ev.relation_id = r.id)
         ORDER BY r.id LIMIT ?2",
        COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![workspace_id, limit as i64], from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// `(with a tombstoned endpoint, without evidence)` relation counts
pub fn defect_counts(conn: &Connection, workspace_id: i64) -> Result<(usize, usize)> {
    let (tombstoned, unevidenced): (i64, i64) = conn.query_row(
        "SELECT
            (SELECT COUNT(*) FROM relations r
             JOIN entities s ON s.id = r.src_entity_id
             JOIN entities d ON d.id = r.dst_entity_id
             WHERE r.workspace_id = ?1 AND (s.is_deleted = 1 OR d.is_deleted = 1)),
            (SELECT COUNT(*) FROM relations r
             WHERE r.workspace_id = ?1
               AND NOT EXISTS (SELECT 1 FROM relation_evidence ev WHERE ev.relation_id = r.id))",
        params![workspace_id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    Ok((tombstoned as usize, unevidenced as usize))
}

pub fn count(conn: &Connection, workspace_id: i64) -> Result<usize> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM relations WHERE workspace_id = ?1",
        params![workspace_id],
        |row| row.get(0),
    )?;
    Ok(n as usize)
}

// ============================================================================
// Evidence
// ============================================================================

/// Link a fact as evidence for a relation; idempotent
pub fn link_evidence(conn: &Connection, relation_id: i64, fact_id: i64) -> Result<bool> {
    let n = conn.execute(
        "INSERT OR IGNORE INTO relation_evidence (relation_id, fact_id) VALUES (?1, ?2)",
        params![relation_id, fact_id],
    )?;
    Ok(n > 0)
}

/// Drop a relation's links to `fact_ids` before they are re-derived.
/// Evidence contributed by other files' facts stays.
pub fn clear_evidence_from(conn: &Connection, relation_id: i64, fact_ids: &[i64]) -> Result<usize> {
    let mut stmt = conn.prepare_cached(
        "DELETE FROM relation_evidence WHERE relation_id = ?1 AND fact_id = ?2",
    )?;
    let mut removed = 0;
    for fact_id in fact_ids {
        removed += stmt.execute(params![relation_id, fact_id])?;
    }
    Ok(removed)
}

/// Facts justifying a relation
pub fn evidence_for(conn: &Connection, relation_id: i64) -> Result<Vec<Fact>> {
    let mut stmt = conn.prepare(
        "SELECT f.id, f.entity_id, f.fact_type, f.fact_key, f.content, f.payload,
                f.content_hash, f.updated_at
         FROM relation_evidence ev JOIN facts f ON f.id = ev.fact_id
         WHERE ev.relation_id = ?1
         ORDER BY f.fact_type, f.fact_key",
    )?;
    let rows = stmt.query_map(params![relation_id], |row| {
        Ok(Fact {
            id: row.get(0)?,
            entity_id: row.get(1)?,
            fact_type: row.get(2)?,
            fact_key: row.get(3)?,
            content: row.get(4)?,
            payload: json_column(row.get(5)?),
            content_hash: row.get(6)?,
            updated_at: row.get(7)?,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Evidence rows pointing at a missing relation or fact
pub fn dangling_evidence_count(conn: &Connection) -> Result<usize> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM relation_evidence ev
         WHERE NOT EXISTS (SELECT 1 FROM relations r WHERE r.id = ev.relation_id)
            OR NOT EXISTS (SELECT 1 FROM facts f WHERE f.id = ev.fact_id)",
        [],
        |row| row.get(0),
    )?;
    Ok(n as usize)
}
