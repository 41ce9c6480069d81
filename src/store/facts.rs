//! Fact repository

use std::collections::{BTreeSet, HashMap};

use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};

use super::{json_column, json_text, placeholders, MAX_BATCH_PARAMS};
use crate::error::Result;
use crate::model::{now_timestamp, Fact, FactDraft};

const COLUMNS: &str =
    "id, entity_id, fact_type, fact_key, content, payload, content_hash, updated_at";

fn from_row(row: &Row<'_>) -> rusqlite::Result<Fact> {
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
}

/// Insert or update a fact by `(entity, type, key)`.
///
/// Returns the fact id and whether its content hash changed. An unchanged
/// fact is not rewritten.
pub fn upsert(conn: &Connection, entity_id: i64, draft: &FactDraft) -> Result<(i64, bool)> {
    let hash = draft.content_hash();

    let existing: Option<(i64, Option<String>)> = conn
        .query_row(
            "SELECT id, content_hash FROM facts
             WHERE entity_id = ?1 AND fact_type = ?2 AND fact_key = ?3",
            params![entity_id, draft.fact_type, draft.fact_key],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    if let Some((id, stored)) = &existing {
        if stored.as_deref() == Some(hash.as_str()) {
            return Ok((*id, false));
        }
    }

    let id = conn.query_row(
        "INSERT INTO facts (entity_id, fact_type, fact_key, content, payload, content_hash, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT (entity_id, fact_type, fact_key) DO UPDATE
         SET content = excluded.content,
             payload = excluded.payload,
             content_hash = excluded.content_hash,
             updated_at = excluded.updated_at
         RETURNING id",
        params![
            entity_id,
            draft.fact_type,
            draft.fact_key,
            draft.content,
            json_text(&draft.payload),
            hash,
            now_timestamp()
        ],
        |row| row.get(0),
    )?;
    Ok((id, true))
}

/// Delete an entity's facts whose ids are not in `keep`
pub fn delete_except(conn: &Connection, entity_id: i64, keep: &BTreeSet<i64>) -> Result<usize> {
    let mut stmt = conn.prepare_cached("SELECT id FROM facts WHERE entity_id = ?1")?;
    let ids: Vec<i64> = stmt
        .query_map(params![entity_id], |row| row.get(0))?
        .collect::<rusqlite::Result<_>>()?;

    let mut delete = conn.prepare_cached("DELETE FROM facts WHERE id = ?1")?;
    let mut removed = 0;
    for id in ids.into_iter().filter(|id| !keep.contains(id)) {
        removed += delete.execute(params![id])?;
    }
    Ok(removed)
}

pub fn for_entity(
    conn: &Connection,
    entity_id: i64,
    fact_type: Option<&str>,
) -> Result<Vec<Fact>> {
    let sql = format!(
        "SELECT {} FROM facts WHERE entity_id = ?1 AND (?2 IS NULL OR fact_type = ?2)
         ORDER BY fact_type, fact_key",
        COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![entity_id, fact_type], from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn for_entities(conn: &Connection, entity_ids: &[i64]) -> Result<Vec<Fact>> {
    let mut out = Vec::new();
    for chunk in entity_ids.chunks(MAX_BATCH_PARAMS) {
        let sql = format!(
            "SELECT {} FROM facts WHERE entity_id IN ({}) ORDER BY entity_id, fact_type, fact_key",
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

/// Fact counts for a batch of entities; entities with none are absent
pub fn counts_for_entities(conn: &Connection, entity_ids: &[i64]) -> Result<HashMap<i64, usize>> {
    let mut counts = HashMap::new();
    for chunk in entity_ids.chunks(MAX_BATCH_PARAMS) {
        let sql = format!(
            "SELECT entity_id, COUNT(*) FROM facts WHERE entity_id IN ({}) GROUP BY entity_id",
            placeholders(chunk.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(chunk.iter()), |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (id, n) = row?;
            counts.insert(id, n as usize);
        }
    }
    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EntityDraft;
    use crate::store::{entities, GraphStore};

    #[test]
    fn test_upsert_skips_unchanged_and_cleans_orphans() {
        let store = GraphStore::in_memory().unwrap();
        let ws = store.ensure_workspace("h", "/r").unwrap();

        store
            .with_conn(|conn| {
                let (e, _) =
                    entities::upsert(conn, ws.id, &EntityDraft::new("module:a.rs", "module"), None)?;
                let a = FactDraft::new("module:a.rs", "doc", "a").with_content("one");
                let b = FactDraft::new("module:a.rs", "doc", "b").with_content("two");
                let c = FactDraft::new("module:a.rs", "doc", "c").with_content("three");

                let (a_id, changed) = upsert(conn, e, &a)?;
                assert!(changed);
                let (b_id, _) = upsert(conn, e, &b)?;
                upsert(conn, e, &c)?;

                assert_eq!(upsert(conn, e, &a)?, (a_id, false));
                let (_, changed) = upsert(conn, e, &a.clone().with_content("uno"))?;
                assert!(changed);

                let removed = delete_except(conn, e, &BTreeSet::from([a_id, b_id]))?;
                assert_eq!(removed, 1);
                let keys: Vec<String> = for_entity(conn, e, None)?
                    .into_iter()
                    .map(|f| f.fact_key)
                    .collect();
                assert_eq!(keys, vec!["a", "b"]);

                let counts = counts_for_entities(conn, &[e, e + 100])?;
                assert_eq!(counts.get(&e), Some(&2));
                assert!(!counts.contains_key(&(e + 100)));
                Ok(())
            })
            .unwrap();
    }
}
