//! Graph schema, created idempotently on open

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{KgError, Result};

pub const SCHEMA_VERSION: &str = "2";

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS schema_info (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS workspaces (
        id INTEGER PRIMARY KEY,
        host TEXT NOT NULL,
        root_path TEXT NOT NULL,
        created_at TEXT NOT NULL,
        UNIQUE (host, root_path)
    );

    -- Sync audit trail
    CREATE TABLE IF NOT EXISTS sync_runs (
        id INTEGER PRIMARY KEY,
        workspace_id INTEGER NOT NULL REFERENCES workspaces(id) ON DELETE CASCADE,
        trigger TEXT NOT NULL,
        status TEXT NOT NULL,
        started_at TEXT NOT NULL,
        finished_at TEXT,
        stats TEXT,
        errors TEXT
    );

    CREATE TABLE IF NOT EXISTS entities (
        id INTEGER PRIMARY KEY,
        workspace_id INTEGER NOT NULL REFERENCES workspaces(id) ON DELETE CASCADE,
        entity_key TEXT NOT NULL,
        entity_type TEXT NOT NULL,
        summary TEXT,
        metadata TEXT,
        is_deleted INTEGER NOT NULL DEFAULT 0,
        deleted_at TEXT,
        last_sync_run_id INTEGER REFERENCES sync_runs(id) ON DELETE SET NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        UNIQUE (workspace_id, entity_key)
    );

    -- span_start/span_end are -1 for whole-file sources
    CREATE TABLE IF NOT EXISTS sources (
        id INTEGER PRIMARY KEY,
        workspace_id INTEGER NOT NULL REFERENCES workspaces(id) ON DELETE CASCADE,
        entity_id INTEGER NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
        kind TEXT NOT NULL,
        file_path TEXT NOT NULL,
        span_start INTEGER NOT NULL DEFAULT -1,
        span_end INTEGER NOT NULL DEFAULT -1,
        content_hash TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        UNIQUE (workspace_id, kind, file_path, span_start, span_end)
    );

    -- Last content hash processed per file, whether or not it produced entities
    CREATE TABLE IF NOT EXISTS files (
        workspace_id INTEGER NOT NULL REFERENCES workspaces(id) ON DELETE CASCADE,
        path TEXT NOT NULL,
        content_hash TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (workspace_id, path)
    );

    CREATE TABLE IF NOT EXISTS facts (
        id INTEGER PRIMARY KEY,
        entity_id INTEGER NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
        fact_type TEXT NOT NULL,
        fact_key TEXT NOT NULL,
        content TEXT,
        payload TEXT,
        content_hash TEXT,
        updated_at TEXT NOT NULL,
        UNIQUE (entity_id, fact_type, fact_key)
    );

    CREATE TABLE IF NOT EXISTS relations (
        id INTEGER PRIMARY KEY,
        workspace_id INTEGER NOT NULL REFERENCES workspaces(id) ON DELETE CASCADE,
        src_entity_id INTEGER NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
        dst_entity_id INTEGER NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
        relation_type TEXT NOT NULL,
        strength_type TEXT NOT NULL,
        metadata TEXT,
        source_path TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        UNIQUE (src_entity_id, dst_entity_id, relation_type, strength_type),
        CHECK (src_entity_id != dst_entity_id)
    );

    -- Every file currently asserting a relation; the edge goes when none is left
    CREATE TABLE IF NOT EXISTS relation_assertions (
        relation_id INTEGER NOT NULL REFERENCES relations(id) ON DELETE CASCADE,
        workspace_id INTEGER NOT NULL,
        path TEXT NOT NULL,
        PRIMARY KEY (relation_id, path)
    );

    CREATE TABLE IF NOT EXISTS relation_evidence (
        relation_id INTEGER NOT NULL REFERENCES relations(id) ON DELETE CASCADE,
        fact_id INTEGER NOT NULL REFERENCES facts(id) ON DELETE CASCADE,
        PRIMARY KEY (relation_id, fact_id)
    );

    CREATE TABLE IF NOT EXISTS sync_events (
        id INTEGER PRIMARY KEY,
        sync_run_id INTEGER NOT NULL REFERENCES sync_runs(id) ON DELETE CASCADE,
        entity_id INTEGER NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
        event_type TEXT NOT NULL,
        previous_hash TEXT,
        new_hash TEXT,
        created_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_entities_type ON entities(workspace_id, entity_type);
    CREATE INDEX IF NOT EXISTS idx_entities_deleted ON entities(is_deleted, deleted_at);
    CREATE INDEX IF NOT EXISTS idx_sources_path ON sources(workspace_id, file_path);
    CREATE INDEX IF NOT EXISTS idx_sources_entity ON sources(entity_id);
    CREATE INDEX IF NOT EXISTS idx_relations_src ON relations(src_entity_id);
    CREATE INDEX IF NOT EXISTS idx_relations_dst ON relations(dst_entity_id);
    CREATE INDEX IF NOT EXISTS idx_relations_source_path ON relations(workspace_id, source_path);
    CREATE INDEX IF NOT EXISTS idx_assertions_path ON relation_assertions(workspace_id, path);
    CREATE INDEX IF NOT EXISTS idx_evidence_fact ON relation_evidence(fact_id);
    CREATE INDEX IF NOT EXISTS idx_events_run ON sync_events(sync_run_id);
    CREATE INDEX IF NOT EXISTS idx_events_entity ON sync_events(entity_id);
    CREATE INDEX IF NOT EXISTS idx_events_created ON sync_events(created_at);
"#;

/// Create missing tables and record the schema version.
///
/// Refuses to run against a database written by a newer schema.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA)?;

    let existing: Option<String> = conn
        .query_row(
            "SELECT value FROM schema_info WHERE key = 'version'",
            [],
            |row| row.get(0),
        )
        .optional()?;

    match existing {
        None => {
            conn.execute(
                "INSERT INTO schema_info (key, value) VALUES ('version', ?1), ('generator', 'kgraph-engine')",
                params![SCHEMA_VERSION],
            )?;
        }
        Some(version) if version == SCHEMA_VERSION => {}
        Some(version) => {
            return Err(KgError::config(format!(
                "graph database schema version {} is not supported (expected {})",
                version, SCHEMA_VERSION
            )));
        }
    }
    Ok(())
}
