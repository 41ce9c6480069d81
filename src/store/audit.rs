//! Sync audit trail: runs and per-entity events

use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::Result;
use crate::model::{now_timestamp, EventType, RunStatus, SyncEvent, SyncRun, SyncStats, Trigger};

const RUN_COLUMNS: &str =
    "id, workspace_id, trigger, status, started_at, finished_at, stats, errors";

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<SyncRun> {
    let trigger: String = row.get(2)?;
    let status: String = row.get(3)?;
    let stats: Option<String> = row.get(6)?;
    let errors: Option<String> = row.get(7)?;
    Ok(SyncRun {
        id: row.get(0)?,
        workspace_id: row.get(1)?,
        trigger: trigger.parse().unwrap_or(Trigger::Manual),
        status: RunStatus::parse(&status),
        started_at: row.get(4)?,
        finished_at: row.get(5)?,
        stats: stats
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default(),
        errors: errors
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default(),
    })
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<SyncEvent> {
    let event_type: String = row.get(3)?;
    Ok(SyncEvent {
        id: row.get(0)?,
        sync_run_id: row.get(1)?,
        entity_id: row.get(2)?,
        event_type: EventType::parse(&event_type).unwrap_or(EventType::Updated),
        previous_hash: row.get(4)?,
        new_hash: row.get(5)?,
        created_at: row.get(6)?,
    })
}

/// Open a run in `running` status
pub fn begin_run(conn: &Connection, workspace_id: i64, trigger: Trigger) -> Result<i64> {
    conn.execute(
        "INSERT INTO sync_runs (workspace_id, trigger, status, started_at) VALUES (?1, ?2, ?3, ?4)",
        params![
            workspace_id,
            trigger.as_str(),
            RunStatus::Running.as_str(),
            now_timestamp()
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Close a run with its final status, stats and per-item errors
pub fn finish_run(
    conn: &Connection,
    run_id: i64,
    status: RunStatus,
    stats: &SyncStats,
    errors: &[String],
) -> Result<()> {
    conn.execute(
        "UPDATE sync_runs SET status = ?2, finished_at = ?3, stats = ?4, errors = ?5 WHERE id = ?1",
        params![
            run_id,
            status.as_str(),
            now_timestamp(),
            serde_json::to_string(stats)?,
            serde_json::to_string(errors)?
        ],
    )?;
    Ok(())
}

pub fn record_event(
    conn: &Connection,
    run_id: i64,
    entity_id: i64,
    event_type: EventType,
    previous_hash: Option<&str>,
    new_hash: Option<&str>,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO sync_events (sync_run_id, entity_id, event_type, previous_hash, new_hash, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            run_id,
            entity_id,
            event_type.as_str(),
            previous_hash,
            new_hash,
            now_timestamp()
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn get_run(conn: &Connection, run_id: i64) -> Result<Option<SyncRun>> {
    let sql = format!("SELECT {} FROM sync_runs WHERE id = ?1", RUN_COLUMNS);
    Ok(conn.query_row(&sql, params![run_id], run_from_row).optional()?)
}

/// Newest first
pub fn recent_runs(conn: &Connection, workspace_id: i64, limit: usize) -> Result<Vec<SyncRun>> {
    let sql = format!(
        "SELECT {} FROM sync_runs WHERE workspace_id = ?1 ORDER BY id DESC LIMIT ?2",
        RUN_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![workspace_id, limit as i64], run_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn events_for_run(conn: &Connection, run_id: i64) -> Result<Vec<SyncEvent>> {
    let mut stmt = conn.prepare(
        "SELECT id, sync_run_id, entity_id, event_type, previous_hash, new_hash, created_at
         FROM sync_events WHERE sync_run_id = ?1 ORDER BY id",
    )?;
    let rows = stmt.query_map(params![run_id], event_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn events_for_entity(conn: &Connection, entity_id: i64) -> Result<Vec<SyncEvent>> {
    let mut stmt = conn.prepare(
        "SELECT id, sync_run_id, entity_id, event_type, previous_hash, new_hash, created_at
         FROM sync_events WHERE entity_id = ?1 ORDER BY id",
    )?;
    let rows = stmt.query_map(params![entity_id], event_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Delete events created before `cutoff` and finished runs older than it.
/// Returns `(events, runs)` removed.
pub fn purge_before(conn: &Connection, workspace_id: i64, cutoff: &str) -> Result<(usize, usize)> {
    let events = conn.execute(
        "DELETE FROM sync_events
         WHERE created_at < ?2
           AND sync_run_id IN (SELECT id FROM sync_runs WHERE workspace_id = ?1)",
        params![workspace_id, cutoff],
    )?;
    let runs = conn.execute(
        "DELETE FROM sync_runs
         WHERE workspace_id = ?1 AND status != 'running' AND finished_at IS NOT NULL
           AND finished_at < ?2",
        params![workspace_id, cutoff],
    )?;
    Ok((events, runs))
}
