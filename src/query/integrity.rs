//! Structural and semantic consistency checks, tombstone retention

use std::path::Path;

use chrono::{Duration, SecondsFormat, Utc};
use rusqlite::Connection;
use serde::Serialize;

use super::{EdgeView, NodeView};
use crate::error::{KgError, Result};
use crate::fs_utils::absolute_path;
use crate::model::{entity_types, Relation};
use crate::store::{audit, entities, relations, sources};

/// Entity types that exist as relation targets without a file of their own
const STUB_TYPES: &[&str] = &[entity_types::PACKAGE];

/// Entity types expected to be covered by tests
const CODE_TYPES: &[&str] = &[entity_types::MODULE, entity_types::SYMBOL];

#[derive(Debug, Clone, Default, Serialize)]
pub struct InconsistencyReport {
    /// Relations with a tombstoned endpoint
    pub tombstoned_endpoints: Vec<EdgeView>,
    pub missing_evidence: Vec<EdgeView>,
    pub unimplemented_specs: Vec<NodeView>,
    /// Modules and symbols nothing tests
    pub untested_code: Vec<NodeView>,
    pub total: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IntegrityReport {
    pub live_entities: usize,
    pub tombstoned_entities: usize,
    pub sources: usize,
    pub missing_source_files: Vec<String>,
    pub entities_without_sources: usize,
    pub relations: usize,
    pub relations_with_tombstoned_endpoint: usize,
    pub relations_without_evidence: usize,
    pub dangling_evidence: usize,
    pub ok: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PurgeReport {
    pub retention_days: u32,
    pub cutoff: String,
    pub entities_purged: usize,
    pub events_purged: usize,
    pub runs_purged: usize,
}

fn edge_views(conn: &Connection, rels: &[Relation]) -> Result<Vec<EdgeView>> {
    let mut ids: Vec<i64> = rels
        .iter()
        .flat_map(|r| [r.src_entity_id, r.dst_entity_id])
        .collect();
    ids.sort_unstable();
    ids.dedup();
    let keys: std::collections::HashMap<i64, String> = entities::find_by_ids(conn, &ids)?
        .into_iter()
        .map(|e| (e.id, e.key))
        .collect();
    Ok(rels
        .iter()
        .filter_map(|r| {
            let src = keys.get(&r.src_entity_id)?;
            let dst = keys.get(&r.dst_entity_id)?;
            Some(EdgeView::new(r, src, dst))
        })
        .collect())
}

/// Structural checks (dead endpoints, unevidenced relations) plus semantic
/// ones (specs nothing implements, code nothing tests). Each list is
/// capped at `limit`.
pub fn inconsistency_report(
    conn: &Connection,
    workspace_id: i64,
    limit: usize,
) -> Result<InconsistencyReport> {
    let tombstoned = relations::with_tombstoned_endpoint(conn, workspace_id, limit)?;
    let unevidenced = relations::without_evidence(conn, workspace_id, limit)?;

    let mut report = InconsistencyReport {
        tombstoned_endpoints: edge_views(conn, &tombstoned)?,
        missing_evidence: edge_views(conn, &unevidenced)?,
        unimplemented_specs: entities::unimplemented_specs(
            conn,
            workspace_id,
            &[entity_types::SPEC],
            limit,
        )?
        .iter()
        .map(NodeView::from)
        .collect(),
        untested_code: entities::untested(conn, workspace_id, CODE_TYPES, limit)?
            .iter()
            .map(NodeView::from)
            .collect(),
        total: 0,
    };
    report.total = report.tombstoned_endpoints.len()
        + report.missing_evidence.len()
        + report.unimplemented_specs.len()
        + report.untested_code.len();
    Ok(report)
}

/// Live entities with no relation in either direction
pub fn find_orphans(
    conn: &Connection,
    workspace_id: i64,
    entity_type: Option<&str>,
    limit: usize,
) -> Result<Vec<NodeView>> {
    Ok(entities::orphans(conn, workspace_id, entity_type, limit)?
        .iter()
        .map(NodeView::from)
        .collect())
}

/// Whole-graph health counts. Source files are checked against `root`.
pub fn verify_integrity(conn: &Connection, workspace_id: i64, root: &Path) -> Result<IntegrityReport> {
    let (live_entities, tombstoned_entities) = entities::counts(conn, workspace_id)?;
    let (relations_with_tombstoned_endpoint, relations_without_evidence) =
        relations::defect_counts(conn, workspace_id)?;

    let mut missing_source_files: Vec<String> =
        sources::missing_on_disk(conn, workspace_id, |path| absolute_path(root, path).exists())?
            .into_iter()
            .map(|s| s.file_path)
            .collect();
    missing_source_files.sort();
    missing_source_files.dedup();

    let mut report = IntegrityReport {
        live_entities,
        tombstoned_entities,
        sources: sources::count(conn, workspace_id)?,
        missing_source_files,
        entities_without_sources: entities::count_without_sources(conn, workspace_id, STUB_TYPES)?,
        relations: relations::count(conn, workspace_id)?,
        relations_with_tombstoned_endpoint,
        relations_without_evidence,
        dangling_evidence: relations::dangling_evidence_count(conn)?,
        ok: false,
    };
    report.ok = report.missing_source_files.is_empty()
        && report.entities_without_sources == 0
        && report.relations_with_tombstoned_endpoint == 0
        && report.dangling_evidence == 0;
    Ok(report)
}

/// Hard-delete tombstones and audit events older than the retention window
pub fn purge_tombstones(conn: &Connection, workspace_id: i64, retention_days: u32) -> Result<PurgeReport> {
    let cutoff = Utc::now()
        .checked_sub_signed(Duration::days(i64::from(retention_days)))
        .ok_or_else(|| KgError::invalid(format!("retention of {} days is out of range", retention_days)))?
        .to_rfc3339_opts(SecondsFormat::Millis, true);

    let entities_purged = entities::purge_tombstoned(conn, workspace_id, &cutoff)?;
    let (events_purged, runs_purged) = audit::purge_before(conn, workspace_id, &cutoff)?;
    tracing::info!(
        "[STORE] Purged {} tombstones, {} events, {} runs older than {}",
        entities_purged,
        events_purged,
        runs_purged,
        cutoff
    );
    Ok(PurgeReport {
        retention_days,
        cutoff,
        entities_purged,
        events_purged,
        runs_purged,
    })
}
