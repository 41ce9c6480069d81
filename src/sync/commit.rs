//! Transactional diff/commit of one file's extraction
//!
//! Everything here runs on the caller's ambient transaction, in this order:
//!
//! 1. upsert entities
//! 2. upsert sources, drop the file's sources that were not re-emitted and
//!    tombstone entities left without any source
//! 3. upsert facts, then delete each touched entity's facts that were not
//!    re-asserted
//! 4. upsert relations (self-loops and unresolved endpoints skipped), link
//!    their evidence, drop the file's relations that were not re-asserted
//! 5. one sync event per entity change, the file ledger, the finished run
//!
//! Nothing is written to the [`EntityKeyCache`] here; new keys come back in
//! [`CommitOutcome::new_keys`] and the worker applies them after the
//! transaction commits.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use rusqlite::Connection;

use crate::error::Result;
use crate::model::{EventType, ExtractionResult, FactRef, RelationDraft, RunStatus, SyncStats};
use crate::parsers::EntityLookup;
use crate::store::entities::EntityChange;
use crate::store::{audit, entities, facts, files, relations, sources};

/// In-session `entity key → id` map.
///
/// Loaded lazily from the store, extended after every successful commit and
/// invalidated whenever the sync queue drains.
#[derive(Debug, Default)]
pub struct EntityKeyCache {
    keys: Option<HashMap<String, i64>>,
}

impl EntityKeyCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_loaded(&self) -> bool {
        self.keys.is_some()
    }

    /// Load the full key index if it is not loaded yet
    pub fn ensure_loaded(&mut self, conn: &Connection, workspace_id: i64) -> Result<()> {
        if self.keys.is_none() {
            let keys = entities::key_index(conn, workspace_id)?;
            tracing::debug!("[SYNC] entity key cache warmed with {} keys", keys.len());
            self.keys = Some(keys);
        }
        Ok(())
    }

    pub fn insert(&mut self, key: String, id: i64) {
        if let Some(keys) = self.keys.as_mut() {
            keys.insert(key, id);
        }
    }

    pub fn extend(&mut self, new_keys: impl IntoIterator<Item = (String, i64)>) {
        for (key, id) in new_keys {
            self.insert(key, id);
        }
    }

    pub fn invalidate(&mut self) {
        self.keys = None;
    }

    pub fn len(&self) -> usize {
        self.keys.as_ref().map_or(0, HashMap::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EntityLookup for EntityKeyCache {
    fn lookup(&self, key: &str) -> Option<i64> {
        self.keys.as_ref()?.get(key).copied()
    }
}

/// Identifies the file and run a commit belongs to
#[derive(Debug, Clone, Copy)]
pub struct FileCommit<'a> {
    pub workspace_id: i64,
    pub run_id: i64,
    pub path: &'a str,
    pub content_hash: &'a str,
    /// Hash of the previously committed version, if any
    pub previous_hash: Option<&'a str>,
}

#[derive(Debug, Default)]
pub struct CommitOutcome {
    pub stats: SyncStats,
    /// Per-item problems recorded on the run
    pub errors: Vec<String>,
    /// Entity keys created by this commit
    pub new_keys: Vec<(String, i64)>,
    /// Relation endpoints that did not resolve; retried once they exist
    pub unresolved: BTreeSet<String>,
}

/// Resolution of keys during one commit: this commit's entities first, then
/// the session cache
struct KeyResolver<'a> {
    local: HashMap<String, i64>,
    known: &'a dyn EntityLookup,
}

impl KeyResolver<'_> {
    fn resolve(&self, key: &str) -> Option<i64> {
        self.local
            .get(key)
            .copied()
            .or_else(|| self.known.lookup(key))
    }
}

/// Apply one file's extraction result inside the ambient transaction and
/// finish its run as completed.
///
/// `extraction_errors` are carried into the run's error list.
pub fn commit_extraction(
    conn: &Connection,
    file: FileCommit<'_>,
    result: &ExtractionResult,
    known: &dyn EntityLookup,
    extraction_errors: &[String],
) -> Result<CommitOutcome> {
    let mut outcome = CommitOutcome {
        errors: extraction_errors.to_vec(),
        ..CommitOutcome::default()
    };
    let stats = &mut outcome.stats;
    stats.files_processed = 1;

    let mut resolver = KeyResolver {
        local: HashMap::new(),
        known,
    };
    let mut changes: Vec<(i64, EventType)> = Vec::new();

    // 1. entities; the first draft for a key wins
    for draft in &result.entities {
        if resolver.local.contains_key(&draft.key) {
            continue;
        }
        let (id, change) = entities::upsert(conn, file.workspace_id, draft, Some(file.run_id))?;
        resolver.local.insert(draft.key.clone(), id);
        match change {
            EntityChange::Created => {
                stats.entities_created += 1;
                outcome.new_keys.push((draft.key.clone(), id));
                changes.push((id, EventType::Created));
            }
            EntityChange::Updated => {
                stats.entities_updated += 1;
                changes.push((id, EventType::Updated));
            }
            EntityChange::Restored => {
                stats.entities_restored += 1;
                changes.push((id, EventType::Restored));
            }
            EntityChange::Unchanged => {}
        }
    }
    let emitted: HashSet<i64> = resolver.local.values().copied().collect();

    // 2. sources
    let mut touched: BTreeSet<i64> = BTreeSet::new();
    let mut kept_sources: BTreeSet<i64> = BTreeSet::new();
    for draft in &result.sources {
        if draft.file_path != file.path {
            outcome.errors.push(format!(
                "source for {} points at {} while syncing {}",
                draft.entity_key, draft.file_path, file.path
            ));
            continue;
        }
        let Some(entity_id) = resolver.resolve(&draft.entity_key) else {
            outcome
                .errors
                .push(format!("source for unknown entity {}", draft.entity_key));
            continue;
        };
        let id = sources::upsert(conn, file.workspace_id, entity_id, draft, file.content_hash)?;
        kept_sources.insert(id);
        touched.insert(entity_id);
        stats.sources_upserted += 1;
    }

    stats.sources_deleted = sources::for_path(conn, file.workspace_id, file.path)?
        .iter()
        .filter(|s| !kept_sources.contains(&s.id))
        .count();
    let lost_source =
        sources::delete_for_path_except(conn, file.workspace_id, file.path, &kept_sources)?;
    let candidates: Vec<i64> = lost_source
        .into_iter()
        .filter(|id| !emitted.contains(id))
        .collect();
    for id in entities::unsourced_among(conn, &candidates)? {
        if entities::tombstone(conn, id, Some(file.run_id))? {
            stats.entities_deleted += 1;
            changes.push((id, EventType::Deleted));
        }
    }

    // 3. facts with orphan cleanup per touched entity
    let mut asserted: BTreeMap<i64, BTreeSet<i64>> = BTreeMap::new();
    let mut fact_ids: HashMap<FactRef, i64> = HashMap::new();
    for draft in &result.facts {
        let Some(entity_id) = resolver.resolve(&draft.entity_key) else {
            outcome
                .errors
                .push(format!("fact for unknown entity {}", draft.entity_key));
            continue;
        };
        let (id, changed) = facts::upsert(conn, entity_id, draft)?;
        if changed {
            stats.facts_upserted += 1;
        }
        asserted.entry(entity_id).or_default().insert(id);
        fact_ids.insert(draft.reference(), id);
        touched.insert(entity_id);
    }

    let empty = BTreeSet::new();
    for entity_id in &touched {
        let keep = asserted.get(entity_id).unwrap_or(&empty);
        stats.facts_deleted += facts::delete_except(conn, *entity_id, keep)?;
    }

    // 4. relations and their evidence
    let extracted_facts: Vec<i64> = fact_ids.values().copied().collect();
    let mut kept_relations: BTreeSet<i64> = BTreeSet::new();
    for draft in &result.relations {
        if draft.is_self_loop() {
            stats.relations_skipped += 1;
            continue;
        }
        let (src, dst) = match (resolver.resolve(&draft.src_key), resolver.resolve(&draft.dst_key))
        {
            (Some(src), Some(dst)) => (src, dst),
            (src, dst) => {
                if src.is_none() {
                    outcome.unresolved.insert(draft.src_key.clone());
                }
                if dst.is_none() {
                    outcome.unresolved.insert(draft.dst_key.clone());
                }
                stats.relations_skipped += 1;
                continue;
            }
        };

        let Some(relation_id) =
            relations::upsert(conn, file.workspace_id, src, dst, draft, Some(file.path))?
        else {
            stats.relations_skipped += 1;
            continue;
        };

        // Duplicate drafts for one edge accumulate evidence
        if kept_relations.insert(relation_id) {
            relations::clear_evidence_from(conn, relation_id, &extracted_facts)?;
            stats.relations_upserted += 1;
        }
        for fact_id in evidence_facts(draft, &fact_ids) {
            if relations::link_evidence(conn, relation_id, fact_id)? {
                stats.evidence_linked += 1;
            }
        }
    }
    stats.relations_deleted = relations::delete_for_source_path_except(
        conn,
        file.workspace_id,
        file.path,
        &kept_relations,
    )?;

    // 5. audit trail and ledger
    for (entity_id, event_type) in &changes {
        let new_hash = match event_type {
            EventType::Deleted => None,
            _ => Some(file.content_hash),
        };
        audit::record_event(
            conn,
            file.run_id,
            *entity_id,
            *event_type,
            file.previous_hash,
            new_hash,
        )?;
    }
    files::record(conn, file.workspace_id, file.path, file.content_hash)?;
    audit::finish_run(
        conn,
        file.run_id,
        RunStatus::Completed,
        &outcome.stats,
        &outcome.errors,
    )?;

    Ok(outcome)
}

/// Fact ids justifying a relation: its explicit references, or every fact
/// of this extraction whose entity key starts with the relation's source key
fn evidence_facts(draft: &RelationDraft, fact_ids: &HashMap<FactRef, i64>) -> Vec<i64> {
    let mut ids: Vec<i64> = if draft.evidence.is_empty() {
        fact_ids
            .iter()
            .filter(|(fact, _)| fact.entity_key.starts_with(&draft.src_key))
            .map(|(_, id)| *id)
            .collect()
    } else {
        draft
            .evidence
            .iter()
            .filter_map(|fact| fact_ids.get(fact).copied())
            .collect()
    };
    ids.sort_unstable();
    ids.dedup();
    ids
}
