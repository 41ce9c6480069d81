//! Query & analysis engine
//!
//! Read-side operations over the graph store. Lookups attach read-through
//! freshness to every source they return; traversals batch one query per BFS
//! layer.
//!
//! # Modules
//!
//! - `traversal` - relation walk, impact analysis, dependency graph, trace chain
//! - `coverage` - spec → implementation → test coverage
//! - `integrity` - inconsistency report, orphans, integrity counts, purge

pub mod coverage;
pub mod integrity;
pub mod traversal;

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;

use crate::config::{EngineConfig, SearchConfig};
use crate::error::{KgError, Result};
use crate::model::{Entity, Fact, Relation, Source};
use crate::store::relations::Direction;
use crate::store::{entities, facts, relations, sources, GraphStore};
use crate::sync::{Freshness, ReadThroughValidator};

pub use coverage::{CoverageGap, CoverageMap, GapType, Implementation};
pub use integrity::{InconsistencyReport, IntegrityReport, PurgeReport};
pub use traversal::{DependencyDirection, ImpactReport, ImpactedEntity, Subgraph, TraceResult, WalkOptions};

/// Compact entity shape used in query results
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeView {
    pub id: i64,
    pub key: String,
    pub entity_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub is_deleted: bool,
}

impl From<&Entity> for NodeView {
    fn from(e: &Entity) -> Self {
        Self {
            id: e.id,
            key: e.key.clone(),
            entity_type: e.entity_type.clone(),
            summary: e.summary.clone(),
            is_deleted: e.is_deleted,
        }
    }
}

/// A relation with its endpoints resolved to keys
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EdgeView {
    pub id: i64,
    pub src: String,
    pub dst: String,
    pub relation_type: String,
    pub strength: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_path: Option<String>,
}

impl EdgeView {
    pub fn new(rel: &Relation, src: &str, dst: &str) -> Self {
        Self {
            id: rel.id,
            src: src.to_string(),
            dst: dst.to_string(),
            relation_type: rel.relation_type.clone(),
            strength: rel.strength_type.clone(),
            source_path: rel.source_path.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceView {
    #[serde(flatten)]
    pub source: Source,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub freshness: Option<Freshness>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EntityDescription {
    pub entity: Entity,
    pub sources: Vec<SourceView>,
    pub fact_count: usize,
    pub outgoing_relations: usize,
    pub incoming_relations: usize,
    /// Any source changed or vanished on disk since it was extracted
    pub stale: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct BulkDescription {
    pub entities: Vec<EntityDescription>,
    pub missing: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BulkFacts {
    pub facts: BTreeMap<String, Vec<Fact>>,
    pub missing: Vec<String>,
}

/// What to fetch evidence for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvidenceTarget {
    Relation(i64),
    /// Every outgoing relation of an entity
    Entity(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct RelationEvidence {
    pub relation: EdgeView,
    pub facts: Vec<Fact>,
}

/// Read-side entry point bound to one workspace
#[derive(Clone)]
pub struct GraphQuery {
    store: GraphStore,
    workspace_id: i64,
    root: PathBuf,
    search: SearchConfig,
    retention_days: u32,
    validator: Option<Arc<ReadThroughValidator>>,
}

impl GraphQuery {
    pub fn new(store: GraphStore, workspace_id: i64, root: PathBuf, config: &EngineConfig) -> Self {
        Self {
            store,
            workspace_id,
            root,
            search: config.search.clone(),
            retention_days: config.audit.retention_days,
            validator: None,
        }
    }

    /// Attach freshness checks to every returned source
    pub fn with_validator(mut self, validator: Arc<ReadThroughValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn store(&self) -> &GraphStore {
        &self.store
    }

    pub fn workspace_id(&self) -> i64 {
        self.workspace_id
    }

    pub fn search_config(&self) -> &SearchConfig {
        &self.search
    }

    /// Look up an entity by key, tombstoned included
    pub fn entity(&self, key: &str) -> Result<Entity> {
        self.store
            .with_conn(|conn| entities::find_by_key(conn, self.workspace_id, key))?
            .ok_or_else(|| KgError::EntityNotFound {
                key: key.to_string(),
            })
    }

    fn live_entity(&self, key: &str, include_deleted: bool) -> Result<Entity> {
        let entity = self.entity(key)?;
        if entity.is_deleted && !include_deleted {
            return Err(KgError::EntityNotFound {
                key: key.to_string(),
            });
        }
        Ok(entity)
    }

    pub fn search(
        &self,
        query: &str,
        entity_type: Option<&str>,
        limit: Option<usize>,
        include_deleted: bool,
    ) -> Result<Vec<NodeView>> {
        let limit = self.search.limit(limit);
        let found = self.store.with_conn(|conn| {
            entities::search(conn, self.workspace_id, query, entity_type, include_deleted, limit)
        })?;
        Ok(found.iter().map(NodeView::from).collect())
    }

    pub fn describe(&self, key: &str) -> Result<EntityDescription> {
        let mut all = self.describe_many(&[key.to_string()])?;
        all.entities.pop().ok_or_else(|| KgError::EntityNotFound {
            key: key.to_string(),
        })
    }

    pub fn bulk_describe(&self, keys: &[String]) -> Result<BulkDescription> {
        self.describe_many(keys)
    }

    fn describe_many(&self, keys: &[String]) -> Result<BulkDescription> {
        let (found, counts, all_sources) = self.store.with_conn(|conn| {
            let found = entities::find_by_keys(conn, self.workspace_id, keys)?;
            let ids: Vec<i64> = found.iter().map(|e| e.id).collect();
            let fact_counts = facts::counts_for_entities(conn, &ids)?;
            let edge_counts = relations::counts_for_entities(conn, &ids)?;
            let counts: HashMap<i64, (usize, usize, usize)> = ids
                .iter()
                .map(|id| {
                    let facts = fact_counts.get(id).copied().unwrap_or_default();
                    let (out, inc) = edge_counts.get(id).copied().unwrap_or_default();
                    (*id, (facts, out, inc))
                })
                .collect();
            let srcs = sources::for_entities(conn, &ids)?;
            Ok((found, counts, srcs))
        })?;

        let freshness = self.check_freshness(&all_sources);
        let mut by_entity: HashMap<i64, Vec<SourceView>> = HashMap::new();
        for source in all_sources {
            let fresh = freshness.as_ref().and_then(|f| {
                f.get(&(source.file_path.clone(), source.content_hash.clone()))
                    .cloned()
            });
            by_entity.entry(source.entity_id).or_default().push(SourceView {
                source,
                freshness: fresh,
            });
        }

        let by_key: HashMap<&str, &Entity> = found.iter().map(|e| (e.key.as_str(), e)).collect();
        let mut described = Vec::with_capacity(found.len());
        let mut missing = Vec::new();
        for key in keys {
            let Some(entity) = by_key.get(key.as_str()) else {
                missing.push(key.clone());
                continue;
            };
            let sources = by_entity.remove(&entity.id).unwrap_or_default();
            let (fact_count, outgoing_relations, incoming_relations) =
                counts.get(&entity.id).copied().unwrap_or_default();
            let stale = sources
                .iter()
                .any(|s| s.freshness.as_ref().is_some_and(|f| f.stale));
            described.push(EntityDescription {
                entity: (*entity).clone(),
                sources,
                fact_count,
                outgoing_relations,
                incoming_relations,
                stale,
            });
        }
        Ok(BulkDescription {
            entities: described,
            missing,
        })
    }

    /// One check per distinct file, whatever number of entities share it
    fn check_freshness(&self, srcs: &[Source]) -> Option<HashMap<(String, String), Freshness>> {
        let validator = self.validator.as_ref()?;
        Some(validator.validate_batch(
            srcs.iter()
                .map(|s| (s.file_path.as_str(), s.content_hash.as_str())),
        ))
    }

    pub fn facts(&self, key: &str, fact_type: Option<&str>) -> Result<Vec<Fact>> {
        let entity = self.entity(key)?;
        self.store
            .with_conn(|conn| facts::for_entity(conn, entity.id, fact_type))
    }

    pub fn bulk_facts(&self, keys: &[String]) -> Result<BulkFacts> {
        self.store.with_conn(|conn| {
            let found = entities::find_by_keys(conn, self.workspace_id, keys)?;
            let ids: Vec<i64> = found.iter().map(|e| e.id).collect();
            let key_of: HashMap<i64, &str> = found.iter().map(|e| (e.id, e.key.as_str())).collect();

            let mut grouped: BTreeMap<String, Vec<Fact>> = found
                .iter()
                .map(|e| (e.key.clone(), Vec::new()))
                .collect();
            for fact in facts::for_entities(conn, &ids)? {
                if let Some(key) = key_of.get(&fact.entity_id) {
                    grouped.entry(key.to_string()).or_default().push(fact);
                }
            }
            let missing = keys
                .iter()
                .filter(|k| !grouped.contains_key(k.as_str()))
                .cloned()
                .collect();
            Ok(BulkFacts {
                facts: grouped,
                missing,
            })
        })
    }

    pub fn evidence(&self, target: &EvidenceTarget) -> Result<Vec<RelationEvidence>> {
        self.store.with_conn(|conn| {
            let rels = match target {
                EvidenceTarget::Relation(id) => {
                    let rel = relations::get(conn, *id)?.ok_or_else(|| KgError::EntityNotFound {
                        key: format!("relation #{}", id),
                    })?;
                    vec![rel]
                }
                EvidenceTarget::Entity(key) => {
                    let entity = entities::find_by_key(conn, self.workspace_id, key)?.ok_or_else(
                        || KgError::EntityNotFound { key: key.clone() },
                    )?;
                    relations::for_entity(conn, entity.id, Direction::Outgoing, None, true)?
                }
            };

            let mut ids: Vec<i64> = rels
                .iter()
                .flat_map(|r| [r.src_entity_id, r.dst_entity_id])
                .collect();
            ids.sort_unstable();
            ids.dedup();
            let keys: HashMap<i64, String> = entities::find_by_ids(conn, &ids)?
                .into_iter()
                .map(|e| (e.id, e.key))
                .collect();

            let mut out = Vec::with_capacity(rels.len());
            for rel in &rels {
                let (Some(src), Some(dst)) = (keys.get(&rel.src_entity_id), keys.get(&rel.dst_entity_id))
                else {
                    continue;
                };
                out.push(RelationEvidence {
                    relation: EdgeView::new(rel, src, dst),
                    facts: relations::evidence_for(conn, rel.id)?,
                });
            }
            Ok(out)
        })
    }

    /// Multi-hop walk from `key`
    pub fn relations(
        &self,
        key: &str,
        direction: Direction,
        relation_type: Option<&str>,
        depth: Option<usize>,
        include_deleted: bool,
    ) -> Result<Subgraph> {
        let root = self.live_entity(key, include_deleted)?;
        let depth = self.search.depth(depth);
        self.store.with_conn(|conn| {
            traversal::walk(
                conn,
                &root,
                WalkOptions {
                    direction,
                    depth,
                    relation_type,
                    include_deleted,
                },
            )
        })
    }

    pub fn impact_analysis(
        &self,
        key: &str,
        depth: Option<usize>,
        include_deleted: bool,
    ) -> Result<ImpactReport> {
        let root = self.live_entity(key, include_deleted)?;
        let depth = self.search.depth(depth);
        self.store
            .with_conn(|conn| traversal::impact_analysis(conn, &root, depth, include_deleted))
    }

    pub fn dependency_graph(
        &self,
        key: &str,
        direction: DependencyDirection,
        depth: Option<usize>,
        include_deleted: bool,
    ) -> Result<Subgraph> {
        let root = self.live_entity(key, include_deleted)?;
        let depth = self.search.depth(depth);
        self.store.with_conn(|conn| {
            traversal::dependency_graph(conn, &root, direction, depth, include_deleted)
        })
    }

    pub fn trace_chain(
        &self,
        from: &str,
        to: &str,
        max_depth: Option<usize>,
        include_deleted: bool,
    ) -> Result<TraceResult> {
        let from = self.live_entity(from, include_deleted)?;
        let to = self.live_entity(to, include_deleted)?;
        let depth = self
            .search
            .depth(Some(max_depth.unwrap_or(self.search.max_depth)));
        self.store
            .with_conn(|conn| traversal::trace_chain(conn, &from, &to, depth, include_deleted))
    }

    pub fn coverage_map(&self, spec_key: &str) -> Result<CoverageMap> {
        let spec = self.live_entity(spec_key, false)?;
        self.store
            .with_conn(|conn| coverage::coverage_map(conn, &spec, false))
    }

    pub fn inconsistency_report(&self, limit: Option<usize>) -> Result<InconsistencyReport> {
        let limit = self.search.limit(limit);
        self.store
            .with_conn(|conn| integrity::inconsistency_report(conn, self.workspace_id, limit))
    }

    pub fn find_orphans(&self, entity_type: Option<&str>, limit: Option<usize>) -> Result<Vec<NodeView>> {
        let limit = self.search.limit(limit);
        self.store
            .with_conn(|conn| integrity::find_orphans(conn, self.workspace_id, entity_type, limit))
    }

    pub fn verify_integrity(&self) -> Result<IntegrityReport> {
        self.store
            .with_conn(|conn| integrity::verify_integrity(conn, self.workspace_id, &self.root))
    }

    pub fn purge_tombstones(&self, retention_days: Option<u32>) -> Result<PurgeReport> {
        let days = retention_days.unwrap_or(self.retention_days);
        self.store
            .transaction(|tx| integrity::purge_tombstones(tx, self.workspace_id, days))
    }
}
