//! Spec → implementation → test coverage

use std::collections::{BTreeMap, HashMap, HashSet};

use rusqlite::Connection;
use serde::Serialize;

use super::NodeView;
use crate::error::Result;
use crate::model::{entity_types, relation_types, Entity};
use crate::store::entities;
use crate::store::relations::{self, Direction};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GapType {
    NoImplementation,
    NoTests,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoverageGap {
    pub gap_type: GapType,
    pub entity_key: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Implementation {
    #[serde(flatten)]
    pub node: NodeView,
    /// Spec keys this entity implements (the spec document or one of its sections)
    pub implements: Vec<String>,
    pub tests: Vec<NodeView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CoverageMap {
    pub spec: NodeView,
    /// The spec document plus the sections it contains
    pub targets: Vec<String>,
    pub implementations: Vec<Implementation>,
    pub gaps: Vec<CoverageGap>,
    /// Share of implementations with at least one test
    pub tested_ratio: f64,
}

/// Implementations of `spec` (and of its sections) and the tests that cover
/// them. Three batched queries regardless of spec size.
pub fn coverage_map(conn: &Connection, spec: &Entity, include_deleted: bool) -> Result<CoverageMap> {
    let mut targets: Vec<i64> = vec![spec.id];
    if spec.entity_type == entity_types::SPEC {
        let sections = relations::for_frontier(conn, &[spec.id], Direction::Outgoing, include_deleted)?;
        targets.extend(
            sections
                .iter()
                .filter(|r| r.relation_type == relation_types::CONTAINS)
                .map(|r| r.dst_entity_id),
        );
    }

    let implements: Vec<_> = relations::for_frontier(conn, &targets, Direction::Incoming, include_deleted)?
        .into_iter()
        .filter(|r| r.relation_type == relation_types::IMPLEMENTS)
        .collect();

    // implementation id -> implemented target ids, in discovery order
    let mut impl_targets: BTreeMap<i64, Vec<i64>> = BTreeMap::new();
    let mut impl_order: Vec<i64> = Vec::new();
    for rel in &implements {
        let entry = impl_targets.entry(rel.src_entity_id).or_default();
        if entry.is_empty() {
            impl_order.push(rel.src_entity_id);
        }
        entry.push(rel.dst_entity_id);
    }

    let tests_by_impl: HashMap<i64, Vec<i64>> = if impl_order.is_empty() {
        HashMap::new()
    } else {
        let mut map: HashMap<i64, Vec<i64>> = HashMap::new();
        for rel in relations::for_frontier(conn, &impl_order, Direction::Incoming, include_deleted)? {
            if rel.relation_type == relation_types::TESTS {
                map.entry(rel.dst_entity_id).or_default().push(rel.src_entity_id);
            }
        }
        map
    };

    let mut ids: HashSet<i64> = targets.iter().copied().collect();
    ids.extend(impl_order.iter().copied());
    ids.extend(tests_by_impl.values().flatten().copied());
    let ids: Vec<i64> = ids.into_iter().collect();
    let nodes: HashMap<i64, Entity> = entities::find_by_ids(conn, &ids)?
        .into_iter()
        .map(|e| (e.id, e))
        .collect();
    let key_of = |id: &i64| nodes.get(id).map(|e| e.key.clone());

    let mut gaps = Vec::new();
    if impl_order.is_empty() {
        gaps.push(CoverageGap {
            gap_type: GapType::NoImplementation,
            entity_key: spec.key.clone(),
        });
    }

    let mut implementations = Vec::with_capacity(impl_order.len());
    for id in &impl_order {
        let Some(entity) = nodes.get(id) else {
            continue;
        };
        let tests: Vec<NodeView> = tests_by_impl
            .get(id)
            .map(|t| t.iter().filter_map(|t| nodes.get(t)).map(NodeView::from).collect())
            .unwrap_or_default();
        if tests.is_empty() {
            gaps.push(CoverageGap {
                gap_type: GapType::NoTests,
                entity_key: entity.key.clone(),
            });
        }
        implementations.push(Implementation {
            node: NodeView::from(entity),
            implements: impl_targets
                .get(id)
                .map(|t| t.iter().filter_map(key_of).collect())
                .unwrap_or_default(),
            tests,
        });
    }

    let tested = implementations.iter().filter(|i| !i.tests.is_empty()).count();
    let tested_ratio = if implementations.is_empty() {
        0.0
    } else {
        tested as f64 / implementations.len() as f64
    };

    Ok(CoverageMap {
        spec: NodeView::from(spec),
        targets: targets.iter().filter_map(key_of).collect(),
        implementations,
        gaps,
        tested_ratio,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EntityDraft, RelationDraft};
    use crate::store::GraphStore;

    fn seed(edges: &[(&str, &str, &str)]) -> (GraphStore, i64) {
        let store = GraphStore::in_memory().unwrap();
        let ws = store.ensure_workspace("h", "/r").unwrap().id;
        store
            .transaction(|tx| {
                let mut ids = HashMap::new();
                for (key, ty) in [
                    ("spec:s.md", "spec"),
                    ("spec:s.md#queue", "spec_section"),
                    ("spec:other.md", "spec"),
                    ("module:q.rs", "module"),
                    ("module:w.rs", "module"),
                    ("test:t.rs#q", "test"),
                ] {
                    let (id, _) = entities::upsert(tx, ws, &EntityDraft::new(key, ty), None)?;
                    ids.insert(key, id);
                }
                for (s, d, ty) in edges {
                    let draft = RelationDraft::new(*s, *d, *ty, "explicit");
                    relations::upsert(tx, ws, ids[s], ids[d], &draft, None)?;
                }
                Ok(())
            })
            .unwrap();
        (store, ws)
    }

    fn map(store: &GraphStore, ws: i64, key: &str) -> CoverageMap {
        store
            .with_conn(|conn| {
                let spec = entities::find_by_key(conn, ws, key)?.unwrap();
                coverage_map(conn, &spec, false)
            })
            .unwrap()
    }

    #[test]
    fn test_spec_without_implementation_is_a_gap() {
        let (store, ws) = seed(&[]);
        let coverage = map(&store, ws, "spec:other.md");
        assert!(coverage.implementations.is_empty());
        assert_eq!(
            coverage.gaps,
            vec![CoverageGap {
                gap_type: GapType::NoImplementation,
                entity_key: "spec:other.md".to_string(),
            }]
        );
    }

    #[test]
    fn test_section_implementations_and_tests() {
        let (store, ws) = seed(&[
            ("spec:s.md", "spec:s.md#queue", "contains"),
            ("module:q.rs", "spec:s.md#queue", "implements"),
            ("module:w.rs", "spec:s.md", "implements"),
            ("test:t.rs#q", "module:q.rs", "tests"),
        ]);
        let coverage = map(&store, ws, "spec:s.md");
        assert_eq!(coverage.implementations.len(), 2);

        let q = coverage
            .implementations
            .iter()
            .find(|i| i.node.key == "module:q.rs")
            .unwrap();
        assert_eq!(q.implements, vec!["spec:s.md#queue"]);
        assert_eq!(q.tests[0].key, "test:t.rs#q");

        assert_eq!(
            coverage.gaps,
            vec![CoverageGap {
                gap_type: GapType::NoTests,
                entity_key: "module:w.rs".to_string(),
            }]
        );
        assert!((coverage.tested_ratio - 0.5).abs() < f64::EPSILON);
    }
}
