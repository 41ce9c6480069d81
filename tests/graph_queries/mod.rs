//! Query engine over a synced workspace

use std::sync::Arc;
use std::time::Duration;

use kgraph_engine::model::Trigger;
use kgraph_engine::query::{DependencyDirection, GapType};
use kgraph_engine::store::relations::Direction;
use kgraph_engine::sync::SyncQueue;
use kgraph_engine::KgError;

use crate::common::SyncedRepo;

#[test]
fn test_coverage_map_links_spec_implementation_and_tests() {
    let synced = SyncedRepo::fixture();
    let coverage = synced.query().coverage_map("spec:docs/sync.md").unwrap();

    assert!(coverage.targets.contains(&"spec:docs/sync.md#queue".to_string()));
    assert!(coverage.targets.contains(&"spec:docs/sync.md#watcher".to_string()));

    assert_eq!(coverage.implementations.len(), 1);
    let queue = &coverage.implementations[0];
    assert_eq!(queue.node.key, "module:src/queue.rs");
    assert_eq!(queue.implements, vec!["spec:docs/sync.md#queue".to_string()]);
    let tests: Vec<&str> = queue.tests.iter().map(|t| t.key.as_str()).collect();
    assert_eq!(tests, vec!["test:src/queue.rs#tests::test_push"]);

    assert!(coverage.gaps.is_empty());
    assert!((coverage.tested_ratio - 1.0).abs() < f64::EPSILON);
}

#[test]
fn test_coverage_map_reports_gaps() {
    let mut synced = SyncedRepo::fixture();
    let section = synced
        .query()
        .coverage_map("spec:docs/sync.md#watcher")
        .unwrap();
    assert!(section.implementations.is_empty());
    assert_eq!(section.gaps[0].gap_type, GapType::NoImplementation);

    // Drop the in-file test: the implementation is now untested
    synced.repo.add_file(
        "src/queue.rs",
        "// implements: spec:docs/sync.md#queue\npub struct Queue;\n",
    );
    synced.sync();
    let coverage = synced.query().coverage_map("spec:docs/sync.md").unwrap();
    assert_eq!(coverage.gaps.len(), 1);
    assert_eq!(coverage.gaps[0].gap_type, GapType::NoTests);
    assert_eq!(coverage.gaps[0].entity_key, "module:src/queue.rs");
    assert_eq!(coverage.tested_ratio, 0.0);
}

#[test]
fn test_trace_chain_from_crate_root_to_spec_section() {
    let synced = SyncedRepo::fixture();
    let trace = synced
        .query()
        .trace_chain("module:src/lib.rs", "spec:docs/sync.md#queue", None, false)
        .unwrap();

    assert!(trace.found);
    assert_eq!(trace.hops, 2);
    let path: Vec<&str> = trace.path.iter().map(|n| n.key.as_str()).collect();
    assert_eq!(
        path,
        vec!["module:src/lib.rs", "module:src/queue.rs", "spec:docs/sync.md#queue"]
    );
    assert_eq!(trace.edges.len(), 2);
    assert_eq!(trace.edges[1].relation_type, "implements");

    // Edges are directed: nothing leads from a section back into the code
    let reverse = synced
        .query()
        .trace_chain("spec:docs/sync.md#queue", "module:src/lib.rs", None, false)
        .unwrap();
    assert!(!reverse.found);
    assert!(reverse.path.is_empty());
}

#[test]
fn test_impact_analysis_walks_dependents() {
    let synced = SyncedRepo::fixture();
    let report = synced
        .query()
        .impact_analysis("module:src/queue.rs", Some(3), false)
        .unwrap();

    let lib = report
        .affected
        .iter()
        .find(|a| a.node.key == "module:src/lib.rs")
        .expect("lib.rs depends on queue.rs");
    assert_eq!(lib.distance, 1);
    assert_eq!(lib.path.first().map(String::as_str), Some("module:src/lib.rs"));
    assert_eq!(lib.path.last().map(String::as_str), Some("module:src/queue.rs"));

    assert!(report
        .affected
        .iter()
        .any(|a| a.node.key == "test:src/queue.rs#tests::test_push"));
    assert!(report.affected.iter().all(|a| a.node.key != "module:src/queue.rs"));
}

#[test]
fn test_dependency_graph_directions() {
    let synced = SyncedRepo::fixture();
    let q = synced.query();

    let down = q
        .dependency_graph("package:demo", DependencyDirection::Downstream, Some(1), false)
        .unwrap();
    let keys: Vec<&str> = down.nodes.iter().map(|n| n.key.as_str()).collect();
    assert!(keys.contains(&"package:serde"));

    let up = q
        .dependency_graph("package:serde", DependencyDirection::Upstream, Some(1), false)
        .unwrap();
    let keys: Vec<&str> = up.nodes.iter().map(|n| n.key.as_str()).collect();
    assert!(keys.contains(&"package:demo"));
    assert!(up.edges.iter().all(|e| e.dst == "package:serde"));
}

#[test]
fn test_relations_filters_by_type_and_depth() {
    let synced = SyncedRepo::fixture();
    let q = synced.query();

    let contains = q
        .relations("module:src/lib.rs", Direction::Outgoing, Some("contains"), Some(2), false)
        .unwrap();
    assert!(contains.edges.iter().all(|e| e.relation_type == "contains"));
    let keys: Vec<&str> = contains.nodes.iter().map(|n| n.key.as_str()).collect();
    assert!(keys.contains(&"module:src/queue.rs"));
    assert!(keys.contains(&"symbol:src/queue.rs#Queue"));

    let shallow = q
        .relations("module:src/lib.rs", Direction::Outgoing, Some("contains"), Some(1), false)
        .unwrap();
    assert!(shallow.nodes.iter().all(|n| n.key != "symbol:src/queue.rs#Queue"));
}

#[test]
fn test_tombstoned_entities_are_hidden_unless_asked() {
    let mut synced = SyncedRepo::fixture();
    synced.repo.remove_file("src/queue.rs");
    synced.sync();
    let q = synced.query();

    let err = q
        .impact_analysis("module:src/queue.rs", None, false)
        .unwrap_err();
    assert!(matches!(err, KgError::EntityNotFound { .. }));
    assert!(q.impact_analysis("module:src/queue.rs", None, true).is_ok());

    let live = q.search("queue", Some("module"), None, false).unwrap();
    assert!(live.is_empty());
    let all = q.search("queue", Some("module"), None, true).unwrap();
    assert_eq!(all.len(), 1);
    assert!(all[0].is_deleted);
}

#[test]
fn test_inconsistency_report_flags_dead_endpoints() {
    let mut synced = SyncedRepo::fixture();
    let clean = synced.query().inconsistency_report(None).unwrap();
    assert!(clean.tombstoned_endpoints.is_empty());
    assert!(clean.missing_evidence.is_empty());
    assert!(clean.unimplemented_specs.is_empty());
    let untested: Vec<&str> = clean.untested_code.iter().map(|n| n.key.as_str()).collect();
    assert_eq!(untested, vec!["module:src/lib.rs", "symbol:src/lib.rs#make"]);

    // lib.rs still declares `mod queue;`
    synced.repo.remove_file("src/queue.rs");
    synced.sync();
    let report = synced.query().inconsistency_report(None).unwrap();
    assert!(report
        .tombstoned_endpoints
        .iter()
        .any(|e| e.src == "module:src/lib.rs" && e.dst == "module:src/queue.rs"));
    let specs: Vec<&str> = report.unimplemented_specs.iter().map(|n| n.key.as_str()).collect();
    assert_eq!(specs, vec!["spec:docs/sync.md"]);
    assert_eq!(
        report.total,
        report.tombstoned_endpoints.len()
            + report.missing_evidence.len()
            + report.unimplemented_specs.len()
            + report.untested_code.len()
    );
}

#[test]
fn test_find_orphans_and_verify_integrity() {
    let mut synced = SyncedRepo::fixture();
    synced.repo.add_file("docs/notes.md", "Nothing but prose.\n");
    synced.sync();
    let q = synced.query();

    let orphans = q.find_orphans(None, None).unwrap();
    let keys: Vec<&str> = orphans.iter().map(|n| n.key.as_str()).collect();
    assert_eq!(keys, vec!["spec:docs/notes.md"]);
    assert!(q.find_orphans(Some("module"), None).unwrap().is_empty());

    let integrity = q.verify_integrity().unwrap();
    assert!(integrity.ok, "{:?}", integrity);
    assert_eq!(integrity.tombstoned_entities, 0);
    assert!(integrity.live_entities >= 11);

    // Deleted behind the engine's back
    std::fs::remove_file(synced.repo.path().join("docs/notes.md")).unwrap();
    let integrity = q.verify_integrity().unwrap();
    assert!(!integrity.ok);
    assert_eq!(integrity.missing_source_files, vec!["docs/notes.md".to_string()]);
}

#[test]
fn test_read_through_detects_stale_sources() {
    let synced = SyncedRepo::fixture();
    let queue = Arc::new(SyncQueue::new());
    let q = synced.validated_query(queue.clone());

    let fresh = q.describe("module:src/queue.rs").unwrap();
    assert!(!fresh.stale);
    assert!(queue.is_empty());

    synced.repo.add_file("src/queue.rs", "pub struct Changed;\n");
    let q = synced.validated_query(queue.clone());
    let described = q.describe("symbol:src/queue.rs#Queue").unwrap();
    assert!(described.stale);
    assert_eq!(described.sources[0].source.file_path, "src/queue.rs");

    let item = queue.get("src/queue.rs").expect("resync queued");
    assert_eq!(item.trigger, Trigger::ReadThrough);
    assert_eq!(queue.len(), 1);

    // The stale graph is still served as it was
    assert_eq!(described.entity.key, "symbol:src/queue.rs#Queue");
    assert!(!described.entity.is_deleted);
}

#[test]
fn test_read_through_reports_deleted_files() {
    let synced = SyncedRepo::fixture();
    let queue = Arc::new(SyncQueue::new());
    let q = synced.validated_query(queue.clone());

    synced.repo.remove_file("docs/sync.md");
    let bulk = q
        .bulk_describe(&[
            "spec:docs/sync.md".to_string(),
            "spec:docs/sync.md#queue".to_string(),
            "spec:nope.md".to_string(),
        ])
        .unwrap();
    assert_eq!(bulk.entities.len(), 2);
    assert_eq!(bulk.missing, vec!["spec:nope.md".to_string()]);
    for described in &bulk.entities {
        let freshness = described.sources[0].freshness.as_ref().unwrap();
        assert!(freshness.stale && freshness.deleted);
    }
    // One check, one resync, however many entities share the file
    assert_eq!(queue.len(), 1);
}

#[test]
fn test_purge_removes_old_tombstones() {
    let mut synced = SyncedRepo::fixture();
    synced.repo.remove_file("src/queue.rs");
    synced.sync();
    let tombstoned = synced.query().verify_integrity().unwrap().tombstoned_entities;
    assert!(tombstoned >= 3);

    // Default retention keeps fresh tombstones
    let kept = synced.query().purge_tombstones(None).unwrap();
    assert_eq!(kept.entities_purged, 0);

    std::thread::sleep(Duration::from_millis(20));
    let purged = synced.query().purge_tombstones(Some(0)).unwrap();
    assert_eq!(purged.entities_purged, tombstoned);
    assert!(synced.entity("module:src/queue.rs").is_none());
    assert!(synced.entity("module:src/lib.rs").is_some());
}
