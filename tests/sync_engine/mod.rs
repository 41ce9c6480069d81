//! Sync engine: startup reconciliation, incremental commits, tombstones

use std::sync::Arc;
use std::time::{Duration, Instant};

use kgraph_engine::model::{EventType, Trigger};
use kgraph_engine::store::{audit, files};
use kgraph_engine::sync::{FileOutcome, SyncScope, WorkerPhase};
use kgraph_engine::{GraphStore, KgError, ParserRegistry, SyncRuntime};

use crate::common::{SyncedRepo, TestRepo};

const FIXTURE_KEYS: &[&str] = &[
    "module:src/lib.rs",
    "module:src/queue.rs",
    "symbol:src/lib.rs#make",
    "symbol:src/queue.rs#Queue",
    "spec:docs/sync.md",
    "spec:docs/sync.md#queue",
    "spec:docs/sync.md#watcher",
    "test:src/queue.rs#tests::test_push",
    "package:demo",
    "package:serde",
];

#[test]
fn test_startup_indexes_every_extractor() {
    let synced = SyncedRepo::fixture();

    for key in FIXTURE_KEYS {
        let entity = synced
            .entity(key)
            .unwrap_or_else(|| panic!("missing entity {}", key));
        assert!(!entity.is_deleted, "{} should be live", key);
    }
    assert!(synced.worker.pending_links().is_empty());

    let state = &synced.worker.context().state;
    // src/lib.rs may be committed twice when its link to queue.rs is retried
    assert!(state.files_committed() >= 4);
    assert_eq!(state.files_failed(), 0);
    assert!(state.startup_scan_complete());
}

#[test]
fn test_state_dir_is_never_tracked() {
    let synced = SyncedRepo::fixture();
    let ws = synced.workspace_id();
    let tracked = synced
        .store()
        .with_conn(|conn| files::tracked(conn, ws))
        .unwrap();

    let mut paths: Vec<&str> = tracked.keys().map(String::as_str).collect();
    paths.sort();
    assert_eq!(paths, vec!["Cargo.toml", "docs/sync.md", "src/lib.rs", "src/queue.rs"]);
}

#[test]
fn test_second_startup_is_a_noop() {
    let mut synced = SyncedRepo::fixture();
    let ws = synced.workspace_id();
    let runs_before = synced
        .store()
        .with_conn(|conn| audit::recent_runs(conn, ws, 1000))
        .unwrap()
        .len();

    let report = synced.sync();
    assert_eq!(report.scanned, 4);
    assert_eq!(report.enqueued, 0);
    assert_eq!(report.vanished_paths, 0);

    let runs_after = synced
        .store()
        .with_conn(|conn| audit::recent_runs(conn, ws, 1000))
        .unwrap()
        .len();
    assert_eq!(runs_before, runs_after);
}

#[test]
fn test_edit_replaces_the_changed_file_only() {
    let mut synced = SyncedRepo::fixture();
    let lib_before = synced.entity("module:src/lib.rs").unwrap();

    synced.repo.add_file(
        "src/queue.rs",
        "// implements: spec:docs/sync.md#queue\npub struct Buffer;\n",
    );
    let report = synced.sync();
    assert_eq!(report.enqueued, 1);

    assert!(synced.entity("symbol:src/queue.rs#Queue").unwrap().is_deleted);
    assert!(!synced.entity("symbol:src/queue.rs#Buffer").unwrap().is_deleted);
    // The in-file test went away with the edit
    assert!(synced
        .entity("test:src/queue.rs#tests::test_push")
        .unwrap()
        .is_deleted);

    let lib_after = synced.entity("module:src/lib.rs").unwrap();
    assert_eq!(lib_before.id, lib_after.id);
    assert_eq!(lib_before.updated_at, lib_after.updated_at);
}

#[test]
fn test_delete_tombstones_and_restore_revives() {
    let mut synced = SyncedRepo::fixture();
    let original = synced.entity("module:src/queue.rs").unwrap();

    synced.repo.remove_file("src/queue.rs");
    let report = synced.sync();
    assert_eq!(report.vanished_paths, 1);
    assert!(report.entities_tombstoned >= 3);
    assert!(synced.entity("module:src/queue.rs").unwrap().is_deleted);
    assert!(synced.entity("symbol:src/queue.rs#Queue").unwrap().is_deleted);
    // Entities sourced elsewhere survive
    assert!(!synced.entity("module:src/lib.rs").unwrap().is_deleted);

    synced.repo.add_file("src/queue.rs", crate::common::test_repo::QUEUE_RS);
    synced.sync();
    let restored = synced.entity("module:src/queue.rs").unwrap();
    assert_eq!(restored.id, original.id);
    assert!(!restored.is_deleted);

    let events: Vec<EventType> = synced
        .store()
        .with_conn(|conn| audit::events_for_entity(conn, original.id))
        .unwrap()
        .into_iter()
        .map(|e| e.event_type)
        .collect();
    assert_eq!(
        events,
        vec![EventType::Created, EventType::Deleted, EventType::Restored]
    );
}

#[test]
fn test_directory_removal_tombstones_everything_under_it() {
    let mut synced = SyncedRepo::fixture();

    std::fs::remove_dir_all(synced.repo.path().join("docs")).unwrap();
    let report = synced.sync();
    assert_eq!(report.vanished_paths, 1);
    for key in ["spec:docs/sync.md", "spec:docs/sync.md#queue", "spec:docs/sync.md#watcher"] {
        assert!(synced.entity(key).unwrap().is_deleted, "{} should be tombstoned", key);
    }
}

#[test]
fn test_unresolved_links_are_retried_after_drain() {
    let mut synced = SyncedRepo::new(TestRepo::new());
    synced
        .repo
        .add_file("src/lib.rs", "mod later;\nuse crate::later::Thing;\n");
    synced.sync();
    assert_eq!(synced.worker.pending_links(), vec!["src/lib.rs".to_string()]);

    synced.repo.add_file("src/later.rs", "pub struct Thing;\n");
    synced.sync();
    assert!(synced.worker.pending_links().is_empty());

    let out = synced
        .query()
        .relations(
            "module:src/lib.rs",
            kgraph_engine::store::relations::Direction::Outgoing,
            None,
            Some(1),
            false,
        )
        .unwrap();
    let targets: Vec<(&str, &str)> = out
        .edges
        .iter()
        .map(|e| (e.relation_type.as_str(), e.dst.as_str()))
        .collect();
    assert!(targets.contains(&("contains", "module:src/later.rs")));
    assert!(targets.contains(&("imports", "module:src/later.rs")));
}

#[test]
fn test_request_sync_scopes() {
    let mut synced = SyncedRepo::fixture();
    let ctx = synced.worker.context().clone();

    let n = ctx
        .request_sync(&SyncScope::Paths {
            paths: vec!["./src/lib.rs".to_string()],
        })
        .unwrap();
    assert_eq!(n, 1);
    let item = ctx.queue.get("src/lib.rs").unwrap();
    assert_eq!(item.trigger, Trigger::Manual);
    assert_eq!(synced.worker.drain(), 1);

    let err = ctx
        .request_sync(&SyncScope::Paths {
            paths: vec!["../outside.rs".to_string()],
        })
        .unwrap_err();
    assert!(matches!(err, KgError::InvalidArgument { .. }));

    // Nothing changed on disk: a full sync has nothing to enqueue
    assert_eq!(ctx.request_sync(&SyncScope::Full).unwrap(), 0);
    synced.repo.add_file("src/extra.rs", "pub fn extra() {}\n");
    assert_eq!(ctx.request_sync(&SyncScope::Full).unwrap(), 1);
}

#[test]
fn test_missing_untracked_path_is_a_noop() {
    let mut synced = SyncedRepo::fixture();
    let outcome = synced
        .worker
        .process_file("src/never-existed.rs", Trigger::Manual)
        .unwrap();
    assert_eq!(outcome, FileOutcome::Unchanged);
    assert_eq!(synced.worker.context().state.files_failed(), 0);
}

#[test]
fn test_runtime_picks_up_edits_through_the_watcher() {
    let repo = TestRepo::with_fixture();
    repo.add_file(".kgraph/config.toml", "[sync]\nwatch_enabled = true\ndebounce_ms = 50\n");
    let config = repo.config();
    let store = GraphStore::open(&repo.path().join(".kgraph/graph.db"), 4).unwrap();
    let registry = Arc::new(ParserRegistry::with_builtin(&config.sync));
    let mut runtime = SyncRuntime::start(repo.path(), &config, store.clone(), registry).unwrap();

    let wait_for = |what: &str, done: &dyn Fn() -> bool| {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !done() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            std::thread::sleep(Duration::from_millis(25));
        }
    };

    wait_for("startup", &|| {
        let status = runtime.status();
        status.startup_scan_complete && status.queue_depth == 0 && status.files_committed >= 4
    });
    assert!(runtime.status().watch_healthy);

    let ws = runtime.context().workspace_id;
    repo.add_file("src/added.rs", "pub fn added() {}\n");
    wait_for("watch commit", &|| {
        store
            .with_conn(|conn| kgraph_engine::store::entities::find_by_key(conn, ws, "module:src/added.rs"))
            .unwrap()
            .is_some()
    });

    runtime.stop();
    assert_eq!(runtime.status().phase, WorkerPhase::Stopped);
}
