//! Every tool through the router, against a synced workspace

use std::sync::Arc;
use std::time::{Duration, Instant};

use kgraph_engine::sync::SyncControl;
use kgraph_engine::tools::{tool_schemas, TOOLS};
use kgraph_engine::{GraphQuery, GraphStore, ParserRegistry, SyncRuntime, ToolRouter};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};

use crate::common::{SyncedRepo, TestRepo};

fn router(synced: &SyncedRepo) -> ToolRouter {
    ToolRouter::new(synced.query(), None)
}

fn keys(value: &Value) -> Vec<String> {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item["key"].as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default()
}

#[test]
fn test_every_read_tool_answers() {
    let synced = SyncedRepo::fixture();
    let router = router(&synced);

    let calls: Vec<(&str, Value)> = vec![
        ("search", json!({"query": "queue"})),
        ("describe", json!({"key": "module:src/queue.rs"})),
        ("relations", json!({"key": "module:src/lib.rs", "direction": "outgoing"})),
        ("facts", json!({"key": "module:src/lib.rs", "fact_type": "import"})),
        ("evidence", json!({"key": "module:src/queue.rs"})),
        ("bulk_describe", json!({"keys": ["module:src/lib.rs", "module:src/queue.rs"]})),
        ("bulk_facts", json!({"keys": ["module:src/lib.rs", "spec:missing.md"]})),
        ("impact_analysis", json!({"key": "module:src/queue.rs"})),
        ("dependency_graph", json!({"key": "package:demo", "direction": "downstream"})),
        ("trace_chain", json!({"from": "module:src/lib.rs", "to": "spec:docs/sync.md#queue"})),
        ("coverage_map", json!({"spec_key": "spec:docs/sync.md"})),
        ("inconsistency_report", json!({})),
        ("find_orphans", Value::Null),
        ("verify_integrity", json!({})),
        ("purge_tombstones", json!({"retention_days": 30})),
    ];
    // Everything but `sync`, which needs an engine
    assert_eq!(calls.len(), TOOLS.len() - 1);

    for (tool, args) in calls {
        let out = router
            .call(tool, args)
            .unwrap_or_else(|e| panic!("{} failed: {}", tool, e));
        assert!(!out.is_null(), "{} returned null", tool);
    }
}

#[test]
fn test_tool_results_have_stable_shapes() {
    let synced = SyncedRepo::fixture();
    let router = router(&synced);

    let found = router.call("search", json!({"query": "queue"})).unwrap();
    assert!(keys(&found).contains(&"module:src/queue.rs".to_string()));

    let described = router
        .call("describe", json!({"key": "symbol:src/queue.rs#Queue"}))
        .unwrap();
    assert_eq!(described["entity"]["entity_type"], "symbol");
    assert_eq!(described["sources"][0]["file_path"], "src/queue.rs");
    assert_eq!(described["stale"], false);

    let facts = router
        .call("facts", json!({"key": "module:src/lib.rs", "fact_type": "import"}))
        .unwrap();
    assert!(facts
        .as_array()
        .unwrap()
        .iter()
        .any(|f| f["fact_key"] == "crate::queue::Queue"));

    let bulk = router
        .call("bulk_facts", json!({"keys": ["module:src/lib.rs", "spec:missing.md"]}))
        .unwrap();
    assert!(bulk["facts"]["module:src/lib.rs"].is_array());
    assert_eq!(bulk["missing"], json!(["spec:missing.md"]));

    let evidence = router.call("evidence", json!({"key": "module:src/queue.rs"})).unwrap();
    let implements = evidence
        .as_array()
        .unwrap()
        .iter()
        .find(|e| e["relation"]["relation_type"] == "implements")
        .expect("implements relation");
    assert_eq!(implements["facts"][0]["fact_type"], "marker");

    let relation_id = implements["relation"]["id"].clone();
    let by_id = router.call("evidence", json!({"relation_id": relation_id})).unwrap();
    assert_eq!(by_id.as_array().unwrap().len(), 1);

    let coverage = router
        .call("coverage_map", json!({"spec_key": "spec:docs/sync.md"}))
        .unwrap();
    assert_eq!(coverage["implementations"][0]["key"], "module:src/queue.rs");
    assert_eq!(coverage["tested_ratio"], 1.0);
}

#[test]
fn test_structured_errors() {
    let synced = SyncedRepo::fixture();
    let router = router(&synced);

    let cases: Vec<(&str, Value, &str)> = vec![
        ("describe", json!({"key": "module:nope.rs"}), "not_found"),
        ("describe", json!({"key": "   "}), "invalid_argument"),
        ("describe", json!({}), "invalid_argument"),
        ("search", json!({"query": "x", "extra": true}), "invalid_argument"),
        ("relations", json!({"key": "module:src/lib.rs", "direction": "sideways"}), "invalid_argument"),
        ("evidence", json!({"key": "module:src/lib.rs", "relation_id": 1}), "invalid_argument"),
        ("evidence", json!({"relation_id": 999999}), "not_found"),
        ("bulk_describe", json!({"keys": []}), "invalid_argument"),
        ("sync", json!({"paths": []}), "invalid_argument"),
        ("sync", json!({}), "worker_unavailable"),
        ("no_such_tool", json!({}), "invalid_argument"),
    ];
    for (tool, args, code) in cases {
        let err = router.call(tool, args.clone()).unwrap_err();
        assert_eq!(err.code, code, "{} {}", tool, args);
        assert!(!err.message.is_empty());
    }

    let too_many: Vec<String> = (0..=synced.config.search.max_limit)
        .map(|i| format!("module:{}.rs", i))
        .collect();
    let err = router
        .call("bulk_describe", json!({ "keys": too_many }))
        .unwrap_err();
    assert_eq!(err.code, "invalid_argument");
}

#[test]
fn test_limits_and_depth_are_clamped() {
    let synced = SyncedRepo::fixture();
    let router = router(&synced);

    let one = router.call("search", json!({"query": "src", "limit": 1})).unwrap();
    assert_eq!(one.as_array().unwrap().len(), 1);

    let huge = router
        .call("search", json!({"query": "src", "limit": 1_000_000}))
        .unwrap();
    assert!(huge.as_array().unwrap().len() <= synced.config.search.max_limit);

    let deep = router
        .call("relations", json!({"key": "module:src/lib.rs", "depth": 1000}))
        .unwrap();
    assert!(deep["depth_reached"].as_u64().unwrap() <= synced.config.search.max_depth as u64);
}

#[test]
fn test_schemas_cover_every_tool() {
    let schemas = tool_schemas().unwrap();
    for (name, description) in TOOLS {
        assert_eq!(schemas[*name]["description"], *description);
        assert_eq!(schemas[*name]["input_schema"]["type"], "object");
    }
    assert!(schemas["coverage_map"]["input_schema"]["properties"]["spec_key"].is_object());
}

#[test]
fn test_sync_tool_drives_an_in_process_runtime() {
    let repo = TestRepo::with_fixture();
    let config = repo.config();
    let store = GraphStore::open(&config.database_path(repo.path()), 4).unwrap();
    let registry = Arc::new(ParserRegistry::with_builtin(&config.sync));
    let runtime = Arc::new(SyncRuntime::start(repo.path(), &config, store.clone(), registry).unwrap());

    let wait_for = |what: &str, done: &dyn Fn() -> bool| {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !done() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            std::thread::sleep(Duration::from_millis(20));
        }
    };
    wait_for("startup", &|| {
        let status = runtime.status();
        status.startup_scan_complete && status.queue_depth == 0
    });

    let query = GraphQuery::new(
        store,
        runtime.context().workspace_id,
        repo.path().to_path_buf(),
        &config,
    );
    let control: Arc<dyn SyncControl> = runtime.clone();
    let router = ToolRouter::new(query, Some(control));

    // The watcher is off: only an explicit sync picks this up
    repo.add_file("src/late.rs", "pub fn late() {}\n");
    let out = router
        .call("sync", json!({"paths": ["src/late.rs"]}))
        .unwrap();
    assert_eq!(out["accepted"], true);
    assert_eq!(out["scope"], json!({"scope": "paths", "paths": ["src/late.rs"]}));
    assert_eq!(out["enqueued"], 1);

    wait_for("late.rs", &|| {
        router
            .call("describe", json!({"key": "module:src/late.rs"}))
            .is_ok()
    });

    let full = router.call("sync", Value::Null).unwrap();
    assert_eq!(full["scope"], json!({"scope": "full"}));
    assert_eq!(full["enqueued"], 0);

    drop(router);
    let mut runtime = Arc::try_unwrap(runtime).unwrap_or_else(|_| panic!("runtime still shared"));
    runtime.stop();
}
