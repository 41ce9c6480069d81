//! Parent/child worker protocol over in-memory pipes
//!
//! The child side is the real `ChildRuntime` (boot, sync engine, status
//! ticker); only the process boundary is replaced by `tokio::io::duplex`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use kgraph_engine::model::Trigger;
use kgraph_engine::store::entities;
use kgraph_engine::sync::{ResyncSink, SyncControl, SyncScope, WorkerPhase};
use kgraph_engine::worker_process::{ChildRuntime, InitParams, LevelHandle};
use kgraph_engine::{GraphStore, WorkerHost};

use crate::common::TestRepo;

const TIMEOUT: Duration = Duration::from_secs(10);

/// Host wired to an in-process child serving the other end of a pipe
fn connect(repo: &TestRepo) -> (WorkerHost, tokio::task::JoinHandle<kgraph_engine::Result<()>>) {
    let (host_end, child_end) = tokio::io::duplex(256 * 1024);
    let (child_read, child_write) = tokio::io::split(child_end);
    let child = ChildRuntime::new(LevelHandle::new(tracing::Level::INFO));
    let task = tokio::spawn(child.serve(child_read, child_write));

    let mut init = InitParams::new(repo.path());
    init.status_interval_ms = Some(20);
    let (host_read, host_write) = tokio::io::split(host_end);
    (WorkerHost::attach(host_read, host_write, init), task)
}

async fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + TIMEOUT;
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn entity_exists(repo: &TestRepo, key: &str) -> bool {
    let config = repo.config();
    let store = GraphStore::open(&config.database_path(repo.path()), 1).unwrap();
    let ws = store.ensure_local_workspace(repo.path()).unwrap().id;
    store
        .with_conn(|conn| entities::find_by_key(conn, ws, key))
        .unwrap()
        .is_some_and(|e| !e.is_deleted)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_worker_syncs_and_reports_status() {
    let repo = TestRepo::with_fixture();
    let (host, child) = connect(&repo);

    let ready = host.wait_ready(TIMEOUT).await.unwrap();
    assert_eq!(ready.pid, std::process::id());
    assert!(host.is_alive());

    wait_until("startup", || {
        host.last_status()
            .is_some_and(|s| s.startup_scan_complete && s.queue_depth == 0 && s.files_committed >= 4)
    })
    .await;
    assert!(entity_exists(&repo, "module:src/queue.rs"));
    assert!(host.status_age().unwrap() < TIMEOUT);

    repo.add_file("src/late.rs", "pub fn late() {}\n");
    host.enqueue(vec!["src/late.rs".to_string()], Trigger::Manual)
        .unwrap();
    wait_until("late.rs", || entity_exists(&repo, "module:src/late.rs")).await;

    let final_status = host.stop(TIMEOUT).await.expect("final status");
    assert_eq!(final_status.phase, WorkerPhase::Stopped);
    assert_eq!(final_status.files_failed, 0);
    child.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_host_forwards_sync_and_read_through_requests() {
    let repo = TestRepo::with_fixture();
    let (host, child) = connect(&repo);
    host.wait_ready(TIMEOUT).await.unwrap();
    wait_until("startup", || {
        host.last_status()
            .is_some_and(|s| s.startup_scan_complete && s.queue_depth == 0)
    })
    .await;

    let host = Arc::new(host);
    let control: Arc<dyn SyncControl> = host.clone();
    // The isolated worker acknowledges without a count
    let ack = control
        .request_sync(&SyncScope::Paths {
            paths: vec!["src/lib.rs".to_string()],
        })
        .unwrap();
    assert_eq!(ack, None);
    assert!(control.status().is_some());

    repo.add_file("src/queue.rs", "pub struct Replaced;\n");
    let sink: Arc<dyn ResyncSink> = host.clone();
    assert!(sink.request_resync("src/queue.rs", Trigger::ReadThrough));

    wait_until("resync", || entity_exists(&repo, "symbol:src/queue.rs#Replaced")).await;

    drop(control);
    drop(sink);
    let host = Arc::try_unwrap(host).unwrap_or_else(|_| panic!("host still shared"));
    host.stop(TIMEOUT).await;
    child.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_failed_boot_is_reported_to_the_host() {
    let (host_end, child_end) = tokio::io::duplex(16 * 1024);
    let (child_read, child_write) = tokio::io::split(child_end);
    let child = tokio::spawn(
        ChildRuntime::new(LevelHandle::new(tracing::Level::INFO)).serve(child_read, child_write),
    );

    let (host_read, host_write) = tokio::io::split(host_end);
    let host = WorkerHost::attach(
        host_read,
        host_write,
        InitParams::new("/definitely/not/a/workspace"),
    );

    assert!(host.wait_ready(TIMEOUT).await.is_err());
    assert!(host.last_error().is_some());
    wait_until("stream close", || !host.is_alive()).await;
    assert!(host.enqueue(vec!["a.rs".to_string()], Trigger::Manual).is_err());
    assert!(child.await.unwrap().is_err());
}
