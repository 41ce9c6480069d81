//! `sync` (one shot) and `watch` (until interrupted)

use std::time::Duration;

use serde::Serialize;

use crate::cli::{SyncArgs, WatchArgs};
use crate::error::{KgError, Result};
use crate::sync::{StartupReport, SyncContext, SyncRuntime, SyncScope, SyncStatus, SyncWorker};

use super::CommandContext;

#[derive(Debug, Serialize)]
struct SyncSummary {
    #[serde(skip_serializing_if = "Option::is_none")]
    startup: Option<StartupReport>,
    processed: usize,
    files_committed: u64,
    files_failed: u64,
    /// Paths whose relations still point at unknown entities
    pending_links: Vec<String>,
}

/// Reconcile once in this process: full startup reconciliation, or just the
/// given paths, then drain the queue
pub fn run_sync(ctx: &CommandContext, args: &SyncArgs) -> Result<String> {
    let store = ctx.open_store()?;
    let sync_ctx = SyncContext::new(&ctx.root, &ctx.config, store)?;
    let mut worker = SyncWorker::new(sync_ctx, ctx.registry());

    let startup = if args.paths.is_empty() {
        Some(worker.startup(true)?)
    } else {
        let n = worker.context().request_sync(&SyncScope::Paths {
            paths: args.paths.clone(),
        })?;
        tracing::info!("[SYNC] {} paths queued", n);
        None
    };
    let processed = worker.drain();

    let state = &worker.context().state;
    let summary = SyncSummary {
        startup,
        processed,
        files_committed: state.files_committed(),
        files_failed: state.files_failed(),
        pending_links: worker.pending_links(),
    };

    ctx.render(&summary, |s| {
        let mut out = String::new();
        if let Some(startup) = &s.startup {
            out.push_str(&format!(
                "scanned {} files, {} changed, {} vanished ({} entities tombstoned)\n",
                startup.scanned, startup.enqueued, startup.vanished_paths, startup.entities_tombstoned
            ));
        }
        out.push_str(&format!(
            "processed {} paths: {} committed, {} failed\n",
            s.processed, s.files_committed, s.files_failed
        ));
        if !s.pending_links.is_empty() {
            out.push_str(&format!("unresolved links in: {}\n", s.pending_links.join(", ")));
        }
        out
    })
}

fn log_status(status: &SyncStatus) {
    tracing::info!(
        "[SYNC] phase={:?} queue={} committed={} failed={} watch_healthy={}",
        status.phase,
        status.queue_depth,
        status.files_committed,
        status.files_failed,
        status.watch_healthy
    );
}

/// Run watcher + worker in this process until Ctrl-C
pub fn run_watch(ctx: &CommandContext, args: &WatchArgs) -> Result<String> {
    let rt = tokio::runtime::Runtime::new()
        .map_err(|e| KgError::config(format!("Failed to create tokio runtime: {}", e)))?;

    let store = ctx.open_store()?;
    let mut runtime = SyncRuntime::start(&ctx.root, &ctx.config, store, ctx.registry())?;
    eprintln!("Watching {} (Ctrl-C to stop)", ctx.root.display());

    rt.block_on(async {
        let period = Duration::from_secs(args.status_every.max(1));
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                _ = ticker.tick() => {
                    if args.status_every > 0 {
                        log_status(&runtime.status());
                    }
                    if !runtime.is_running() {
                        tracing::error!("[SYNC] Worker thread exited");
                        break;
                    }
                }
            }
        }
    });

    runtime.stop();
    let status = runtime.status();
    ctx.render(&status, |s| {
        format!(
            "stopped: {} files committed, {} failed\n",
            s.files_committed, s.files_failed
        )
    })
}
