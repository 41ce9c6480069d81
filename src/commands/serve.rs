//! `serve`: JSON-lines tool server on stdio
//!
//! One request per line:
//!
//! ```json
//! {"id": 1, "tool": "describe", "args": {"key": "module:src/lib.rs"}}
//! {"type": "status"}
//! ```
//!
//! answered in order with `response`, `error` or `status` lines. The sync
//! engine runs in a `kgraph-sync-worker` child by default; a dead child
//! only disables `sync`, queries keep working.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::cli::ServeArgs;
use crate::error::{KgError, Result};
use crate::model::Trigger;
use crate::sync::{ResyncSink, SyncControl, SyncQueue, SyncRuntime, SyncStatus};
use crate::tools::ToolRouter;
use crate::worker_process::{worker_binary_path, MessageReader, MessageWriter, WorkerHost};

use super::CommandContext;

const STOP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct ToolRequest {
    #[serde(default)]
    id: Value,
    tool: String,
    #[serde(default)]
    args: Value,
}

/// Outgoing line
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServeResponse {
    Response {
        id: Value,
        result: Value,
    },
    Error {
        id: Value,
        code: String,
        message: String,
    },
    Status {
        #[serde(skip_serializing_if = "Value::is_null")]
        id: Value,
        /// `null` until the sync engine has reported
        status: Option<SyncStatus>,
        worker_alive: bool,
    },
}

impl ServeResponse {
    fn error(id: Value, err: impl Into<crate::tools::ToolError>) -> Self {
        let err = err.into();
        Self::Error {
            id,
            code: err.code,
            message: err.message,
        }
    }
}

/// Where read-through resyncs go when `serve` runs without a sync engine
struct Discard;

impl ResyncSink for Discard {
    fn request_resync(&self, path: &str, _trigger: Trigger) -> bool {
        tracing::debug!("[SYNC] Stale source {} (no sync engine attached)", path);
        false
    }
}

/// Answer one request line. Tool calls hit SQLite, so this is blocking.
pub fn handle_line(router: &ToolRouter, worker_alive: bool, line: &str) -> ServeResponse {
    let value: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(e) => {
            return ServeResponse::error(Value::Null, KgError::invalid(format!("malformed request: {}", e)))
        }
    };

    if value.get("type").and_then(Value::as_str) == Some("status") {
        return ServeResponse::Status {
            id: value.get("id").cloned().unwrap_or(Value::Null),
            status: router.sync_control().and_then(|s| s.status()),
            worker_alive,
        };
    }

    let request: ToolRequest = match serde_json::from_value(value) {
        Ok(request) => request,
        Err(e) => {
            return ServeResponse::error(Value::Null, KgError::invalid(format!("malformed request: {}", e)))
        }
    };
    match router.call(&request.tool, request.args) {
        Ok(result) => ServeResponse::Response {
            id: request.id,
            result,
        },
        Err(err) => ServeResponse::error(request.id, err),
    }
}

/// Serve requests from `reader` until end of input. Returns the number of
/// requests answered.
pub async fn serve_lines<R, W, F>(router: ToolRouter, alive: F, reader: R, writer: W) -> Result<usize>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    F: Fn() -> bool,
{
    let mut reader = MessageReader::new(reader);
    let mut writer = MessageWriter::new(writer);
    let mut answered = 0;

    while let Some(line) = reader.next_line().await? {
        let router = router.clone();
        let worker_alive = alive();
        let response = tokio::task::spawn_blocking(move || handle_line(&router, worker_alive, &line))
            .await
            .map_err(|e| KgError::ipc(format!("request task failed: {}", e)))?;
        writer.send(&response).await?;
        answered += 1;
    }
    Ok(answered)
}

/// Run the tool server
///
/// This creates a tokio runtime and runs the async server on stdio.
pub fn run_serve(ctx: &CommandContext, args: &ServeArgs) -> Result<String> {
    let runtime = tokio::runtime::Runtime::new()
        .map_err(|e| KgError::config(format!("Failed to create tokio runtime: {}", e)))?;
    runtime.block_on(run_serve_async(ctx, args))?;
    Ok(String::new())
}

async fn run_serve_async(ctx: &CommandContext, args: &ServeArgs) -> Result<()> {
    let store = ctx.open_store()?;

    if args.no_sync {
        let query = ctx.graph_query(store, Arc::new(Discard))?;
        let router = ToolRouter::new(query, None);
        let n = serve_lines(router, || false, tokio::io::stdin(), tokio::io::stdout()).await?;
        tracing::info!("[IPC] Served {} requests", n);
        return Ok(());
    }

    if args.in_process {
        let runtime = Arc::new(SyncRuntime::start(
            &ctx.root,
            &ctx.config,
            store.clone(),
            ctx.registry(),
        )?);
        let queue: Arc<SyncQueue> = Arc::clone(&runtime.context().queue);
        let query = ctx.graph_query(store, queue)?;
        let control: Arc<dyn SyncControl> = runtime.clone();
        let router = ToolRouter::new(query, Some(control));
        let watch = Arc::clone(&runtime);
        let n = serve_lines(router, move || watch.is_running(), tokio::io::stdin(), tokio::io::stdout())
            .await?;
        tracing::info!("[IPC] Served {} requests", n);
        // Last handle: dropping it stops the runtime
        tokio::task::spawn_blocking(move || drop(runtime))
            .await
            .map_err(|e| KgError::ipc(format!("shutdown task failed: {}", e)))?;
        return Ok(());
    }

    let binary = match &args.worker_bin {
        Some(path) => path.clone(),
        None => worker_binary_path()?,
    };
    let host = Arc::new(WorkerHost::spawn(&binary, ctx.init_params()).await?);
    let ready = host
        .wait_ready(Duration::from_secs(args.ready_timeout))
        .await?;
    tracing::info!("[IPC] Worker {} ready for workspace {}", ready.pid, ready.workspace_id);

    let sink: Arc<dyn ResyncSink> = host.clone();
    let control: Arc<dyn SyncControl> = host.clone();
    let query = ctx.graph_query(store, sink)?;
    let router = ToolRouter::new(query, Some(control));
    let watch = Arc::clone(&host);
    let n = serve_lines(router, move || watch.is_alive(), tokio::io::stdin(), tokio::io::stdout()).await?;
    tracing::info!("[IPC] Served {} requests", n);

    match Arc::try_unwrap(host) {
        Ok(host) => {
            if let Some(status) = host.stop(STOP_TIMEOUT).await {
                tracing::info!(
                    "[IPC] Worker stopped after {} commits ({} failed)",
                    status.files_committed,
                    status.files_failed
                );
            }
        }
        // Dropping the last handle kills the child
        Err(_) => tracing::warn!("[IPC] Worker handle still shared at shutdown"),
    }
    Ok(())
}
