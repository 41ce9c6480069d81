//! `tool`, `purge` and `schema`

use std::sync::Arc;

use serde_json::Value;

use crate::cli::{PurgeArgs, ToolArgs};
use crate::error::{KgError, Result};
use crate::query::PurgeReport;
use crate::sync::SyncQueue;
use crate::tools::{tool_schemas, ToolRouter};

use super::CommandContext;

fn pretty(value: &Value) -> Result<String> {
    let mut out = serde_json::to_string_pretty(value)?;
    out.push('\n');
    Ok(out)
}

/// One tool call against the on-disk graph. Stale sources are reported in
/// the result; nothing is resynced.
pub fn run_tool(ctx: &CommandContext, args: &ToolArgs) -> Result<String> {
    let tool_args: Value = serde_json::from_str(&args.args)
        .map_err(|e| KgError::invalid(format!("--args is not valid JSON: {}", e)))?;

    let stale = Arc::new(SyncQueue::new());
    let query = ctx.graph_query(ctx.open_store()?, stale.clone())?;
    let router = ToolRouter::new(query, None);
    let result = router.call_raw(&args.name, tool_args)?;

    if !stale.is_empty() {
        let paths: Vec<String> = stale.snapshot().into_iter().map(|item| item.path).collect();
        tracing::warn!(
            "[SYNC] {} stale source file(s), run `kgraph-engine sync {}`",
            paths.len(),
            paths.join(" ")
        );
    }
    pretty(&result)
}

pub fn run_purge(ctx: &CommandContext, args: &PurgeArgs) -> Result<String> {
    let stale = Arc::new(SyncQueue::new());
    let query = ctx.graph_query(ctx.open_store()?, stale)?;
    let report: PurgeReport = query.purge_tombstones(args.retention_days)?;
    ctx.render(&report, |r| {
        format!(
            "purged {} entities, {} events, {} runs older than {} ({} days)\n",
            r.entities_purged, r.events_purged, r.runs_purged, r.cutoff, r.retention_days
        )
    })
}

pub fn run_schema() -> Result<String> {
    pretty(&tool_schemas()?)
}
