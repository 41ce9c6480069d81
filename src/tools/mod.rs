//! Tool-invocation surface
//!
//! A fixed set of named operations, each taking a small JSON argument object
//! and returning a JSON result or a `{code, message}` error. This is a thin
//! layer: argument validation here, semantics in [`crate::query`] and
//! [`crate::sync`].

pub mod types;

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};

use crate::error::{KgError, Result};
use crate::query::{EvidenceTarget, GraphQuery};
use crate::sync::{SyncControl, SyncScope};

pub use types::*;

/// Name and one-line description of every tool, in listing order
pub const TOOLS: &[(&str, &str)] = &[
    ("search", "Find entities by key or summary substring"),
    ("describe", "Entity with its sources (with freshness), fact count and relation counts"),
    ("relations", "Multi-hop relation walk from one entity"),
    ("facts", "Facts attached to one entity"),
    ("evidence", "Facts supporting a relation, or every outgoing relation of an entity"),
    ("bulk_describe", "describe for many keys at once"),
    ("bulk_facts", "facts for many keys at once"),
    ("impact_analysis", "Entities that transitively depend on the root, with distance and path"),
    ("dependency_graph", "Upstream/downstream subgraph around an entity"),
    ("trace_chain", "Shortest relation path between two entities"),
    ("coverage_map", "Implementations of a spec and the tests covering them"),
    ("inconsistency_report", "Dead endpoints, unevidenced relations, unimplemented specs, untested modules and symbols"),
    ("find_orphans", "Entities with no relations at all"),
    ("sync", "Request a full or per-path resync"),
    ("verify_integrity", "Whole-graph health counts"),
    ("purge_tombstones", "Hard-delete tombstones and audit history past the retention window"),
];

/// Structured tool failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolError {
    pub code: String,
    pub message: String,
}

impl From<KgError> for ToolError {
    fn from(err: KgError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

impl std::fmt::Display for ToolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

fn parse<T: DeserializeOwned>(tool: &str, args: Value) -> Result<T> {
    // A bare call with no arguments means "all defaults"
    let args = if args.is_null() { json!({}) } else { args };
    serde_json::from_value(args)
        .map_err(|e| KgError::invalid(format!("{}: {}", tool, e)))
}

fn output<T: Serialize>(value: T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

fn non_empty<'a>(field: &str, value: &'a str) -> Result<&'a str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(KgError::invalid(format!("'{}' must not be empty", field)));
    }
    Ok(trimmed)
}

/// JSON schema of every tool's argument object, keyed by tool name
pub fn tool_schemas() -> Result<Value> {
    let mut tools = serde_json::Map::new();
    for (name, description) in TOOLS {
        let schema = match *name {
            "search" => schemars::schema_for!(SearchArgs),
            "describe" => schemars::schema_for!(DescribeArgs),
            "relations" => schemars::schema_for!(RelationsArgs),
            "facts" => schemars::schema_for!(FactsArgs),
            "evidence" => schemars::schema_for!(EvidenceArgs),
            "bulk_describe" | "bulk_facts" => schemars::schema_for!(BulkArgs),
            "impact_analysis" => schemars::schema_for!(ImpactArgs),
            "dependency_graph" => schemars::schema_for!(DependencyGraphArgs),
            "trace_chain" => schemars::schema_for!(TraceChainArgs),
            "coverage_map" => schemars::schema_for!(CoverageMapArgs),
            "inconsistency_report" => schemars::schema_for!(InconsistencyArgs),
            "find_orphans" => schemars::schema_for!(OrphansArgs),
            "sync" => schemars::schema_for!(SyncArgs),
            "verify_integrity" => schemars::schema_for!(VerifyIntegrityArgs),
            _ => schemars::schema_for!(PurgeArgs),
        };
        tools.insert(
            name.to_string(),
            json!({ "description": description, "input_schema": serde_json::to_value(&schema)? }),
        );
    }
    Ok(Value::Object(tools))
}

/// Routes tool calls to the query engine and, for `sync`, to whichever sync
/// engine is attached
#[derive(Clone)]
pub struct ToolRouter {
    query: GraphQuery,
    sync: Option<Arc<dyn SyncControl>>,
}

impl ToolRouter {
    pub fn new(query: GraphQuery, sync: Option<Arc<dyn SyncControl>>) -> Self {
        Self { query, sync }
    }

    pub fn query(&self) -> &GraphQuery {
        &self.query
    }

    pub fn sync_control(&self) -> Option<&Arc<dyn SyncControl>> {
        self.sync.as_ref()
    }

    /// Invoke `name` with `args`
    pub fn call(&self, name: &str, args: Value) -> std::result::Result<Value, ToolError> {
        self.call_raw(name, args).map_err(ToolError::from)
    }

    /// Like [`call`](Self::call), keeping the engine error
    pub fn call_raw(&self, name: &str, args: Value) -> Result<Value> {
        let started = std::time::Instant::now();
        let result = self.dispatch(name, args);
        match &result {
            Ok(_) => tracing::debug!("[TOOLS] {} ok in {:?}", name, started.elapsed()),
            Err(e) => tracing::debug!("[TOOLS] {} failed: {}", name, e),
        }
        result
    }

    fn dispatch(&self, name: &str, args: Value) -> Result<Value> {
        let q = &self.query;
        match name {
            "search" => {
                let a: SearchArgs = parse(name, args)?;
                output(q.search(
                    non_empty("query", &a.query)?,
                    a.entity_type.as_deref(),
                    a.limit,
                    a.include_deleted,
                )?)
            }
            "describe" => {
                let a: DescribeArgs = parse(name, args)?;
                output(q.describe(non_empty("key", &a.key)?)?)
            }
            "relations" => {
                let a: RelationsArgs = parse(name, args)?;
                output(q.relations(
                    non_empty("key", &a.key)?,
                    a.direction.into(),
                    a.relation_type.as_deref(),
                    a.depth,
                    a.include_deleted,
                )?)
            }
            "facts" => {
                let a: FactsArgs = parse(name, args)?;
                output(q.facts(non_empty("key", &a.key)?, a.fact_type.as_deref())?)
            }
            "evidence" => {
                let a: EvidenceArgs = parse(name, args)?;
                let target = match (a.relation_id, a.key) {
                    (Some(id), None) => EvidenceTarget::Relation(id),
                    (None, Some(key)) => EvidenceTarget::Entity(non_empty("key", &key)?.to_string()),
                    _ => {
                        return Err(KgError::invalid(
                            "evidence: pass exactly one of 'relation_id' or 'key'",
                        ))
                    }
                };
                output(q.evidence(&target)?)
            }
            "bulk_describe" => {
                let a: BulkArgs = parse(name, args)?;
                output(q.bulk_describe(&self.bulk_keys(a.keys)?)?)
            }
            "bulk_facts" => {
                let a: BulkArgs = parse(name, args)?;
                output(q.bulk_facts(&self.bulk_keys(a.keys)?)?)
            }
            "impact_analysis" => {
                let a: ImpactArgs = parse(name, args)?;
                output(q.impact_analysis(non_empty("key", &a.key)?, a.depth, a.include_deleted)?)
            }
            "dependency_graph" => {
                let a: DependencyGraphArgs = parse(name, args)?;
                output(q.dependency_graph(
                    non_empty("key", &a.key)?,
                    a.direction,
                    a.depth,
                    a.include_deleted,
                )?)
            }
            "trace_chain" => {
                let a: TraceChainArgs = parse(name, args)?;
                output(q.trace_chain(
                    non_empty("from", &a.from)?,
                    non_empty("to", &a.to)?,
                    a.max_depth,
                    a.include_deleted,
                )?)
            }
            "coverage_map" => {
                let a: CoverageMapArgs = parse(name, args)?;
                output(q.coverage_map(non_empty("spec_key", &a.spec_key)?)?)
            }
            "inconsistency_report" => {
                let a: InconsistencyArgs = parse(name, args)?;
                output(q.inconsistency_report(a.limit)?)
            }
            "find_orphans" => {
                let a: OrphansArgs = parse(name, args)?;
                output(q.find_orphans(a.entity_type.as_deref(), a.limit)?)
            }
            "sync" => {
                let a: SyncArgs = parse(name, args)?;
                let scope = match a.paths {
                    Some(paths) if paths.is_empty() => {
                        return Err(KgError::invalid("sync: 'paths' must not be empty"))
                    }
                    Some(paths) => SyncScope::Paths { paths },
                    None => SyncScope::Full,
                };
                let control = self.sync.as_ref().ok_or(KgError::WorkerUnavailable)?;
                let enqueued = control.request_sync(&scope)?;
                Ok(json!({ "accepted": true, "scope": scope, "enqueued": enqueued }))
            }
            "verify_integrity" => {
                let _: VerifyIntegrityArgs = parse(name, args)?;
                output(q.verify_integrity()?)
            }
            "purge_tombstones" => {
                let a: PurgeArgs = parse(name, args)?;
                output(q.purge_tombstones(a.retention_days)?)
            }
            other => Err(KgError::invalid(format!(
                "unknown tool '{}'; expected one of: {}",
                other,
                TOOLS.iter().map(|(n, _)| *n).collect::<Vec<_>>().join(", ")
            ))),
        }
    }

    fn bulk_keys(&self, keys: Vec<String>) -> Result<Vec<String>> {
        if keys.is_empty() {
            return Err(KgError::invalid("'keys' must not be empty"));
        }
        let max = self.query.search_config().max_limit;
        if keys.len() > max {
            return Err(KgError::invalid(format!(
                "at most {} keys per call, got {}",
                max,
                keys.len()
            )));
        }
        Ok(keys)
    }
}
