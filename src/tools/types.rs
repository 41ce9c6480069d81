//! Argument objects for the tool surface
//!
//! Unknown fields are rejected so typos surface as `invalid_argument` instead
//! of silently falling back to defaults.

use schemars::JsonSchema;
use serde::Deserialize;

use crate::query::DependencyDirection;
use crate::store::relations::Direction;

// ============================================================================
// Read operations
// ============================================================================

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct SearchArgs {
    /// Substring matched against entity keys and summaries
    #[schemars(description = "Substring to match against entity keys and summaries")]
    pub query: String,

    #[schemars(description = "Restrict to one entity type (e.g. 'module', 'symbol', 'spec')")]
    pub entity_type: Option<String>,

    #[schemars(description = "Maximum results (clamped to the configured maximum)")]
    pub limit: Option<usize>,

    #[serde(default)]
    pub include_deleted: bool,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct DescribeArgs {
    #[schemars(description = "Entity key, e.g. 'module:src/lib.rs'")]
    pub key: String,
}

/// Edge direction for a relation walk
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum WalkDirection {
    Incoming,
    Outgoing,
    #[default]
    Both,
}

impl From<WalkDirection> for Direction {
    fn from(value: WalkDirection) -> Self {
        match value {
            WalkDirection::Incoming => Direction::Incoming,
            WalkDirection::Outgoing => Direction::Outgoing,
            WalkDirection::Both => Direction::Both,
        }
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct RelationsArgs {
    pub key: String,

    #[serde(default)]
    pub direction: WalkDirection,

    #[schemars(description = "Only follow edges of this type (e.g. 'imports', 'tests')")]
    pub relation_type: Option<String>,

    #[schemars(description = "Hops to walk (default from config, clamped to the configured maximum)")]
    pub depth: Option<usize>,

    #[serde(default)]
    pub include_deleted: bool,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct FactsArgs {
    pub key: String,

    #[schemars(description = "Only facts of this type (e.g. 'heading', 'signature')")]
    pub fact_type: Option<String>,
}

/// Exactly one of `relation_id` or `key`
#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct EvidenceArgs {
    #[schemars(description = "Relation id, as returned by relation walks")]
    pub relation_id: Option<i64>,

    #[schemars(description = "Entity key; evidence for all of its outgoing relations")]
    pub key: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct BulkArgs {
    #[schemars(description = "Entity keys; unknown keys are reported under 'missing'")]
    pub keys: Vec<String>,
}

// ============================================================================
// Analysis operations
// ============================================================================

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ImpactArgs {
    pub key: String,
    pub depth: Option<usize>,
    #[serde(default)]
    pub include_deleted: bool,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct DependencyGraphArgs {
    pub key: String,

    #[serde(default)]
    #[schemars(description = "'downstream' (what the root depends on), 'upstream' (what depends on it) or 'both'")]
    pub direction: DependencyDirection,

    pub depth: Option<usize>,

    #[serde(default)]
    pub include_deleted: bool,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct TraceChainArgs {
    pub from: String,
    pub to: String,
    pub max_depth: Option<usize>,
    #[serde(default)]
    pub include_deleted: bool,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct CoverageMapArgs {
    #[schemars(description = "Spec or spec section key, e.g. 'spec:docs/sync.md'")]
    pub spec_key: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct InconsistencyArgs {
    #[schemars(description = "Cap per finding category")]
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct OrphansArgs {
    pub entity_type: Option<String>,
    pub limit: Option<usize>,
}

// ============================================================================
// Operational commands
// ============================================================================

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct SyncArgs {
    #[schemars(description = "Workspace-relative paths to resync; omit for a full reconciliation")]
    pub paths: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct VerifyIntegrityArgs {}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct PurgeArgs {
    #[schemars(description = "Keep tombstones newer than this many days (default from config)")]
    pub retention_days: Option<u32>,
}
