//! Graph data model: persisted records, extractor drafts, and sync triggers

use std::fmt;
use std::str::FromStr;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::KgError;

/// Current UTC time as an RFC 3339 string with millisecond precision.
///
/// Lexicographic order of these strings matches chronological order, which
/// the retention queries rely on.
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Well-known entity types produced by the built-in extractors
pub mod entity_types {
    pub const MODULE: &str = "module";
    pub const SYMBOL: &str = "symbol";
    pub const PACKAGE: &str = "package";
    pub const SPEC: &str = "spec";
    pub const SPEC_SECTION: &str = "spec_section";
    pub const TEST: &str = "test";
}

/// Well-known relation types
pub mod relation_types {
    pub const CONTAINS: &str = "contains";
    pub const IMPORTS: &str = "imports";
    pub const DEPENDS_ON: &str = "depends_on";
    pub const IMPLEMENTS: &str = "implements";
    pub const TESTS: &str = "tests";
}

/// Relation strength tags
pub mod strength {
    /// Stated directly in the source (a `use`, a dependency table entry, a marker comment)
    pub const EXPLICIT: &str = "explicit";
    /// Derived from naming or location
    pub const INFERRED: &str = "inferred";
}

/// Stable entity key builders
pub mod keys {
    pub fn module(path: &str) -> String {
        format!("module:{}", path)
    }

    pub fn symbol(path: &str, name: &str) -> String {
        format!("symbol:{}#{}", path, name)
    }

    pub fn package(name: &str) -> String {
        format!("package:{}", name)
    }

    pub fn spec(path: &str) -> String {
        format!("spec:{}", path)
    }

    pub fn spec_section(path: &str, slug: &str) -> String {
        format!("spec:{}#{}", path, slug)
    }

    pub fn test(path: &str, name: &str) -> String {
        format!("test:{}#{}", path, name)
    }
}

/// What caused a path to be queued for sync
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    /// A query observed a stale source
    ReadThrough,
    /// Filesystem watch event
    Watch,
    /// Explicit sync request
    Manual,
    /// Startup reconciliation
    Startup,
}

impl Trigger {
    /// Queue priority; higher is processed first
    pub fn priority(self) -> u8 {
        match self {
            Trigger::ReadThrough => 3,
            Trigger::Watch | Trigger::Manual => 2,
            Trigger::Startup => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Trigger::ReadThrough => "read_through",
            Trigger::Watch => "watch",
            Trigger::Manual => "manual",
            Trigger::Startup => "startup",
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Trigger {
    type Err = KgError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "read_through" => Ok(Trigger::ReadThrough),
            "watch" => Ok(Trigger::Watch),
            "manual" => Ok(Trigger::Manual),
            "startup" => Ok(Trigger::Startup),
            other => Err(KgError::invalid(format!("unknown trigger '{}'", other))),
        }
    }
}

/// One repository checkout
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workspace {
    pub id: i64,
    pub host: String,
    pub root_path: String,
    pub created_at: String,
}

/// A graph node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: i64,
    pub workspace_id: i64,
    pub key: String,
    pub entity_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    pub metadata: Value,
    pub is_deleted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sync_run_id: Option<i64>,
    pub created_at: String,
    pub updated_at: String,
}

/// Byte range within a file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: i64,
    pub end: i64,
}

/// A pointer from an entity to a file location
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub id: i64,
    pub workspace_id: i64,
    pub entity_id: i64,
    pub kind: String,
    pub file_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub span: Option<Span>,
    pub content_hash: String,
    pub updated_at: String,
}

/// A typed, keyed attribute of one entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fact {
    pub id: i64,
    pub entity_id: i64,
    pub fact_type: String,
    pub fact_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    pub payload: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    pub updated_at: String,
}

/// A directed, typed edge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relation {
    pub id: i64,
    pub workspace_id: i64,
    pub src_entity_id: i64,
    pub dst_entity_id: i64,
    pub relation_type: String,
    pub strength_type: String,
    pub metadata: Value,
    /// File whose extraction asserted this relation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_path: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Status of a sync run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "completed" => RunStatus::Completed,
            "failed" => RunStatus::Failed,
            _ => RunStatus::Running,
        }
    }
}

/// Aggregate counters recorded on a finished sync run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncStats {
    pub files_processed: usize,
    pub entities_created: usize,
    pub entities_updated: usize,
    pub entities_deleted: usize,
    pub entities_restored: usize,
    pub sources_upserted: usize,
    pub sources_deleted: usize,
    pub facts_upserted: usize,
    pub facts_deleted: usize,
    pub relations_upserted: usize,
    pub relations_deleted: usize,
    pub relations_skipped: usize,
    pub evidence_linked: usize,
}

impl SyncStats {
    pub fn merge(&mut self, other: &SyncStats) {
        self.files_processed += other.files_processed;
        self.entities_created += other.entities_created;
        self.entities_updated += other.entities_updated;
        self.entities_deleted += other.entities_deleted;
        self.entities_restored += other.entities_restored;
        self.sources_upserted += other.sources_upserted;
        self.sources_deleted += other.sources_deleted;
        self.facts_upserted += other.facts_upserted;
        self.facts_deleted += other.facts_deleted;
        self.relations_upserted += other.relations_upserted;
        self.relations_deleted += other.relations_deleted;
        self.relations_skipped += other.relations_skipped;
        self.evidence_linked += other.evidence_linked;
    }

    /// Whether any entity-level mutation happened
    pub fn has_entity_changes(&self) -> bool {
        self.entities_created
            + self.entities_updated
            + self.entities_deleted
            + self.entities_restored
            > 0
    }
}

/// One sync session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRun {
    pub id: i64,
    pub workspace_id: i64,
    pub trigger: Trigger,
    pub status: RunStatus,
    pub started_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
    pub stats: SyncStats,
    pub errors: Vec<String>,
}

/// Kind of entity mutation recorded in the audit trail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Created,
    Updated,
    Deleted,
    Restored,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Created => "created",
            EventType::Updated => "updated",
            EventType::Deleted => "deleted",
            EventType::Restored => "restored",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(EventType::Created),
            "updated" => Some(EventType::Updated),
            "deleted" => Some(EventType::Deleted),
            "restored" => Some(EventType::Restored),
            _ => None,
        }
    }
}

/// One entity mutation within a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncEvent {
    pub id: i64,
    pub sync_run_id: i64,
    pub entity_id: i64,
    pub event_type: EventType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_hash: Option<String>,
    pub created_at: String,
}

// ============================================================================
// Extractor output
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityDraft {
    pub key: String,
    pub entity_type: String,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub metadata: Value,
}

impl EntityDraft {
    pub fn new(key: impl Into<String>, entity_type: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            entity_type: entity_type.into(),
            summary: None,
            metadata: Value::Null,
        }
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDraft {
    pub entity_key: String,
    pub kind: String,
    pub file_path: String,
    #[serde(default)]
    pub span: Option<Span>,
}

impl SourceDraft {
    /// Whole-file source
    pub fn file(entity_key: impl Into<String>, kind: impl Into<String>, path: &str) -> Self {
        Self {
            entity_key: entity_key.into(),
            kind: kind.into(),
            file_path: path.to_string(),
            span: None,
        }
    }

    pub fn spanned(
        entity_key: impl Into<String>,
        kind: impl Into<String>,
        path: &str,
        start: usize,
        end: usize,
    ) -> Self {
        Self {
            entity_key: entity_key.into(),
            kind: kind.into(),
            file_path: path.to_string(),
            span: Some(Span {
                start: start as i64,
                end: end as i64,
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactDraft {
    pub entity_key: String,
    pub fact_type: String,
    pub fact_key: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub payload: Value,
}

impl FactDraft {
    pub fn new(
        entity_key: impl Into<String>,
        fact_type: impl Into<String>,
        fact_key: impl Into<String>,
    ) -> Self {
        Self {
            entity_key: entity_key.into(),
            fact_type: fact_type.into(),
            fact_key: fact_key.into(),
            content: None,
            payload: Value::Null,
        }
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// Hash over content and payload, used to detect fact changes
    pub fn content_hash(&self) -> String {
        let mut buf = self.content.clone().unwrap_or_default().into_bytes();
        buf.push(0);
        buf.extend_from_slice(self.payload.to_string().as_bytes());
        crate::fs_utils::hash_bytes(&buf)
    }

    pub fn reference(&self) -> FactRef {
        FactRef {
            entity_key: self.entity_key.clone(),
            fact_type: self.fact_type.clone(),
            fact_key: self.fact_key.clone(),
        }
    }
}

/// Address of a fact within one extraction
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FactRef {
    pub entity_key: String,
    pub fact_type: String,
    pub fact_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationDraft {
    pub src_key: String,
    pub dst_key: String,
    pub relation_type: String,
    pub strength: String,
    #[serde(default)]
    pub metadata: Value,
    /// Facts justifying this relation; empty means fall back to key-prefix matching
    #[serde(default)]
    pub evidence: Vec<FactRef>,
}

impl RelationDraft {
    pub fn new(
        src_key: impl Into<String>,
        dst_key: impl Into<String>,
        relation_type: impl Into<String>,
        strength: impl Into<String>,
    ) -> Self {
        Self {
            src_key: src_key.into(),
            dst_key: dst_key.into(),
            relation_type: relation_type.into(),
            strength: strength.into(),
            metadata: Value::Null,
            evidence: Vec::new(),
        }
    }

    pub fn with_evidence(mut self, fact: FactRef) -> Self {
        self.evidence.push(fact);
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn is_self_loop(&self) -> bool {
        self.src_key == self.dst_key
    }
}

/// Merged output of every extractor that handled one file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub entities: Vec<EntityDraft>,
    pub facts: Vec<FactDraft>,
    pub relations: Vec<RelationDraft>,
    pub sources: Vec<SourceDraft>,
}

impl ExtractionResult {
    pub fn merge(&mut self, other: ExtractionResult) {
        self.entities.extend(other.entities);
        self.facts.extend(other.facts);
        self.relations.extend(other.relations);
        self.sources.extend(other.sources);
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
            && self.facts.is_empty()
            && self.relations.is_empty()
            && self.sources.is_empty()
    }
}
