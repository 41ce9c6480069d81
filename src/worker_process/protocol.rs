//! Parent ⇄ sync-worker message types
//!
//! One JSON object per line, tagged by `type`:
//!
//! ```json
//! {"type":"enqueue","files":["src/lib.rs"],"trigger":"read_through"}
//! {"type":"status","phase":"idle","queue_depth":0,...}
//! ```

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::model::Trigger;
use crate::sync::{SyncScope, SyncStatus};

/// Environment the child needs before it can start syncing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitParams {
    pub root: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_path: Option<PathBuf>,
    /// Overrides the configured database location
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_path: Option<PathBuf>,
    /// Lowest level forwarded as `log` messages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
    /// Status push interval, defaults to one second
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_interval_ms: Option<u64>,
}

impl InitParams {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            config_path: None,
            database_path: None,
            log_level: None,
            status_interval_ms: None,
        }
    }
}

/// Parent-to-child message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParentMessage {
    Init(InitParams),
    Enqueue { files: Vec<String>, trigger: Trigger },
    Sync { scope: SyncScope },
    Stop,
}

/// Child-to-parent message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChildMessage {
    Ready { pid: u32, workspace_id: i64 },
    /// Pushed on a fixed interval, never requested
    Status(SyncStatus),
    Error {
        detail: String,
        /// The child exits after sending a fatal error
        #[serde(default)]
        fatal: bool,
    },
    Log {
        level: String,
        module: String,
        message: String,
    },
}

impl ChildMessage {
    pub fn error(detail: impl Into<String>, fatal: bool) -> Self {
        Self::Error {
            detail: detail.into(),
            fatal,
        }
    }
}
