//! CLI argument definitions using clap with subcommand architecture

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Incrementally synchronized knowledge graph over a codebase
#[derive(Parser, Debug)]
#[command(name = "kgraph-engine")]
#[command(about = "Keeps a knowledge graph of a codebase in sync with the files on disk")]
#[command(version)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Workspace root (defaults to the current directory)
    #[arg(long, global = true, env = "KGRAPH_ROOT", value_name = "DIR")]
    pub root: Option<PathBuf>,

    /// Configuration file (defaults to <root>/.kgraph/config.toml)
    #[arg(long, global = true, env = "KGRAPH_CONFIG", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Graph database file (overrides the configured location)
    #[arg(long, global = true, env = "KGRAPH_DB", value_name = "FILE")]
    pub db: Option<PathBuf>,

    /// Output format for command summaries
    #[arg(short, long, default_value = "text", value_enum, global = true)]
    pub format: OutputFormat,

    /// Debug-level logging on stderr
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

// ============================================
// Main Commands Enum
// ============================================

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List the files the engine would track, with their content hashes
    Scan(ScanArgs),

    /// Reconcile the graph with the disk once, then exit
    Sync(SyncArgs),

    /// Watch the workspace and keep the graph in sync until interrupted
    Watch(WatchArgs),

    /// Serve tool calls as JSON lines on stdio, backed by an isolated sync worker
    Serve(ServeArgs),

    /// Run one tool call and print its JSON result
    Tool(ToolArgs),

    /// Hard-delete tombstones past the retention window
    Purge(PurgeArgs),

    /// Print the JSON schema of every tool's arguments
    Schema,
}

// ============================================
// Subcommand arguments
// ============================================

#[derive(Args, Debug)]
pub struct ScanArgs {
    /// Restrict the scan to this workspace-relative directory
    #[arg(value_name = "DIR")]
    pub dir: Option<String>,
}

#[derive(Args, Debug)]
pub struct SyncArgs {
    /// Workspace-relative paths to resync; omit for a full reconciliation
    #[arg(value_name = "PATH")]
    pub paths: Vec<String>,
}

#[derive(Args, Debug)]
pub struct WatchArgs {
    /// Seconds between status lines on stderr (0 disables them)
    #[arg(long, default_value = "30")]
    pub status_every: u64,
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Run the sync engine inside this process instead of a child
    #[arg(long)]
    pub in_process: bool,

    /// Path to the kgraph-sync-worker binary (defaults to the sibling of this executable)
    #[arg(long, env = "KGRAPH_WORKER_BIN", value_name = "FILE")]
    pub worker_bin: Option<PathBuf>,

    /// Seconds to wait for the worker's `ready`
    #[arg(long, default_value = "30")]
    pub ready_timeout: u64,

    /// Serve queries without any sync engine (read-through staleness is still reported)
    #[arg(long, conflicts_with = "in_process")]
    pub no_sync: bool,
}

#[derive(Args, Debug)]
pub struct ToolArgs {
    /// Tool name, e.g. describe, trace_chain, coverage_map
    #[arg(value_name = "NAME")]
    pub name: String,

    /// Tool arguments as a JSON object
    #[arg(long, default_value = "{}", value_name = "JSON")]
    pub args: String,
}

#[derive(Args, Debug)]
pub struct PurgeArgs {
    /// Retention window in days (defaults to audit.retention_days)
    #[arg(long, value_name = "DAYS")]
    pub retention_days: Option<u32>,
}

/// Output format options
#[derive(Debug, Clone, Copy, Default, ValueEnum, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable text (default for terminal)
    #[default]
    #[value(alias = "pretty")]
    Text,
    /// JSON for machine parsing
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "kgraph-engine",
            "tool",
            "describe",
            "--args",
            r#"{"key":"module:src/lib.rs"}"#,
            "--root",
            "/repo",
            "-f",
            "json",
        ])
        .unwrap();
        assert_eq!(cli.root, Some(PathBuf::from("/repo")));
        assert_eq!(cli.format, OutputFormat::Json);
        match cli.command {
            Commands::Tool(args) => assert_eq!(args.name, "describe"),
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_serve_flags_conflict() {
        assert!(Cli::try_parse_from(["kgraph-engine", "serve", "--in-process", "--no-sync"]).is_err());
    }
}
