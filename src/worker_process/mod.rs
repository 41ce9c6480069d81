//! Process isolation for the sync engine
//!
//! The watcher and sync worker run in a `kgraph-sync-worker` child. Parent
//! and child exchange JSON lines over the child's stdio:
//!
//! ```text
//! parent                                   child
//!   │ ── init / enqueue / sync / stop ──>    │
//!   │ <── ready / status / error / log ───   │  (status pushed every tick)
//! ```
//!
//! The parent never waits on a reply, so a child stuck mid-transaction
//! cannot stall query serving; a dead child shows up as a closed stream.

pub mod child;
pub mod codec;
pub mod host;
pub mod log_forward;
pub mod protocol;

pub use child::ChildRuntime;
pub use codec::{encode_line, MessageReader, MessageWriter};
pub use host::{ReadyInfo, WorkerHost};
pub use log_forward::{parse_level, ForwardingLayer, LevelHandle};
pub use protocol::{ChildMessage, InitParams, ParentMessage};

/// File name of the worker binary, looked up next to the running executable
pub const WORKER_BINARY: &str = "kgraph-sync-worker";

/// Locate the worker binary: `KGRAPH_WORKER_BIN` if set, else the sibling
/// of the current executable
pub fn worker_binary_path() -> std::io::Result<std::path::PathBuf> {
    if let Some(path) = std::env::var_os("KGRAPH_WORKER_BIN") {
        return Ok(path.into());
    }
    let exe = std::env::current_exe()?;
    let dir = exe
        .parent()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "executable has no parent"))?;
    Ok(dir.join(format!("{}{}", WORKER_BINARY, std::env::consts::EXE_SUFFIX)))
}
