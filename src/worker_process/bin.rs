//! kgraph sync worker
//!
//! Isolated child process: file watcher plus the single-writer sync worker.
//! Spawned by `kgraph-engine serve`; speaks JSON lines on stdin/stdout.
//!
//! # Usage
//!
//! ```bash
//! echo '{"type":"init","root":"."}' | kgraph-sync-worker
//! ```

use std::io::Write;

use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

use kgraph_engine::logging;
use kgraph_engine::worker_process::{
    encode_line, ChildMessage, ChildRuntime, ForwardingLayer, LevelHandle,
};

#[derive(Parser, Debug)]
#[command(name = "kgraph-sync-worker")]
#[command(about = "Isolated sync worker for kgraph-engine (spawned by `serve`)")]
struct Args {
    /// Stderr log level, used when RUST_LOG is unset
    #[arg(long, default_value = "warn")]
    stderr_level: String,
}

/// Report a panic on stdout before the process dies so the parent sees why
fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let detail = format!("worker panicked: {}", info);
        if let Ok(line) = encode_line(&ChildMessage::error(detail, true)) {
            let mut stdout = std::io::stdout().lock();
            let _ = stdout.write_all(line.as_bytes());
            let _ = stdout.flush();
        }
        default_hook(info);
    }));
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = LevelHandle::new(tracing::Level::INFO);
    let runtime = ChildRuntime::new(level.clone());

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(logging::env_filter(&args.stderr_level)),
        )
        .with(ForwardingLayer::new(runtime.outbox(), level))
        .init();
    install_panic_hook();

    // The parent already received a fatal `error` line; this only sets the exit status
    runtime
        .serve(tokio::io::stdin(), tokio::io::stdout())
        .await?;
    Ok(())
}
