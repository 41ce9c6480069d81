//! Child side of the worker pipe
//!
//! Waits for `init`, boots a [`SyncRuntime`], answers `ready`, then pushes a
//! `status` on every tick until `stop` or end of input. Parent messages never
//! get a reply; failures surface as `error` messages.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio::time::MissedTickBehavior;

use super::codec::{MessageReader, MessageWriter};
use super::log_forward::{parse_level, LevelHandle};
use super::protocol::{ChildMessage, InitParams, ParentMessage};
use crate::config::EngineConfig;
use crate::error::{KgError, Result};
use crate::parsers::ParserRegistry;
use crate::store::GraphStore;
use crate::sync::SyncRuntime;

const DEFAULT_STATUS_INTERVAL_MS: u64 = 1000;

/// Build the sync runtime an `init` message describes
fn boot(params: &InitParams) -> Result<SyncRuntime> {
    let root = std::fs::canonicalize(&params.root)?;
    let config = EngineConfig::load(&root, params.config_path.as_deref())?;
    config.validate()?;

    let db_path: PathBuf = params
        .database_path
        .clone()
        .unwrap_or_else(|| config.database_path(&root));
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let store = GraphStore::open(&db_path, config.store.pool_size)?;
    let registry = Arc::new(ParserRegistry::with_builtin(&config.sync));
    tracing::info!(
        "[WORKER] Booting for {} (db {}, extractors {:?})",
        root.display(),
        db_path.display(),
        registry.names()
    );
    SyncRuntime::start(&root, &config, store, registry)
}

pub struct ChildRuntime {
    outbox: UnboundedSender<ChildMessage>,
    outgoing: UnboundedReceiver<ChildMessage>,
    level: LevelHandle,
}

impl ChildRuntime {
    pub fn new(level: LevelHandle) -> Self {
        let (outbox, outgoing) = mpsc::unbounded_channel();
        Self {
            outbox,
            outgoing,
            level,
        }
    }

    /// Sender for anything that wants to talk to the parent, such as the
    /// log forwarding layer
    pub fn outbox(&self) -> UnboundedSender<ChildMessage> {
        self.outbox.clone()
    }

    /// Run the protocol until `stop`, end of input, or a fatal error
    pub async fn serve<R, W>(self, reader: R, writer: W) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let ChildRuntime {
            outbox,
            mut outgoing,
            level,
        } = self;
        let this = ChildHandle { outbox, level };

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let writer_task = tokio::spawn(async move {
            let mut writer = MessageWriter::new(writer);
            loop {
                tokio::select! {
                    msg = outgoing.recv() => {
                        let Some(msg) = msg else { break };
                        if writer.send(&msg).await.is_err() {
                            return;
                        }
                    }
                    _ = &mut shutdown_rx => {
                        while let Ok(msg) = outgoing.try_recv() {
                            if writer.send(&msg).await.is_err() {
                                return;
                            }
                        }
                        break;
                    }
                }
            }
            let _ = writer.shutdown().await;
        });

        let result = this.run(MessageReader::new(reader)).await;
        if let Err(e) = &result {
            this.send(ChildMessage::error(e.to_string(), true));
        }

        let _ = shutdown_tx.send(());
        if writer_task.await.is_err() {
            tracing::error!("[IPC] Writer task panicked");
        }
        result
    }
}

struct ChildHandle {
    outbox: UnboundedSender<ChildMessage>,
    level: LevelHandle,
}

impl ChildHandle {
    fn send(&self, msg: ChildMessage) {
        let _ = self.outbox.send(msg);
    }

    async fn wait_for_init<R: AsyncRead + Unpin>(
        &self,
        reader: &mut MessageReader<R>,
    ) -> Result<Option<InitParams>> {
        loop {
            match reader.next::<ParentMessage>().await {
                Ok(Some(ParentMessage::Init(params))) => return Ok(Some(params)),
                Ok(Some(ParentMessage::Stop)) | Ok(None) => return Ok(None),
                Ok(Some(other)) => {
                    tracing::warn!("[IPC] Ignoring {:?} before init", other);
                    self.send(ChildMessage::error("not initialized", false));
                }
                Err(e @ KgError::Ipc { .. }) => self.send(ChildMessage::error(e.to_string(), false)),
                Err(e) => return Err(e),
            }
        }
    }

    async fn run<R: AsyncRead + Unpin>(&self, mut reader: MessageReader<R>) -> Result<()> {
        let Some(params) = self.wait_for_init(&mut reader).await? else {
            tracing::info!("[WORKER] Parent went away before init");
            return Ok(());
        };
        if let Some(level) = params.log_level.as_deref().and_then(parse_level) {
            self.level.set(level);
        }

        let boot_params = params.clone();
        let runtime = tokio::task::spawn_blocking(move || boot(&boot_params))
            .await
            .map_err(|e| KgError::ipc(format!("boot task failed: {}", e)))??;

        self.send(ChildMessage::Ready {
            pid: std::process::id(),
            workspace_id: runtime.context().workspace_id,
        });

        let period = params
            .status_interval_ms
            .unwrap_or(DEFAULT_STATUS_INTERVAL_MS)
            .max(10);
        let mut ticker = tokio::time::interval(Duration::from_millis(period));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let outcome = loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if !runtime.is_running() {
                        break Err(KgError::ipc("sync worker thread exited"));
                    }
                    self.send(ChildMessage::Status(runtime.status()));
                }
                msg = reader.next::<ParentMessage>() => match msg {
                    Ok(Some(ParentMessage::Enqueue { files, trigger })) => {
                        let added = runtime.enqueue(&files, trigger);
                        tracing::debug!("[WORKER] Enqueued {}/{} ({})", added, files.len(), trigger.as_str());
                    }
                    Ok(Some(ParentMessage::Sync { scope })) => {
                        // Full scans hash the tree; keep them off the protocol loop
                        let ctx = runtime.context().clone();
                        let outbox = self.outbox.clone();
                        tokio::task::spawn_blocking(move || match ctx.request_sync(&scope) {
                            Ok(n) => tracing::info!("[WORKER] Sync request enqueued {} paths", n),
                            Err(e) => {
                                let _ = outbox.send(ChildMessage::error(e.to_string(), false));
                            }
                        });
                    }
                    Ok(Some(ParentMessage::Init(_))) => {
                        tracing::warn!("[IPC] Duplicate init ignored");
                    }
                    Ok(Some(ParentMessage::Stop)) | Ok(None) => break Ok(()),
                    Err(e @ KgError::Ipc { .. }) => {
                        self.send(ChildMessage::error(e.to_string(), false));
                    }
                    Err(e) => break Err(e),
                }
            }
        };

        let final_status = tokio::task::spawn_blocking(move || {
            let mut runtime = runtime;
            runtime.stop();
            runtime.status()
        })
        .await
        .map_err(|e| KgError::ipc(format!("shutdown task failed: {}", e)))?;
        self.send(ChildMessage::Status(final_status));
        tracing::info!("[WORKER] Stopped");
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Trigger;
    use crate::sync::WorkerPhase;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_protocol_round_trip() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("lib.rs"), "pub fn a() {}\n").unwrap();
        std::fs::create_dir_all(dir.path().join(".kgraph")).unwrap();
        std::fs::write(
            dir.path().join(".kgraph/config.toml"),
            "[sync]\nwatch_enabled = false\n",
        )
        .unwrap();

        let (parent_end, child_end) = tokio::io::duplex(64 * 1024);
        let (child_read, child_write) = tokio::io::split(child_end);
        let child = ChildRuntime::new(LevelHandle::new(tracing::Level::INFO));
        let task = tokio::spawn(child.serve(child_read, child_write));

        let (parent_read, parent_write) = tokio::io::split(parent_end);
        let mut to_child = MessageWriter::new(parent_write);
        let mut from_child = MessageReader::new(parent_read);

        let mut init = InitParams::new(dir.path());
        init.status_interval_ms = Some(20);
        to_child.send(&ParentMessage::Init(init)).await.unwrap();

        let ready: ChildMessage = from_child.next().await.unwrap().unwrap();
        assert!(matches!(ready, ChildMessage::Ready { .. }));

        to_child
            .send(&ParentMessage::Enqueue {
                files: vec!["lib.rs".to_string()],
                trigger: Trigger::Manual,
            })
            .await
            .unwrap();

        let mut committed = false;
        while !committed {
            if let Some(ChildMessage::Status(status)) = from_child.next().await.unwrap() {
                committed = status.files_committed >= 1;
            }
        }

        to_child.send(&ParentMessage::Stop).await.unwrap();
        let mut last = None;
        while let Some(msg) = from_child.next::<ChildMessage>().await.unwrap() {
            if let ChildMessage::Status(status) = msg {
                last = Some(status);
            }
        }
        assert_eq!(last.unwrap().phase, WorkerPhase::Stopped);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_boot_failure_is_fatal() {
        let (parent_end, child_end) = tokio::io::duplex(4096);
        let (child_read, child_write) = tokio::io::split(child_end);
        let task = tokio::spawn(
            ChildRuntime::new(LevelHandle::new(tracing::Level::INFO)).serve(child_read, child_write),
        );

        let (parent_read, parent_write) = tokio::io::split(parent_end);
        let mut to_child = MessageWriter::new(parent_write);
        let mut from_child = MessageReader::new(parent_read);
        to_child
            .send(&ParentMessage::Init(InitParams::new("/definitely/not/here")))
            .await
            .unwrap();

        let msg: ChildMessage = from_child.next().await.unwrap().unwrap();
        assert!(matches!(msg, ChildMessage::Error { fatal: true, .. }));
        assert!(task.await.unwrap().is_err());
    }
}
