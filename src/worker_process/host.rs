//! Parent side of the worker pipe
//!
//! The host never waits on the child for an answer. Outbound messages go
//! through an unbounded channel drained by a writer task; a reader task
//! records pushed `status`/`ready` messages and re-emits child logs.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::codec::{MessageReader, MessageWriter};
use super::protocol::{ChildMessage, InitParams, ParentMessage};
use crate::error::{KgError, Result};
use crate::model::Trigger;
use crate::sync::{ResyncSink, SyncControl, SyncScope, SyncStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadyInfo {
    pub pid: u32,
    pub workspace_id: i64,
}

#[derive(Default)]
struct HostShared {
    status: RwLock<Option<(SyncStatus, Instant)>>,
    last_error: Mutex<Option<String>>,
    exited: AtomicBool,
    /// Read-through requests sent since the last status push
    in_flight: Mutex<HashMap<String, u8>>,
}

pub struct WorkerHost {
    outbound: mpsc::UnboundedSender<ParentMessage>,
    ready: watch::Receiver<Option<ReadyInfo>>,
    shared: Arc<HostShared>,
    child: Option<Child>,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
}

fn reemit(level: &str, module: &str, message: &str) {
    match level {
        "error" => tracing::error!(worker_module = %module, "[WORKER] {}", message),
        "warn" => tracing::warn!(worker_module = %module, "[WORKER] {}", message),
        "info" => tracing::info!(worker_module = %module, "[WORKER] {}", message),
        "debug" => tracing::debug!(worker_module = %module, "[WORKER] {}", message),
        _ => tracing::trace!(worker_module = %module, "[WORKER] {}", message),
    }
}

impl WorkerHost {
    /// Launch the worker binary and send `init`. Its stderr is discarded;
    /// logs arrive as `log` messages.
    pub async fn spawn(binary: &Path, init: InitParams) -> Result<Self> {
        let mut child = Command::new(binary)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| KgError::ipc(format!("failed to spawn {}: {}", binary.display(), e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| KgError::ipc("worker stdin not captured"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| KgError::ipc("worker stdout not captured"))?;

        tracing::info!(
            "[IPC] Spawned {} (pid {:?})",
            binary.display(),
            child.id()
        );
        let mut host = Self::attach(stdout, stdin, init);
        host.child = Some(child);
        Ok(host)
    }

    /// Speak the protocol over an existing stream pair. Must be called
    /// inside a tokio runtime.
    pub fn attach<R, W>(reader: R, writer: W, init: InitParams) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let shared = Arc::new(HostShared::default());
        let (ready_tx, ready_rx) = watch::channel(None);
        let (outbound, mut queued) = mpsc::unbounded_channel::<ParentMessage>();
        // Cannot fail: the receiver is alive
        let _ = outbound.send(ParentMessage::Init(init));

        let writer_task = tokio::spawn(async move {
            let mut writer = MessageWriter::new(writer);
            while let Some(msg) = queued.recv().await {
                if let Err(e) = writer.send(&msg).await {
                    tracing::warn!("[IPC] Write to worker failed: {}", e);
                    return;
                }
            }
            let _ = writer.shutdown().await;
        });

        let reader_shared = Arc::clone(&shared);
        let reader_task = tokio::spawn(async move {
            let mut reader = MessageReader::new(reader);
            loop {
                match reader.next::<ChildMessage>().await {
                    Ok(Some(msg)) => handle(&reader_shared, &ready_tx, msg),
                    Ok(None) => break,
                    Err(e @ KgError::Ipc { .. }) => tracing::warn!("[IPC] {}", e),
                    Err(e) => {
                        tracing::warn!("[IPC] Read from worker failed: {}", e);
                        break;
                    }
                }
            }
            reader_shared.exited.store(true, Ordering::SeqCst);
            tracing::info!("[IPC] Worker stream closed");
        });

        Self {
            outbound,
            ready: ready_rx,
            shared,
            child: None,
            reader_task,
            writer_task,
        }
    }

    pub fn ready_info(&self) -> Option<ReadyInfo> {
        *self.ready.borrow()
    }

    pub fn is_alive(&self) -> bool {
        !self.shared.exited.load(Ordering::SeqCst)
    }

    /// Last pushed status; never contacts the child
    pub fn last_status(&self) -> Option<SyncStatus> {
        self.shared.status.read().as_ref().map(|(s, _)| s.clone())
    }

    pub fn status_age(&self) -> Option<Duration> {
        self.shared.status.read().as_ref().map(|(_, at)| at.elapsed())
    }

    pub fn last_error(&self) -> Option<String> {
        self.shared.last_error.lock().clone()
    }

    pub async fn wait_ready(&self, timeout: Duration) -> Result<ReadyInfo> {
        let mut ready = self.ready.clone();
        let waited = match tokio::time::timeout(timeout, ready.wait_for(|r| r.is_some())).await {
            Ok(Ok(info)) => *info,
            Ok(Err(_)) => {
                return Err(match self.last_error() {
                    Some(detail) => KgError::ipc(detail),
                    None => KgError::WorkerUnavailable,
                })
            }
            Err(_) => return Err(KgError::WorkerUnavailable),
        };
        waited.ok_or(KgError::WorkerUnavailable)
    }

    fn send(&self, msg: ParentMessage) -> Result<()> {
        if !self.is_alive() {
            return Err(KgError::WorkerUnavailable);
        }
        self.outbound
            .send(msg)
            .map_err(|_| KgError::WorkerUnavailable)
    }

    pub fn enqueue(&self, files: Vec<String>, trigger: Trigger) -> Result<()> {
        if files.is_empty() {
            return Ok(());
        }
        self.send(ParentMessage::Enqueue { files, trigger })
    }

    pub fn sync(&self, scope: SyncScope) -> Result<()> {
        self.send(ParentMessage::Sync { scope })
    }

    /// Ask the child to stop and wait for its stream to close; kill it if
    /// it has not exited within `timeout`. Returns the final status.
    pub async fn stop(self, timeout: Duration) -> Option<SyncStatus> {
        let WorkerHost {
            outbound,
            shared,
            mut child,
            reader_task,
            writer_task,
            ..
        } = self;
        let _ = outbound.send(ParentMessage::Stop);
        drop(outbound);

        if tokio::time::timeout(timeout, reader_task).await.is_err() {
            tracing::warn!("[IPC] Worker did not stop within {:?}", timeout);
            if let Some(child) = child.as_mut() {
                if let Err(e) = child.kill().await {
                    tracing::warn!("[IPC] Failed to kill worker: {}", e);
                }
            }
        }
        if let Some(mut child) = child {
            match child.wait().await {
                Ok(code) => tracing::info!("[IPC] Worker exited with {}", code),
                Err(e) => tracing::warn!("[IPC] Failed to reap worker: {}", e),
            }
        }
        writer_task.abort();

        let status = shared.status.read().as_ref().map(|(s, _)| s.clone());
        status
    }
}

fn handle(shared: &HostShared, ready: &watch::Sender<Option<ReadyInfo>>, msg: ChildMessage) {
    match msg {
        ChildMessage::Ready { pid, workspace_id } => {
            tracing::info!("[IPC] Worker ready (pid {}, workspace {})", pid, workspace_id);
            ready.send_replace(Some(ReadyInfo { pid, workspace_id }));
        }
        ChildMessage::Status(status) => {
            *shared.status.write() = Some((status, Instant::now()));
            shared.in_flight.lock().clear();
        }
        ChildMessage::Error { detail, fatal } => {
            if fatal {
                tracing::error!("[IPC] Worker failed: {}", detail);
            } else {
                tracing::warn!("[IPC] Worker error: {}", detail);
            }
            *shared.last_error.lock() = Some(detail);
        }
        ChildMessage::Log {
            level,
            module,
            message,
        } => reemit(&level, &module, &message),
    }
}

impl ResyncSink for WorkerHost {
    /// Forward to the child's queue. Repeats for the same path at the same
    /// or lower priority are dropped until the next status push.
    fn request_resync(&self, path: &str, trigger: Trigger) -> bool {
        {
            let mut in_flight = self.shared.in_flight.lock();
            match in_flight.get(path) {
                Some(&sent) if sent >= trigger.priority() => return false,
                _ => {
                    in_flight.insert(path.to_string(), trigger.priority());
                }
            }
        }
        self.enqueue(vec![path.to_string()], trigger).is_ok()
    }
}

impl SyncControl for WorkerHost {
    fn request_sync(&self, scope: &SyncScope) -> Result<Option<usize>> {
        self.sync(scope.clone())?;
        Ok(None)
    }

    fn status(&self) -> Option<SyncStatus> {
        self.last_status()
    }
}
