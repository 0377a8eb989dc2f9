//! In-process transfer backend.
//!
//! Serves file contents from memory and writes them into the destination
//! directory the same way the HTTP backend does (`.part` file, then rename),
//! so everything downstream of the backend runs unchanged. In manual mode
//! nothing moves until the caller steps a transfer, which makes pause,
//! restart, and completion ordering reproducible.

use super::{
    part_path, transfer_destination, BackgroundDownloadHandle, BackgroundDownloadStatus,
    TransferBackend, TransferEvent, TransferRequest, TransferState,
};
use crate::cancel::CancellationToken;
use crate::error::{FetchError, Result};
use crate::model_library::RemoteFile;
use async_trait::async_trait;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

const DEFAULT_CHUNK_SIZE: usize = 4096;

/// How enqueued transfers make progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryTransferMode {
    /// Each transfer streams its content in chunks and finishes on its own.
    Automatic,
    /// Transfers stay queued until stepped with `advance`, `complete`, `fail`.
    Manual,
}

struct MemorySlot {
    status: BackgroundDownloadStatus,
    transfer: Option<SlotTarget>,
    token: CancellationToken,
}

#[derive(Clone)]
struct SlotTarget {
    coordinate: String,
    dest_dir: PathBuf,
    file: RemoteFile,
}

struct MemoryShared {
    mode: MemoryTransferMode,
    chunk_size: usize,
    contents: Mutex<HashMap<(String, String), Arc<Vec<u8>>>>,
    failures: Mutex<HashMap<(String, String), String>>,
    slots: Mutex<HashMap<String, MemorySlot>>,
    sessions: Mutex<HashMap<String, Vec<String>>>,
    requests: Mutex<Vec<TransferRequest>>,
    events: mpsc::UnboundedSender<TransferEvent>,
}

/// [`TransferBackend`] kept entirely in memory.
pub struct MemoryTransferBackend {
    shared: Arc<MemoryShared>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<TransferEvent>>>,
}

impl MemoryTransferBackend {
    pub fn new(mode: MemoryTransferMode) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(MemoryShared {
                mode,
                chunk_size: DEFAULT_CHUNK_SIZE,
                contents: Mutex::new(HashMap::new()),
                failures: Mutex::new(HashMap::new()),
                slots: Mutex::new(HashMap::new()),
                sessions: Mutex::new(HashMap::new()),
                requests: Mutex::new(Vec::new()),
                events: tx,
            }),
            events_rx: Mutex::new(Some(rx)),
        }
    }

    pub fn automatic() -> Self {
        Self::new(MemoryTransferMode::Automatic)
    }

    pub fn manual() -> Self {
        Self::new(MemoryTransferMode::Manual)
    }

    /// Serve `bytes` for `path` in repository `coordinate`. Files without
    /// registered content get generated bytes of their listed size.
    pub fn with_content(self, coordinate: &str, path: &str, bytes: impl Into<Vec<u8>>) -> Self {
        self.shared
            .contents
            .lock()
            .expect("content table lock poisoned")
            .insert((coordinate.to_string(), path.to_string()), Arc::new(bytes.into()));
        self
    }

    /// In automatic mode, fail `path` halfway through with `message`.
    pub fn with_failure(self, coordinate: &str, path: &str, message: &str) -> Self {
        self.shared
            .failures
            .lock()
            .expect("failure table lock poisoned")
            .insert((coordinate.to_string(), path.to_string()), message.to_string());
        self
    }

    pub fn mode(&self) -> MemoryTransferMode {
        self.shared.mode
    }

    /// Every request passed to `enqueue`, oldest first.
    pub fn enqueued_requests(&self) -> Vec<TransferRequest> {
        self.shared
            .requests
            .lock()
            .expect("request log lock poisoned")
            .clone()
    }

    /// Known handles of `model_id`, ordered by file path.
    pub fn handles_for_model(&self, model_id: &str) -> Vec<BackgroundDownloadHandle> {
        let slots = self.shared.slots.lock().expect("transfer table lock poisoned");
        let mut found: Vec<(String, BackgroundDownloadHandle)> = slots
            .values()
            .filter(|slot| slot.status.handle.model_id == model_id)
            .map(|slot| {
                let path = slot
                    .transfer
                    .as_ref()
                    .map(|t| t.file.path.clone())
                    .unwrap_or_default();
                (path, slot.status.handle.clone())
            })
            .collect();
        found.sort_by(|a, b| a.0.cmp(&b.0));
        found.into_iter().map(|(_, handle)| handle).collect()
    }

    /// Insert a status as if the transfer had run while this process was
    /// not watching. The handle's session is registered alongside it.
    pub fn seed_status(&self, status: BackgroundDownloadStatus) {
        let handle = status.handle.clone();
        self.shared
            .sessions
            .lock()
            .expect("session table lock poisoned")
            .entry(handle.session_identifier.clone())
            .or_default()
            .push(handle.id.clone());
        self.shared
            .slots
            .lock()
            .expect("transfer table lock poisoned")
            .insert(
                handle.id,
                MemorySlot {
                    status,
                    transfer: None,
                    token: CancellationToken::new(),
                },
            );
    }

    /// Manual mode: report `bytes` written for a handle, writing that prefix
    /// of the content to the `.part` file.
    pub fn advance(&self, handle_id: &str, bytes: u64) -> Result<()> {
        let (handle, target) = self.shared.slot_target(handle_id)?;
        let content = self.shared.content_for(&target.coordinate, &target.file);
        let bytes = bytes.min(content.len() as u64);

        let dest = transfer_destination(&target.dest_dir, &target.file.path)?;
        write_file(&part_path(&dest), &content[..bytes as usize])?;

        self.shared.set_progress(&handle, TransferState::Active, bytes);
        self.shared.emit(TransferEvent::Progress {
            handle,
            bytes_written: bytes,
            total_bytes: content.len() as u64,
        });
        Ok(())
    }

    /// Manual mode: finish a handle's file. Does not announce the session.
    pub fn complete(&self, handle_id: &str) -> Result<()> {
        let (handle, target) = self.shared.slot_target(handle_id)?;
        let content = self.shared.content_for(&target.coordinate, &target.file);

        let dest = transfer_destination(&target.dest_dir, &target.file.path)?;
        write_file(&dest, &content)?;
        let _ = std::fs::remove_file(part_path(&dest));

        let total = content.len() as u64;
        self.shared.set_progress(&handle, TransferState::Completed, total);
        self.shared.emit(TransferEvent::Progress {
            handle: handle.clone(),
            bytes_written: total,
            total_bytes: total,
        });
        self.shared.emit(TransferEvent::FileFinished {
            handle,
            state: TransferState::Completed,
        });
        Ok(())
    }

    /// Manual mode: fail a handle with `error`.
    pub fn fail(&self, handle_id: &str, error: FetchError) -> Result<()> {
        let handle = {
            let mut slots = self.shared.slots.lock().expect("transfer table lock poisoned");
            let slot = slots
                .get_mut(handle_id)
                .ok_or_else(|| FetchError::Other(format!("unknown transfer {}", handle_id)))?;
            slot.status.state = TransferState::Failed;
            slot.status.error = Some(Arc::new(error));
            slot.status.estimated_time_remaining = None;
            slot.status.handle.clone()
        };
        self.shared.emit(TransferEvent::FileFinished {
            handle,
            state: TransferState::Failed,
        });
        Ok(())
    }

    /// Announce that a session has finished, as the platform callback would.
    pub fn finish_session(&self, session_identifier: &str) {
        self.shared.emit(TransferEvent::SessionFinished {
            session_identifier: session_identifier.to_string(),
        });
    }

    /// Manual mode: complete every handle of a session, then announce it.
    pub fn complete_session(&self, session_identifier: &str) -> Result<()> {
        let ids = self
            .shared
            .sessions
            .lock()
            .expect("session table lock poisoned")
            .get(session_identifier)
            .cloned()
            .unwrap_or_default();
        for id in ids {
            self.complete(&id)?;
        }
        self.finish_session(session_identifier);
        Ok(())
    }
}

impl MemoryShared {
    fn content_for(&self, coordinate: &str, file: &RemoteFile) -> Arc<Vec<u8>> {
        let key = (coordinate.to_string(), file.path.clone());
        if let Some(bytes) = self
            .contents
            .lock()
            .expect("content table lock poisoned")
            .get(&key)
        {
            return Arc::clone(bytes);
        }
        Arc::new((0..file.size).map(|i| (i % 251) as u8).collect())
    }

    fn slot_target(&self, handle_id: &str) -> Result<(BackgroundDownloadHandle, SlotTarget)> {
        let slots = self.slots.lock().expect("transfer table lock poisoned");
        let slot = slots
            .get(handle_id)
            .ok_or_else(|| FetchError::Other(format!("unknown transfer {}", handle_id)))?;
        let target = slot
            .transfer
            .clone()
            .ok_or_else(|| FetchError::Other(format!("transfer {} has no file", handle_id)))?;
        Ok((slot.status.handle.clone(), target))
    }

    fn set_progress(&self, handle: &BackgroundDownloadHandle, state: TransferState, bytes: u64) {
        let mut slots = self.slots.lock().expect("transfer table lock poisoned");
        if let Some(slot) = slots.get_mut(&handle.id) {
            slot.status.state = state;
            slot.status.progress.bytes_written = bytes;
            let remaining = slot.status.progress.total_bytes.saturating_sub(bytes);
            slot.status.estimated_time_remaining = if state.is_terminal() || remaining == 0 {
                Some(Duration::ZERO)
            } else {
                None
            };
        }
    }

    fn is_live(&self, handle_id: &str, token: &CancellationToken) -> bool {
        !token.is_cancelled()
            && self
                .slots
                .lock()
                .expect("transfer table lock poisoned")
                .contains_key(handle_id)
    }

    fn session_finished(&self, session_identifier: &str) -> bool {
        let sessions = self.sessions.lock().expect("session table lock poisoned");
        let slots = self.slots.lock().expect("transfer table lock poisoned");
        sessions.get(session_identifier).is_some_and(|ids| {
            ids.iter()
                .all(|id| slots.get(id).is_some_and(|s| s.status.state.is_terminal()))
        })
    }

    fn emit(&self, event: TransferEvent) {
        let _ = self.events.send(event);
    }
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| FetchError::io_with_path(e, parent))?;
    }
    let mut file = std::fs::File::create(path).map_err(|e| FetchError::io_with_path(e, path))?;
    file.write_all(bytes)
        .map_err(|e| FetchError::io_with_path(e, path))
}

#[async_trait]
impl TransferBackend for MemoryTransferBackend {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn enqueue(&self, request: TransferRequest) -> Result<()> {
        debug!(
            "Memory backend enqueued {} transfers for session {}",
            request.transfers.len(),
            request.session_identifier
        );
        self.shared
            .requests
            .lock()
            .expect("request log lock poisoned")
            .push(request.clone());
        self.shared
            .sessions
            .lock()
            .expect("session table lock poisoned")
            .insert(
                request.session_identifier.clone(),
                request.transfers.iter().map(|t| t.handle.id.clone()).collect(),
            );

        for transfer in &request.transfers {
            let token = CancellationToken::new();
            let target = SlotTarget {
                coordinate: request.coordinate.clone(),
                dest_dir: request.dest_dir.clone(),
                file: transfer.file.clone(),
            };
            let resumed = super::bytes_on_disk(&request.dest_dir, &transfer.file);
            let mut status = BackgroundDownloadStatus::queued(
                transfer.handle.clone(),
                self.shared
                    .content_for(&request.coordinate, &transfer.file)
                    .len() as u64,
            );
            status.progress.bytes_written = resumed.min(status.progress.total_bytes);

            let previous = self
                .shared
                .slots
                .lock()
                .expect("transfer table lock poisoned")
                .insert(
                    transfer.handle.id.clone(),
                    MemorySlot {
                        status,
                        transfer: Some(target.clone()),
                        token: token.clone(),
                    },
                );
            if let Some(previous) = previous {
                previous.token.cancel();
            }

            if self.shared.mode == MemoryTransferMode::Automatic {
                let shared = Arc::clone(&self.shared);
                let handle = transfer.handle.clone();
                tokio::spawn(async move {
                    run_automatic(shared, handle, target, token).await;
                });
            }
        }
        Ok(())
    }

    async fn cancel(&self, handle: &BackgroundDownloadHandle) {
        let removed = self
            .shared
            .slots
            .lock()
            .expect("transfer table lock poisoned")
            .remove(&handle.id);
        if let Some(slot) = removed {
            slot.token.cancel();
        }
    }

    async fn poll_status(&self) -> Vec<BackgroundDownloadStatus> {
        self.shared
            .slots
            .lock()
            .expect("transfer table lock poisoned")
            .values()
            .map(|slot| slot.status.clone())
            .collect()
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransferEvent>> {
        self.events_rx.lock().expect("event receiver lock poisoned").take()
    }
}

async fn run_automatic(
    shared: Arc<MemoryShared>,
    handle: BackgroundDownloadHandle,
    target: SlotTarget,
    token: CancellationToken,
) {
    let result = stream_into_place(&shared, &handle, &target, &token).await;
    if !shared.is_live(&handle.id, &token) {
        return;
    }

    let state = match result {
        Ok(()) => TransferState::Completed,
        Err(e) => {
            let mut slots = shared.slots.lock().expect("transfer table lock poisoned");
            if let Some(slot) = slots.get_mut(&handle.id) {
                slot.status.state = TransferState::Failed;
                slot.status.error = Some(Arc::new(e));
            }
            TransferState::Failed
        }
    };

    shared.emit(TransferEvent::FileFinished {
        handle: handle.clone(),
        state,
    });
    if shared.session_finished(&handle.session_identifier) {
        shared.emit(TransferEvent::SessionFinished {
            session_identifier: handle.session_identifier.clone(),
        });
    }
}

async fn stream_into_place(
    shared: &MemoryShared,
    handle: &BackgroundDownloadHandle,
    target: &SlotTarget,
    token: &CancellationToken,
) -> Result<()> {
    let content = shared.content_for(&target.coordinate, &target.file);
    let total = content.len() as u64;
    let dest = transfer_destination(&target.dest_dir, &target.file.path)?;
    let part = part_path(&dest);
    let fail_with = shared
        .failures
        .lock()
        .expect("failure table lock poisoned")
        .get(&(target.coordinate.clone(), target.file.path.clone()))
        .cloned();

    if std::fs::metadata(&dest).map(|m| m.len() == total).unwrap_or(false) {
        shared.set_progress(handle, TransferState::Completed, total);
        emit_progress(shared, handle, token, total, total);
        return Ok(());
    }

    let mut written = std::fs::metadata(&part)
        .map(|m| m.len())
        .unwrap_or(0)
        .min(total);
    write_file(&part, &content[..written as usize])?;

    while written < total {
        tokio::task::yield_now().await;
        if !shared.is_live(&handle.id, token) {
            return Err(FetchError::DownloadCancelled);
        }
        if let Some(ref message) = fail_with {
            if written >= total / 2 {
                return Err(FetchError::DownloadFailed {
                    url: format!("memory://{}/{}", target.coordinate, target.file.path),
                    message: message.clone(),
                });
            }
        }

        let end = (written + shared.chunk_size as u64).min(total);
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(&part)
            .map_err(|e| FetchError::io_with_path(e, &part))?;
        file.write_all(&content[written as usize..end as usize])
            .map_err(|e| FetchError::io_with_path(e, &part))?;
        written = end;

        shared.set_progress(handle, TransferState::Active, written);
        emit_progress(shared, handle, token, written, total);
    }

    std::fs::rename(&part, &dest).map_err(|e| FetchError::io_with_path(e, &dest))?;
    shared.set_progress(handle, TransferState::Completed, total);
    emit_progress(shared, handle, token, total, total);
    Ok(())
}

fn emit_progress(
    shared: &MemoryShared,
    handle: &BackgroundDownloadHandle,
    token: &CancellationToken,
    bytes_written: u64,
    total_bytes: u64,
) {
    if token.is_cancelled() {
        return;
    }
    shared.emit(TransferEvent::Progress {
        handle: handle.clone(),
        bytes_written,
        total_bytes,
    });
}
