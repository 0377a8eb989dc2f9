//! HTTP transfer backend with `.part` files and Range resume.

use super::{
    estimate_remaining, part_path, transfer_destination, BackgroundDownloadHandle,
    BackgroundDownloadStatus, FileTransfer, TransferBackend, TransferEvent, TransferProgress,
    TransferRequest, TransferState,
};
use crate::cancel::CancellationToken;
use crate::config::NetworkConfig;
use crate::error::{FetchError, Result};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Minimum bytes between progress events for one transfer.
const PROGRESS_EVENT_STRIDE: u64 = 1 << 20;

struct TransferSlot {
    status: BackgroundDownloadStatus,
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
    started_at: Option<Instant>,
    resumed_from: u64,
}

struct Shared {
    client: Client,
    base_url: String,
    revision: String,
    auth_token: Option<String>,
    semaphore: Arc<Semaphore>,
    slots: Mutex<HashMap<String, TransferSlot>>,
    sessions: Mutex<HashMap<String, Vec<String>>>,
    events: mpsc::UnboundedSender<TransferEvent>,
}

/// [`TransferBackend`] that downloads from the model hub's `resolve` endpoint.
pub struct HttpTransferBackend {
    shared: Arc<Shared>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<TransferEvent>>>,
}

impl HttpTransferBackend {
    pub fn new(
        base_url: impl Into<String>,
        revision: impl Into<String>,
        max_concurrent_transfers: usize,
    ) -> Result<Self> {
        // No overall timeout: large files legitimately take hours.
        let client = Client::builder()
            .connect_timeout(NetworkConfig::CONNECT_TIMEOUT)
            .user_agent(NetworkConfig::USER_AGENT)
            .build()
            .map_err(|e| FetchError::Network {
                message: format!("Failed to create HTTP client: {}", e),
                cause: None,
            })?;

        let (tx, rx) = mpsc::unbounded_channel();
        Ok(Self {
            shared: Arc::new(Shared {
                client,
                base_url: base_url.into().trim_end_matches('/').to_string(),
                revision: revision.into(),
                auth_token: None,
                semaphore: Arc::new(Semaphore::new(max_concurrent_transfers.max(1))),
                slots: Mutex::new(HashMap::new()),
                sessions: Mutex::new(HashMap::new()),
                events: tx,
            }),
            events_rx: Mutex::new(Some(rx)),
        })
    }

    /// Attach a bearer token for gated repositories. Must be called before
    /// the backend is shared.
    pub fn with_auth_token(mut self, token: Option<String>) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.auth_token = token.map(|t| t.trim().to_string()).filter(|t| !t.is_empty());
        }
        self
    }

    fn stop_slot(slot: TransferSlot) {
        slot.token.cancel();
        if let Some(task) = slot.task {
            task.abort();
        }
    }
}

impl Shared {
    fn resolve_url(&self, coordinate: &str, remote_path: &str) -> String {
        let encoded: Vec<String> = remote_path
            .split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect();
        format!(
            "{}/{}/resolve/{}/{}",
            self.base_url,
            coordinate,
            urlencoding::encode(&self.revision),
            encoded.join("/")
        )
    }

    /// Apply `f` to the slot for `handle` unless the transfer was cancelled.
    fn update_slot(
        &self,
        handle_id: &str,
        token: &CancellationToken,
        f: impl FnOnce(&mut TransferSlot),
    ) -> bool {
        if token.is_cancelled() {
            return false;
        }
        let mut slots = self.slots.lock().expect("transfer table lock poisoned");
        match slots.get_mut(handle_id) {
            Some(slot) => {
                f(slot);
                true
            }
            None => false,
        }
    }

    fn session_finished(&self, session_identifier: &str) -> bool {
        let sessions = self.sessions.lock().expect("session table lock poisoned");
        let slots = self.slots.lock().expect("transfer table lock poisoned");
        sessions.get(session_identifier).is_some_and(|ids| {
            ids.iter().all(|id| {
                slots
                    .get(id)
                    .is_some_and(|slot| slot.status.state.is_terminal())
            })
        })
    }

    fn emit(&self, event: TransferEvent) {
        // Receiver gone means nobody is listening any more.
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl TransferBackend for HttpTransferBackend {
    fn kind(&self) -> &'static str {
        "http"
    }

    async fn enqueue(&self, request: TransferRequest) -> Result<()> {
        tokio::fs::create_dir_all(&request.dest_dir)
            .await
            .map_err(|e| FetchError::io_with_path(e, &request.dest_dir))?;

        {
            let mut sessions = self.shared.sessions.lock().expect("session table lock poisoned");
            sessions.insert(
                request.session_identifier.clone(),
                request.transfers.iter().map(|t| t.handle.id.clone()).collect(),
            );
        }

        info!(
            "Enqueueing {} transfers for {} (session {})",
            request.transfers.len(),
            request.coordinate,
            request.session_identifier
        );

        for transfer in request.transfers {
            let token = CancellationToken::new();
            let previous = {
                let mut slots = self.shared.slots.lock().expect("transfer table lock poisoned");
                slots.insert(
                    transfer.handle.id.clone(),
                    TransferSlot {
                        status: BackgroundDownloadStatus::queued(
                            transfer.handle.clone(),
                            transfer.file.size,
                        ),
                        token: token.clone(),
                        task: None,
                        started_at: None,
                        resumed_from: 0,
                    },
                )
            };
            if let Some(previous) = previous {
                Self::stop_slot(previous);
            }

            let shared = Arc::clone(&self.shared);
            let coordinate = request.coordinate.clone();
            let dest_dir = request.dest_dir.clone();
            let handle_id = transfer.handle.id.clone();
            let task_token = token.clone();
            let task = tokio::spawn(async move {
                run_transfer(shared, coordinate, dest_dir, transfer, task_token).await;
            });

            let mut slots = self.shared.slots.lock().expect("transfer table lock poisoned");
            match slots.get_mut(&handle_id) {
                Some(slot) if !token.is_cancelled() => slot.task = Some(task),
                _ => task.abort(),
            }
        }

        Ok(())
    }

    async fn cancel(&self, handle: &BackgroundDownloadHandle) {
        let slot = self
            .shared
            .slots
            .lock()
            .expect("transfer table lock poisoned")
            .remove(&handle.id);
        if let Some(slot) = slot {
            debug!("Cancelling transfer {} for {}", handle.id, handle.model_id);
            Self::stop_slot(slot);
        }
    }

    async fn poll_status(&self) -> Vec<BackgroundDownloadStatus> {
        let now = Instant::now();
        let slots = self.shared.slots.lock().expect("transfer table lock poisoned");
        slots
            .values()
            .map(|slot| {
                let mut status = slot.status.clone();
                if status.state == TransferState::Active {
                    let progress = status.progress;
                    status.estimated_time_remaining = slot.started_at.and_then(|started| {
                        estimate_remaining(
                            progress.bytes_written.saturating_sub(slot.resumed_from),
                            now.duration_since(started),
                            progress.total_bytes.saturating_sub(progress.bytes_written),
                        )
                    });
                }
                status
            })
            .collect()
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransferEvent>> {
        self.events_rx.lock().expect("event receiver lock poisoned").take()
    }
}

async fn run_transfer(
    shared: Arc<Shared>,
    coordinate: String,
    dest_dir: PathBuf,
    transfer: FileTransfer,
    token: CancellationToken,
) {
    let FileTransfer { handle, file } = transfer;

    let permit = tokio::select! {
        permit = Arc::clone(&shared.semaphore).acquire_owned() => permit,
        _ = token.cancelled() => return,
    };
    let Ok(_permit) = permit else {
        return;
    };

    let url = shared.resolve_url(&coordinate, &file.path);
    let result = match transfer_destination(&dest_dir, &file.path) {
        Ok(dest) => download_file(&shared, &handle, &url, &dest, file.size, &token).await,
        Err(e) => Err(e),
    };

    let state = match result {
        Ok(bytes) => {
            shared.update_slot(&handle.id, &token, |slot| {
                slot.status.state = TransferState::Completed;
                slot.status.progress.bytes_written = bytes;
                slot.status.progress.total_bytes = slot.status.progress.total_bytes.max(bytes);
                slot.status.estimated_time_remaining = Some(std::time::Duration::ZERO);
            });
            TransferState::Completed
        }
        Err(FetchError::DownloadCancelled) => return,
        Err(e) => {
            error!("Transfer of {}/{} failed: {}", coordinate, file.path, e);
            let error = Arc::new(e);
            shared.update_slot(&handle.id, &token, |slot| {
                slot.status.state = TransferState::Failed;
                slot.status.error = Some(error);
                slot.status.estimated_time_remaining = None;
            });
            TransferState::Failed
        }
    };

    if token.is_cancelled() {
        return;
    }
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

/// Fetch one file into `dest`, resuming from `<dest>.part`. Returns the final size.
async fn download_file(
    shared: &Shared,
    handle: &BackgroundDownloadHandle,
    url: &str,
    dest: &Path,
    expected_size: u64,
    token: &CancellationToken,
) -> Result<u64> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| FetchError::io_with_path(e, parent))?;
    }

    // Finished on a previous run.
    if let Ok(meta) = tokio::fs::metadata(dest).await {
        if expected_size == 0 || meta.len() == expected_size {
            info!("Skipping already-downloaded file {}", dest.display());
            report_progress(shared, handle, token, meta.len(), meta.len());
            return Ok(meta.len());
        }
    }

    let part = part_path(dest);
    let mut resume_from = tokio::fs::metadata(&part).await.map(|m| m.len()).unwrap_or(0);
    if expected_size > 0 && resume_from > expected_size {
        warn!("Discarding oversized partial file {}", part.display());
        let _ = tokio::fs::remove_file(&part).await;
        resume_from = 0;
    }
    if expected_size > 0 && resume_from == expected_size {
        finalize(&part, dest).await?;
        report_progress(shared, handle, token, expected_size, expected_size);
        return Ok(expected_size);
    }

    shared.update_slot(&handle.id, token, |slot| {
        slot.status.state = TransferState::Active;
        slot.status.progress.bytes_written = resume_from;
        slot.started_at = Some(Instant::now());
        slot.resumed_from = resume_from;
    });

    let mut request = shared.client.get(url);
    if let Some(ref token) = shared.auth_token {
        request = request.bearer_auth(token);
    }
    if resume_from > 0 {
        request = request.header(reqwest::header::RANGE, format!("bytes={}-", resume_from));
        info!("Resuming {} from byte {}", dest.display(), resume_from);
    }

    let response = tokio::select! {
        response = request.send() => response.map_err(|e| FetchError::Network {
            message: format!("Download request failed: {}", e),
            cause: Some(e.to_string()),
        })?,
        _ = token.cancelled() => return Err(FetchError::DownloadCancelled),
    };

    let status = response.status();
    if !status.is_success() {
        return Err(FetchError::DownloadFailed {
            url: url.to_string(),
            message: format!("HTTP {}", status),
        });
    }

    let is_resuming = resume_from > 0 && status == reqwest::StatusCode::PARTIAL_CONTENT;
    if resume_from > 0 && !is_resuming {
        warn!("Server ignored the Range request, restarting {}", dest.display());
    }

    let file_total = if expected_size > 0 {
        expected_size
    } else {
        let body = response.content_length().unwrap_or(0);
        if is_resuming {
            resume_from + body
        } else {
            body
        }
    };

    let mut out = if is_resuming {
        tokio::fs::OpenOptions::new()
            .append(true)
            .open(&part)
            .await
            .map_err(|e| FetchError::io_with_path(e, &part))?
    } else {
        tokio::fs::File::create(&part)
            .await
            .map_err(|e| FetchError::io_with_path(e, &part))?
    };

    let mut written: u64 = if is_resuming { resume_from } else { 0 };
    let mut last_reported = written;
    report_progress(shared, handle, token, written, file_total);

    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        if token.is_cancelled() {
            // Keep the partial file for the next attempt.
            out.flush().await.ok();
            return Err(FetchError::DownloadCancelled);
        }

        let chunk = chunk.map_err(|e| FetchError::Network {
            message: format!("Download stream error: {}", e),
            cause: Some(e.to_string()),
        })?;
        out.write_all(&chunk)
            .await
            .map_err(|e| FetchError::io_with_path(e, &part))?;
        written += chunk.len() as u64;

        if written - last_reported >= PROGRESS_EVENT_STRIDE {
            last_reported = written;
            report_progress(shared, handle, token, written, file_total);
        }
    }

    out.flush()
        .await
        .map_err(|e| FetchError::io_with_path(e, &part))?;
    out.sync_all()
        .await
        .map_err(|e| FetchError::io_with_path(e, &part))?;
    drop(out);

    if file_total > 0 && written != file_total {
        return Err(FetchError::Network {
            message: format!(
                "Incomplete download of {}: got {} of {} bytes",
                dest.display(),
                written,
                file_total
            ),
            cause: None,
        });
    }

    finalize(&part, dest).await?;
    report_progress(shared, handle, token, written, written.max(file_total));
    Ok(written)
}

async fn finalize(part: &Path, dest: &Path) -> Result<()> {
    tokio::fs::rename(part, dest)
        .await
        .map_err(|e| FetchError::io_with_path(e, dest))
}

fn report_progress(
    shared: &Shared,
    handle: &BackgroundDownloadHandle,
    token: &CancellationToken,
    bytes_written: u64,
    total_bytes: u64,
) {
    let updated = shared.update_slot(&handle.id, token, |slot| {
        slot.status.progress = TransferProgress {
            bytes_written,
            total_bytes,
        };
    });
    if updated {
        shared.emit(TransferEvent::Progress {
            handle: handle.clone(),
            bytes_written,
            total_bytes,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model_library::RemoteFile;
    use tempfile::TempDir;

    fn backend() -> HttpTransferBackend {
        HttpTransferBackend::new("https://huggingface.co/", "main", 2).unwrap()
    }

    #[test]
    fn test_resolve_url_encodes_segments() {
        let backend = backend();
        assert_eq!(
            backend
                .shared
                .resolve_url("org/model", "sub dir/model #1.safetensors"),
            "https://huggingface.co/org/model/resolve/main/sub%20dir/model%20%231.safetensors"
        );
    }

    #[test]
    fn test_auth_token_is_trimmed() {
        let backend = backend().with_auth_token(Some(" hf_abc ".to_string()));
        assert_eq!(backend.shared.auth_token.as_deref(), Some("hf_abc"));
    }

    #[test]
    fn test_events_taken_once() {
        let backend = backend();
        assert!(backend.take_events().is_some());
        assert!(backend.take_events().is_none());
    }

    #[tokio::test]
    async fn test_finished_file_is_skipped_without_network() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("config.json"), b"{}").unwrap();

        let backend = backend();
        let mut events = backend.take_events().unwrap();
        let handle = BackgroundDownloadHandle::new("org/model", "http", "session-1");
        backend
            .enqueue(TransferRequest {
                session_identifier: "session-1".to_string(),
                coordinate: "org/model".to_string(),
                dest_dir: tmp.path().to_path_buf(),
                transfers: vec![FileTransfer {
                    handle: handle.clone(),
                    file: RemoteFile::new("config.json", 2),
                }],
            })
            .await
            .unwrap();

        let mut finished = false;
        while let Some(event) = events.recv().await {
            if let TransferEvent::SessionFinished { session_identifier } = event {
                assert_eq!(session_identifier, "session-1");
                finished = true;
                break;
            }
        }
        assert!(finished);

        let statuses = backend.poll_status().await;
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].state, TransferState::Completed);
        assert_eq!(statuses[0].progress.bytes_written, 2);
    }

    #[tokio::test]
    async fn test_cancel_forgets_status() {
        let tmp = TempDir::new().unwrap();
        let backend = backend();
        let handle = BackgroundDownloadHandle::new("org/model", "http", "session-2");
        // The path escapes the destination so the task fails without I/O.
        // Cancel must drop the slot whether or not the task got there first.
        backend
            .enqueue(TransferRequest {
                session_identifier: "session-2".to_string(),
                coordinate: "org/model".to_string(),
                dest_dir: tmp.path().to_path_buf(),
                transfers: vec![FileTransfer {
                    handle: handle.clone(),
                    file: RemoteFile::new("../escape.bin", 1),
                }],
            })
            .await
            .unwrap();

        backend.cancel(&handle).await;
        assert!(backend.poll_status().await.is_empty());
    }
}
