//! Transfer backends.
//!
//! A backend moves bytes for individual files and reports back through a
//! status table and an event channel. It knows nothing about model state;
//! the session manager and orchestrator map transfer-level state onto
//! [`DownloadState`](crate::model_library::DownloadState).

mod http;
mod memory;

pub use http::HttpTransferBackend;
pub use memory::{MemoryTransferBackend, MemoryTransferMode};

use crate::config::NetworkConfig;
use crate::error::{FetchError, Result};
use crate::model_library::RemoteFile;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Durable link between a model download and one file transfer.
///
/// Every handle of one download attempt shares a `session_identifier`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackgroundDownloadHandle {
    pub id: String,
    pub model_id: String,
    pub backend: String,
    pub session_identifier: String,
}

impl BackgroundDownloadHandle {
    pub fn new(model_id: &str, backend: &str, session_identifier: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            model_id: model_id.to_string(),
            backend: backend.to_string(),
            session_identifier: session_identifier.to_string(),
        }
    }
}

/// Transfer-level state, distinct from the model's lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransferState {
    Queued,
    Active,
    Paused,
    Completed,
    Failed,
}

impl TransferState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferState::Completed | TransferState::Failed)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferProgress {
    pub bytes_written: u64,
    pub total_bytes: u64,
}

/// Point-in-time view of one transfer.
#[derive(Debug, Clone)]
pub struct BackgroundDownloadStatus {
    pub handle: BackgroundDownloadHandle,
    pub state: TransferState,
    pub progress: TransferProgress,
    pub error: Option<Arc<FetchError>>,
    pub estimated_time_remaining: Option<Duration>,
}

impl BackgroundDownloadStatus {
    pub fn queued(handle: BackgroundDownloadHandle, total_bytes: u64) -> Self {
        Self {
            handle,
            state: TransferState::Queued,
            progress: TransferProgress {
                bytes_written: 0,
                total_bytes,
            },
            error: None,
            estimated_time_remaining: None,
        }
    }
}

/// One file to fetch under a handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileTransfer {
    pub handle: BackgroundDownloadHandle,
    pub file: RemoteFile,
}

/// Everything a backend needs to (re)start a session's transfers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub session_identifier: String,
    pub coordinate: String,
    pub dest_dir: PathBuf,
    pub transfers: Vec<FileTransfer>,
}

/// Notifications from a backend. Progress byte counts are cumulative per handle.
#[derive(Debug, Clone)]
pub enum TransferEvent {
    Progress {
        handle: BackgroundDownloadHandle,
        bytes_written: u64,
        total_bytes: u64,
    },
    FileFinished {
        handle: BackgroundDownloadHandle,
        state: TransferState,
    },
    /// Every handle enqueued under the session has reached a terminal state.
    SessionFinished { session_identifier: String },
}

/// Resumable file transfer service.
#[async_trait]
pub trait TransferBackend: Send + Sync {
    /// Short name recorded in handles.
    fn kind(&self) -> &'static str;

    /// Start (or restart) the transfers in `request`. Partial data already on
    /// disk for a handle's file is resumed rather than discarded.
    async fn enqueue(&self, request: TransferRequest) -> Result<()>;

    /// Stop a transfer and forget its status. Partial data stays on disk.
    async fn cancel(&self, handle: &BackgroundDownloadHandle);

    /// Status of every transfer the backend currently knows about.
    async fn poll_status(&self) -> Vec<BackgroundDownloadStatus>;

    /// Take the event receiver. Only the first call returns it.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransferEvent>>;
}

/// Where a repository file lands under `dest_dir`.
///
/// Repository paths are `/`-separated and must stay inside `dest_dir`.
pub fn transfer_destination(dest_dir: &Path, remote_path: &str) -> Result<PathBuf> {
    let relative = Path::new(remote_path);
    let escapes = relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if remote_path.is_empty() || escapes {
        return Err(FetchError::InvalidLocation(format!(
            "repository path escapes the model directory: {}",
            remote_path
        )));
    }
    Ok(dest_dir.join(relative))
}

/// `<dest>.part`
pub fn part_path(dest: &Path) -> PathBuf {
    let mut name = OsString::from(dest.as_os_str());
    name.push(NetworkConfig::DOWNLOAD_TEMP_SUFFIX);
    PathBuf::from(name)
}

/// Bytes of `file` already on disk: the finished file if present, else its
/// `.part` file.
pub fn bytes_on_disk(dest_dir: &Path, file: &RemoteFile) -> u64 {
    let Ok(dest) = transfer_destination(dest_dir, &file.path) else {
        return 0;
    };
    if let Ok(meta) = std::fs::metadata(&dest) {
        return meta.len();
    }
    std::fs::metadata(part_path(&dest))
        .map(|m| m.len())
        .unwrap_or(0)
}

/// Remaining time at the observed rate, if there is a rate to speak of.
pub(crate) fn estimate_remaining(
    transferred_since_start: u64,
    elapsed: Duration,
    remaining_bytes: u64,
) -> Option<Duration> {
    if remaining_bytes == 0 {
        return Some(Duration::ZERO);
    }
    let secs = elapsed.as_secs_f64();
    if transferred_since_start == 0 || secs <= 0.0 {
        return None;
    }
    let rate = transferred_since_start as f64 / secs;
    Some(Duration::from_secs_f64(remaining_bytes as f64 / rate))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_transfer_destination_rejects_escapes() {
        let root = Path::new("/models/org--model");
        assert_eq!(
            transfer_destination(root, "unet/config.json").unwrap(),
            root.join("unet/config.json")
        );
        assert!(transfer_destination(root, "../outside").is_err());
        assert!(transfer_destination(root, "/etc/passwd").is_err());
        assert!(transfer_destination(root, "").is_err());
    }

    #[test]
    fn test_part_path_appends_suffix() {
        assert_eq!(
            part_path(Path::new("/m/model.safetensors")),
            PathBuf::from("/m/model.safetensors.part")
        );
    }

    #[test]
    fn test_bytes_on_disk_prefers_finished_file() {
        let tmp = TempDir::new().unwrap();
        let file = RemoteFile::new("weights.bin", 10);
        assert_eq!(bytes_on_disk(tmp.path(), &file), 0);

        std::fs::write(tmp.path().join("weights.bin.part"), b"abc").unwrap();
        assert_eq!(bytes_on_disk(tmp.path(), &file), 3);

        std::fs::write(tmp.path().join("weights.bin"), b"0123456789").unwrap();
        assert_eq!(bytes_on_disk(tmp.path(), &file), 10);
    }

    #[test]
    fn test_estimate_remaining() {
        assert_eq!(
            estimate_remaining(100, Duration::from_secs(1), 300),
            Some(Duration::from_secs(3))
        );
        assert_eq!(estimate_remaining(0, Duration::from_secs(1), 300), None);
        assert_eq!(
            estimate_remaining(0, Duration::ZERO, 0),
            Some(Duration::ZERO)
        );
    }
}
