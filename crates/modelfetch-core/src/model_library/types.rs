//! Core data model shared by the download engine.

use crate::error::{FetchError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Where a model's files live.
///
/// Fixed for the lifetime of a download attempt.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ModelLocation {
    /// A repository coordinate on the model hub, e.g. `mlx-community/Qwen3-1.7B-4bit`.
    Remote { coordinate: String },
    /// A file or directory already on this machine.
    Local { path: PathBuf },
}

impl ModelLocation {
    pub fn remote(coordinate: impl Into<String>) -> Self {
        ModelLocation::Remote {
            coordinate: coordinate.into(),
        }
    }

    pub fn local(path: impl Into<PathBuf>) -> Self {
        ModelLocation::Local { path: path.into() }
    }

    /// Parse user input: absolute or dot-relative paths and `file://` URLs are
    /// local, anything else must look like an `owner/name` coordinate.
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        if let Some(path) = input.strip_prefix("file://") {
            return Ok(Self::local(path));
        }
        if input.starts_with('/') || input.starts_with("./") || input.starts_with("../") {
            return Ok(Self::local(input));
        }

        let mut parts = input.split('/');
        let valid = matches!(
            (parts.next(), parts.next(), parts.next()),
            (Some(owner), Some(name), None) if !owner.is_empty() && !name.is_empty()
        );
        if !valid || input.chars().any(char::is_whitespace) {
            return Err(FetchError::InvalidLocation(input.to_string()));
        }
        Ok(Self::remote(input))
    }

    /// Stable identifier of the model this location refers to.
    pub fn model_id(&self) -> String {
        match self {
            ModelLocation::Remote { coordinate } => coordinate.clone(),
            ModelLocation::Local { path } => path.to_string_lossy().into_owned(),
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, ModelLocation::Remote { .. })
    }
}

impl std::fmt::Display for ModelLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelLocation::Remote { coordinate } => write!(f, "{}", coordinate),
            ModelLocation::Local { path } => write!(f, "{}", path.display()),
        }
    }
}

/// Persisted lifecycle state of one model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum DownloadState {
    #[default]
    NotDownloaded,
    DownloadingActive,
    DownloadingPaused,
    Downloaded,
    /// Only persisted when the engine is configured to retain failures.
    Failed,
}

impl DownloadState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadState::NotDownloaded => "notDownloaded",
            DownloadState::DownloadingActive => "downloadingActive",
            DownloadState::DownloadingPaused => "downloadingPaused",
            DownloadState::Downloaded => "downloaded",
            DownloadState::Failed => "failed",
        }
    }

    /// Active or paused.
    pub fn is_in_progress(&self) -> bool {
        matches!(
            self,
            DownloadState::DownloadingActive | DownloadState::DownloadingPaused
        )
    }

    /// States whose on-disk data must survive incomplete-download cleanup.
    pub fn owns_files(&self) -> bool {
        self.is_in_progress() || *self == DownloadState::Downloaded
    }

    /// States from which a fresh attempt may start.
    pub fn can_start(&self) -> bool {
        matches!(self, DownloadState::NotDownloaded | DownloadState::Failed)
    }
}

impl std::fmt::Display for DownloadState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// Byte and file counters for one download attempt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadProgress {
    pub bytes_downloaded: u64,
    pub total_bytes: u64,
    pub files_completed: usize,
    pub total_files: usize,
    pub current_file_name: Option<String>,
}

impl DownloadProgress {
    /// Progress in `[0, 1]`. Empty payloads count as complete once every file is done.
    pub fn fraction(&self) -> f64 {
        if self.total_bytes == 0 {
            if self.total_files > 0 && self.files_completed >= self.total_files {
                return 1.0;
            }
            return 0.0;
        }
        (self.bytes_downloaded as f64 / self.total_bytes as f64).clamp(0.0, 1.0)
    }
}

/// One file of a remote repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteFile {
    /// Path relative to the repository root, `/`-separated.
    pub path: String,
    pub size: u64,
}

impl RemoteFile {
    pub fn new(path: impl Into<String>, size: u64) -> Self {
        Self {
            path: path.into(),
            size,
        }
    }

    /// Last path component.
    pub fn file_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    pub fn is_archive(&self) -> bool {
        is_zip_path(Path::new(&self.path))
    }
}

/// True for paths with a `.zip` extension (any case).
pub fn is_zip_path(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("zip"))
        .unwrap_or(false)
}

/// The persisted row for one model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelRecord {
    pub model_id: String,
    pub location: ModelLocation,
    pub state: DownloadState,
    /// Last forwarded progress fraction.
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub total_bytes: Option<u64>,
    /// Final on-disk location once downloaded.
    #[serde(default)]
    pub local_path: Option<PathBuf>,
    #[serde(default)]
    pub size_on_disk: Option<u64>,
    /// Only populated when failures are retained.
    #[serde(default)]
    pub last_error: Option<String>,
    pub updated_at: String,
}

impl ModelRecord {
    pub fn new(location: ModelLocation) -> Self {
        Self {
            model_id: location.model_id(),
            location,
            state: DownloadState::NotDownloaded,
            progress: 0.0,
            total_bytes: None,
            local_path: None,
            size_on_disk: None,
            last_error: None,
            updated_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}
