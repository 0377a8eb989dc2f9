//! Error types for the model download engine.
//!
//! The variants follow the engine's failure taxonomy: transfer failures that a
//! caller may retry, resource exhaustion that needs user action, archive
//! corruption that needs a fresh download, and internal invariant violations.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the download engine.
#[derive(Debug, Error)]
pub enum FetchError {
    // Network errors
    #[error("Network error: {message}")]
    Network {
        message: String,
        /// Optional cause description
        cause: Option<String>,
    },

    #[error("Request timeout after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Download failed for {url}: {message}")]
    DownloadFailed { url: String, message: String },

    // Resource errors
    #[error("Insufficient storage: need {required} bytes, {available} available")]
    InsufficientStorage { required: u64, available: u64 },

    #[error("Insufficient memory: model needs {required} bytes, device has {available}")]
    InsufficientMemory { required: u64, available: u64 },

    // Archive errors
    #[error("Corrupt archive {path:?}: {message}")]
    ArchiveCorrupt { path: PathBuf, message: String },

    #[error("Could not find a free name for {0}")]
    FilenameCollisionUnresolved(PathBuf),

    // Session errors
    #[error("Unknown background session: {session_identifier}")]
    SessionMismatch { session_identifier: String },

    #[error("Background sessions have not been resumed yet")]
    NotResumed,

    // File system errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Model lifecycle errors
    #[error("Model not found: {model_id}")]
    ModelNotFound { model_id: String },

    #[error("No remote files of {model_id} match the file filter")]
    NoMatchingFiles { model_id: String },

    #[error("A download is already in progress for {model_id}")]
    DownloadInProgress { model_id: String },

    #[error("Model already downloaded: {model_id}")]
    AlreadyDownloaded { model_id: String },

    #[error("Cannot {command} {model_id} while it is {state}")]
    InvalidTransition {
        model_id: String,
        command: &'static str,
        state: String,
    },

    #[error("Download cancelled")]
    DownloadCancelled,

    // Input errors
    #[error("Invalid glob pattern {pattern:?}: {message}")]
    InvalidPattern { pattern: String, message: String },

    #[error("Invalid model location: {0}")]
    InvalidLocation(String),

    #[error("Configuration error: {message}")]
    Config { message: String },

    // Generic errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, FetchError>;

/// Coarse grouping of errors for observers deciding how to present a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Transfer failed; a fresh `start` may succeed.
    Network,
    /// Disk or memory exhausted; user action required.
    Resources,
    /// Payload unusable; re-download required.
    Archive,
    /// Caller issued a command the current state does not allow.
    Lifecycle,
    /// Local filesystem or serialization failure.
    Storage,
    /// Engine invariant violated or unclassified.
    Internal,
}

// Conversion implementations for common error types

impl From<std::io::Error> for FetchError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::StorageFull {
            return FetchError::InsufficientStorage {
                required: 0,
                available: 0,
            };
        }
        FetchError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for FetchError {
    fn from(err: serde_json::Error) -> Self {
        FetchError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout(std::time::Duration::from_secs(0))
        } else {
            FetchError::Network {
                message: err.to_string(),
                cause: Some(err.to_string()),
            }
        }
    }
}

impl From<zip::result::ZipError> for FetchError {
    fn from(err: zip::result::ZipError) -> Self {
        match err {
            zip::result::ZipError::Io(io) => FetchError::from(io),
            other => FetchError::ArchiveCorrupt {
                path: PathBuf::new(),
                message: other.to_string(),
            },
        }
    }
}

impl From<walkdir::Error> for FetchError {
    fn from(err: walkdir::Error) -> Self {
        let path = err.path().map(|p| p.to_path_buf());
        match err.into_io_error() {
            Some(io) => FetchError::io_with_path_opt(io, path),
            None => FetchError::Io {
                message: "filesystem loop detected".to_string(),
                path,
                source: None,
            },
        }
    }
}

impl FetchError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        Self::io_with_path_opt(err, Some(path.into()))
    }

    fn io_with_path_opt(err: std::io::Error, path: Option<PathBuf>) -> Self {
        if err.kind() == std::io::ErrorKind::StorageFull {
            return FetchError::InsufficientStorage {
                required: 0,
                available: 0,
            };
        }
        FetchError::Io {
            message: err.to_string(),
            path,
            source: Some(err),
        }
    }

    /// Check if this error should trigger a retry by the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FetchError::Network { .. } | FetchError::Timeout(_) | FetchError::DownloadFailed { .. }
        )
    }

    /// Classify the error for presentation.
    pub fn category(&self) -> ErrorCategory {
        match self {
            FetchError::Network { .. }
            | FetchError::Timeout(_)
            | FetchError::DownloadFailed { .. } => ErrorCategory::Network,

            FetchError::InsufficientStorage { .. } | FetchError::InsufficientMemory { .. } => {
                ErrorCategory::Resources
            }

            FetchError::ArchiveCorrupt { .. } => ErrorCategory::Archive,

            FetchError::ModelNotFound { .. }
            | FetchError::NoMatchingFiles { .. }
            | FetchError::DownloadInProgress { .. }
            | FetchError::AlreadyDownloaded { .. }
            | FetchError::InvalidTransition { .. }
            | FetchError::DownloadCancelled
            | FetchError::InvalidPattern { .. }
            | FetchError::InvalidLocation(_)
            | FetchError::NotResumed => ErrorCategory::Lifecycle,

            FetchError::Io { .. } | FetchError::Json { .. } | FetchError::Config { .. } => {
                ErrorCategory::Storage
            }

            FetchError::FilenameCollisionUnresolved(_)
            | FetchError::SessionMismatch { .. }
            | FetchError::Other(_) => ErrorCategory::Internal,
        }
    }

    /// Attach an archive path to an `ArchiveCorrupt` error produced without one.
    pub(crate) fn with_archive_path(self, archive: &std::path::Path) -> Self {
        match self {
            FetchError::ArchiveCorrupt { path, message } if path.as_os_str().is_empty() => {
                FetchError::ArchiveCorrupt {
                    path: archive.to_path_buf(),
                    message,
                }
            }
            other => other,
        }
    }
}
