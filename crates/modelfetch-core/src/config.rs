//! Centralized configuration for the download engine.
//!
//! Compile-time constants live in unit structs grouped by concern. Runtime
//! settings live in [`EngineConfig`], which can be loaded from a JSON file.

use crate::error::{FetchError, Result};
use crate::metadata::atomic_read_json;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Network-related configuration.
pub struct NetworkConfig;

impl NetworkConfig {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
    pub const API_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
    pub const DOWNLOAD_TEMP_SUFFIX: &'static str = ".part";
    pub const USER_AGENT: &'static str = concat!("modelfetch/", env!("CARGO_PKG_VERSION"));
    pub const DEFAULT_HUB_BASE: &'static str = "https://huggingface.co";
    pub const DEFAULT_REVISION: &'static str = "main";
}

/// On-disk layout names.
pub struct PathsConfig;

impl PathsConfig {
    pub const DOWNLOAD_STORE_FILENAME: &'static str = "downloads.json";
    pub const SESSION_STORE_FILENAME: &'static str = "sessions.json";
    pub const ENGINE_CONFIG_FILENAME: &'static str = "engine.json";
    pub const MODELS_DIR_NAME: &'static str = "models";
    /// Prefix of staging directories used while an archive is extracted.
    pub const EXTRACT_STAGING_PREFIX: &'static str = ".extract-";
}

/// Defaults for archive restructuring.
pub struct RestructureConfig;

impl RestructureConfig {
    /// Well-known file whose directory is the content root of a nested package.
    pub const DEFAULT_MARKER_FILE: &'static str = "merges.txt";
    /// Directories ending in this suffix are moved as a single unit.
    pub const DEFAULT_BUNDLE_SUFFIX: &'static str = ".mlmodelc";
}

/// Runtime configuration for a download engine instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    /// Directory holding one subdirectory per model.
    pub models_root: PathBuf,
    /// Directory holding the download and session stores.
    pub data_dir: PathBuf,
    /// Minimum spacing between forwarded progress updates, in milliseconds.
    pub throttle_interval_ms: u64,
    /// Upper bound on concurrently running file transfers.
    pub max_concurrent_transfers: usize,
    /// Base URL of the model hub.
    pub hub_base_url: String,
    /// Repository revision to download from.
    pub revision: String,
    /// Marker filename used by the restructurer.
    pub marker_file: String,
    /// Bundle directory suffix used by the restructurer.
    pub bundle_suffix: String,
    /// Refuse downloads that would not fit on disk.
    pub check_disk_space: bool,
    /// Refuse downloads larger than physical memory.
    pub check_memory: bool,
    /// Persist `failed` (with the last error) instead of rolling back to `notDownloaded`.
    pub retain_failed_state: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            models_root: PathBuf::from(PathsConfig::MODELS_DIR_NAME),
            data_dir: PathBuf::from("."),
            throttle_interval_ms: 250,
            max_concurrent_transfers: 4,
            hub_base_url: NetworkConfig::DEFAULT_HUB_BASE.to_string(),
            revision: NetworkConfig::DEFAULT_REVISION.to_string(),
            marker_file: RestructureConfig::DEFAULT_MARKER_FILE.to_string(),
            bundle_suffix: RestructureConfig::DEFAULT_BUNDLE_SUFFIX.to_string(),
            check_disk_space: true,
            check_memory: true,
            retain_failed_state: false,
        }
    }
}

impl EngineConfig {
    /// Create a config rooted at `root`: models under `root/models`, stores in `root`.
    pub fn rooted_at(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            models_root: root.join(PathsConfig::MODELS_DIR_NAME),
            data_dir: root,
            ..Self::default()
        }
    }

    /// Load a config from a JSON file, using defaults when the file is absent.
    pub fn load(path: &Path) -> Result<Self> {
        let config = atomic_read_json::<Self>(path)?.unwrap_or_default();
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_transfers == 0 {
            return Err(FetchError::Config {
                message: "maxConcurrentTransfers must be at least 1".to_string(),
            });
        }
        if self.marker_file.is_empty() || self.marker_file.contains(['/', '\\']) {
            return Err(FetchError::Config {
                message: format!("invalid marker file name {:?}", self.marker_file),
            });
        }
        if self.bundle_suffix.is_empty() {
            return Err(FetchError::Config {
                message: "bundleSuffix must not be empty".to_string(),
            });
        }
        Ok(())
    }

    pub fn throttle_interval(&self) -> Duration {
        Duration::from_millis(self.throttle_interval_ms)
    }

    pub fn with_throttle_interval(mut self, interval: Duration) -> Self {
        self.throttle_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_resource_checks(mut self, enabled: bool) -> Self {
        self.check_disk_space = enabled;
        self.check_memory = enabled;
        self
    }

    pub fn with_retain_failed_state(mut self, retain: bool) -> Self {
        self.retain_failed_state = retain;
        self
    }
}
