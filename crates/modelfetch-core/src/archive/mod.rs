//! Archive post-processing: extraction and directory flattening.
//!
//! A downloaded `.zip` becomes a usable model directory in three steps:
//! extract into a staging directory next to the model directory, flatten the
//! staging tree around its marker file, then swap it into place. The model
//! directory is only replaced once extraction has fully succeeded.

mod extract;
mod restructure;

pub use extract::{extract_zip, ExtractionReport};
pub use restructure::{
    restructure, PlannedMove, RestructureOutcome, RestructureReport, RestructureRules,
};

use crate::config::PathsConfig;
use crate::error::{FetchError, Result};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Result of installing an archive into a model directory.
#[derive(Debug)]
pub struct InstallReport {
    pub extraction: ExtractionReport,
    /// A failed restructure leaves the extracted layout in place.
    pub restructure: std::result::Result<RestructureOutcome, FetchError>,
}

/// Extracts and flattens archives into model directories.
#[derive(Debug, Clone, Default)]
pub struct ArchiveInstaller {
    rules: RestructureRules,
}

impl ArchiveInstaller {
    pub fn new(rules: RestructureRules) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &RestructureRules {
        &self.rules
    }

    /// Install `archive` as the contents of `model_dir`.
    ///
    /// Whatever `model_dir` held before (including `archive` itself when it
    /// was downloaded there) is replaced after extraction succeeds.
    pub async fn install(&self, archive: PathBuf, model_dir: PathBuf) -> Result<InstallReport> {
        let rules = self.rules.clone();
        tokio::task::spawn_blocking(move || install_blocking(&archive, &model_dir, &rules))
            .await
            .map_err(|e| FetchError::Other(format!("Archive task failed: {}", e)))?
    }
}

fn install_blocking(
    archive: &Path,
    model_dir: &Path,
    rules: &RestructureRules,
) -> Result<InstallReport> {
    let parent = model_dir
        .parent()
        .ok_or_else(|| FetchError::InvalidLocation(model_dir.display().to_string()))?;
    std::fs::create_dir_all(parent).map_err(|e| FetchError::io_with_path(e, parent))?;

    let staging = parent.join(format!(
        "{}{}",
        PathsConfig::EXTRACT_STAGING_PREFIX,
        uuid::Uuid::new_v4()
    ));

    let extraction = extract_zip(archive, &staging)?;

    let restructure = restructure(&staging, rules);
    if let Err(ref e) = restructure {
        warn!(
            "Restructure of {} failed, keeping extracted layout: {}",
            archive.display(),
            e
        );
    }

    if let Err(e) = swap_into_place(&staging, model_dir) {
        if let Err(cleanup) = std::fs::remove_dir_all(&staging) {
            warn!("Failed to remove staging dir {}: {}", staging.display(), cleanup);
        }
        return Err(e);
    }

    info!("Installed {} into {}", archive.display(), model_dir.display());
    Ok(InstallReport {
        extraction,
        restructure,
    })
}

fn swap_into_place(staging: &Path, model_dir: &Path) -> Result<()> {
    if model_dir.exists() {
        std::fs::remove_dir_all(model_dir).map_err(|e| FetchError::io_with_path(e, model_dir))?;
    }
    std::fs::rename(staging, model_dir).map_err(|e| FetchError::io_with_path(e, model_dir))
}

/// True for leftover staging directories created by [`ArchiveInstaller`].
pub fn is_staging_dir(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with(PathsConfig::EXTRACT_STAGING_PREFIX))
}
