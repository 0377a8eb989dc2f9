//! Observer-facing download events.

use crate::archive::{InstallReport, RestructureOutcome};
use crate::error::FetchError;
use crate::model_library::DownloadProgress;
use std::path::PathBuf;
use std::sync::Arc;

/// One notification on a model's event stream.
///
/// `Completed` and `Failed` are terminal for the attempt: the stream closes
/// right after either is sent.
#[derive(Debug, Clone)]
pub enum DownloadEvent {
    Progress(DownloadProgress),
    Completed(CompletedInfo),
    Failed(Arc<FetchError>),
}

impl DownloadEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DownloadEvent::Progress(_))
    }
}

/// Final details of a finished download.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedInfo {
    pub model_id: String,
    pub local_path: PathBuf,
    pub size_on_disk: u64,
    /// Present when the payload was an archive.
    pub archive: Option<ArchiveSummary>,
}

/// What happened to an archive payload after extraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveSummary {
    Flattened { moved: usize, renamed: usize },
    AlreadyFlat,
    MarkerNotFound,
    /// Extraction succeeded but flattening did not; the extracted layout is kept.
    RestructureFailed(String),
}

impl From<&InstallReport> for ArchiveSummary {
    fn from(report: &InstallReport) -> Self {
        match &report.restructure {
            Ok(RestructureOutcome::Restructured(r)) => ArchiveSummary::Flattened {
                moved: r.moves.len(),
                renamed: r.renamed_count(),
            },
            Ok(RestructureOutcome::AlreadyFlat) => ArchiveSummary::AlreadyFlat,
            Ok(RestructureOutcome::MarkerNotFound) => ArchiveSummary::MarkerNotFound,
            Err(e) => ArchiveSummary::RestructureFailed(e.to_string()),
        }
    }
}
