//! Flattening of extracted model directories.
//!
//! Archives often wrap the real model in one or more container directories
//! (`pkg/variant/weights/...`). The loader expects the content at the model
//! root, so the directory holding the marker file is treated as the content
//! root and its children are hoisted up. Bundle directories (e.g. compiled
//! `.mlmodelc` packages) move as one unit. Other directories inside the
//! content root are left where they are.

use crate::error::{FetchError, Result};
use std::collections::HashSet;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Bound on `stem_N.ext` candidates tried for one colliding name.
const MAX_RENAME_ATTEMPTS: usize = 10_000;

/// What identifies a content root and which directories are indivisible.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestructureRules {
    pub marker_file: String,
    pub bundle_suffix: String,
}

impl Default for RestructureRules {
    fn default() -> Self {
        Self {
            marker_file: crate::config::RestructureConfig::DEFAULT_MARKER_FILE.to_string(),
            bundle_suffix: crate::config::RestructureConfig::DEFAULT_BUNDLE_SUFFIX.to_string(),
        }
    }
}

/// One planned move from the content root to the model root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedMove {
    pub source: PathBuf,
    pub destination: PathBuf,
    /// True when the destination name differs from the source name.
    pub renamed: bool,
}

/// Details of an applied restructure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestructureReport {
    pub content_root: PathBuf,
    pub moves: Vec<PlannedMove>,
    /// Non-bundle directories found in the content root and not moved.
    pub left_in_place: Vec<PathBuf>,
    /// Directories emptied by the moves and removed.
    pub removed_dirs: Vec<PathBuf>,
}

impl RestructureReport {
    pub fn renamed_count(&self) -> usize {
        self.moves.iter().filter(|m| m.renamed).count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestructureOutcome {
    /// No marker file anywhere under the root; the tree is untouched.
    MarkerNotFound,
    /// The marker already sits at the root.
    AlreadyFlat,
    Restructured(RestructureReport),
}

impl RestructureOutcome {
    pub fn is_restructured(&self) -> bool {
        matches!(self, RestructureOutcome::Restructured(_))
    }
}

/// Flatten `root` so the content directory's children sit directly in it.
///
/// Moves are applied as a unit: if any rename fails, the ones already done
/// are reversed before the error is returned. Running this on its own output
/// is a no-op.
pub fn restructure(root: &Path, rules: &RestructureRules) -> Result<RestructureOutcome> {
    let content_root = match find_content_root(root, rules)? {
        Some(dir) => dir,
        None => {
            debug!("No {} under {}, leaving layout as is", rules.marker_file, root.display());
            return Ok(RestructureOutcome::MarkerNotFound);
        }
    };

    if content_root == root {
        return Ok(RestructureOutcome::AlreadyFlat);
    }

    let (moves, left_in_place) = plan_moves(root, &content_root, rules)?;
    apply_moves(&moves)?;
    let removed_dirs = remove_emptied_chain(root, &content_root);

    let report = RestructureReport {
        content_root,
        moves,
        left_in_place,
        removed_dirs,
    };
    info!(
        "Restructured {}: hoisted {} entries from {} ({} renamed)",
        root.display(),
        report.moves.len(),
        report.content_root.display(),
        report.renamed_count()
    );
    Ok(RestructureOutcome::Restructured(report))
}

/// The shallowest directory containing the marker file. Ties at equal depth
/// go to the lexicographically smallest path. Bundles are not searched.
fn find_content_root(root: &Path, rules: &RestructureRules) -> Result<Option<PathBuf>> {
    let mut best: Option<(usize, PathBuf)> = None;

    let walker = WalkDir::new(root)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !(e.file_type().is_dir() && is_bundle(e.file_name(), rules)));

    for entry in walker {
        let entry = entry?;
        if !entry.file_type().is_file() || entry.file_name() != rules.marker_file.as_str() {
            continue;
        }
        let Some(parent) = entry.path().parent() else {
            continue;
        };
        let candidate = (entry.depth(), parent.to_path_buf());
        if best.as_ref().map_or(true, |current| candidate < *current) {
            best = Some(candidate);
        }
    }

    Ok(best.map(|(_, dir)| dir))
}

fn is_bundle(name: &std::ffi::OsStr, rules: &RestructureRules) -> bool {
    !rules.bundle_suffix.is_empty() && name.to_string_lossy().ends_with(&rules.bundle_suffix)
}

fn plan_moves(
    root: &Path,
    content_root: &Path,
    rules: &RestructureRules,
) -> Result<(Vec<PlannedMove>, Vec<PathBuf>)> {
    let mut entries: Vec<_> = std::fs::read_dir(content_root)
        .map_err(|e| FetchError::io_with_path(e, content_root))?
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|e| FetchError::io_with_path(e, content_root))?;
    entries.sort_by_key(|e| e.file_name());

    let mut moves = Vec::new();
    let mut left_in_place = Vec::new();
    let mut taken: HashSet<OsString> = HashSet::new();

    for entry in entries {
        let file_type = entry
            .file_type()
            .map_err(|e| FetchError::io_with_path(e, entry.path()))?;
        let name = entry.file_name();

        if file_type.is_dir() && !is_bundle(&name, rules) {
            left_in_place.push(entry.path());
            continue;
        }

        let target_name = free_name(root, &name, &taken)?;
        taken.insert(target_name.clone());
        moves.push(PlannedMove {
            source: entry.path(),
            destination: root.join(&target_name),
            renamed: target_name != name,
        });
    }

    Ok((moves, left_in_place))
}

/// First of `name`, `stem_1.ext`, `stem_2.ext`, ... not present at `root`
/// and not already claimed by an earlier planned move.
fn free_name(root: &Path, name: &OsString, taken: &HashSet<OsString>) -> Result<OsString> {
    let is_free = |candidate: &OsString| {
        !taken.contains(candidate) && root.join(candidate).symlink_metadata().is_err()
    };

    if is_free(name) {
        return Ok(name.clone());
    }

    let as_path = Path::new(name);
    let stem = as_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let extension = as_path.extension().map(|e| e.to_string_lossy().into_owned());

    for n in 1..=MAX_RENAME_ATTEMPTS {
        let candidate = match &extension {
            Some(ext) => OsString::from(format!("{}_{}.{}", stem, n, ext)),
            None => OsString::from(format!("{}_{}", stem, n)),
        };
        if is_free(&candidate) {
            return Ok(candidate);
        }
    }

    Err(FetchError::FilenameCollisionUnresolved(root.join(name)))
}

fn apply_moves(moves: &[PlannedMove]) -> Result<()> {
    let mut journal: Vec<&PlannedMove> = Vec::with_capacity(moves.len());

    for planned in moves {
        if let Err(e) = std::fs::rename(&planned.source, &planned.destination) {
            warn!(
                "Move {} -> {} failed, rolling back {} moves",
                planned.source.display(),
                planned.destination.display(),
                journal.len()
            );
            for done in journal.iter().rev() {
                if let Err(undo) = std::fs::rename(&done.destination, &done.source) {
                    warn!(
                        "Rollback of {} failed: {}",
                        done.destination.display(),
                        undo
                    );
                }
            }
            return Err(FetchError::io_with_path(e, &planned.source));
        }
        debug!(
            "Moved {} -> {}",
            planned.source.display(),
            planned.destination.display()
        );
        journal.push(planned);
    }

    Ok(())
}

/// Remove the directories the moves emptied: the content root and each
/// parent up to `root`, stopping at the first one that still has entries.
fn remove_emptied_chain(root: &Path, content_root: &Path) -> Vec<PathBuf> {
    let mut removed = Vec::new();

    for dir in content_root.ancestors() {
        if dir == root || !dir.starts_with(root) {
            break;
        }
        let is_empty = std::fs::read_dir(dir)
            .map(|mut it| it.next().is_none())
            .unwrap_or(false);
        if !is_empty {
            break;
        }
        match std::fs::remove_dir(dir) {
            Ok(()) => removed.push(dir.to_path_buf()),
            Err(e) => {
                warn!("Failed to remove {}: {}", dir.display(), e);
                break;
            }
        }
    }

    removed
}
