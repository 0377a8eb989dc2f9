//! ZIP extraction.

use crate::error::{FetchError, Result};
use std::fs::File;
use std::io::{BufReader, ErrorKind};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Counts from a successful extraction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractionReport {
    pub files: usize,
    pub directories: usize,
    pub bytes: u64,
    /// Entries skipped because their names escape the destination.
    pub skipped: Vec<String>,
}

/// Extract every entry of `archive` under `dest`, preserving relative paths.
///
/// `dest` must be absent or an empty directory. If extraction fails, `dest`
/// is removed again so no half-written tree is left looking valid.
pub fn extract_zip(archive: &Path, dest: &Path) -> Result<ExtractionReport> {
    let created_dest = prepare_destination(dest)?;

    match extract_entries(archive, dest) {
        Ok(report) => {
            info!(
                "Extracted {} files ({} bytes) from {} to {}",
                report.files,
                report.bytes,
                archive.display(),
                dest.display()
            );
            Ok(report)
        }
        Err(e) => {
            warn!("Extraction of {} failed: {}", archive.display(), e);
            let cleanup = if created_dest {
                std::fs::remove_dir_all(dest)
            } else {
                clear_directory(dest)
            };
            if let Err(cleanup_err) = cleanup {
                warn!(
                    "Failed to clean up partial extraction at {}: {}",
                    dest.display(),
                    cleanup_err
                );
            }
            Err(e)
        }
    }
}

/// Returns true when the directory was created by this call.
fn prepare_destination(dest: &Path) -> Result<bool> {
    if dest.exists() {
        let mut entries =
            std::fs::read_dir(dest).map_err(|e| FetchError::io_with_path(e, dest))?;
        if entries.next().is_some() {
            return Err(FetchError::Io {
                message: "extraction destination is not empty".to_string(),
                path: Some(dest.to_path_buf()),
                source: None,
            });
        }
        return Ok(false);
    }
    std::fs::create_dir_all(dest).map_err(|e| FetchError::io_with_path(e, dest))?;
    Ok(true)
}

fn clear_directory(dir: &Path) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            std::fs::remove_dir_all(&path)?;
        } else {
            std::fs::remove_file(&path)?;
        }
    }
    Ok(())
}

fn extract_entries(archive_path: &Path, dest: &Path) -> Result<ExtractionReport> {
    let file = File::open(archive_path).map_err(|e| FetchError::io_with_path(e, archive_path))?;
    let mut archive = zip::ZipArchive::new(BufReader::new(file))
        .map_err(|e| FetchError::from(e).with_archive_path(archive_path))?;

    let mut report = ExtractionReport::default();

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| FetchError::from(e).with_archive_path(archive_path))?;

        let outpath = match entry.enclosed_name() {
            Some(relative) => dest.join(relative),
            None => {
                warn!("Skipping unsafe archive entry {:?}", entry.name());
                report.skipped.push(entry.name().to_string());
                continue;
            }
        };

        if entry.is_dir() {
            std::fs::create_dir_all(&outpath).map_err(|e| FetchError::io_with_path(e, &outpath))?;
            report.directories += 1;
            continue;
        }

        if let Some(parent) = outpath.parent() {
            std::fs::create_dir_all(parent).map_err(|e| FetchError::io_with_path(e, parent))?;
        }

        let mut outfile =
            File::create(&outpath).map_err(|e| FetchError::io_with_path(e, &outpath))?;
        let written = std::io::copy(&mut entry, &mut outfile)
            .map_err(|e| copy_error(e, archive_path, &outpath))?;
        report.files += 1;
        report.bytes += written;
        debug!("Extracted {} ({} bytes)", outpath.display(), written);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Some(mode) = entry.unix_mode() {
                // Keep owner read/write so later moves and deletes succeed.
                let mode = (mode & 0o777) | 0o600;
                std::fs::set_permissions(&outpath, std::fs::Permissions::from_mode(mode)).ok();
            }
        }
    }

    Ok(report)
}

/// Checksum and truncation failures surface from the zip reader as IO errors.
fn copy_error(err: std::io::Error, archive: &Path, outpath: &Path) -> FetchError {
    match err.kind() {
        ErrorKind::InvalidData | ErrorKind::UnexpectedEof => FetchError::ArchiveCorrupt {
            path: archive.to_path_buf(),
            message: format!("{} while extracting {}", err, outpath.display()),
        },
        _ => FetchError::io_with_path(err, PathBuf::from(outpath)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;
    use zip::write::SimpleFileOptions;

    fn write_zip(path: &Path, entries: &[(&str, Option<&[u8]>)]) {
        let file = File::create(path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        let options = SimpleFileOptions::default();
        for (name, contents) in entries {
            match contents {
                Some(bytes) => {
                    zip.start_file(*name, options).unwrap();
                    zip.write_all(bytes).unwrap();
                }
                None => {
                    zip.add_directory(*name, options).unwrap();
                }
            }
        }
        zip.finish().unwrap();
    }

    #[test]
    fn test_extracts_files_and_directory_records() {
        let tmp = TempDir::new().unwrap();
        let archive = tmp.path().join("pkg.zip");
        write_zip(
            &archive,
            &[
                ("empty/", None),
                ("a/b/c.txt", Some(b"deep")),
                ("top.json", Some(b"{}")),
            ],
        );

        let dest = tmp.path().join("out");
        let report = extract_zip(&archive, &dest).unwrap();

        assert_eq!(report.files, 2);
        assert_eq!(report.directories, 1);
        assert_eq!(report.bytes, 6);
        assert!(dest.join("empty").is_dir());
        assert_eq!(std::fs::read(dest.join("a/b/c.txt")).unwrap(), b"deep");
        assert_eq!(std::fs::read(dest.join("top.json")).unwrap(), b"{}");
    }

    #[test]
    fn test_corrupt_archive_leaves_no_destination() {
        let tmp = TempDir::new().unwrap();
        let archive = tmp.path().join("broken.zip");
        std::fs::write(&archive, b"this is not a zip file").unwrap();

        let dest = tmp.path().join("out");
        let err = extract_zip(&archive, &dest).unwrap_err();

        assert!(matches!(err, FetchError::ArchiveCorrupt { ref path, .. } if path == &archive));
        assert!(!dest.exists());
    }

    #[test]
    fn test_empty_existing_destination_is_accepted() {
        let tmp = TempDir::new().unwrap();
        let archive = tmp.path().join("pkg.zip");
        write_zip(&archive, &[("f.txt", Some(b"x"))]);
        let dest = tmp.path().join("out");
        std::fs::create_dir(&dest).unwrap();

        extract_zip(&archive, &dest).unwrap();
        assert!(dest.join("f.txt").is_file());
    }

    #[test]
    fn test_non_empty_destination_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let archive = tmp.path().join("pkg.zip");
        write_zip(&archive, &[("f.txt", Some(b"x"))]);
        let dest = tmp.path().join("out");
        std::fs::create_dir(&dest).unwrap();
        std::fs::write(dest.join("existing"), b"keep").unwrap();

        assert!(extract_zip(&archive, &dest).is_err());
        assert_eq!(std::fs::read(dest.join("existing")).unwrap(), b"keep");
    }
}
