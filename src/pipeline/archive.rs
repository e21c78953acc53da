use std::collections::HashSet;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Archive {
    pub path: PathBuf,
    pub size: u64,
    pub members: Vec<String>,
}

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("no files provided for archive creation")]
    NoInputs,
    #[error("none of the provided files could be added to the archive")]
    NoMembers,
    #[error("archive file not found after creation: {0}")]
    Missing(PathBuf),
    #[error("archive io failed: {0}")]
    Io(#[from] io::Error),
    #[error("archive write failed: {0}")]
    Zip(#[from] zip::result::ZipError),
}

/// Writes `paths` into a deflate zip at `archive_path`. Missing files and
/// repeats of an already-added canonical path are skipped; the archive only
/// counts as built once it is observed on disk afterwards.
pub fn build_archive(paths: &[PathBuf], archive_path: &Path) -> Result<Archive, ArchiveError> {
    if paths.is_empty() {
        warn!(archive = %archive_path.display(), "no files provided for archive creation");
        return Err(ArchiveError::NoInputs);
    }
    if let Some(parent) = archive_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let base_dir = archive_path
        .parent()
        .map(|parent| fs::canonicalize(parent).unwrap_or_else(|_| parent.to_path_buf()))
        .unwrap_or_default();

    let mut writer = ZipWriter::new(File::create(archive_path)?);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    let mut seen = HashSet::<PathBuf>::new();
    let mut members = Vec::new();

    for path in paths {
        let canonical = match fs::canonicalize(path) {
            Ok(canonical) if canonical.is_file() => canonical,
            _ => {
                warn!(path = %path.display(), "file not found, skipping");
                continue;
            }
        };
        if !seen.insert(canonical.clone()) {
            warn!(path = %path.display(), "duplicate file skipped");
            continue;
        }

        let member = member_name(canonical.as_path(), base_dir.as_path());
        writer.start_file(member.clone(), options)?;
        let mut source = File::open(canonical.as_path())?;
        io::copy(&mut source, &mut writer)?;
        debug!(member = %member, "added to archive");
        members.push(member);
    }

    let file = writer.finish()?;
    file.sync_all()?;
    drop(file);

    if members.is_empty() {
        if let Err(remove_error) = fs::remove_file(archive_path) {
            debug!(archive = %archive_path.display(), error = %remove_error, "empty archive not removed");
        }
        return Err(ArchiveError::NoMembers);
    }

    let size = match fs::metadata(archive_path) {
        Ok(metadata) if metadata.is_file() => metadata.len(),
        _ => return Err(ArchiveError::Missing(archive_path.to_path_buf())),
    };
    info!(archive = %archive_path.display(), size, members = members.len(), "archive created");
    Ok(Archive {
        path: archive_path.to_path_buf(),
        size,
        members,
    })
}

fn member_name(path: &Path, base_dir: &Path) -> String {
    let relative = path
        .strip_prefix(base_dir)
        .ok()
        .filter(|rel| !rel.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .or_else(|| path.file_name().map(PathBuf::from))
        .unwrap_or_else(|| path.to_path_buf());
    relative
        .components()
        .map(|component| component.as_os_str().to_string_lossy().to_string())
        .collect::<Vec<_>>()
        .join("/")
}
