//! On-demand listings of a directory's regular files.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use ignore::WalkBuilder;
use crate::FileRecord;

/// List the regular files directly under `dir`.
///
/// Hidden and ignored files are included, subdirectories are not descended
/// into, and the order is whatever the filesystem hands back. An empty or
/// missing `dir` yields an empty snapshot.
pub fn enumerate_files<P: AsRef<Path>>(dir: P) -> Vec<FileRecord> {
    let dir = dir.as_ref();
    let mut files = Vec::new();

    if dir.as_os_str().is_empty() || !dir.is_dir() {
        return files;
    }

    for result in WalkBuilder::new(dir)
        .standard_filters(false)
        .max_depth(Some(1))
        .build()
    {
        match result {
            Ok(entry) => {
                if entry.depth() == 0 {
                    continue;
                }
                if let Some(record) = file_record(dir, entry.path()) {
                    files.push(record);
                }
            }
            Err(err) => {
                tracing::warn!("Error enumerating directory: {}", err);
            }
        }
    }

    files
}

fn file_record(dir: &Path, path: &Path) -> Option<FileRecord> {
    // Follows symlinks, so a link to a regular file counts as one.
    let metadata = match fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(err) => {
            tracing::debug!("Skipping {}: {}", path.display(), err);
            return None;
        }
    };

    if !metadata.is_file() {
        return None;
    }

    let relative_path = path
        .strip_prefix(dir)
        .map(Path::to_path_buf)
        .unwrap_or_else(|_| path.file_name().map(PathBuf::from).unwrap_or_default());

    Some(FileRecord::new(
        relative_path,
        metadata.modified().unwrap_or(UNIX_EPOCH),
        metadata.len(),
    ))
}
