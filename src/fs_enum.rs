//! Filesystem enumeration for sync roots and disk roots

use crate::error::Result;
use crate::paths::wire_path;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Regular file found under a root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFile {
    pub path: PathBuf,
    /// Path relative to the root, '/'-separated, as sent on the wire
    pub relative: String,
    pub size: u64,
}

/// Recursively list regular files under `root`, sorted by path.
/// Symlinks are not followed; unreadable entries are skipped with a warning.
pub fn enumerate_files(root: &Path) -> Result<Vec<LocalFile>> {
    use walkdir::WalkDir;

    if !root.is_dir() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("{} is not a directory", root.display()),
        )
        .into());
    }

    let mut entries = Vec::new();

    for entry in WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
    {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "skipping unreadable entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = match path.strip_prefix(root).ok().and_then(wire_path) {
            Some(rel) => rel,
            None => {
                warn!(path = %path.display(), "skipping file with a non UTF-8 path");
                continue;
            }
        };
        match entry.metadata() {
            Ok(metadata) => entries.push(LocalFile {
                path: path.to_path_buf(),
                relative,
                size: metadata.len(),
            }),
            Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable file"),
        }
    }

    Ok(entries)
}
