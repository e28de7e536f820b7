//! Path helpers shared by the server disk store and the client.
//!
//! Paths arrive from the wire as untrusted relative strings; everything that
//! turns one into a filesystem location goes through [`normalize_under_root`].

use crate::error::{Result, SyncError};
use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};

/// Resolve a wire path to a location safely under `root`.
///
/// Rejects NUL bytes, absolute paths, parent-directory components and
/// (on Windows) drive prefixes and ':' in components. The deepest existing
/// ancestor of the result is canonicalized so symlinks cannot lead out of
/// `root`, which must exist.
pub fn normalize_under_root(root: &Path, rel: &str) -> Result<PathBuf> {
    use Component::{CurDir, Normal, ParentDir, Prefix, RootDir};

    let escapes = || SyncError::PathEscapesRoot(rel.to_string());

    if rel.contains('\0') {
        return Err(escapes());
    }

    let mut safe = PathBuf::new();
    for component in Path::new(rel).components() {
        match component {
            CurDir => {}
            Normal(s) => {
                #[cfg(windows)]
                if s.to_string_lossy().contains(':') {
                    return Err(escapes());
                }
                safe.push(s);
            }
            ParentDir | RootDir | Prefix(_) => return Err(escapes()),
        }
    }
    if safe.as_os_str().is_empty() {
        return Err(escapes());
    }

    let root = root.canonicalize()?;
    let joined = root.join(&safe);

    // Canonicalize whatever part already exists, re-append the rest
    let mut existing = joined.clone();
    let mut missing: Vec<OsString> = Vec::new();
    while !existing.exists() {
        match (existing.file_name(), existing.parent()) {
            (Some(name), Some(parent)) => {
                missing.push(name.to_os_string());
                existing = parent.to_path_buf();
            }
            _ => break,
        }
    }
    let mut resolved = existing.canonicalize()?;
    for name in missing.iter().rev() {
        resolved.push(name);
    }

    if !resolved.starts_with(&root) || resolved == root {
        return Err(escapes());
    }
    Ok(resolved)
}

/// Render a path relative to a sync root the way it travels on the wire:
/// normal components joined with '/'.
pub fn wire_path(relative: &Path) -> Option<String> {
    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(s) => parts.push(s.to_str()?),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// Create directory with parent creation
pub fn ensure_dir_exists(path: &Path) -> Result<()> {
    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }
    Ok(())
}

/// Create parent directory if needed
pub fn ensure_parent_exists(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir_exists(parent)?;
    }
    Ok(())
}
