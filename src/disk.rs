//! Per-user disk roots on the server and the offset-addressed chunk writer
//! shared by the server and the client.

use crate::error::{Result, SyncError};
use crate::fs_enum::{enumerate_files, LocalFile};
use crate::packet::UpdateDataPayload;
use crate::paths::{ensure_dir_exists, ensure_parent_exists, normalize_under_root};
use crate::user_id::UserId;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Filesystem-backed store: one directory per user under `root`.
/// A user "has a disk" exactly when that directory exists.
#[derive(Debug, Clone)]
pub struct DiskStore {
    root: PathBuf,
}

impl DiskStore {
    /// Open the store, creating the base directory if needed
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        ensure_dir_exists(&root)?;
        Ok(DiskStore { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn user_root(&self, user: &UserId) -> PathBuf {
        self.root.join(user.to_string())
    }

    pub fn has_disk(&self, user: &UserId) -> bool {
        self.user_root(user).is_dir()
    }

    /// Create the user's disk root. Not recursive, and an existing root is
    /// reported as [`SyncError::DiskAlreadyExists`].
    pub fn prepare(&self, user: &UserId) -> Result<PathBuf> {
        let path = self.user_root(user);
        match fs::create_dir(&path) {
            Ok(()) => Ok(path),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                Err(SyncError::DiskAlreadyExists(user.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn require_disk(&self, user: &UserId) -> Result<PathBuf> {
        let path = self.user_root(user);
        if path.is_dir() {
            Ok(path)
        } else {
            Err(SyncError::UserHasNoDisk(user.to_string()))
        }
    }

    /// Write one chunk into the user's disk
    pub fn write_chunk(&self, user: &UserId, update: &UpdateDataPayload) -> Result<PathBuf> {
        let root = self.require_disk(user)?;
        apply_update(&root, update)
    }

    /// Every file currently stored for the user
    pub fn files(&self, user: &UserId) -> Result<Vec<LocalFile>> {
        let root = self.require_disk(user)?;
        enumerate_files(&root)
    }
}

/// Write `update.data` at exactly `update.offset` in `root/update.path`.
///
/// Each chunk carries its absolute offset, so chunks may land in any order.
/// The file is opened without truncation or append mode, and a file left
/// longer than `total` by an earlier sync is cut back to `total`.
pub fn apply_update(root: &Path, update: &UpdateDataPayload) -> Result<PathBuf> {
    let len = update.data.len() as u64;
    match update.offset.checked_add(len) {
        Some(end) if end <= update.total => {}
        _ => {
            return Err(SyncError::ChunkOutOfBounds {
                offset: update.offset,
                len,
                total: update.total,
            })
        }
    }

    let path = normalize_under_root(root, &update.path)?;
    ensure_parent_exists(&path)?;

    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)?;

    let landed = file.seek(SeekFrom::Start(update.offset))?;
    if landed != update.offset {
        return Err(SyncError::UnexpectedFileState {
            path,
            expected: update.offset,
            actual: landed,
        });
    }
    file.write_all(&update.data)?;

    if file.metadata()?.len() > update.total {
        file.set_len(update.total)?;
    }

    Ok(path)
}
