//! Content comparison of two synced trees

use crate::error::Result;
use crate::fs_enum::{enumerate_files, LocalFile};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use tracing::debug;

const HASH_BUF_SIZE: usize = 64 * 1024;

/// Available checksum algorithms
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ChecksumType {
    #[default]
    Blake3,
    Md5, // For compatibility with older md5 listings
}

impl std::str::FromStr for ChecksumType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "blake3" => Ok(Self::Blake3),
            "md5" => Ok(Self::Md5),
            other => Err(format!("unknown checksum type '{other}' (expected blake3 or md5)")),
        }
    }
}

/// Hex digest of everything `reader` yields
pub fn digest_reader<R: Read>(mut reader: R, checksum_type: ChecksumType) -> Result<String> {
    let mut buf = vec![0u8; HASH_BUF_SIZE];
    match checksum_type {
        ChecksumType::Blake3 => {
            let mut hasher = blake3::Hasher::new();
            loop {
                let n = reader.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
            Ok(hasher.finalize().to_hex().to_string())
        }
        ChecksumType::Md5 => {
            let mut ctx = md5::Context::new();
            loop {
                let n = reader.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                ctx.consume(&buf[..n]);
            }
            Ok(format!("{:x}", ctx.compute()))
        }
    }
}

pub fn file_digest(path: &Path, checksum_type: ChecksumType) -> Result<String> {
    let file = File::open(path)?;
    digest_reader(BufReader::new(file), checksum_type)
}

/// Differences between two trees, by wire path
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TreeDiff {
    /// Present on the right only
    pub missing_left: Vec<String>,
    /// Present on the left only
    pub missing_right: Vec<String>,
    /// Present on both sides with different contents
    pub differing: Vec<String>,
}

impl TreeDiff {
    pub fn is_clean(&self) -> bool {
        self.missing_left.is_empty() && self.missing_right.is_empty() && self.differing.is_empty()
    }
}

fn index(files: Vec<LocalFile>) -> BTreeMap<String, LocalFile> {
    files.into_iter().map(|f| (f.relative.clone(), f)).collect()
}

/// Compare every regular file under `left` and `right` by content
pub fn compare_trees(left: &Path, right: &Path, checksum_type: ChecksumType) -> Result<TreeDiff> {
    let left_files = index(enumerate_files(left)?);
    let mut right_files = index(enumerate_files(right)?);
    let mut diff = TreeDiff::default();

    for (rel, l) in left_files {
        let Some(r) = right_files.remove(&rel) else {
            diff.missing_right.push(rel);
            continue;
        };
        // sizes differ: no need to hash
        if l.size != r.size {
            diff.differing.push(rel);
            continue;
        }
        let (a, b) = (file_digest(&l.path, checksum_type)?, file_digest(&r.path, checksum_type)?);
        debug!(path = %rel, left = %a, right = %b, "compared");
        if a != b {
            diff.differing.push(rel);
        }
    }
    diff.missing_left.extend(right_files.into_keys());

    Ok(diff)
}
