//! Directory snapshots used by the cache stores.
//!
//! A snapshot lists every regular file under a set of directories with its
//! SHA-256. Entries are walked in file-name order so the resulting
//! [`CacheManifest`] is deterministic. Timestamps and permissions are not
//! part of the listing.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::error::StorageError;
use crate::storage_traits::{CacheManifest, StorageResult};

/// SHA-256 of a file's contents, hex encoded.
pub fn hash_file(path: &Path) -> StorageResult<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// List the regular files under `sources`, keyed `<slot>/<relative path>`.
///
/// Missing directories contribute nothing. Symlinks are not followed and
/// not recorded.
pub fn build_manifest(key: &str, sources: &[PathBuf]) -> StorageResult<CacheManifest> {
    let mut files = BTreeMap::new();

    for (slot, dir) in sources.iter().enumerate() {
        if !dir.is_dir() {
            tracing::debug!(path = %dir.display(), "cache path missing, skipping");
            continue;
        }
        for entry in WalkDir::new(dir).sort_by_file_name() {
            let entry = entry.map_err(|e| StorageError::Walk {
                path: dir.display().to_string(),
                message: e.to_string(),
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = match entry.path().strip_prefix(dir) {
                Ok(rel) => to_slash(rel),
                Err(_) => continue,
            };
            if rel.is_empty() {
                continue;
            }
            files.insert(format!("{slot}/{rel}"), hash_file(entry.path())?);
        }
    }

    Ok(CacheManifest {
        key: key.to_string(),
        files,
    })
}

/// Split a manifest path into its slot index and the path under the slot.
pub(crate) fn split_slot(entry: &str) -> Option<(usize, &str)> {
    let (slot, rel) = entry.split_once('/')?;
    Some((slot.parse().ok()?, rel))
}

/// Join a slash-separated relative path onto `base`.
pub(crate) fn join_rel(base: &Path, rel: &str) -> PathBuf {
    rel.split('/')
        .filter(|c| !c.is_empty() && *c != "." && *c != "..")
        .fold(base.to_path_buf(), |acc, c| acc.join(c))
}

/// Copy `src` to `dest`, creating parent directories. Permission bits are
/// carried over by `fs::copy`.
pub(crate) fn copy_file(src: &Path, dest: &Path) -> io::Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(src, dest)?;
    Ok(())
}

fn to_slash(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
