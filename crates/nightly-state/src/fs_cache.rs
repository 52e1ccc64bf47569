//! Filesystem-backed build cache.

use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::StorageError;
use crate::snapshot::{build_manifest, copy_file, join_rel, split_slot};
use crate::storage_traits::{CacheManifest, CacheStore, ContentDigest, SaveOutcome, StorageResult};

const MANIFEST_FILE: &str = "manifest.json";
const FILES_DIR: &str = "files";

/// Cache store rooted at a local directory.
///
/// Layout: `<root>/entries/<sha256(key)>/{manifest.json, files/<slot>/...}`.
/// Entries are staged in a sibling temporary directory and renamed into
/// place, so readers only ever see complete entries.
#[derive(Debug, Clone)]
pub struct FsCacheStore {
    entries_dir: PathBuf,
}

impl FsCacheStore {
    /// Create a store rooted at `root`. Creates `root/entries/` if needed.
    pub fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let entries_dir = root.as_ref().join("entries");
        fs::create_dir_all(&entries_dir)?;
        Ok(Self { entries_dir })
    }

    /// Directory holding the entry for `key`.
    pub fn entry_dir(&self, key: &str) -> PathBuf {
        self.entries_dir
            .join(ContentDigest::from_bytes(key.as_bytes()).as_str())
    }

    fn read_manifest(&self, key: &str) -> StorageResult<Option<CacheManifest>> {
        let path = self.entry_dir(key).join(MANIFEST_FILE);
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let manifest: CacheManifest = serde_json::from_slice(&bytes)?;
        if manifest.key != key {
            return Err(StorageError::CacheEntryCorrupt {
                key: key.to_string(),
                reason: format!("manifest belongs to key {}", manifest.key),
            });
        }
        Ok(Some(manifest))
    }

    fn restore_blocking(
        &self,
        key: &str,
        targets: &[PathBuf],
    ) -> StorageResult<Option<CacheManifest>> {
        let Some(manifest) = self.read_manifest(key)? else {
            return Ok(None);
        };
        let files_dir = self.entry_dir(key).join(FILES_DIR);

        for entry in manifest.files.keys() {
            let Some((slot, rel)) = split_slot(entry) else {
                return Err(StorageError::CacheEntryCorrupt {
                    key: key.to_string(),
                    reason: format!("malformed manifest path {entry}"),
                });
            };
            let Some(target) = targets.get(slot) else {
                warn!(key = %key, slot, "cache entry has more slots than restore targets");
                continue;
            };
            let src = join_rel(&files_dir.join(slot.to_string()), rel);
            if !src.is_file() {
                return Err(StorageError::CacheEntryCorrupt {
                    key: key.to_string(),
                    reason: format!("missing file {entry}"),
                });
            }
            copy_file(&src, &join_rel(target, rel))?;
        }

        debug!(key = %key, files = manifest.files.len(), "cache entry restored");
        Ok(Some(manifest))
    }

    fn save_blocking(&self, key: &str, sources: &[PathBuf]) -> StorageResult<SaveOutcome> {
        let manifest = build_manifest(key, sources)?;
        if manifest.is_empty() {
            return Ok(SaveOutcome::Empty);
        }
        if let Some(existing) = self.read_manifest(key)? {
            if existing.files == manifest.files {
                return Ok(SaveOutcome::Unchanged);
            }
        }

        let staging = tempfile::Builder::new()
            .prefix(".staging-")
            .tempdir_in(&self.entries_dir)?;
        let staged_files = staging.path().join(FILES_DIR);
        for entry in manifest.files.keys() {
            let Some((slot, rel)) = split_slot(entry) else {
                continue;
            };
            let src = join_rel(&sources[slot], rel);
            copy_file(&src, &join_rel(&staged_files.join(slot.to_string()), rel))?;
        }
        fs::write(
            staging.path().join(MANIFEST_FILE),
            serde_json::to_vec_pretty(&manifest)?,
        )?;

        let final_dir = self.entry_dir(key);
        if final_dir.exists() {
            // Move the stale entry aside first so the rename below cannot
            // collide with a non-empty directory.
            let trash = tempfile::Builder::new()
                .prefix(".stale-")
                .tempdir_in(&self.entries_dir)?;
            fs::rename(&final_dir, trash.path().join("entry"))?;
        }
        fs::rename(staging.path(), &final_dir)?;

        debug!(key = %key, files = manifest.files.len(), "cache entry written");
        Ok(SaveOutcome::Written)
    }
}

#[async_trait]
impl CacheStore for FsCacheStore {
    async fn restore(
        &self,
        key: &str,
        targets: &[PathBuf],
    ) -> StorageResult<Option<CacheManifest>> {
        let store = self.clone();
        let key = key.to_string();
        let targets = targets.to_vec();
        tokio::task::spawn_blocking(move || store.restore_blocking(&key, &targets))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?
    }

    async fn save(&self, key: &str, sources: &[PathBuf]) -> StorageResult<SaveOutcome> {
        let store = self.clone();
        let key = key.to_string();
        let sources = sources.to_vec();
        tokio::task::spawn_blocking(move || store.save_blocking(&key, &sources))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?
    }
}
