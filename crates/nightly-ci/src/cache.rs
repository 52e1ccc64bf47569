//! Dependency cache keying, restore and save.
//!
//! The key is derived from the platform label, a schema version and a hash
//! over every lock file in the workspace, so two Runs with the same lock
//! files on the same platform share one entry. Restore is best-effort; save
//! runs once, at the end of a successful Run.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use nightly_state::snapshot::hash_file;
use nightly_state::{CacheManifest, CacheStore, SaveOutcome};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::definition::CacheConfig;
use crate::error::{PipelineError, Result};

/// Structured cache key. Displays as `{platform}-{schema}-{lock_hash}-{kind}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub platform: String,
    pub schema_version: u32,
    pub lock_hash: String,
    pub kind: String,
}

impl CacheKey {
    /// Compute the key for `workspace` under `config`.
    pub fn compute(config: &CacheConfig, workspace: &Path) -> Result<Self> {
        Ok(Self {
            platform: config.platform.clone(),
            schema_version: config.schema_version,
            lock_hash: hash_files(workspace, &config.lock_glob)?,
            kind: config.kind.clone(),
        })
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}-{}-{}",
            self.platform, self.schema_version, self.lock_hash, self.kind
        )
    }
}

/// Hash every regular file under `root` matching `pattern`.
///
/// Matches are sorted by path; the result is the SHA-256 of the
/// concatenated per-file SHA-256 digests. No match yields an empty string.
pub fn hash_files(root: &Path, pattern: &str) -> Result<String> {
    let full = format!(
        "{}/{}",
        glob::Pattern::escape(&root.to_string_lossy()),
        pattern
    );
    let entries = glob::glob(&full).map_err(|e| PipelineError::InvalidGlob {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })?;

    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| match entry {
            Ok(path) => Some(path),
            Err(e) => {
                debug!(error = %e, "Skipping unreadable path while hashing");
                None
            }
        })
        .filter(|p| p.is_file())
        .collect();
    if files.is_empty() {
        return Ok(String::new());
    }
    files.sort();

    let mut hasher = Sha256::new();
    for file in &files {
        hasher.update(hash_file(file)?.as_bytes());
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Resolve configured cache paths: `~/` against `home`, relative paths
/// against `workspace`, absolute paths unchanged.
pub fn resolve_cache_paths(paths: &[String], workspace: &Path, home: &Path) -> Vec<PathBuf> {
    paths
        .iter()
        .map(|p| {
            if p == "~" {
                home.to_path_buf()
            } else if let Some(rest) = p.strip_prefix("~/") {
                home.join(rest)
            } else {
                let path = Path::new(p);
                if path.is_absolute() {
                    path.to_path_buf()
                } else {
                    workspace.join(path)
                }
            }
        })
        .collect()
}

/// Result of a restore attempt. Only `Hit` changes the workspace.
#[derive(Debug)]
pub enum RestoreOutcome {
    Hit(CacheManifest),
    Miss,
    /// The entry existed but could not be restored; treated as a miss.
    Failed(String),
}

/// Applies the cache policy on top of a `CacheStore`.
#[derive(Clone)]
pub struct CacheManager {
    store: Arc<dyn CacheStore>,
    config: CacheConfig,
}

impl CacheManager {
    pub fn new(store: Arc<dyn CacheStore>, config: CacheConfig) -> Self {
        Self { store, config }
    }

    pub fn key(&self, workspace: &Path) -> Result<CacheKey> {
        CacheKey::compute(&self.config, workspace)
    }

    pub fn paths(&self, workspace: &Path, home: &Path) -> Vec<PathBuf> {
        resolve_cache_paths(&self.config.paths, workspace, home)
    }

    /// Restore the entry for `key` into the cache paths. Never fails.
    pub async fn restore(&self, key: &CacheKey, targets: &[PathBuf]) -> RestoreOutcome {
        match self.store.restore(&key.to_string(), targets).await {
            Ok(Some(manifest)) => RestoreOutcome::Hit(manifest),
            Ok(None) => RestoreOutcome::Miss,
            Err(e) => {
                warn!(key = %key, error = %e, "Cache restore failed, continuing without cache");
                RestoreOutcome::Failed(e.to_string())
            }
        }
    }

    /// Save the cache paths under `key`. The store skips the write when the
    /// entry already matches.
    pub async fn save(&self, key: &CacheKey, sources: &[PathBuf]) -> Result<SaveOutcome> {
        Ok(self.store.save(&key.to_string(), sources).await?)
    }
}
