//! In-memory fakes for storage traits (testing only)
//!
//! Provides `MemoryRunLedger`, `MemoryCacheStore` and `MemoryReleaseChannel`
//! that satisfy the trait contracts without any external dependencies.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use crate::error::StorageError;
use crate::snapshot::{build_manifest, join_rel, split_slot};
use crate::storage_traits::*;

// ---------------------------------------------------------------------------
// MemoryRunLedger
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct RunState {
    record: RunRecord,
    events: Vec<RunEvent>,
}

/// In-memory run ledger backed by a `HashMap<RunId, RunState>`.
#[derive(Debug, Default)]
pub struct MemoryRunLedger {
    runs: Mutex<HashMap<String, RunState>>,
}

impl MemoryRunLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn finish(
        &self,
        run_id: &RunId,
        status: RunStatus,
        summary: RunSummary,
    ) -> StorageResult<()> {
        let mut runs = self.runs.lock().unwrap();
        let state = runs
            .get_mut(&run_id.0)
            .ok_or_else(|| StorageError::RunNotFound {
                run_id: run_id.0.clone(),
            })?;
        if state.record.status != RunStatus::Running {
            return Err(StorageError::InvalidRunState {
                run_id: run_id.0.clone(),
                status: format!("{:?}", state.record.status),
                expected: "Running".to_string(),
            });
        }
        state.record.status = status;
        state.record.summary = Some(summary);
        state.record.completed_at = Some(Utc::now());
        Ok(())
    }
}

#[async_trait]
impl RunLedger for MemoryRunLedger {
    async fn create_run(
        &self,
        definition_digest: &ContentDigest,
        metadata: RunMetadata,
    ) -> StorageResult<RunId> {
        let run_id = RunId::new();
        let record = RunRecord {
            run_id: run_id.clone(),
            definition_digest: definition_digest.clone(),
            metadata,
            status: RunStatus::Running,
            summary: None,
            created_at: Utc::now(),
            completed_at: None,
        };
        let mut runs = self.runs.lock().unwrap();
        runs.insert(
            run_id.0.clone(),
            RunState {
                record,
                events: Vec::new(),
            },
        );
        Ok(run_id)
    }

    async fn append_event(&self, run_id: &RunId, event: RunEvent) -> StorageResult<()> {
        let mut runs = self.runs.lock().unwrap();
        let state = runs
            .get_mut(&run_id.0)
            .ok_or_else(|| StorageError::RunNotFound {
                run_id: run_id.0.clone(),
            })?;
        if state.record.status != RunStatus::Running {
            return Err(StorageError::InvalidRunState {
                run_id: run_id.0.clone(),
                status: format!("{:?}", state.record.status),
                expected: "Running".to_string(),
            });
        }
        state.events.push(event);
        Ok(())
    }

    async fn complete_run(&self, run_id: &RunId, summary: RunSummary) -> StorageResult<()> {
        self.finish(run_id, RunStatus::Completed, summary)
    }

    async fn fail_run(&self, run_id: &RunId, summary: RunSummary) -> StorageResult<()> {
        self.finish(run_id, RunStatus::Failed, summary)
    }

    async fn get_run(&self, run_id: &RunId) -> StorageResult<RunRecord> {
        let runs = self.runs.lock().unwrap();
        runs.get(&run_id.0)
            .map(|s| s.record.clone())
            .ok_or_else(|| StorageError::RunNotFound {
                run_id: run_id.0.clone(),
            })
    }

    async fn get_events(&self, run_id: &RunId) -> StorageResult<Vec<RunEvent>> {
        let runs = self.runs.lock().unwrap();
        let state = runs
            .get(&run_id.0)
            .ok_or_else(|| StorageError::RunNotFound {
                run_id: run_id.0.clone(),
            })?;
        let mut events = state.events.clone();
        events.sort_by_key(|e| e.seq);
        Ok(events)
    }

    async fn list_runs(
        &self,
        definition_digest: Option<&ContentDigest>,
    ) -> StorageResult<Vec<RunRecord>> {
        let runs = self.runs.lock().unwrap();
        let records: Vec<RunRecord> = runs
            .values()
            .filter(|s| {
                definition_digest
                    .map(|d| s.record.definition_digest == *d)
                    .unwrap_or(true)
            })
            .map(|s| s.record.clone())
            .collect();
        Ok(records)
    }
}

// ---------------------------------------------------------------------------
// MemoryCacheStore
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct CachedEntry {
    manifest: CacheManifest,
    blobs: BTreeMap<String, Vec<u8>>,
}

/// In-memory cache store. Reads and writes the real directories it is
/// pointed at, but keeps entries in a `HashMap<key, entry>`.
#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    entries: Mutex<HashMap<String, CachedEntry>>,
    writes: Mutex<u64>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of saves that wrote an entry.
    pub fn write_count(&self) -> u64 {
        *self.writes.lock().unwrap()
    }

}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn restore(
        &self,
        key: &str,
        targets: &[PathBuf],
    ) -> StorageResult<Option<CacheManifest>> {
        let Some(entry) = self.entries.lock().unwrap().get(key).cloned() else {
            return Ok(None);
        };
        for (path, data) in &entry.blobs {
            let Some((slot, rel)) = split_slot(path) else {
                continue;
            };
            if let Some(target) = targets.get(slot) {
                let dest = join_rel(target, rel);
                if let Some(parent) = dest.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(dest, data)?;
            }
        }
        Ok(Some(entry.manifest))
    }

    async fn save(&self, key: &str, sources: &[PathBuf]) -> StorageResult<SaveOutcome> {
        let manifest = build_manifest(key, sources)?;
        if manifest.is_empty() {
            return Ok(SaveOutcome::Empty);
        }
        if let Some(existing) = self.entries.lock().unwrap().get(key) {
            if existing.manifest.files == manifest.files {
                return Ok(SaveOutcome::Unchanged);
            }
        }
        let mut blobs = BTreeMap::new();
        for path in manifest.files.keys() {
            if let Some((slot, rel)) = split_slot(path) {
                blobs.insert(path.clone(), std::fs::read(join_rel(&sources[slot], rel))?);
            }
        }
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), CachedEntry { manifest, blobs });
        *self.writes.lock().unwrap() += 1;
        Ok(SaveOutcome::Written)
    }
}

// ---------------------------------------------------------------------------
// MemoryReleaseChannel
// ---------------------------------------------------------------------------

/// In-memory release channel backed by a `HashMap<tag, name → bytes>`.
///
/// Records every token it was handed so tests can assert on the secrets
/// boundary, and can be told to fail uploads for specific asset names.
#[derive(Debug, Default)]
pub struct MemoryReleaseChannel {
    releases: Mutex<HashMap<String, BTreeMap<String, Vec<u8>>>>,
    tokens_seen: Mutex<Vec<SecretToken>>,
    failing: Mutex<HashSet<String>>,
    publish_calls: Mutex<u64>,
}

impl MemoryReleaseChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make uploads of `name` fail.
    pub fn fail_uploads_of(&self, name: &str) {
        self.failing.lock().unwrap().insert(name.to_string());
    }

    /// Contents of an asset on `tag`.
    pub fn asset(&self, tag: &str, name: &str) -> Option<Vec<u8>> {
        let releases = self.releases.lock().unwrap();
        releases.get(tag).and_then(|r| r.get(name).cloned())
    }

    /// Tokens passed to `publish`, in call order.
    pub fn tokens_seen(&self) -> Vec<SecretToken> {
        self.tokens_seen.lock().unwrap().clone()
    }

    /// Number of `publish` calls.
    pub fn publish_calls(&self) -> u64 {
        *self.publish_calls.lock().unwrap()
    }
}

#[async_trait]
impl ReleaseChannel for MemoryReleaseChannel {
    async fn publish(
        &self,
        tag: &str,
        assets: &[ReleaseAsset],
        token: &SecretToken,
    ) -> StorageResult<PublishReport> {
        *self.publish_calls.lock().unwrap() += 1;
        self.tokens_seen.lock().unwrap().push(token.clone());

        let mut uploads = Vec::with_capacity(assets.len());
        for asset in assets {
            if self.failing.lock().unwrap().contains(&asset.name) {
                uploads.push(UploadOutcome::failed(&asset.name, "injected failure"));
                continue;
            }
            match tokio::fs::read(&asset.path).await {
                Ok(data) => {
                    self.releases
                        .lock()
                        .unwrap()
                        .entry(tag.to_string())
                        .or_default()
                        .insert(asset.name.clone(), data);
                    uploads.push(UploadOutcome::ok(&asset.name));
                }
                Err(e) => uploads.push(UploadOutcome::failed(&asset.name, e.to_string())),
            }
        }

        Ok(PublishReport {
            tag: tag.to_string(),
            uploads,
        })
    }

    async fn list_assets(&self, tag: &str, _token: &SecretToken) -> StorageResult<Vec<String>> {
        let releases = self.releases.lock().unwrap();
        Ok(releases
            .get(tag)
            .map(|r| r.keys().cloned().collect())
            .unwrap_or_default())
    }
}

