//! JSON-file run ledger.
//!
//! One file per run at `<root>/<run_id>.json` holding the record and its
//! events. Writes go through a temp file and rename.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::StorageError;
use crate::storage_traits::*;

#[derive(Debug, Serialize, Deserialize)]
struct StoredRun {
    record: RunRecord,
    events: Vec<RunEvent>,
}

/// Run ledger persisted as JSON files in a directory.
#[derive(Debug)]
pub struct FsRunLedger {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl FsRunLedger {
    /// Open (and create if needed) a ledger directory.
    pub async fn open(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    /// Only UUIDs map to files, so an id can never name a path outside
    /// the ledger directory.
    fn run_path(&self, run_id: &RunId) -> StorageResult<PathBuf> {
        let id = Uuid::parse_str(&run_id.0).map_err(|_| StorageError::InvalidRunId {
            run_id: run_id.0.clone(),
        })?;
        Ok(self.root.join(format!("{}.json", id.hyphenated())))
    }

    async fn load(&self, run_id: &RunId) -> StorageResult<StoredRun> {
        let bytes = match tokio::fs::read(self.run_path(run_id)?).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::RunNotFound {
                    run_id: run_id.0.clone(),
                })
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn store(&self, run: &StoredRun) -> StorageResult<()> {
        let path = self.run_path(&run.record.run_id)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(run)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn finish(
        &self,
        run_id: &RunId,
        status: RunStatus,
        summary: RunSummary,
    ) -> StorageResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut run = self.load(run_id).await?;
        ensure_running(&run.record)?;
        run.record.status = status;
        run.record.summary = Some(summary);
        run.record.completed_at = Some(Utc::now());
        self.store(&run).await
    }
}

fn ensure_running(record: &RunRecord) -> StorageResult<()> {
    if record.status != RunStatus::Running {
        return Err(StorageError::InvalidRunState {
            run_id: record.run_id.0.clone(),
            status: format!("{:?}", record.status),
            expected: "Running".to_string(),
        });
    }
    Ok(())
}

#[async_trait]
impl RunLedger for FsRunLedger {
    async fn create_run(
        &self,
        definition_digest: &ContentDigest,
        metadata: RunMetadata,
    ) -> StorageResult<RunId> {
        let run_id = RunId::new();
        let run = StoredRun {
            record: RunRecord {
                run_id: run_id.clone(),
                definition_digest: definition_digest.clone(),
                metadata,
                status: RunStatus::Running,
                summary: None,
                created_at: Utc::now(),
                completed_at: None,
            },
            events: Vec::new(),
        };
        let _guard = self.write_lock.lock().await;
        self.store(&run).await?;
        Ok(run_id)
    }

    async fn append_event(&self, run_id: &RunId, event: RunEvent) -> StorageResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut run = self.load(run_id).await?;
        ensure_running(&run.record)?;
        run.events.push(event);
        self.store(&run).await
    }

    async fn complete_run(&self, run_id: &RunId, summary: RunSummary) -> StorageResult<()> {
        self.finish(run_id, RunStatus::Completed, summary).await
    }

    async fn fail_run(&self, run_id: &RunId, summary: RunSummary) -> StorageResult<()> {
        self.finish(run_id, RunStatus::Failed, summary).await
    }

    async fn get_run(&self, run_id: &RunId) -> StorageResult<RunRecord> {
        Ok(self.load(run_id).await?.record)
    }

    async fn get_events(&self, run_id: &RunId) -> StorageResult<Vec<RunEvent>> {
        let mut events = self.load(run_id).await?.events;
        events.sort_by_key(|e| e.seq);
        Ok(events)
    }

    async fn list_runs(
        &self,
        definition_digest: Option<&ContentDigest>,
    ) -> StorageResult<Vec<RunRecord>> {
        let mut records = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = tokio::fs::read(&path).await?;
            let run: StoredRun = match serde_json::from_slice(&bytes) {
                Ok(run) => run,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable run file");
                    continue;
                }
            };
            if definition_digest
                .map(|d| run.record.definition_digest == *d)
                .unwrap_or(true)
            {
                records.push(run.record);
            }
        }
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }
}
