//! Storage trait definitions for the nightly pipeline
//!
//! These traits define the three pieces of state a Run touches:
//! - `RunLedger`: Run persistence (events, summaries)
//! - `CacheStore`: Keyed directory snapshots shared between Runs
//! - `ReleaseChannel`: The mutable publish target artifacts are uploaded to
//!
//! All traits are async and backend-agnostic. In-memory fakes are provided
//! for testing via the `fakes` module.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::StorageError;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Content digest (SHA-256 hex string).
///
/// The inner field is private to guarantee the string is always valid
/// lowercase hex produced by `from_bytes` or validated via `TryFrom<String>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentDigest(String);

impl ContentDigest {
    /// Compute the SHA-256 digest of the given bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        use sha2::Digest;
        let mut hasher = Sha256::new();
        hasher.update(data);
        ContentDigest(hex::encode(hasher.finalize()))
    }

    /// Return the full hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form (first 12 hex chars).
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl TryFrom<String> for ContentDigest {
    type Error = StorageError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        if s.len() != 64 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(StorageError::InvalidDigest { digest: s });
        }
        Ok(ContentDigest(s.to_ascii_lowercase()))
    }
}

impl std::fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// RunLedger: Run Persistence
// ---------------------------------------------------------------------------

/// Unique identifier for a pipeline run
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    /// Generate a new random RunId
    pub fn new() -> Self {
        RunId(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Metadata attached to a run at creation time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetadata {
    /// Commit reference the run builds
    pub git_ref: Option<String>,
    /// Pipeline name
    pub pipeline: String,
    /// What admitted the run ("scheduled" or "push")
    pub trigger: String,
    /// Arbitrary key-value tags
    pub tags: serde_json::Value,
}

/// A single event in a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    /// Monotonic sequence number within the run
    pub seq: u64,
    /// Event kind (e.g. "stage_started", "stage_failed", "cache_saved")
    pub kind: String,
    /// Event payload
    pub payload: serde_json::Value,
    /// Timestamp
    pub timestamp: DateTime<Utc>,
}

/// Summary produced when a run completes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    /// Total events recorded
    pub total_events: u64,
    /// Number of artifacts published (zero unless every stage passed)
    pub artifacts_published: usize,
    /// Duration in milliseconds
    pub duration_ms: u64,
    /// Whether the run succeeded
    pub success: bool,
}

/// Status of a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

/// Full run record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: RunId,
    pub definition_digest: ContentDigest,
    pub metadata: RunMetadata,
    pub status: RunStatus,
    pub summary: Option<RunSummary>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Run ledger.
///
/// Guarantees:
/// - Events are ordered by monotonic `seq` within a run.
/// - A run transitions: Running → Completed | Failed (terminal).
/// - Finished runs are immutable.
#[async_trait]
pub trait RunLedger: Send + Sync {
    /// Create a new run, returning its unique ID.
    async fn create_run(
        &self,
        definition_digest: &ContentDigest,
        metadata: RunMetadata,
    ) -> StorageResult<RunId>;

    /// Append an event to an active run. Fails if the run is finished.
    async fn append_event(&self, run_id: &RunId, event: RunEvent) -> StorageResult<()>;

    /// Mark a run as completed with a summary.
    async fn complete_run(&self, run_id: &RunId, summary: RunSummary) -> StorageResult<()>;

    /// Mark a run as failed with a summary.
    async fn fail_run(&self, run_id: &RunId, summary: RunSummary) -> StorageResult<()>;

    /// Retrieve a run record by ID.
    async fn get_run(&self, run_id: &RunId) -> StorageResult<RunRecord>;

    /// Retrieve all events for a run, ordered by seq.
    async fn get_events(&self, run_id: &RunId) -> StorageResult<Vec<RunEvent>>;

    /// List runs, optionally filtered by definition digest.
    async fn list_runs(
        &self,
        definition_digest: Option<&ContentDigest>,
    ) -> StorageResult<Vec<RunRecord>>;
}

// ---------------------------------------------------------------------------
// CacheStore: Keyed Directory Snapshots
// ---------------------------------------------------------------------------

/// Content listing of a cache entry.
///
/// `files` maps `<slot>/<relative path>` to the SHA-256 of the file, where
/// `slot` is the index of the cached directory in the path list. The map is
/// ordered so the serialized manifest is deterministic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheManifest {
    /// Cache key string the entry was saved under
    pub key: String,
    /// Per-file content digests
    pub files: BTreeMap<String, String>,
}

impl CacheManifest {
    /// Digest over the file listing (the key is not part of it).
    pub fn content_digest(&self) -> ContentDigest {
        let mut buf = Vec::new();
        for (path, digest) in &self.files {
            buf.extend_from_slice(path.as_bytes());
            buf.push(0);
            buf.extend_from_slice(digest.as_bytes());
            buf.push(b'\n');
        }
        ContentDigest::from_bytes(&buf)
    }

    /// Whether the listing is empty.
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Outcome of a cache save request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SaveOutcome {
    /// A new or replacement entry was written.
    Written,
    /// An entry with identical content already exists under the key.
    Unchanged,
    /// None of the cached paths exist; nothing was stored.
    Empty,
}

/// Build cache store.
///
/// Guarantees:
/// - A miss is `Ok(None)`, never an error.
/// - `save` is a no-op when the stored entry already has the same content.
/// - Concurrent writers to the same key race; the last writer wins.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Copy the entry under `key` into `targets` (slot `i` into `targets[i]`).
    /// Returns `None` on a miss.
    async fn restore(&self, key: &str, targets: &[PathBuf])
        -> StorageResult<Option<CacheManifest>>;

    /// Snapshot `sources` under `key` unless an identical entry exists.
    async fn save(&self, key: &str, sources: &[PathBuf]) -> StorageResult<SaveOutcome>;
}

// ---------------------------------------------------------------------------
// ReleaseChannel: Mutable Publish Target
// ---------------------------------------------------------------------------

/// Repository-scoped credential for the release channel.
///
/// `Debug` never prints the value.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretToken(String);

impl SecretToken {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The raw token, for the one call site that authenticates.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for SecretToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretToken(***)")
    }
}

/// A local file to upload under `name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseAsset {
    pub name: String,
    pub path: PathBuf,
}

impl ReleaseAsset {
    /// Asset named after the file name of `path`.
    pub fn from_path(path: PathBuf) -> Self {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string_lossy().into_owned());
        Self { name, path }
    }
}

/// Per-file upload result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadOutcome {
    pub name: String,
    /// Error message when the upload failed
    pub error: Option<String>,
}

impl UploadOutcome {
    pub fn ok(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            error: None,
        }
    }

    pub fn failed(name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            error: Some(error.into()),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Result of publishing a set of assets to a tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishReport {
    pub tag: String,
    pub uploads: Vec<UploadOutcome>,
}

impl PublishReport {
    pub fn all_succeeded(&self) -> bool {
        self.uploads.iter().all(UploadOutcome::succeeded)
    }

    pub fn failures(&self) -> impl Iterator<Item = &UploadOutcome> {
        self.uploads.iter().filter(|u| !u.succeeded())
    }
}

/// Release channel.
///
/// Semantics:
/// - `publish` uploads every asset to `tag`, replacing a same-named asset.
/// - There is no versioning: the last publisher of a name wins.
/// - Transport errors for a single file are reported in the `PublishReport`;
///   `Err` is reserved for failures that affect the whole tag.
#[async_trait]
pub trait ReleaseChannel: Send + Sync {
    /// Upload `assets` to `tag`.
    async fn publish(
        &self,
        tag: &str,
        assets: &[ReleaseAsset],
        token: &SecretToken,
    ) -> StorageResult<PublishReport>;

    /// Names of the assets currently attached to `tag`.
    async fn list_assets(&self, tag: &str, token: &SecretToken) -> StorageResult<Vec<String>>;
}
