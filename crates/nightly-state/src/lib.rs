//! Nightly-State: storage for the nightly pipeline
//!
//! This crate holds every piece of state a pipeline Run reads or writes
//! outside its own process.
//!
//! ## Key Components
//!
//! - `RunLedger`: Run records and their ordered events (`FsRunLedger`)
//! - `CacheStore`: Keyed snapshots of dependency/build directories (`FsCacheStore`)
//! - `ReleaseChannel`: The mutable "nightly" publish target
//!   (`GithubReleaseChannel`, `DirReleaseChannel`)
//! - `fakes`: In-memory implementations of all three for tests

mod error;
pub mod dir_release;
pub mod fakes;
pub mod fs_cache;
pub mod fs_ledger;
pub mod github_release;
pub mod snapshot;
pub mod storage_traits;

pub use dir_release::DirReleaseChannel;
pub use error::StorageError;
pub use fs_cache::FsCacheStore;
pub use fs_ledger::FsRunLedger;
pub use github_release::GithubReleaseChannel;
pub use storage_traits::{
    CacheManifest, CacheStore, ContentDigest, PublishReport, ReleaseAsset, ReleaseChannel,
    RunEvent, RunId, RunLedger, RunMetadata, RunRecord, RunStatus, RunSummary, SaveOutcome,
    SecretToken, StorageResult, UploadOutcome,
};
