//! Nightly-CI: the nightly build-and-publish pipeline
//!
//! Provides a pipeline orchestrator that:
//! - Admits or rejects schedule ticks and pushes against trigger rules
//! - Executes a fixed, ordered list of stages and stops at the first fatal failure
//! - Restores and saves a dependency cache keyed by platform and lock files
//! - Publishes packaged artifacts to the mutable `nightly` release
//! - Records every Run in a ledger that `RunGate` can check

pub mod artifact;
pub mod cache;
pub mod definition;
mod error;
pub mod events;
pub mod gate;
pub mod obs;
pub mod pipeline;
pub mod runner;
pub mod stage;
pub mod telemetry;
pub mod trigger;

// Re-export key types
pub use artifact::{collect_artifacts, Artifact};
pub use cache::{CacheKey, CacheManager, RestoreOutcome};
pub use definition::PipelineDefinition;
pub use error::{PipelineError, Result};
pub use gate::{GateVerdict, RunGate};
pub use pipeline::{
    NightlyPipeline, PipelineResult, PipelineServices, RunOptions, RunOutcome, SkippedStage,
    StageFailure,
};
pub use runner::{
    CommandOutput, CommandRequest, ExecContext, ProcessExecutor, StageExecutor, StageResult,
    StageRunner,
};
pub use stage::{BuiltinStage, CommandSpec, Condition, FailureKind, StageAction, StageConfig};
pub use trigger::{
    AdmittedRun, RejectReason, TriggerDecision, TriggerEvent, TriggerKind, TriggerRule, TriggerSet,
};
