//! Structured lifecycle events for pipeline Runs.
//!
//! Every function emits one `info!` (or `warn!`) record carrying an
//! `event` field, so JSON logs can be filtered by lifecycle step:
//! `run.started`, `stage.started`, `stage.finished`, `stage.skipped`,
//! `cache.restored`, `cache.saved`, `artifact.published`, `run.finished`,
//! `trigger.evaluated`.

use tracing::{info, warn};

use crate::trigger::TriggerDecision;

/// Span tagging everything inside a Run with its id.
///
/// ```ignore
/// pipeline.execute(..).instrument(obs::run_span(&run_id)).await
/// ```
pub fn run_span(run_id: &str) -> tracing::Span {
    tracing::info_span!("nightly.run", run_id = %run_id)
}

pub fn emit_trigger_evaluated(kind: &str, decision: &TriggerDecision) {
    match decision {
        TriggerDecision::Admit(run) => info!(
            event = "trigger.evaluated",
            kind = %kind,
            admitted = true,
            branch = %run.branch,
        ),
        TriggerDecision::Reject(reason) => info!(
            event = "trigger.evaluated",
            kind = %kind,
            admitted = false,
            reason = %reason,
        ),
    }
}

pub fn emit_run_started(run_id: &str, trigger: &str, commit: Option<&str>) {
    info!(
        event = "run.started",
        run_id = %run_id,
        trigger = %trigger,
        commit = commit.unwrap_or("-"),
    );
}

pub fn emit_stage_started(stage: &str, seq: u64) {
    info!(event = "stage.started", stage = %stage, seq = seq);
}

pub fn emit_stage_finished(stage: &str, exit_code: i32, duration_ms: u64, passed: bool) {
    info!(
        event = "stage.finished",
        stage = %stage,
        exit_code = exit_code,
        duration_ms = duration_ms,
        passed = passed,
    );
}

/// A stage that did not run. `reason` is `disabled` or `aborted`.
pub fn emit_stage_skipped(stage: &str, reason: &str) {
    info!(event = "stage.skipped", stage = %stage, reason = %reason);
}

pub fn emit_cache_restored(key: &str, outcome: &str) {
    info!(event = "cache.restored", key = %key, outcome = %outcome);
}

pub fn emit_cache_saved(key: &str, outcome: &str) {
    info!(event = "cache.saved", key = %key, outcome = %outcome);
}

/// Cache save failed. The Run result is unaffected.
pub fn emit_cache_save_error(key: &str, error: &dyn std::fmt::Display) {
    warn!(event = "cache.save_error", key = %key, error = %error);
}

pub fn emit_artifact_published(tag: &str, name: &str, ok: bool) {
    info!(event = "artifact.published", tag = %tag, name = %name, ok = ok);
}

pub fn emit_run_finished(run_id: &str, duration_ms: u64, total_events: u64, success: bool) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        duration_ms = duration_ms,
        total_events = total_events,
        success = success,
    );
}

/// Emit event: run finalization error (warning level).
pub fn emit_run_finalize_error(run_id: &str, error: &dyn std::fmt::Display) {
    warn!(event = "run.finalize_error", run_id = %run_id, error = %error);
}
