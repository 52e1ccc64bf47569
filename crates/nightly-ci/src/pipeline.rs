//! Pipeline orchestration and run recording.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use nightly_state::{
    CacheStore, ContentDigest, ReleaseChannel, RunEvent, RunId, RunLedger, RunMetadata,
    RunSummary, SaveOutcome, SecretToken,
};
use serde_json::{json, Value};
use tracing::{info, warn, Instrument};

use crate::artifact::collect_artifacts;
use crate::cache::{CacheKey, CacheManager, RestoreOutcome};
use crate::definition::PipelineDefinition;
use crate::error::{PipelineError, Result};
use crate::events;
use crate::obs;
use crate::runner::{ExecContext, StageExecutor, StageResult, StageRunner};
use crate::stage::{FailureKind, StageAction, StageConfig};
use crate::trigger::{
    AdmittedRun, RejectReason, TriggerDecision, TriggerEvent, TriggerKind, TriggerSet,
};

/// External collaborators of a Run.
#[derive(Clone)]
pub struct PipelineServices {
    pub ledger: Arc<dyn RunLedger>,
    pub cache: Arc<dyn CacheStore>,
    pub release: Arc<dyn ReleaseChannel>,
    pub executor: Arc<dyn StageExecutor>,
}

/// Per-invocation settings.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Checkout directory; every command runs here.
    pub workspace: PathBuf,

    /// Home directory for `~/` cache paths.
    pub home_dir: PathBuf,

    /// Upload credential. Only the publish stage sees it.
    pub token: Option<SecretToken>,
}

/// A stage that did not produce a result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedStage {
    pub name: String,
    /// `disabled` or `aborted`
    pub reason: &'static str,
}

/// The fatal failure that ended a Run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageFailure {
    pub stage: String,
    pub kind: FailureKind,
    pub message: String,
}

/// Result of a complete pipeline Run.
#[derive(Debug, Clone)]
pub struct PipelineResult {
    pub run_id: String,

    /// Whether every fatal stage passed.
    pub success: bool,

    pub trigger: TriggerKind,

    /// Results of the stages that ran, in order.
    pub stages: Vec<StageResult>,

    pub skipped: Vec<SkippedStage>,

    pub failure: Option<StageFailure>,

    /// Asset names uploaded to the release channel.
    pub published: Vec<String>,

    pub cache_key: Option<String>,

    /// `None` when no save was attempted.
    pub cache_saved: Option<SaveOutcome>,

    /// Total duration in milliseconds.
    pub duration_ms: u64,

    pub definition_digest: String,
}

impl PipelineResult {
    /// Number of stages that passed.
    pub fn passed_count(&self) -> usize {
        self.stages.iter().filter(|s| s.passed()).count()
    }

    /// Number of stages that failed.
    pub fn failed_count(&self) -> usize {
        self.stages.iter().filter(|s| !s.passed()).count()
    }
}

/// What happened to an incoming event.
#[derive(Debug, Clone)]
pub enum RunOutcome {
    /// No Run was created.
    Rejected(RejectReason),
    Finished(Box<PipelineResult>),
}

/// Appends ordered events to one Run in the ledger.
struct RunRecorder {
    ledger: Arc<dyn RunLedger>,
    run_id: RunId,
    seq: u64,
    /// Assets uploaded so far, for the summary of an aborted Run.
    published: usize,
}

impl RunRecorder {
    async fn start(
        ledger: Arc<dyn RunLedger>,
        digest: &ContentDigest,
        metadata: RunMetadata,
    ) -> Result<Self> {
        let run_id = ledger.create_run(digest, metadata).await?;
        Ok(Self {
            ledger,
            run_id,
            seq: 0,
            published: 0,
        })
    }

    async fn record(&mut self, kind: &str, payload: Value) -> Result<u64> {
        self.seq += 1;
        let event = RunEvent {
            seq: self.seq,
            kind: kind.to_string(),
            payload,
            timestamp: Utc::now(),
        };
        self.ledger.append_event(&self.run_id, event).await?;
        Ok(self.seq)
    }

    async fn finish(&self, summary: RunSummary) -> Result<()> {
        let finished = if summary.success {
            self.ledger.complete_run(&self.run_id, summary).await
        } else {
            self.ledger.fail_run(&self.run_id, summary).await
        };
        if let Err(e) = &finished {
            obs::emit_run_finalize_error(&self.run_id.to_string(), e);
        }
        Ok(finished?)
    }
}

/// Outcome of the publish stage body.
struct PublishStep {
    outcome: std::result::Result<String, String>,
    published: Vec<String>,
}

/// The nightly pipeline: trigger rules, stage list and services.
pub struct NightlyPipeline {
    definition: PipelineDefinition,
    triggers: TriggerSet,
    services: PipelineServices,
    cache: CacheManager,
}

impl NightlyPipeline {
    /// Validate `definition` and bind it to `services`.
    pub fn new(definition: PipelineDefinition, services: PipelineServices) -> Result<Self> {
        definition.validate()?;
        let triggers = definition.trigger_set()?;
        let cache = CacheManager::new(services.cache.clone(), definition.cache.clone());
        Ok(Self {
            definition,
            triggers,
            services,
            cache,
        })
    }

    pub fn definition(&self) -> &PipelineDefinition {
        &self.definition
    }

    /// Decide whether `event` starts a Run. No side effects besides logging.
    pub fn evaluate(&self, event: &TriggerEvent) -> TriggerDecision {
        let kind = match event {
            TriggerEvent::ScheduledTick { .. } => TriggerKind::Scheduled,
            TriggerEvent::Push { .. } => TriggerKind::Push,
        };
        let decision = match self.triggers.evaluate(event) {
            TriggerDecision::Admit(mut run) => {
                if run.kind == TriggerKind::Scheduled {
                    run.branch = self.definition.main_branch.clone();
                }
                TriggerDecision::Admit(run)
            }
            rejected => rejected,
        };
        obs::emit_trigger_evaluated(kind.as_str(), &decision);
        decision
    }

    /// Evaluate `event` and, when admitted, execute the Run.
    ///
    /// A rejected event touches nothing: no ledger record, no stage.
    pub async fn handle_event(
        &self,
        event: &TriggerEvent,
        opts: &RunOptions,
    ) -> Result<RunOutcome> {
        match self.evaluate(event) {
            TriggerDecision::Reject(reason) => Ok(RunOutcome::Rejected(reason)),
            TriggerDecision::Admit(admitted) => {
                let result = self.run(&admitted, opts).await?;
                Ok(RunOutcome::Finished(Box::new(result)))
            }
        }
    }

    /// Execute every stage for an admitted event.
    ///
    /// Stages run strictly in order. The first failing fatal stage aborts the
    /// Run: later stages are recorded as skipped, nothing is published and
    /// the cache is not saved. The Run is finalized as Completed or Failed.
    pub async fn run(&self, admitted: &AdmittedRun, opts: &RunOptions) -> Result<PipelineResult> {
        let start = Instant::now();
        let digest = self.definition.digest()?;

        let metadata = RunMetadata {
            git_ref: Some(
                admitted
                    .commit
                    .clone()
                    .unwrap_or_else(|| admitted.branch.clone()),
            ),
            pipeline: self.definition.name.clone(),
            trigger: admitted.kind.as_str().to_string(),
            tags: json!({
                "branch": &admitted.branch,
                "triggered_at": admitted.at.to_rfc3339(),
                "stages": self.definition.stage_names(),
                "workspace": opts.workspace.to_string_lossy(),
            }),
        };

        let mut recorder =
            RunRecorder::start(self.services.ledger.clone(), &digest, metadata).await?;
        let run_id = recorder.run_id.to_string();

        async {
            obs::emit_run_started(&run_id, admitted.kind.as_str(), admitted.commit.as_deref());

            let mut result = match self.execute(&mut recorder, admitted, opts).await {
                Ok(result) => result,
                Err(e) => {
                    // Never leave the record Running
                    let duration_ms = start.elapsed().as_millis() as u64;
                    let summary = RunSummary {
                        total_events: recorder.seq,
                        artifacts_published: recorder.published,
                        duration_ms,
                        success: false,
                    };
                    warn!(error = %e, "Run aborted by an internal error");
                    if recorder.finish(summary).await.is_ok() {
                        obs::emit_run_finished(&run_id, duration_ms, recorder.seq, false);
                    }
                    return Err(e);
                }
            };

            let duration_ms = start.elapsed().as_millis() as u64;
            let summary = RunSummary {
                total_events: recorder.seq,
                artifacts_published: result.published.len(),
                duration_ms,
                success: result.success,
            };
            recorder.finish(summary).await?;
            obs::emit_run_finished(&run_id, duration_ms, recorder.seq, result.success);

            result.duration_ms = duration_ms;
            result.definition_digest = digest.to_string();
            Ok::<_, PipelineError>(result)
        }
        .instrument(obs::run_span(&run_id))
        .await
    }

    fn exec_context(&self, admitted: &AdmittedRun, opts: &RunOptions) -> ExecContext {
        let mut ctx = ExecContext::new(&opts.workspace);
        ctx.env = self.definition.env.clone();
        if admitted.kind == TriggerKind::Scheduled {
            let marker = &self.definition.schedule_marker;
            ctx.env.insert(marker.name.clone(), marker.value.clone());
        }
        ctx.vars
            .insert("repo_url", self.definition.repository_url.clone());
        ctx.vars.insert("branch", admitted.branch.clone());
        ctx.vars.insert(
            "ref",
            admitted
                .commit
                .clone()
                .unwrap_or_else(|| admitted.branch.clone()),
        );
        ctx.scrub.push(self.definition.publish.token_env.clone());
        ctx
    }

    async fn execute(
        &self,
        recorder: &mut RunRecorder,
        admitted: &AdmittedRun,
        opts: &RunOptions,
    ) -> Result<PipelineResult> {
        let ctx = self.exec_context(admitted, opts);
        let cache_paths = self.cache.paths(&opts.workspace, &opts.home_dir);

        let mut stages = Vec::new();
        let mut skipped = Vec::new();
        let mut failure: Option<StageFailure> = None;
        let mut published = Vec::new();
        let mut cache_key: Option<CacheKey> = None;

        for config in &self.definition.stages {
            let skip_reason = if !config.enabled {
                Some("disabled")
            } else if failure.is_some() {
                Some("aborted")
            } else {
                None
            };
            if let Some(reason) = skip_reason {
                obs::emit_stage_skipped(&config.name, reason);
                recorder
                    .record(
                        events::STAGE_SKIPPED,
                        json!({ "stage": &config.name, "reason": reason }),
                    )
                    .await?;
                skipped.push(SkippedStage {
                    name: config.name.clone(),
                    reason,
                });
                continue;
            }

            let seq = recorder
                .record(
                    events::STAGE_STARTED,
                    json!({
                        "stage": &config.name,
                        "action": action_name(&config.action),
                        "fatal": config.fatal,
                        "timeout_secs": config.timeout_secs,
                    }),
                )
                .await?;
            obs::emit_stage_started(&config.name, seq);
            let stage_start = Instant::now();

            let result = match &config.action {
                StageAction::Commands { commands } => {
                    match StageRunner::execute_stage(
                        self.services.executor.as_ref(),
                        config,
                        commands,
                        &ctx,
                    )
                    .await
                    {
                        Ok(r) => r,
                        // Spawn error or timeout: the stage failed
                        Err(e) => StageResult::errored(
                            &config.name,
                            &e,
                            stage_start.elapsed().as_millis() as u64,
                        ),
                    }
                }
                StageAction::RestoreCache => {
                    let outcome = self.restore_cache(opts, &cache_paths, &mut cache_key).await;
                    StageResult::internal(
                        &config.name,
                        outcome,
                        stage_start.elapsed().as_millis() as u64,
                    )
                }
                StageAction::Publish => {
                    let step = self.publish(recorder, &config.name, admitted, opts).await?;
                    published = step.published;
                    StageResult::internal(
                        &config.name,
                        step.outcome,
                        stage_start.elapsed().as_millis() as u64,
                    )
                }
            };

            obs::emit_stage_finished(
                &config.name,
                result.exit_code,
                result.duration_ms,
                result.passed(),
            );
            let mut payload = events::stage_result_payload(&result);
            payload["fatal"] = json!(config.fatal);
            if result.passed() {
                recorder.record(events::STAGE_SUCCEEDED, payload).await?;
            } else {
                let kind = config.failure_kind();
                payload["failure_kind"] = json!(kind.as_str());
                payload["error"] = json!(failure_message(config, &result));
                recorder.record(events::STAGE_FAILED, payload).await?;
                if config.fatal {
                    warn!(stage = %config.name, kind = %kind, "Fatal stage failure, aborting run");
                    failure = Some(StageFailure {
                        stage: config.name.clone(),
                        kind,
                        message: failure_message(config, &result),
                    });
                } else {
                    warn!(stage = %config.name, kind = %kind, "Non-fatal stage failure, continuing");
                }
            }
            stages.push(result);
        }

        let success = failure.is_none();
        let mut cache_saved = None;
        if let (true, Some(key)) = (success, &cache_key) {
            cache_saved = self.save_cache(recorder, key, &cache_paths).await?;
        }

        Ok(PipelineResult {
            run_id: recorder.run_id.to_string(),
            success,
            trigger: admitted.kind,
            stages,
            skipped,
            failure,
            published,
            cache_key: cache_key.map(|k| k.to_string()),
            cache_saved,
            duration_ms: 0,
            definition_digest: String::new(),
        })
    }

    /// Compute the key (lock files exist only after the fetch) and restore.
    /// `Err` carries the message for a non-fatal stage failure.
    async fn restore_cache(
        &self,
        opts: &RunOptions,
        paths: &[PathBuf],
        cache_key: &mut Option<CacheKey>,
    ) -> std::result::Result<String, String> {
        let key = self
            .cache
            .key(&opts.workspace)
            .map_err(|e| format!("cannot compute cache key: {e}"))?;
        let key_str = key.to_string();
        *cache_key = Some(key.clone());

        match self.cache.restore(&key, paths).await {
            RestoreOutcome::Hit(manifest) => {
                obs::emit_cache_restored(&key_str, "hit");
                Ok(format!("restored {} file(s) from {key_str}", manifest.files.len()))
            }
            RestoreOutcome::Miss => {
                obs::emit_cache_restored(&key_str, "miss");
                Ok(format!("no cache entry for {key_str}"))
            }
            RestoreOutcome::Failed(message) => {
                obs::emit_cache_restored(&key_str, "error");
                Err(format!("cache restore failed for {key_str}: {message}"))
            }
        }
    }

    /// Save at the end of a successful Run. A failed save is logged and
    /// does not change the Run result.
    async fn save_cache(
        &self,
        recorder: &mut RunRecorder,
        key: &CacheKey,
        paths: &[PathBuf],
    ) -> Result<Option<SaveOutcome>> {
        let key_str = key.to_string();
        match self.cache.save(key, paths).await {
            Ok(outcome) => {
                let label = match outcome {
                    SaveOutcome::Written => "written",
                    SaveOutcome::Unchanged => "unchanged",
                    SaveOutcome::Empty => "empty",
                };
                obs::emit_cache_saved(&key_str, label);
                recorder
                    .record(
                        events::CACHE_SAVED,
                        json!({ "key": &key_str, "outcome": label }),
                    )
                    .await?;
                Ok(Some(outcome))
            }
            Err(e) => {
                obs::emit_cache_save_error(&key_str, &e);
                Ok(None)
            }
        }
    }

    async fn publish(
        &self,
        recorder: &mut RunRecorder,
        stage: &str,
        admitted: &AdmittedRun,
        opts: &RunOptions,
    ) -> Result<PublishStep> {
        let publish = &self.definition.publish;
        let fail = |message: String| PublishStep {
            outcome: Err(message),
            published: Vec::new(),
        };

        let Some(token) = &opts.token else {
            return Ok(fail(format!(
                "no release token available (set {})",
                publish.token_env
            )));
        };

        let artifacts = match collect_artifacts(&opts.workspace, &publish.artifact_glob) {
            Ok(a) => a,
            Err(e) => return Ok(fail(format!("artifact collection failed: {e}"))),
        };
        if artifacts.is_empty() {
            return Ok(fail(format!(
                "no artifacts matched '{}'",
                publish.artifact_glob
            )));
        }

        let assets: Vec<_> = artifacts.iter().map(|a| a.to_asset()).collect();
        info!(tag = %publish.tag, count = assets.len(), "Publishing artifacts");
        let report = match self
            .services
            .release
            .publish(&publish.tag, &assets, token)
            .await
        {
            Ok(report) => report,
            Err(e) => return Ok(fail(format!("release upload failed: {e}"))),
        };

        for upload in &report.uploads {
            obs::emit_artifact_published(&report.tag, &upload.name, upload.succeeded());
        }
        let uploaded: Vec<String> = report
            .uploads
            .iter()
            .filter(|u| u.succeeded())
            .map(|u| u.name.clone())
            .collect();

        if !report.all_succeeded() {
            let failed: Vec<String> = report
                .failures()
                .map(|u| format!("{}: {}", u.name, u.error.as_deref().unwrap_or("unknown")))
                .collect();
            // Already-uploaded assets stay on the release
            recorder.published = uploaded.len();
            return Ok(PublishStep {
                outcome: Err(format!(
                    "{} of {} upload(s) failed ({}); uploaded before failure: [{}]",
                    failed.len(),
                    report.uploads.len(),
                    failed.join("; "),
                    uploaded.join(", ")
                )),
                published: Vec::new(),
            });
        }

        recorder.published = uploaded.len();
        recorder
            .record(
                events::ARTIFACTS_PUBLISHED,
                json!({
                    "stage": stage,
                    "tag": &report.tag,
                    "commit": admitted.commit.as_deref(),
                    "artifacts": &uploaded,
                }),
            )
            .await?;

        Ok(PublishStep {
            outcome: Ok(format!(
                "published {} artifact(s) to '{}'",
                uploaded.len(),
                report.tag
            )),
            published: uploaded,
        })
    }
}

fn action_name(action: &StageAction) -> &'static str {
    match action {
        StageAction::Commands { .. } => "commands",
        StageAction::RestoreCache => "restore_cache",
        StageAction::Publish => "publish",
    }
}

fn failure_message(config: &StageConfig, result: &StageResult) -> String {
    if result.exit_code == -1 || (result.commands_run == 0 && !result.stderr.is_empty()) {
        format!("Stage '{}' failed: {}", config.name, result.stderr.trim())
    } else {
        format!(
            "Stage '{}' exited with code {}",
            config.name, result.exit_code
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(name: &str, exit_code: i32) -> StageResult {
        StageResult {
            stage_name: name.to_string(),
            exit_code,
            stdout: String::new(),
            stderr: String::new(),
            duration_ms: 100,
            success: exit_code == 0,
            commands_run: 1,
        }
    }

    fn pipeline_result(stages: Vec<StageResult>) -> PipelineResult {
        PipelineResult {
            run_id: "run123".to_string(),
            success: stages.iter().all(|s| s.passed()),
            trigger: TriggerKind::Push,
            stages,
            skipped: Vec::new(),
            failure: None,
            published: Vec::new(),
            cache_key: None,
            cache_saved: None,
            duration_ms: 300,
            definition_digest: "abc123".to_string(),
        }
    }

    #[test]
    fn test_pipeline_result_counts() {
        let result = pipeline_result(vec![result("build", 0), result("test", 0)]);
        assert_eq!(result.passed_count(), 2);
        assert_eq!(result.failed_count(), 0);
        assert!(result.success);
    }

    #[test]
    fn test_pipeline_result_with_failures() {
        let result = pipeline_result(vec![result("build", 0), result("test", 101)]);
        assert_eq!(result.passed_count(), 1);
        assert_eq!(result.failed_count(), 1);
        assert!(!result.success);
    }

    #[test]
    fn test_failure_message() {
        let config = StageConfig::from_builtin(crate::stage::BuiltinStage::Build, 60);
        assert_eq!(
            failure_message(&config, &result("build", 101)),
            "Stage 'build' exited with code 101"
        );
        let mut errored = result("build", -1);
        errored.stderr = "timed out".to_string();
        assert_eq!(
            failure_message(&config, &errored),
            "Stage 'build' failed: timed out"
        );
    }
}
