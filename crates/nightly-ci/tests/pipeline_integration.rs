//! Integration tests for the nightly pipeline with in-memory services.
//!
//! Stage commands go to a recording executor that simulates the external
//! tools (clone, build, packaging) by touching files in the workspace.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use nightly_ci::{
    events, AdmittedRun, BuiltinStage, CommandOutput, CommandRequest, FailureKind,
    NightlyPipeline, PipelineDefinition, PipelineError, PipelineServices, RunGate, RunOptions,
    RunOutcome, StageExecutor, TriggerEvent, TriggerKind,
};
use nightly_state::fakes::{MemoryCacheStore, MemoryReleaseChannel, MemoryRunLedger};
use nightly_state::{
    CacheManifest, CacheStore, ContentDigest, ReleaseChannel, RunEvent, RunId, RunLedger,
    RunMetadata, RunRecord, RunStatus, RunSummary, SaveOutcome, SecretToken, StorageError,
    StorageResult,
};
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;

// ===========================================================================
// Test doubles
// ===========================================================================

#[derive(Default)]
struct RecordingExecutor {
    requests: Mutex<Vec<CommandRequest>>,
    exit_codes: Mutex<HashMap<String, i32>>,
    spawn_errors: Mutex<Vec<String>>,
    artifacts: Mutex<Vec<String>>,
}

impl RecordingExecutor {
    fn new() -> Self {
        let exec = Self::default();
        exec.set_artifacts(&[
            "project-nightly.deb",
            "project-nightly.xz",
            "project-src.tar.gz",
        ]);
        exec
    }

    /// Make the command whose argv joins to `command` exit with `code`.
    fn exit_with(&self, command: &str, code: i32) {
        self.exit_codes
            .lock()
            .unwrap()
            .insert(command.to_string(), code);
    }

    fn fail_to_spawn(&self, command: &str) {
        self.spawn_errors.lock().unwrap().push(command.to_string());
    }

    /// Files `bash ci/deploy.sh` creates.
    fn set_artifacts(&self, names: &[&str]) {
        *self.artifacts.lock().unwrap() = names.iter().map(|n| n.to_string()).collect();
    }

    fn requests(&self) -> Vec<CommandRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn commands(&self) -> Vec<String> {
        self.requests().iter().map(|r| r.argv.join(" ")).collect()
    }

    fn stages_run(&self) -> Vec<String> {
        let mut stages: Vec<String> = Vec::new();
        for r in self.requests() {
            if stages.last() != Some(&r.stage) {
                stages.push(r.stage);
            }
        }
        stages
    }
}

#[async_trait]
impl StageExecutor for RecordingExecutor {
    async fn run_command(&self, request: &CommandRequest) -> nightly_ci::Result<CommandOutput> {
        self.requests.lock().unwrap().push(request.clone());
        let command = request.argv.join(" ");

        if self.spawn_errors.lock().unwrap().contains(&command) {
            return Err(PipelineError::Spawn {
                stage: request.stage.clone(),
                program: request.argv[0].clone(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
            });
        }
        if let Some(code) = self.exit_codes.lock().unwrap().get(&command) {
            return Ok(CommandOutput {
                exit_code: *code,
                stdout: String::new(),
                stderr: format!("{command} failed"),
            });
        }

        let cwd = &request.cwd;
        match request.argv.as_slice() {
            [git, clone, ..] if git == "git" && clone == "clone" => {
                write(&cwd.join(".git/shallow"), "abc\n");
                write(&cwd.join("Cargo.lock"), "version = 3\n");
            }
            [cargo, build, ..] if cargo == "cargo" && build == "build" => {
                write(&cwd.join("target/release/app"), "binary");
            }
            [bash, script] if bash == "bash" && script == "ci/deploy.sh" => {
                for name in self.artifacts.lock().unwrap().iter() {
                    write(&cwd.join(name), name);
                }
                write(&cwd.join("project-notes.txt"), "not an artifact");
            }
            _ => {}
        }

        Ok(CommandOutput {
            exit_code: 0,
            stdout: format!("{command}\n"),
            stderr: String::new(),
        })
    }
}

/// Cache store whose restore always errors.
struct BrokenCacheStore;

#[async_trait]
impl CacheStore for BrokenCacheStore {
    async fn restore(
        &self,
        key: &str,
        _targets: &[PathBuf],
    ) -> StorageResult<Option<CacheManifest>> {
        Err(StorageError::CacheEntryCorrupt {
            key: key.to_string(),
            reason: "blob missing".to_string(),
        })
    }

    async fn save(&self, _key: &str, _sources: &[PathBuf]) -> StorageResult<SaveOutcome> {
        Ok(SaveOutcome::Written)
    }
}

/// Ledger whose `nth` append fails; everything else goes to memory.
struct FlakyLedger {
    inner: MemoryRunLedger,
    fail_on: u64,
    appends: Mutex<u64>,
}

impl FlakyLedger {
    fn failing_append(nth: u64) -> Self {
        Self {
            inner: MemoryRunLedger::new(),
            fail_on: nth,
            appends: Mutex::new(0),
        }
    }
}

#[async_trait]
impl RunLedger for FlakyLedger {
    async fn create_run(
        &self,
        definition_digest: &ContentDigest,
        metadata: RunMetadata,
    ) -> StorageResult<RunId> {
        self.inner.create_run(definition_digest, metadata).await
    }

    async fn append_event(&self, run_id: &RunId, event: RunEvent) -> StorageResult<()> {
        let n = {
            let mut appends = self.appends.lock().unwrap();
            *appends += 1;
            *appends
        };
        if n == self.fail_on {
            return Err(StorageError::Backend("ledger unavailable".to_string()));
        }
        self.inner.append_event(run_id, event).await
    }

    async fn complete_run(&self, run_id: &RunId, summary: RunSummary) -> StorageResult<()> {
        self.inner.complete_run(run_id, summary).await
    }

    async fn fail_run(&self, run_id: &RunId, summary: RunSummary) -> StorageResult<()> {
        self.inner.fail_run(run_id, summary).await
    }

    async fn get_run(&self, run_id: &RunId) -> StorageResult<RunRecord> {
        self.inner.get_run(run_id).await
    }

    async fn get_events(&self, run_id: &RunId) -> StorageResult<Vec<RunEvent>> {
        self.inner.get_events(run_id).await
    }

    async fn list_runs(
        &self,
        definition_digest: Option<&ContentDigest>,
    ) -> StorageResult<Vec<RunRecord>> {
        self.inner.list_runs(definition_digest).await
    }
}

/// Records each lifecycle event's name and whether it was emitted inside
/// the run span.
#[derive(Clone, Default)]
struct LifecycleCapture(Arc<Mutex<Vec<(String, bool)>>>);

struct EventName(Option<String>);

impl Visit for EventName {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "event" {
            self.0 = Some(value.to_string());
        }
    }

    fn record_debug(&mut self, _field: &Field, _value: &dyn std::fmt::Debug) {}
}

impl<S> Layer<S> for LifecycleCapture
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let mut name = EventName(None);
        event.record(&mut name);
        let Some(name) = name.0 else {
            return;
        };
        let in_run = ctx
            .event_scope(event)
            .map_or(false, |mut scope| scope.any(|span| span.name() == "nightly.run"));
        self.0.lock().unwrap().push((name, in_run));
    }
}

// ===========================================================================
// Harness
// ===========================================================================

fn write(path: &Path, data: &str) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, data).unwrap();
}

struct Harness {
    _dir: tempfile::TempDir,
    workspace: PathBuf,
    home: PathBuf,
    ledger: Arc<MemoryRunLedger>,
    cache: Arc<MemoryCacheStore>,
    release: Arc<MemoryReleaseChannel>,
    executor: Arc<RecordingExecutor>,
    definition: PipelineDefinition,
}

impl Harness {
    /// Workspace already checked out (full clone).
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let workspace = dir.path().join("work");
        let home = dir.path().join("home");
        write(&workspace.join(".git/HEAD"), "ref: refs/heads/main\n");
        write(&workspace.join("Cargo.lock"), "version = 3\n");
        write(&home.join(".cargo/registry/index/serde"), "serde");

        let mut definition = PipelineDefinition::nightly();
        // A leaked token in the pipeline env must still be scrubbed
        definition
            .env
            .insert("GITHUB_TOKEN".to_string(), "from-definition".to_string());

        Self {
            _dir: dir,
            workspace,
            home,
            ledger: Arc::new(MemoryRunLedger::new()),
            cache: Arc::new(MemoryCacheStore::new()),
            release: Arc::new(MemoryReleaseChannel::new()),
            executor: Arc::new(RecordingExecutor::new()),
            definition,
        }
    }

    /// Empty workspace: the fetch stage must clone.
    fn fresh_checkout() -> Self {
        let h = Self::new();
        std::fs::remove_dir_all(h.workspace.join(".git")).unwrap();
        std::fs::remove_file(h.workspace.join("Cargo.lock")).unwrap();
        h
    }

    fn pipeline(&self) -> NightlyPipeline {
        self.pipeline_with_cache(self.cache.clone())
    }

    fn services(&self) -> PipelineServices {
        PipelineServices {
            ledger: self.ledger.clone(),
            cache: self.cache.clone(),
            release: self.release.clone(),
            executor: self.executor.clone(),
        }
    }

    fn pipeline_with_cache(&self, cache: Arc<dyn CacheStore>) -> NightlyPipeline {
        let services = PipelineServices {
            cache,
            ..self.services()
        };
        NightlyPipeline::new(self.definition.clone(), services).unwrap()
    }

    fn pipeline_with_ledger(&self, ledger: Arc<dyn RunLedger>) -> NightlyPipeline {
        let services = PipelineServices {
            ledger,
            ..self.services()
        };
        NightlyPipeline::new(self.definition.clone(), services).unwrap()
    }

    /// Commands the fetch stage ran, in order.
    fn fetch_commands(&self) -> Vec<String> {
        self.executor
            .requests()
            .into_iter()
            .filter(|r| r.stage == "fetch_source")
            .map(|r| r.argv.join(" "))
            .collect()
    }

    fn options(&self) -> RunOptions {
        RunOptions {
            workspace: self.workspace.clone(),
            home_dir: self.home.clone(),
            token: Some(SecretToken::new("ghs_secret")),
        }
    }

    async fn run(&self, event: TriggerEvent) -> RunOutcome {
        self.pipeline()
            .handle_event(&event, &self.options())
            .await
            .expect("pipeline errored")
    }
}

fn tick() -> TriggerEvent {
    TriggerEvent::ScheduledTick {
        at: Utc.with_ymd_and_hms(2026, 10, 19, 3, 10, 0).unwrap(),
    }
}

fn push(files: &[&str]) -> TriggerEvent {
    TriggerEvent::Push {
        git_ref: "refs/heads/main".to_string(),
        after: Some("0123abcd".to_string()),
        changed_files: files.iter().map(|f| f.to_string()).collect(),
        at: Utc::now(),
    }
}

fn finished(outcome: RunOutcome) -> nightly_ci::PipelineResult {
    match outcome {
        RunOutcome::Finished(result) => *result,
        RunOutcome::Rejected(reason) => panic!("event was rejected: {reason}"),
    }
}

fn all_stage_names() -> Vec<String> {
    BuiltinStage::ALL.iter().map(|s| s.name().to_string()).collect()
}

// ===========================================================================
// Tests
// ===========================================================================

/// Test: a scheduled Run executes every stage and publishes the artifacts
#[tokio::test]
async fn test_scheduled_run_succeeds() {
    let h = Harness::new();
    let result = finished(h.run(tick()).await);

    assert!(result.success, "failure: {:?}", result.failure);
    assert_eq!(result.trigger, TriggerKind::Scheduled);
    assert_eq!(result.passed_count(), 9);
    assert!(result.skipped.is_empty());
    assert_eq!(
        result.published,
        vec!["project-nightly.deb", "project-nightly.xz", "project-src.tar.gz"]
    );
    assert_eq!(result.cache_saved, Some(SaveOutcome::Written));

    // Only command stages reach the executor, in order
    assert_eq!(
        h.executor.stages_run(),
        vec![
            "prepare_environment",
            "fetch_source",
            "install_toolchain",
            "install_system_deps",
            "build",
            "test",
            "package",
        ]
    );

    // Exactly the glob matches reached the release, under the nightly tag
    let assets = h
        .release
        .list_assets("nightly", &SecretToken::new("reader"))
        .await
        .unwrap();
    assert_eq!(assets, result.published);
    assert!(h.release.asset("nightly", "project-notes.txt").is_none());

    let record = h.ledger.get_run(&RunId(result.run_id.clone())).await.unwrap();
    assert_eq!(record.status, RunStatus::Completed);
    let summary = record.summary.unwrap();
    assert!(summary.success);
    assert_eq!(summary.artifacts_published, 3);
}

/// Test: stage order and fail-fast rules hold in the recorded ledger
#[tokio::test]
async fn test_ledger_passes_gate() {
    let h = Harness::new();
    let result = finished(h.run(tick()).await);
    let events = h
        .ledger
        .get_events(&RunId(result.run_id))
        .await
        .unwrap();

    let verdict = RunGate::evaluate_order(&events, &all_stage_names());
    assert!(verdict.passed, "{:?}", verdict.violations);

    let kinds: Vec<&str> = events.iter().map(|e| e.kind.as_str()).collect();
    assert_eq!(
        kinds.iter().filter(|k| **k == events::STAGE_STARTED).count(),
        9
    );
    assert_eq!(
        kinds.iter().filter(|k| **k == events::ARTIFACTS_PUBLISHED).count(),
        1
    );
    assert_eq!(kinds.last(), Some(&events::CACHE_SAVED));
}

/// Test: the schedule marker and non-interactive front-end reach every command
#[tokio::test]
async fn test_scheduled_environment() {
    let h = Harness::new();
    finished(h.run(tick()).await);

    let requests = h.executor.requests();
    assert!(!requests.is_empty());
    for request in &requests {
        assert_eq!(request.env.get("BUILD_REASON").map(String::as_str), Some("Schedule"));
        assert_eq!(
            request.env.get("DEBIAN_FRONTEND").map(String::as_str),
            Some("noninteractive")
        );
    }
}

/// Test: the token never appears in any stage environment
#[tokio::test]
async fn test_token_only_reaches_publisher() {
    let h = Harness::new();
    finished(h.run(tick()).await);

    for request in h.executor.requests() {
        assert!(!request.env.contains_key("GITHUB_TOKEN"), "{}", request.stage);
        assert!(request.env_remove.contains(&"GITHUB_TOKEN".to_string()));
        assert!(request.env.values().all(|v| v != "ghs_secret"));
        assert!(request.argv.iter().all(|a| !a.contains("ghs_secret")));
    }
    assert_eq!(h.release.tokens_seen(), vec![SecretToken::new("ghs_secret")]);
}

/// Test: a failing build stops test, package and publish
#[tokio::test]
async fn test_build_failure_aborts_run() {
    let h = Harness::new();
    h.executor.exit_with("cargo build --all --release", 101);
    let result = finished(h.run(tick()).await);

    assert!(!result.success);
    let failure = result.failure.clone().unwrap();
    assert_eq!(failure.stage, "build");
    assert_eq!(failure.kind, FailureKind::Build);
    assert!(result.published.is_empty());
    assert_eq!(result.cache_saved, None);

    let skipped: Vec<&str> = result.skipped.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(skipped, vec!["test", "package", "publish"]);
    assert!(result.skipped.iter().all(|s| s.reason == "aborted"));

    let commands = h.executor.commands();
    assert!(!commands.iter().any(|c| c.starts_with("cargo test")));
    assert!(!commands.iter().any(|c| c.contains("deploy.sh")));
    assert_eq!(h.release.publish_calls(), 0);
    assert_eq!(h.cache.write_count(), 0);

    let run_id = RunId(result.run_id);
    let record = h.ledger.get_run(&run_id).await.unwrap();
    assert_eq!(record.status, RunStatus::Failed);
    assert_eq!(record.summary.unwrap().artifacts_published, 0);

    let events = h.ledger.get_events(&run_id).await.unwrap();
    assert!(RunGate::evaluate_order(&events, &all_stage_names()).passed);
    assert!(!events.iter().any(|e| e.kind == events::ARTIFACTS_PUBLISHED));
    assert!(!events.iter().any(|e| e.kind == events::CACHE_SAVED));
    let failed = events
        .iter()
        .find(|e| e.kind == events::STAGE_FAILED)
        .unwrap();
    assert_eq!(failed.payload["failure_kind"], "build");
    assert_eq!(failed.payload["exit_code"], 101);
}

/// Test: a command that cannot be spawned fails its stage
#[tokio::test]
async fn test_spawn_error_fails_stage() {
    let h = Harness::new();
    h.executor.fail_to_spawn("./get-deps");
    let result = finished(h.run(tick()).await);

    assert!(!result.success);
    assert_eq!(result.failure.unwrap().kind, FailureKind::SystemDeps);
    let deps = result.stages.last().unwrap();
    assert_eq!(deps.exit_code, -1);
    assert!(deps.stderr.contains("get-deps"));
}

/// Test: documentation-only pushes start nothing
#[tokio::test]
async fn test_doc_only_push_rejected() {
    let h = Harness::new();
    let outcome = h.run(push(&["docs/index.md", "README.md"])).await;

    assert!(matches!(outcome, RunOutcome::Rejected(_)));
    assert!(h.ledger.list_runs(None).await.unwrap().is_empty());
    assert!(h.executor.requests().is_empty());
}

/// Test: a push to main builds without the schedule marker
#[tokio::test]
async fn test_push_run_has_no_schedule_marker() {
    let h = Harness::new();
    let result = finished(h.run(push(&["src/main.rs", "docs/index.md"])).await);

    assert!(result.success);
    assert_eq!(result.trigger, TriggerKind::Push);
    for request in h.executor.requests() {
        assert!(!request.env.contains_key("BUILD_REASON"));
    }

    let record = h.ledger.get_run(&RunId(result.run_id)).await.unwrap();
    assert_eq!(record.metadata.git_ref.as_deref(), Some("0123abcd"));
    assert_eq!(record.metadata.trigger, "push");
}

/// Test: an empty workspace is cloned shallow, then unshallowed
#[tokio::test]
async fn test_fresh_workspace_is_cloned() {
    let h = Harness::fresh_checkout();
    let result = finished(h.run(tick()).await);
    assert!(result.success, "failure: {:?}", result.failure);

    assert_eq!(
        h.fetch_commands(),
        vec![
            "git clone --depth=1 --recurse-submodules --shallow-submodules --branch main https://github.com/example/project.git .",
            "git fetch --depth=1 origin +refs/tags/*:refs/tags/*",
            "git fetch --prune --unshallow",
            "git fetch origin main",
            "git checkout --force --detach FETCH_HEAD",
            "git submodule update --init --recursive",
        ]
    );
    // The cache key is computed after the clone produced the lock file
    assert!(result.cache_key.unwrap().starts_with("ubuntu22.04-2-"));
}

/// Test: a second Run with unchanged dependencies hits and keeps the entry
#[tokio::test]
async fn test_cache_reused_across_runs() {
    let h = Harness::new();
    let first = finished(h.run(tick()).await);
    assert_eq!(first.cache_saved, Some(SaveOutcome::Written));

    // Drop the local copies; the second Run restores them
    std::fs::remove_dir_all(h.workspace.join("target")).unwrap();
    std::fs::remove_dir_all(h.home.join(".cargo")).unwrap();

    let second = finished(h.run(tick()).await);
    assert_eq!(second.cache_key, first.cache_key);
    assert_eq!(second.cache_saved, Some(SaveOutcome::Unchanged));
    assert_eq!(h.cache.write_count(), 1);
    assert!(h.home.join(".cargo/registry/index/serde").exists());

    let restore = second
        .stages
        .iter()
        .find(|s| s.stage_name == "restore_cache")
        .unwrap();
    assert!(restore.stdout.starts_with("restored"));
}

/// Test: a broken cache entry is a non-fatal failure
#[tokio::test]
async fn test_cache_restore_error_is_not_fatal() {
    let h = Harness::new();
    let result = h
        .pipeline_with_cache(Arc::new(BrokenCacheStore))
        .handle_event(&tick(), &h.options())
        .await
        .unwrap();
    let result = finished(result);

    assert!(result.success);
    assert_eq!(result.failed_count(), 1);
    assert_eq!(result.published.len(), 3);

    let events = h.ledger.get_events(&RunId(result.run_id)).await.unwrap();
    let failed = events
        .iter()
        .find(|e| e.kind == events::STAGE_FAILED)
        .unwrap();
    assert_eq!(failed.payload["stage"], "restore_cache");
    assert_eq!(failed.payload["fatal"], false);
    assert!(RunGate::evaluate(&events).passed);
}

/// Test: packaging that produces nothing fails the publish stage
#[tokio::test]
async fn test_no_artifacts_fails_publish() {
    let h = Harness::new();
    h.executor.set_artifacts(&[]);
    let result = finished(h.run(tick()).await);

    assert!(!result.success);
    let failure = result.failure.unwrap();
    assert_eq!(failure.kind, FailureKind::Publish);
    assert!(failure.message.contains("no artifacts matched"));
    assert_eq!(h.release.publish_calls(), 0);
    assert_eq!(h.cache.write_count(), 0);
}

/// Test: one failed upload fails the Run
#[tokio::test]
async fn test_partial_upload_failure() {
    let h = Harness::new();
    h.release.fail_uploads_of("project-nightly.xz");
    let result = finished(h.run(tick()).await);

    assert!(!result.success);
    assert!(result.published.is_empty());
    let failure = result.failure.unwrap();
    assert_eq!(failure.stage, "publish");
    assert!(failure.message.contains("project-nightly.xz"));

    let record = h.ledger.get_run(&RunId(result.run_id)).await.unwrap();
    assert_eq!(record.status, RunStatus::Failed);
}

/// Test: publishing without a token fails before any upload
#[tokio::test]
async fn test_missing_token_fails_publish() {
    let h = Harness::new();
    let mut opts = h.options();
    opts.token = None;
    let result = finished(h.pipeline().handle_event(&tick(), &opts).await.unwrap());

    assert!(!result.success);
    assert!(result.failure.unwrap().message.contains("GITHUB_TOKEN"));
    assert_eq!(h.release.publish_calls(), 0);
}

/// Test: a disabled stage is skipped without stopping the Run
#[tokio::test]
async fn test_disabled_stage_skipped() {
    let mut h = Harness::new();
    h.definition.stages[6] = h.definition.stages[6].clone().disabled();
    let result = finished(h.run(tick()).await);

    assert!(result.success);
    assert_eq!(result.skipped.len(), 1);
    assert_eq!(result.skipped[0].name, "test");
    assert_eq!(result.skipped[0].reason, "disabled");
}

/// Test: Runs can be started directly from an admitted event
#[tokio::test]
async fn test_run_from_admitted() {
    let h = Harness::new();
    let admitted = AdmittedRun {
        kind: TriggerKind::Push,
        branch: "main".to_string(),
        commit: None,
        at: Utc::now(),
    };
    let result = h.pipeline().run(&admitted, &h.options()).await.unwrap();
    assert!(result.success);
    assert!(!result.definition_digest.is_empty());
}

/// Test: a push Run checks out exactly the pushed commit
#[tokio::test]
async fn test_push_run_builds_pushed_commit() {
    let h = Harness::new();
    let result = finished(h.run(push(&["src/lib.rs"])).await);
    assert!(result.success, "failure: {:?}", result.failure);

    assert_eq!(
        h.fetch_commands(),
        vec![
            "git fetch --depth=1 origin +refs/tags/*:refs/tags/*",
            "git fetch origin 0123abcd",
            "git checkout --force --detach FETCH_HEAD",
            "git submodule update --init --recursive",
        ]
    );

    // The commit on record is the one that was checked out
    let run_id = RunId(result.run_id);
    let record = h.ledger.get_run(&run_id).await.unwrap();
    assert_eq!(record.metadata.git_ref.as_deref(), Some("0123abcd"));
    let events = h.ledger.get_events(&run_id).await.unwrap();
    let published = events
        .iter()
        .find(|e| e.kind == events::ARTIFACTS_PUBLISHED)
        .unwrap();
    assert_eq!(published.payload["commit"], "0123abcd");
    assert_eq!(published.payload["stage"], "publish");
}

/// Test: the publish record names the stage that uploaded
#[tokio::test]
async fn test_publish_record_names_its_stage() {
    let mut h = Harness::new();
    h.definition.stages[8].name = "upload_nightly".to_string();
    let result = finished(h.run(tick()).await);
    assert!(result.success, "failure: {:?}", result.failure);

    let events = h.ledger.get_events(&RunId(result.run_id)).await.unwrap();
    let published = events
        .iter()
        .find(|e| e.kind == events::ARTIFACTS_PUBLISHED)
        .unwrap();
    assert_eq!(published.payload["stage"], "upload_nightly");
    assert_eq!(published.payload["commit"], serde_json::Value::Null);
}

/// Test: a failing test suite stops packaging and publishing
#[tokio::test]
async fn test_test_failure_aborts_run() {
    let h = Harness::new();
    h.executor.exit_with("cargo test --all --release", 101);
    let result = finished(h.run(tick()).await);

    assert!(!result.success);
    let failure = result.failure.unwrap();
    assert_eq!(failure.stage, "test");
    assert_eq!(failure.kind, FailureKind::Test);
    let skipped: Vec<&str> = result.skipped.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(skipped, vec!["package", "publish"]);

    assert!(!h.executor.commands().iter().any(|c| c.contains("deploy.sh")));
    assert_eq!(h.release.publish_calls(), 0);
    assert_eq!(h.cache.write_count(), 0);
    assert_eq!(result.cache_saved, None);

    let record = h.ledger.get_run(&RunId(result.run_id)).await.unwrap();
    assert_eq!(record.status, RunStatus::Failed);
    assert_eq!(record.summary.unwrap().artifacts_published, 0);
}

/// Test: a failing packaging script publishes nothing
#[tokio::test]
async fn test_package_failure_aborts_run() {
    let h = Harness::new();
    h.executor.exit_with("bash ci/deploy.sh", 2);
    let result = finished(h.run(tick()).await);

    assert!(!result.success);
    let failure = result.failure.unwrap();
    assert_eq!(failure.stage, "package");
    assert_eq!(failure.kind, FailureKind::Packaging);
    assert_eq!(result.skipped.len(), 1);
    assert_eq!(result.skipped[0].name, "publish");

    assert_eq!(h.release.publish_calls(), 0);
    assert!(h.release.tokens_seen().is_empty());
    assert_eq!(h.cache.write_count(), 0);

    let events = h.ledger.get_events(&RunId(result.run_id)).await.unwrap();
    assert!(RunGate::evaluate_order(&events, &all_stage_names()).passed);
    assert!(!events.iter().any(|e| e.kind == events::ARTIFACTS_PUBLISHED));
}

/// Test: a fatal stage after publish is refused before anything runs
#[tokio::test]
async fn test_stage_after_publish_is_refused() {
    let mut h = Harness::new();
    h.definition.stages.push(nightly_ci::StageConfig::custom(
        "notify".to_string(),
        vec![nightly_ci::CommandSpec::new(["./notify"])],
        60,
    ));

    let err = NightlyPipeline::new(h.definition.clone(), h.services())
        .err()
        .expect("definition accepted");
    assert!(matches!(err, PipelineError::InvalidDefinition(_)));
    assert!(h.executor.requests().is_empty());
    assert_eq!(h.release.publish_calls(), 0);
    assert!(h.ledger.list_runs(None).await.unwrap().is_empty());
}

/// Test: a ledger error mid-Run still finalizes the record as Failed
#[tokio::test]
async fn test_ledger_error_finalizes_run() {
    let h = Harness::new();
    let ledger = Arc::new(FlakyLedger::failing_append(5));
    let err = h
        .pipeline_with_ledger(ledger.clone())
        .handle_event(&tick(), &h.options())
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Storage(_)));

    let runs = ledger.list_runs(None).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Failed);
    let summary = runs[0].summary.clone().unwrap();
    assert!(!summary.success);
    assert_eq!(summary.artifacts_published, 0);
    assert_eq!(h.release.publish_calls(), 0);
}

/// Test: losing the publish record still counts the uploaded assets
#[tokio::test]
async fn test_ledger_error_after_upload_keeps_count() {
    let h = Harness::new();
    // 8 stages started+finished, publish started, then artifacts_published
    let ledger = Arc::new(FlakyLedger::failing_append(18));
    let result = h
        .pipeline_with_ledger(ledger.clone())
        .handle_event(&tick(), &h.options())
        .await;
    assert!(result.is_err());
    assert_eq!(h.release.publish_calls(), 1);

    let runs = ledger.list_runs(None).await.unwrap();
    assert_eq!(runs[0].status, RunStatus::Failed);
    assert_eq!(runs[0].summary.clone().unwrap().artifacts_published, 3);
}

/// Test: every lifecycle event of a Run carries the run span
#[tokio::test]
async fn test_lifecycle_events_inside_run_span() {
    let capture = LifecycleCapture::default();
    let subscriber = tracing_subscriber::registry().with(capture.clone());
    let _guard = tracing::subscriber::set_default(subscriber);

    let h = Harness::new();
    finished(h.run(tick()).await);

    let seen = capture.0.lock().unwrap().clone();
    let run_events: Vec<&(String, bool)> = seen
        .iter()
        .filter(|(name, _)| name != "trigger.evaluated")
        .collect();
    assert!(run_events.iter().any(|(name, _)| name == "run.started"));
    assert!(run_events.iter().any(|(name, _)| name == "run.finished"));
    for (name, in_run) in run_events {
        assert!(in_run, "{name} emitted outside the run span");
    }
}
