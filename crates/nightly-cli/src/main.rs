//! Nightly - build-and-publish pipeline CLI
//!
//! The `nightly` command evaluates trigger events and runs the nightly
//! pipeline against a workspace.
//!
//! ## Commands
//!
//! - `trigger`: Show whether a schedule tick or push would start a Run
//! - `run`: Evaluate an event and execute the Run when admitted
//! - `cache-key`: Print the dependency cache key for the workspace
//! - `next-run`: Print upcoming scheduled ticks
//! - `definition`: Inspect the effective pipeline definition
//! - `runs`: Inspect recorded Runs

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use nightly_ci::telemetry::init_tracing;
use nightly_ci::{
    CacheKey, NightlyPipeline, PipelineDefinition, PipelineResult, PipelineServices,
    ProcessExecutor, RunGate, RunOptions, RunOutcome, TriggerDecision, TriggerEvent, TriggerKind,
};
use nightly_state::{
    DirReleaseChannel, FsCacheStore, FsRunLedger, GithubReleaseChannel, ReleaseChannel, RunId,
    RunLedger, SecretToken,
};
use tracing::{info, Level};

#[derive(Parser)]
#[command(name = "nightly")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Nightly build-and-publish pipeline", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Workspace (checkout) directory
    #[arg(short, long, global = true, default_value = ".")]
    workspace: PathBuf,

    /// Pipeline definition JSON replacing the built-in nightly pipeline
    #[arg(long, global = true)]
    definition: Option<PathBuf>,

    /// Run ledger directory [default: ~/.nightly/runs]
    #[arg(long, global = true, env = "NIGHTLY_LEDGER_DIR")]
    ledger_dir: Option<PathBuf>,

    /// Cache store directory [default: ~/.nightly/cache]
    #[arg(long, global = true, env = "NIGHTLY_CACHE_DIR")]
    cache_dir: Option<PathBuf>,

    /// Home directory used for `~/` cache paths
    #[arg(long, global = true, env = "HOME")]
    home: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate a trigger event without running anything
    Trigger {
        #[command(subcommand)]
        action: TriggerAction,
    },

    /// Evaluate a trigger event and run the pipeline if admitted
    Run {
        /// Treat this invocation as a scheduled tick
        #[arg(long, conflicts_with = "push_event", required_unless_present = "push_event")]
        schedule: bool,

        /// Tick time (RFC 3339) [default: now]
        #[arg(long, requires = "schedule")]
        at: Option<DateTime<Utc>>,

        /// Push event JSON file (tagged event or GitHub push payload)
        #[arg(long)]
        push_event: Option<PathBuf>,

        /// GitHub repository (owner/name) to clone from and publish to
        #[arg(long, env = "GITHUB_REPOSITORY")]
        repository: Option<String>,

        /// Publish to this directory instead of GitHub releases
        #[arg(long)]
        publish_dir: Option<PathBuf>,

        /// Environment variable holding the release token
        /// [default: from the definition, GITHUB_TOKEN]
        #[arg(long)]
        token_env: Option<String>,
    },

    /// Print the dependency cache key for the workspace
    CacheKey,

    /// Print the next scheduled ticks
    NextRun {
        /// Start time (RFC 3339) [default: now]
        #[arg(long)]
        after: Option<DateTime<Utc>>,

        /// Number of ticks to print
        #[arg(short = 'n', long, default_value = "1")]
        count: usize,
    },

    /// Inspect the pipeline definition
    Definition {
        #[command(subcommand)]
        action: DefinitionAction,
    },

    /// Inspect recorded Runs
    Runs {
        #[command(subcommand)]
        action: RunsAction,
    },
}

#[derive(Subcommand)]
enum TriggerAction {
    /// Would a scheduled tick at this time start a Run?
    Schedule {
        /// Tick time (RFC 3339) [default: now]
        #[arg(long)]
        at: Option<DateTime<Utc>>,
    },

    /// Would this push start a Run?
    Push {
        /// Push event JSON file (tagged event or GitHub push payload)
        #[arg(long)]
        event: PathBuf,
    },
}

#[derive(Subcommand)]
enum DefinitionAction {
    /// Print the effective definition as JSON
    Show,

    /// Print the definition digest recorded with each Run
    Digest,
}

#[derive(Subcommand)]
enum RunsAction {
    /// List recorded Runs, newest last
    List {
        /// Show at most this many Runs
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Show one Run with its events and gate verdict
    Show {
        /// Run ID
        id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    init_tracing(cli.json, level);

    let definition = load_definition(cli.definition.as_deref())?;

    match &cli.command {
        Commands::Trigger { action } => match action {
            TriggerAction::Schedule { at } => cmd_trigger(
                &definition,
                &TriggerEvent::ScheduledTick {
                    at: at.unwrap_or_else(Utc::now),
                },
            ),
            TriggerAction::Push { event } => cmd_trigger(&definition, &read_push_event(event)?),
        },
        Commands::Run {
            schedule: _,
            at,
            push_event,
            repository,
            publish_dir,
            token_env,
        } => {
            let event = match push_event {
                Some(path) => read_push_event(path)?,
                None => TriggerEvent::ScheduledTick {
                    at: at.unwrap_or_else(Utc::now),
                },
            };
            let mut definition = definition;
            if let (Some(repo), None) = (repository, &cli.definition) {
                definition.repository_url = format!("https://github.com/{repo}.git");
            }
            if let Some(name) = token_env {
                definition.publish.token_env = name.clone();
            }
            cmd_run(
                &cli,
                definition,
                &event,
                repository.as_deref(),
                publish_dir.as_deref(),
            )
            .await
        }
        Commands::CacheKey => cmd_cache_key(&definition, &cli.workspace),
        Commands::NextRun { after, count } => {
            cmd_next_run(&definition, after.unwrap_or_else(Utc::now), *count)
        }
        Commands::Definition { action } => match action {
            DefinitionAction::Show => {
                println!("{}", serde_json::to_string_pretty(&definition)?);
                Ok(())
            }
            DefinitionAction::Digest => {
                println!("{}", definition.digest()?);
                Ok(())
            }
        },
        Commands::Runs { action } => {
            let ledger = FsRunLedger::open(state_dir(&cli, cli.ledger_dir.as_ref(), "runs")?)
                .await
                .context("Failed to open run ledger")?;
            match action {
                RunsAction::List { limit } => cmd_runs_list(&ledger, *limit).await,
                RunsAction::Show { id } => cmd_runs_show(&ledger, id).await,
            }
        }
    }
}

fn load_definition(path: Option<&Path>) -> Result<PipelineDefinition> {
    match path {
        Some(path) => PipelineDefinition::from_json_file(path)
            .with_context(|| format!("Failed to load definition {}", path.display())),
        None => Ok(PipelineDefinition::nightly()),
    }
}

fn read_push_event(path: &Path) -> Result<TriggerEvent> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read push event {}", path.display()))?;
    TriggerEvent::push_from_json(&raw)
        .with_context(|| format!("Invalid push event {}", path.display()))
}

fn home_dir(cli: &Cli) -> Result<PathBuf> {
    cli.home
        .clone()
        .context("Home directory unknown; set HOME or pass --home")
}

/// `explicit`, or `~/.nightly/<name>`.
fn state_dir(cli: &Cli, explicit: Option<&PathBuf>, name: &str) -> Result<PathBuf> {
    match explicit {
        Some(dir) => Ok(dir.clone()),
        None => Ok(home_dir(cli)?.join(".nightly").join(name)),
    }
}

fn cmd_trigger(definition: &PipelineDefinition, event: &TriggerEvent) -> Result<()> {
    let triggers = definition.trigger_set()?;
    match triggers.evaluate(event) {
        TriggerDecision::Admit(run) => {
            let branch = match run.kind {
                TriggerKind::Scheduled => definition.main_branch.as_str(),
                TriggerKind::Push => run.branch.as_str(),
            };
            println!("✓ ADMITTED ({} on {})", run.kind, branch);
            if let Some(commit) = &run.commit {
                println!("  Commit: {}", commit);
            }
            println!("  At: {}", run.at.to_rfc3339());
        }
        TriggerDecision::Reject(reason) => {
            println!("✗ REJECTED: {}", reason);
        }
    }
    Ok(())
}

async fn cmd_run(
    cli: &Cli,
    definition: PipelineDefinition,
    event: &TriggerEvent,
    repository: Option<&str>,
    publish_dir: Option<&Path>,
) -> Result<()> {
    let home = home_dir(cli)?;
    let ledger_dir = state_dir(cli, cli.ledger_dir.as_ref(), "runs")?;
    let cache_dir = state_dir(cli, cli.cache_dir.as_ref(), "cache")?;

    let release: Arc<dyn ReleaseChannel> = match (publish_dir, repository) {
        (Some(dir), _) => Arc::new(DirReleaseChannel::new(dir)),
        (None, Some(repo)) => Arc::new(
            GithubReleaseChannel::new(repo)
                .with_context(|| format!("Invalid repository '{}'", repo))?,
        ),
        (None, None) => anyhow::bail!("Either --repository or --publish-dir is required"),
    };
    let ledger = Arc::new(
        FsRunLedger::open(&ledger_dir)
            .await
            .context("Failed to open run ledger")?,
    );
    let services = PipelineServices {
        ledger: ledger.clone(),
        cache: Arc::new(FsCacheStore::new(&cache_dir).context("Failed to open cache store")?),
        release,
        executor: Arc::new(ProcessExecutor),
    };

    let token = std::env::var(&definition.publish.token_env)
        .ok()
        .filter(|t| !t.is_empty())
        .map(SecretToken::new);
    let opts = RunOptions {
        workspace: cli.workspace.clone(),
        home_dir: home,
        token,
    };

    let pipeline = NightlyPipeline::new(definition, services)?;
    info!(workspace = %opts.workspace.display(), "Evaluating trigger");

    let result = match pipeline
        .handle_event(event, &opts)
        .await
        .context("Pipeline failed to run")?
    {
        RunOutcome::Rejected(reason) => {
            println!("✗ REJECTED: {}", reason);
            println!("No Run started.");
            return Ok(());
        }
        RunOutcome::Finished(result) => result,
    };

    print_result(&result);

    // Evaluate gate
    let events = ledger.get_events(&RunId(result.run_id.clone())).await?;
    let verdict = RunGate::evaluate_order(&events, &pipeline.definition().stage_names());
    println!("Gate: {}", if verdict.passed { "✓ PASSED" } else { "✗ FAILED" });
    if !verdict.violations.is_empty() {
        println!("Violations:");
        for violation in &verdict.violations {
            println!("  - {}", violation);
        }
    }

    if result.success && verdict.passed {
        println!("\n✓ Nightly published!");
        Ok(())
    } else {
        anyhow::bail!("Nightly run failed")
    }
}

fn print_result(result: &PipelineResult) {
    println!("Run ID: {}", result.run_id);
    println!("Trigger: {}", result.trigger);
    println!("Status: {}", if result.success { "✓ PASSED" } else { "✗ FAILED" });
    println!("Duration: {}ms", result.duration_ms);
    println!();

    for stage in &result.stages {
        let status = if stage.passed() { "✓" } else { "✗" };
        println!(
            "  {} {} ({}ms, exit code: {})",
            status, stage.stage_name, stage.duration_ms, stage.exit_code
        );
    }
    for skipped in &result.skipped {
        println!("  - {} (skipped: {})", skipped.name, skipped.reason);
    }
    println!();

    if let Some(failure) = &result.failure {
        println!("Failure ({}): {}", failure.kind, failure.message);
    }
    if let Some(key) = &result.cache_key {
        let saved = match result.cache_saved {
            Some(outcome) => format!("{:?}", outcome).to_lowercase(),
            None => "not saved".to_string(),
        };
        println!("Cache: {} ({})", key, saved);
    }
    if !result.published.is_empty() {
        println!("Published:");
        for name in &result.published {
            println!("  {}", name);
        }
    }
    println!(
        "Summary: {}/{} stages passed",
        result.passed_count(),
        result.stages.len()
    );
}

fn cmd_cache_key(definition: &PipelineDefinition, workspace: &Path) -> Result<()> {
    let key = CacheKey::compute(&definition.cache, workspace)?;
    if key.lock_hash.is_empty() {
        eprintln!("warning: no files match '{}'", definition.cache.lock_glob);
    }
    println!("{}", key);
    Ok(())
}

fn cmd_next_run(definition: &PipelineDefinition, after: DateTime<Utc>, count: usize) -> Result<()> {
    let triggers = definition.trigger_set()?;
    let mut cursor = after;
    for _ in 0..count {
        let Some(next) = triggers.next_scheduled_after(cursor) else {
            println!("No scheduled trigger configured");
            return Ok(());
        };
        println!("{}", next.to_rfc3339());
        cursor = next;
    }
    Ok(())
}

async fn cmd_runs_list(ledger: &dyn RunLedger, limit: usize) -> Result<()> {
    let runs = ledger.list_runs(None).await?;
    if runs.is_empty() {
        println!("No runs recorded");
        return Ok(());
    }
    let skip = runs.len().saturating_sub(limit);
    for run in runs.iter().skip(skip) {
        let success = run
            .summary
            .as_ref()
            .map(|s| if s.success { "✓" } else { "✗" })
            .unwrap_or("…");
        println!(
            "{} {} {:?} {} {} {}",
            success,
            run.run_id,
            run.status,
            run.metadata.trigger,
            run.metadata.git_ref.as_deref().unwrap_or("-"),
            run.created_at.to_rfc3339()
        );
    }
    Ok(())
}

async fn cmd_runs_show(ledger: &dyn RunLedger, id: &str) -> Result<()> {
    let run_id = RunId(id.to_string());
    let record = ledger
        .get_run(&run_id)
        .await
        .with_context(|| format!("Run {} not found", id))?;
    let events = ledger.get_events(&run_id).await?;

    println!("Run ID: {}", record.run_id);
    println!("Pipeline: {} ({})", record.metadata.pipeline, record.definition_digest.short());
    println!("Trigger: {}", record.metadata.trigger);
    println!("Ref: {}", record.metadata.git_ref.as_deref().unwrap_or("-"));
    println!("Status: {:?}", record.status);
    if let Some(summary) = &record.summary {
        println!("Duration: {}ms", summary.duration_ms);
        println!("Artifacts published: {}", summary.artifacts_published);
    }
    println!();

    for event in &events {
        let stage = event.payload["stage"].as_str().unwrap_or("");
        println!("  {:>3} {:<20} {}", event.seq, event.kind, stage);
    }

    let verdict = RunGate::evaluate(&events);
    println!();
    println!("Gate: {}", if verdict.passed { "✓ PASSED" } else { "✗ FAILED" });
    for violation in &verdict.violations {
        println!("  - {}", violation);
    }
    Ok(())
}
