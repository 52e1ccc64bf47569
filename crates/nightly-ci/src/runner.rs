//! Stage command execution.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::stage::{CommandSpec, StageConfig};

/// One command invocation, fully resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    /// Stage the command belongs to.
    pub stage: String,

    /// Command to execute (first element is executable).
    pub argv: Vec<String>,

    pub cwd: PathBuf,

    /// Variables set on top of the inherited environment.
    pub env: BTreeMap<String, String>,

    /// Inherited variables removed before spawning.
    pub env_remove: Vec<String>,

    pub timeout: Duration,
}

/// Output of one command.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    /// Exit code (0 = success, -1 = killed by signal).
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Runs stage commands. `ProcessExecutor` spawns real processes; tests
/// substitute a recording executor.
#[async_trait]
pub trait StageExecutor: Send + Sync {
    /// Run `request` to completion. `Err` means the command could not be
    /// started or did not finish in time.
    async fn run_command(&self, request: &CommandRequest) -> Result<CommandOutput>;
}

/// Executor backed by `tokio::process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessExecutor;

#[async_trait]
impl StageExecutor for ProcessExecutor {
    async fn run_command(&self, request: &CommandRequest) -> Result<CommandOutput> {
        let Some((exe, args)) = request.argv.split_first() else {
            return Err(PipelineError::EmptyCommand {
                stage: request.stage.clone(),
            });
        };

        let mut command = Command::new(exe);
        command
            .args(args)
            .current_dir(&request.cwd)
            .envs(&request.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for name in &request.env_remove {
            command.env_remove(name);
        }

        let child = command.spawn().map_err(|source| PipelineError::Spawn {
            stage: request.stage.clone(),
            program: exe.clone(),
            source,
        })?;

        let output = tokio::time::timeout(request.timeout, child.wait_with_output())
            .await
            .map_err(|_| PipelineError::StageTimeout {
                stage: request.stage.clone(),
                secs: request.timeout.as_secs(),
            })??;

        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

/// Everything a stage's commands see beyond their own configuration.
#[derive(Debug, Clone)]
pub struct ExecContext {
    pub workspace: PathBuf,

    /// Pipeline-wide environment, schedule marker included.
    pub env: BTreeMap<String, String>,

    /// Values for `{name}` placeholders in command arguments.
    pub vars: BTreeMap<&'static str, String>,

    /// Variables stripped from every command (the publish token).
    pub scrub: Vec<String>,
}

impl ExecContext {
    pub fn new(workspace: impl AsRef<Path>) -> Self {
        Self {
            workspace: workspace.as_ref().to_path_buf(),
            env: BTreeMap::new(),
            vars: BTreeMap::new(),
            scrub: Vec::new(),
        }
    }
}

/// Result of a stage execution.
#[derive(Debug, Clone)]
pub struct StageResult {
    /// Stage name.
    pub stage_name: String,

    /// Exit code (0 = success).
    pub exit_code: i32,

    /// Captured stdout.
    pub stdout: String,

    /// Captured stderr.
    pub stderr: String,

    /// Duration in milliseconds.
    pub duration_ms: u64,

    /// Whether execution succeeded.
    pub success: bool,

    /// Commands actually run (conditional ones may be skipped).
    pub commands_run: usize,
}

impl StageResult {
    /// Whether this stage passed (exit code 0).
    pub fn passed(&self) -> bool {
        self.success && self.exit_code == 0
    }

    /// Failed result for a stage that could not run its commands at all.
    pub fn errored(stage_name: &str, error: &PipelineError, duration_ms: u64) -> Self {
        Self {
            stage_name: stage_name.to_string(),
            exit_code: -1,
            stdout: String::new(),
            stderr: error.to_string(),
            duration_ms,
            success: false,
            commands_run: 0,
        }
    }

    /// Result for an in-process stage.
    pub fn internal(
        stage_name: &str,
        outcome: std::result::Result<String, String>,
        duration_ms: u64,
    ) -> Self {
        let (success, stdout, stderr) = match outcome {
            Ok(out) => (true, out, String::new()),
            Err(err) => (false, String::new(), err),
        };
        Self {
            stage_name: stage_name.to_string(),
            exit_code: if success { 0 } else { 1 },
            stdout,
            stderr,
            duration_ms,
            success,
            commands_run: 0,
        }
    }
}

/// Stage runner that executes a stage's commands in order.
pub struct StageRunner;

impl StageRunner {
    /// Execute `commands` for `config`, stopping at the first non-zero exit.
    ///
    /// Output of every command run is concatenated. `Err` is returned when a
    /// command cannot be spawned or times out.
    pub async fn execute_stage(
        executor: &dyn StageExecutor,
        config: &StageConfig,
        commands: &[CommandSpec],
        ctx: &ExecContext,
    ) -> Result<StageResult> {
        let start = Instant::now();

        let mut env = ctx.env.clone();
        env.extend(config.env.clone());
        for name in &ctx.scrub {
            env.remove(name);
        }

        let mut stdout = String::new();
        let mut stderr = String::new();
        let mut exit_code = 0;
        let mut commands_run = 0;

        for spec in commands {
            if !spec.applies(&ctx.workspace) {
                debug!(
                    stage = %config.name,
                    command = %spec.display(),
                    "Condition not met, skipping command"
                );
                continue;
            }

            let argv = spec.render(&ctx.vars);
            if argv.is_empty() {
                return Err(PipelineError::EmptyCommand {
                    stage: config.name.clone(),
                });
            }
            let request = CommandRequest {
                stage: config.name.clone(),
                argv,
                cwd: ctx.workspace.clone(),
                env: env.clone(),
                env_remove: ctx.scrub.clone(),
                timeout: Duration::from_secs(config.timeout_secs),
            };

            debug!(stage = %config.name, command = %request.argv.join(" "), "Running command");
            let output = executor.run_command(&request).await?;
            commands_run += 1;
            stdout.push_str(&output.stdout);
            stderr.push_str(&output.stderr);
            exit_code = output.exit_code;
            if exit_code != 0 {
                break;
            }
        }

        Ok(StageResult {
            stage_name: config.name.clone(),
            exit_code,
            stdout,
            stderr,
            duration_ms: start.elapsed().as_millis() as u64,
            success: exit_code == 0,
            commands_run,
        })
    }
}
