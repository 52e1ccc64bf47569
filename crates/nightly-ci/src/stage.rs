//! Pipeline stage definitions and configuration.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Builtin pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum BuiltinStage {
    /// Non-interactive package front-end, package index refresh, git + curl
    PrepareEnvironment,

    /// Clone or update, fetch tags, unshallow, check out the admitted ref
    FetchSource,

    /// rustup stable, minimal profile, rustfmt
    InstallToolchain,

    /// Restore dependency and build caches
    RestoreCache,

    /// ./get-deps
    InstallSystemDeps,

    /// cargo build --all --release
    Build,

    /// cargo test --all --release
    Test,

    /// bash ci/deploy.sh
    Package,

    /// Upload artifacts to the nightly release
    Publish,
}

impl BuiltinStage {
    /// Every builtin stage in pipeline order.
    pub const ALL: [BuiltinStage; 9] = [
        BuiltinStage::PrepareEnvironment,
        BuiltinStage::FetchSource,
        BuiltinStage::InstallToolchain,
        BuiltinStage::RestoreCache,
        BuiltinStage::InstallSystemDeps,
        BuiltinStage::Build,
        BuiltinStage::Test,
        BuiltinStage::Package,
        BuiltinStage::Publish,
    ];

    /// Get the stage name as a string.
    pub fn name(&self) -> &'static str {
        match self {
            BuiltinStage::PrepareEnvironment => "prepare_environment",
            BuiltinStage::FetchSource => "fetch_source",
            BuiltinStage::InstallToolchain => "install_toolchain",
            BuiltinStage::RestoreCache => "restore_cache",
            BuiltinStage::InstallSystemDeps => "install_system_deps",
            BuiltinStage::Build => "build",
            BuiltinStage::Test => "test",
            BuiltinStage::Package => "package",
            BuiltinStage::Publish => "publish",
        }
    }

    /// How a failure of this stage is classified.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            BuiltinStage::PrepareEnvironment => FailureKind::EnvironmentSetup,
            BuiltinStage::FetchSource => FailureKind::Fetch,
            BuiltinStage::InstallToolchain => FailureKind::ToolchainInstall,
            BuiltinStage::RestoreCache => FailureKind::CacheRestore,
            BuiltinStage::InstallSystemDeps => FailureKind::SystemDeps,
            BuiltinStage::Build => FailureKind::Build,
            BuiltinStage::Test => FailureKind::Test,
            BuiltinStage::Package => FailureKind::Packaging,
            BuiltinStage::Publish => FailureKind::Publish,
        }
    }

    /// Whether a failure of this stage aborts the Run.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, BuiltinStage::RestoreCache)
    }

    /// Get the stage's action.
    pub fn action(&self) -> StageAction {
        match self {
            BuiltinStage::RestoreCache => StageAction::RestoreCache,
            BuiltinStage::Publish => StageAction::Publish,
            _ => StageAction::Commands {
                commands: self.commands(),
            },
        }
    }

    /// Get the stage's commands. Empty for stages handled in-process.
    ///
    /// `{repo_url}`, `{branch}` and `{ref}` are substituted by the runner.
    pub fn commands(&self) -> Vec<CommandSpec> {
        match self {
            BuiltinStage::PrepareEnvironment => vec![
                CommandSpec::new([
                    "sh",
                    "-c",
                    "echo 'debconf debconf/frontend select Noninteractive' | debconf-set-selections",
                ]),
                CommandSpec::new(["apt-get", "update"]),
                CommandSpec::new(["apt-get", "install", "-y", "git", "curl"]),
            ],
            BuiltinStage::FetchSource => vec![
                CommandSpec::new([
                    "git",
                    "clone",
                    "--depth=1",
                    "--recurse-submodules",
                    "--shallow-submodules",
                    "--branch",
                    "{branch}",
                    "{repo_url}",
                    ".",
                ])
                .when(Condition::GitMissing),
                CommandSpec::new([
                    "git",
                    "fetch",
                    "--depth=1",
                    "origin",
                    "+refs/tags/*:refs/tags/*",
                ]),
                CommandSpec::new(["git", "fetch", "--prune", "--unshallow"])
                    .when(Condition::Shallow),
                // Build exactly the admitted commit, not whatever the branch
                // points to by now
                CommandSpec::new(["git", "fetch", "origin", "{ref}"]),
                CommandSpec::new(["git", "checkout", "--force", "--detach", "FETCH_HEAD"]),
                CommandSpec::new(["git", "submodule", "update", "--init", "--recursive"]),
            ],
            BuiltinStage::InstallToolchain => vec![
                CommandSpec::new([
                    "rustup",
                    "toolchain",
                    "install",
                    "stable",
                    "--profile",
                    "minimal",
                    "--component",
                    "rustfmt",
                ]),
                CommandSpec::new(["rustup", "default", "stable"]),
            ],
            BuiltinStage::InstallSystemDeps => vec![CommandSpec::new(["./get-deps"])],
            BuiltinStage::Build => {
                vec![CommandSpec::new(["cargo", "build", "--all", "--release"])]
            }
            BuiltinStage::Test => {
                vec![CommandSpec::new(["cargo", "test", "--all", "--release"])]
            }
            BuiltinStage::Package => vec![CommandSpec::new(["bash", "ci/deploy.sh"])],
            BuiltinStage::RestoreCache | BuiltinStage::Publish => Vec::new(),
        }
    }
}

impl fmt::Display for BuiltinStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Stage failure classification.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    EnvironmentSetup,
    Fetch,
    ToolchainInstall,
    CacheRestore,
    SystemDeps,
    Build,
    Test,
    Packaging,
    Publish,
    /// Failure of a non-builtin stage
    Custom,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::EnvironmentSetup => "environment_setup",
            FailureKind::Fetch => "fetch",
            FailureKind::ToolchainInstall => "toolchain_install",
            FailureKind::CacheRestore => "cache_restore",
            FailureKind::SystemDeps => "system_deps",
            FailureKind::Build => "build",
            FailureKind::Test => "test",
            FailureKind::Packaging => "packaging",
            FailureKind::Publish => "publish",
            FailureKind::Custom => "custom",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Workspace predicate checked right before a command runs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    /// `.git` does not exist in the workspace
    GitMissing,
    /// `.git/shallow` exists
    Shallow,
}

impl Condition {
    pub fn holds(&self, workspace: &Path) -> bool {
        let git = workspace.join(".git");
        match self {
            Condition::GitMissing => !git.exists(),
            Condition::Shallow => git.join("shallow").exists(),
        }
    }
}

/// One external command (first element is the executable).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandSpec {
    pub argv: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<Condition>,
}

impl CommandSpec {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            when: None,
        }
    }

    /// Run only when `condition` holds.
    pub fn when(mut self, condition: Condition) -> Self {
        self.when = Some(condition);
        self
    }

    /// Whether this command should run in `workspace`.
    pub fn applies(&self, workspace: &Path) -> bool {
        self.when.map_or(true, |c| c.holds(workspace))
    }

    /// Argv with `{name}` placeholders replaced from `vars`.
    pub fn render(&self, vars: &BTreeMap<&str, String>) -> Vec<String> {
        self.argv
            .iter()
            .map(|arg| {
                vars.iter().fold(arg.clone(), |acc, (name, value)| {
                    acc.replace(&format!("{{{name}}}"), value)
                })
            })
            .collect()
    }

    /// Display form for logs.
    pub fn display(&self) -> String {
        self.argv.join(" ")
    }
}

/// What a stage does when it runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StageAction {
    /// Run external commands in order; the first failure fails the stage
    Commands { commands: Vec<CommandSpec> },
    /// Restore the dependency cache
    RestoreCache,
    /// Collect artifacts and upload them to the release channel
    Publish,
}

/// Configuration for a pipeline stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StageConfig {
    /// Human-readable stage name.
    pub name: String,

    /// Builtin this stage was created from, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub builtin: Option<BuiltinStage>,

    pub action: StageAction,

    /// Extra environment for this stage's commands.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,

    /// Whether a failure aborts the Run.
    pub fatal: bool,

    /// Timeout in seconds, per command.
    pub timeout_secs: u64,

    /// Whether this stage is enabled.
    pub enabled: bool,
}

impl StageConfig {
    /// Create a new stage configuration from a builtin stage.
    pub fn from_builtin(stage: BuiltinStage, timeout_secs: u64) -> Self {
        Self {
            name: stage.name().to_string(),
            builtin: Some(stage),
            action: stage.action(),
            env: BTreeMap::new(),
            fatal: stage.is_fatal(),
            timeout_secs,
            enabled: true,
        }
    }

    /// Create a custom command stage.
    pub fn custom(name: String, commands: Vec<CommandSpec>, timeout_secs: u64) -> Self {
        Self {
            name,
            builtin: None,
            action: StageAction::Commands { commands },
            env: BTreeMap::new(),
            fatal: true,
            timeout_secs,
            enabled: true,
        }
    }

    /// Add an environment variable for this stage.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Disable this stage.
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn failure_kind(&self) -> FailureKind {
        self.builtin
            .map_or(FailureKind::Custom, |b| b.failure_kind())
    }
}
