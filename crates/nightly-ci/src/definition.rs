//! Pipeline definition and identity.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use nightly_state::ContentDigest;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{PipelineError, Result};
use crate::stage::{BuiltinStage, StageAction, StageConfig};
use crate::trigger::{TriggerRule, TriggerSet};

/// Default per-command timeout for builtin stages.
pub const DEFAULT_STAGE_TIMEOUT_SECS: u64 = 3600;

/// Cache settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheConfig {
    /// Platform image label, first key component
    pub platform: String,
    /// Bumped to invalidate every existing entry
    pub schema_version: u32,
    /// Cache kind, last key component
    pub kind: String,
    /// Glob of lock files hashed into the key
    pub lock_glob: String,
    /// Cached directories. `~/` is the home directory; relative paths are
    /// resolved against the workspace.
    pub paths: Vec<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            platform: "ubuntu22.04".to_string(),
            schema_version: 2,
            kind: "cargo".to_string(),
            lock_glob: "**/Cargo.lock".to_string(),
            paths: vec![
                "~/.cargo/registry".to_string(),
                "~/.cargo/git".to_string(),
                "target".to_string(),
            ],
        }
    }
}

/// Publish settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PublishConfig {
    /// Release tag overwritten by every successful Run
    pub tag: String,
    /// Semicolon-separated artifact globs, relative to the workspace
    pub artifact_glob: String,
    /// Environment variable holding the upload token
    pub token_env: String,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            tag: "nightly".to_string(),
            artifact_glob: "project-*.deb;project-*.xz;project-*.tar.gz".to_string(),
            token_env: "GITHUB_TOKEN".to_string(),
        }
    }
}

/// Marker exported to every stage of a scheduled Run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScheduleMarker {
    pub name: String,
    pub value: String,
}

impl Default for ScheduleMarker {
    fn default() -> Self {
        Self {
            name: "BUILD_REASON".to_string(),
            value: "Schedule".to_string(),
        }
    }
}

/// The whole pipeline as data.
///
/// `PipelineDefinition::nightly()` is the shipped pipeline; a JSON file with
/// the same shape can replace it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PipelineDefinition {
    pub name: String,

    /// Branch pushes must target; also the branch scheduled Runs build.
    pub main_branch: String,

    /// Cloned when the workspace has no checkout.
    pub repository_url: String,

    pub triggers: Vec<TriggerRule>,

    /// Executed strictly in this order.
    pub stages: Vec<StageConfig>,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub publish: PublishConfig,

    #[serde(default)]
    pub schedule_marker: ScheduleMarker,

    /// Environment for every stage command.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl PipelineDefinition {
    /// The shipped nightly pipeline.
    pub fn nightly() -> Self {
        let mut env = BTreeMap::new();
        env.insert("DEBIAN_FRONTEND".to_string(), "noninteractive".to_string());

        Self {
            name: "nightly".to_string(),
            main_branch: "main".to_string(),
            repository_url: "https://github.com/example/project.git".to_string(),
            triggers: vec![
                TriggerRule::Scheduled {
                    cron: "10 3 * * *".to_string(),
                },
                TriggerRule::Push {
                    branch: "main".to_string(),
                    paths_ignore: vec![
                        "docs/**/*".to_string(),
                        "**/*.md".to_string(),
                        ".cirrus.yml".to_string(),
                        "ci/build-docs.sh".to_string(),
                        "ci/generate-docs.py".to_string(),
                    ],
                },
            ],
            stages: BuiltinStage::ALL
                .iter()
                .map(|s| StageConfig::from_builtin(*s, DEFAULT_STAGE_TIMEOUT_SECS))
                .collect(),
            cache: CacheConfig::default(),
            publish: PublishConfig::default(),
            schedule_marker: ScheduleMarker::default(),
            env,
        }
    }

    /// Load a definition from a JSON file and validate it.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let def: PipelineDefinition = serde_json::from_str(&raw)?;
        def.validate()?;
        Ok(def)
    }

    /// Check the definition can run: unique stage names, non-empty commands,
    /// non-zero timeouts, publish last, parseable triggers and globs.
    pub fn validate(&self) -> Result<()> {
        if self.stages.is_empty() {
            return Err(PipelineError::InvalidDefinition(
                "pipeline has no stages".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for stage in &self.stages {
            if !seen.insert(stage.name.as_str()) {
                return Err(PipelineError::InvalidDefinition(format!(
                    "duplicate stage name '{}'",
                    stage.name
                )));
            }
            if stage.timeout_secs == 0 {
                return Err(PipelineError::InvalidDefinition(format!(
                    "stage '{}' has a zero timeout",
                    stage.name
                )));
            }
            if let StageAction::Commands { commands } = &stage.action {
                if commands.iter().any(|c| c.argv.is_empty()) {
                    return Err(PipelineError::EmptyCommand {
                        stage: stage.name.clone(),
                    });
                }
            }
        }

        let publishes = self
            .stages
            .iter()
            .filter(|s| matches!(s.action, StageAction::Publish))
            .count();
        if publishes > 1 {
            return Err(PipelineError::InvalidDefinition(
                "at most one publish stage is allowed".to_string(),
            ));
        }
        // Nothing may fail once artifacts are on the release
        let publish_at = self
            .stages
            .iter()
            .position(|s| s.enabled && matches!(s.action, StageAction::Publish));
        if let Some(pos) = publish_at {
            if let Some(late) = self.stages[pos + 1..].iter().find(|s| s.enabled) {
                return Err(PipelineError::InvalidDefinition(format!(
                    "stage '{}' runs after '{}'; publish must be the last enabled stage",
                    late.name, self.stages[pos].name
                )));
            }
        }

        TriggerSet::compile(&self.triggers)?;
        crate::artifact::parse_patterns(&self.publish.artifact_glob)?;
        glob::Pattern::new(&self.cache.lock_glob).map_err(|e| PipelineError::InvalidGlob {
            pattern: self.cache.lock_glob.clone(),
            reason: e.to_string(),
        })?;

        Ok(())
    }

    /// Names of the enabled stages, in order.
    pub fn stage_names(&self) -> Vec<String> {
        self.stages
            .iter()
            .filter(|s| s.enabled)
            .map(|s| s.name.clone())
            .collect()
    }

    /// Identity of this definition: SHA-256 over the ordered stage names
    /// followed by the canonical JSON form.
    pub fn digest(&self) -> Result<ContentDigest> {
        let mut hasher = Sha256::new();
        for stage in &self.stages {
            hasher.update(stage.name.as_bytes());
            hasher.update(b"\0");
        }
        hasher.update(serde_json::to_vec(self)?);
        let digest = hex::encode(hasher.finalize());
        Ok(ContentDigest::try_from(digest)?)
    }

    /// Compile the trigger rules.
    pub fn trigger_set(&self) -> Result<TriggerSet> {
        TriggerSet::compile(&self.triggers)
    }
}
