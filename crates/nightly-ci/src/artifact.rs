//! Artifact collection for the publish stage.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use nightly_state::ReleaseAsset;
use tracing::debug;

use crate::error::{PipelineError, Result};

/// A packaged file found in the workspace.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Artifact {
    /// File name, used as the release asset name
    pub name: String,
    pub path: PathBuf,
}

impl Artifact {
    pub fn to_asset(&self) -> ReleaseAsset {
        ReleaseAsset {
            name: self.name.clone(),
            path: self.path.clone(),
        }
    }
}

/// Split a `;`-separated glob list. Blank entries are dropped, duplicates
/// kept once, and every entry must be a valid pattern.
pub fn parse_patterns(list: &str) -> Result<Vec<String>> {
    let mut seen = BTreeSet::new();
    let mut patterns = Vec::new();
    for raw in list.split(';') {
        let pattern = raw.trim();
        if pattern.is_empty() || !seen.insert(pattern) {
            continue;
        }
        glob::Pattern::new(pattern).map_err(|e| PipelineError::InvalidGlob {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;
        patterns.push(pattern.to_string());
    }
    Ok(patterns)
}

/// Find the regular files under `workspace` matching any glob in `list`.
///
/// A file matched by several globs appears once. The result is sorted by path.
pub fn collect_artifacts(workspace: &Path, list: &str) -> Result<Vec<Artifact>> {
    let root = glob::Pattern::escape(&workspace.to_string_lossy());
    let mut found = BTreeSet::new();

    for pattern in parse_patterns(list)? {
        let full = format!("{root}/{pattern}");
        let paths = glob::glob(&full).map_err(|e| PipelineError::InvalidGlob {
            pattern: pattern.clone(),
            reason: e.to_string(),
        })?;
        for entry in paths {
            let path = match entry {
                Ok(path) => path,
                Err(e) => {
                    debug!(error = %e, "Skipping unreadable artifact candidate");
                    continue;
                }
            };
            if !path.is_file() {
                continue;
            }
            let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
                continue;
            };
            found.insert(Artifact { name, path });
        }
    }

    let mut artifacts: Vec<Artifact> = found.into_iter().collect();
    artifacts.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(artifacts)
}
