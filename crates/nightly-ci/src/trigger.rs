//! Trigger rules and event admission.
//!
//! A Run starts only when an incoming event is admitted by one of the
//! pipeline's trigger rules:
//! - a scheduled tick is admitted when the rule's cron expression matches
//!   the tick time (minute resolution)
//! - a push is admitted when it targets the main branch and at least one
//!   changed file falls outside the ignore globs
//!
//! Evaluation is pure: no I/O, no clock. Rejected events leave no trace.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Timelike, Utc};
use glob::{MatchOptions, Pattern};
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

/// What admitted a Run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Scheduled,
    Push,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::Scheduled => "scheduled",
            TriggerKind::Push => "push",
        }
    }
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declarative trigger configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "on", rename_all = "snake_case")]
pub enum TriggerRule {
    /// Fire on a cron schedule (5-field POSIX or 6/7-field with seconds).
    Scheduled { cron: String },

    /// Fire on pushes to `branch` unless every changed path is ignored.
    Push {
        branch: String,
        #[serde(default)]
        paths_ignore: Vec<String>,
    },
}

/// An incoming candidate event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TriggerEvent {
    ScheduledTick {
        at: DateTime<Utc>,
    },
    Push {
        /// Pushed ref, `refs/heads/main` or a bare branch name
        #[serde(rename = "ref")]
        git_ref: String,
        /// Head commit after the push
        #[serde(default)]
        after: Option<String>,
        #[serde(default)]
        changed_files: Vec<String>,
        #[serde(default = "Utc::now")]
        at: DateTime<Utc>,
    },
}

impl TriggerEvent {
    /// Parse a push event from JSON.
    ///
    /// Accepts either the tagged form (`{"event": "push", "ref": ..}`) or a
    /// GitHub push webhook payload, whose changed files are the union of
    /// `added`, `modified` and `removed` over all `commits`.
    pub fn push_from_json(raw: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(raw)?;
        if value.get("event").is_some() {
            return Ok(serde_json::from_value(value)?);
        }

        let git_ref = value["ref"]
            .as_str()
            .ok_or_else(|| PipelineError::InvalidEvent("push event has no 'ref' field".to_string()))?
            .to_string();
        let after = value["after"].as_str().map(str::to_string);

        let mut changed = std::collections::BTreeSet::new();
        for commit in value["commits"].as_array().into_iter().flatten() {
            for field in ["added", "modified", "removed"] {
                for path in commit[field].as_array().into_iter().flatten() {
                    if let Some(path) = path.as_str() {
                        changed.insert(path.to_string());
                    }
                }
            }
        }

        let at = value["head_commit"]["timestamp"]
            .as_str()
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        Ok(TriggerEvent::Push {
            git_ref,
            after,
            changed_files: changed.into_iter().collect(),
            at,
        })
    }
}

/// Facts about an admitted event that the Run carries forward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmittedRun {
    pub kind: TriggerKind,
    /// Branch to build
    pub branch: String,
    /// Commit reference, when the event carried one
    pub commit: Option<String>,
    pub at: DateTime<Utc>,
}

/// Why an event did not start a Run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RejectReason {
    /// No rule of the event's kind is configured
    NoMatchingRule,
    /// The tick does not match any schedule
    OffSchedule,
    /// Push to a branch other than the configured one
    BranchMismatch { branch: String },
    /// Every changed file matched an ignore glob
    OnlyIgnoredPaths { changed: usize },
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::NoMatchingRule => write!(f, "no trigger rule for this event"),
            RejectReason::OffSchedule => write!(f, "tick does not match the schedule"),
            RejectReason::BranchMismatch { branch } => {
                write!(f, "push to '{branch}' is not the main branch")
            }
            RejectReason::OnlyIgnoredPaths { changed } => {
                write!(f, "all {changed} changed file(s) match ignore globs")
            }
        }
    }
}

/// Admission decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum TriggerDecision {
    Admit(AdmittedRun),
    Reject(RejectReason),
}

impl TriggerDecision {
    pub fn is_admitted(&self) -> bool {
        matches!(self, TriggerDecision::Admit(_))
    }
}

#[derive(Debug, Clone)]
struct CompiledSchedule {
    schedule: cron::Schedule,
}

#[derive(Debug, Clone)]
struct CompiledPush {
    branch: String,
    ignore: Vec<Pattern>,
}

/// Trigger rules with cron expressions and globs parsed up front.
#[derive(Debug, Clone)]
pub struct TriggerSet {
    schedules: Vec<CompiledSchedule>,
    pushes: Vec<CompiledPush>,
}

const PATH_MATCH: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

impl TriggerSet {
    /// Parse every rule. Fails on the first invalid cron expression or glob.
    pub fn compile(rules: &[TriggerRule]) -> Result<Self> {
        let mut schedules = Vec::new();
        let mut pushes = Vec::new();

        for rule in rules {
            match rule {
                TriggerRule::Scheduled { cron } => schedules.push(CompiledSchedule {
                    schedule: parse_cron(cron)?,
                }),
                TriggerRule::Push {
                    branch,
                    paths_ignore,
                } => {
                    let ignore = paths_ignore
                        .iter()
                        .map(|p| {
                            Pattern::new(p).map_err(|e| PipelineError::InvalidGlob {
                                pattern: p.clone(),
                                reason: e.to_string(),
                            })
                        })
                        .collect::<Result<Vec<_>>>()?;
                    pushes.push(CompiledPush {
                        branch: branch_name(branch).to_string(),
                        ignore,
                    });
                }
            }
        }

        Ok(Self { schedules, pushes })
    }

    /// Decide whether `event` starts a Run.
    pub fn evaluate(&self, event: &TriggerEvent) -> TriggerDecision {
        match event {
            TriggerEvent::ScheduledTick { at } => self.evaluate_tick(*at),
            TriggerEvent::Push {
                git_ref,
                after,
                changed_files,
                at,
            } => self.evaluate_push(git_ref, after.as_deref(), changed_files, *at),
        }
    }

    fn evaluate_tick(&self, at: DateTime<Utc>) -> TriggerDecision {
        if self.schedules.is_empty() {
            return TriggerDecision::Reject(RejectReason::NoMatchingRule);
        }
        let minute = truncate_to_minute(at);
        if !self.schedules.iter().any(|s| s.schedule.includes(minute)) {
            return TriggerDecision::Reject(RejectReason::OffSchedule);
        }
        TriggerDecision::Admit(AdmittedRun {
            kind: TriggerKind::Scheduled,
            branch: self.default_branch().to_string(),
            commit: None,
            at: minute,
        })
    }

    fn evaluate_push(
        &self,
        git_ref: &str,
        after: Option<&str>,
        changed_files: &[String],
        at: DateTime<Utc>,
    ) -> TriggerDecision {
        if self.pushes.is_empty() {
            return TriggerDecision::Reject(RejectReason::NoMatchingRule);
        }
        let branch = branch_name(git_ref);
        // Tags and other non-branch refs never match
        let is_branch = git_ref.starts_with("refs/heads/") || !git_ref.starts_with("refs/");
        let Some(rule) = self
            .pushes
            .iter()
            .find(|p| is_branch && p.branch == branch)
        else {
            return TriggerDecision::Reject(RejectReason::BranchMismatch {
                branch: git_ref.to_string(),
            });
        };

        let relevant = changed_files
            .iter()
            .any(|path| !is_ignored(&rule.ignore, path));
        if !relevant {
            return TriggerDecision::Reject(RejectReason::OnlyIgnoredPaths {
                changed: changed_files.len(),
            });
        }

        TriggerDecision::Admit(AdmittedRun {
            kind: TriggerKind::Push,
            branch: branch.to_string(),
            commit: after.map(str::to_string),
            at,
        })
    }

    /// Next tick strictly after `after` that a schedule admits.
    pub fn next_scheduled_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedules
            .iter()
            .filter_map(|s| s.schedule.after(&after).next())
            .min()
    }

    fn default_branch(&self) -> &str {
        self.pushes
            .first()
            .map(|p| p.branch.as_str())
            .unwrap_or("main")
    }
}

/// Compile `rules` and evaluate `event` in one step.
pub fn evaluate(rules: &[TriggerRule], event: &TriggerEvent) -> Result<TriggerDecision> {
    Ok(TriggerSet::compile(rules)?.evaluate(event))
}

/// Parse a cron expression. Five-field POSIX expressions get a leading
/// seconds field. Day-of-week numbers follow the `cron` crate (1 = Sunday);
/// names (`MON`, `SUN`) are portable.
pub fn parse_cron(expr: &str) -> Result<cron::Schedule> {
    let expr = expr.trim();
    let normalized = match expr.split_whitespace().count() {
        5 => format!("0 {expr}"),
        6 | 7 => expr.to_string(),
        n => {
            return Err(PipelineError::InvalidCron {
                expr: expr.to_string(),
                reason: format!("expected 5, 6 or 7 fields, got {n}"),
            })
        }
    };
    cron::Schedule::from_str(&normalized).map_err(|e| PipelineError::InvalidCron {
        expr: expr.to_string(),
        reason: e.to_string(),
    })
}

/// `refs/heads/main` → `main`; bare names pass through.
pub fn branch_name(git_ref: &str) -> &str {
    git_ref.strip_prefix("refs/heads/").unwrap_or(git_ref)
}

fn is_ignored(patterns: &[Pattern], path: &str) -> bool {
    let path = path.strip_prefix("./").unwrap_or(path);
    patterns.iter().any(|p| p.matches_with(path, PATH_MATCH))
}

fn truncate_to_minute(at: DateTime<Utc>) -> DateTime<Utc> {
    at.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(at)
}
