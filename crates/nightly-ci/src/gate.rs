//! Run ledger conformance checks.
//!
//! A recorded Run is valid when:
//! - stages never overlap: every `stage_started` is closed by its own
//!   `stage_succeeded`/`stage_failed` before another stage starts
//! - nothing starts after a fatal failure
//! - artifacts are published and the cache saved only in Runs with no fatal
//!   failure, at most once each

use std::collections::HashSet;

use nightly_state::RunEvent;
use serde::{Deserialize, Serialize};

use crate::events;

/// Gate evaluation verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateVerdict {
    /// Whether the gate passed.
    pub passed: bool,

    /// Violations that caused failure (empty if passed).
    pub violations: Vec<String>,

    /// Summary message.
    pub message: String,
}

impl GateVerdict {
    fn from_violations(violations: Vec<String>) -> Self {
        let passed = violations.is_empty();
        let message = if passed {
            "Run conforms to the stage ordering rules".to_string()
        } else {
            format!("Gate failed with {} violation(s)", violations.len())
        };
        Self {
            passed,
            violations,
            message,
        }
    }
}

fn stage_of(event: &RunEvent) -> &str {
    event.payload["stage"].as_str().unwrap_or("unknown")
}

/// Gate over a Run's recorded events.
pub struct RunGate;

impl RunGate {
    /// Check the fail-fast and publish-on-success rules.
    pub fn evaluate(events: &[RunEvent]) -> GateVerdict {
        let mut violations = Vec::new();
        let mut open: Option<String> = None;
        let mut aborted_by: Option<String> = None;
        let mut finished = HashSet::new();
        let mut publishes = 0;
        let mut saves = 0;

        for event in events {
            match event.kind.as_str() {
                events::STAGE_STARTED => {
                    let stage = stage_of(event).to_string();
                    if let Some(running) = &open {
                        violations.push(format!(
                            "Stage '{}' started while '{}' was still running",
                            stage, running
                        ));
                    }
                    if let Some(failed) = &aborted_by {
                        violations.push(format!(
                            "Stage '{}' started after fatal failure of '{}'",
                            stage, failed
                        ));
                    }
                    if finished.contains(&stage) {
                        violations.push(format!("Stage '{}' ran more than once", stage));
                    }
                    open = Some(stage);
                }
                events::STAGE_SUCCEEDED | events::STAGE_FAILED => {
                    let stage = stage_of(event).to_string();
                    if open.as_deref() != Some(stage.as_str()) {
                        violations.push(format!(
                            "Stage '{}' finished without being started",
                            stage
                        ));
                    }
                    open = None;
                    let fatal = event.payload["fatal"].as_bool().unwrap_or(true);
                    if event.kind == events::STAGE_FAILED && fatal && aborted_by.is_none() {
                        if publishes > 0 {
                            violations.push(format!(
                                "Stage '{}' failed after artifacts were published",
                                stage
                            ));
                        }
                        aborted_by = Some(stage.clone());
                    }
                    finished.insert(stage);
                }
                events::ARTIFACTS_PUBLISHED => {
                    publishes += 1;
                    if let Some(failed) = &aborted_by {
                        violations.push(format!(
                            "Artifacts published after fatal failure of '{}'",
                            failed
                        ));
                    }
                }
                events::CACHE_SAVED => {
                    saves += 1;
                    if let Some(failed) = &aborted_by {
                        violations.push(format!(
                            "Cache saved after fatal failure of '{}'",
                            failed
                        ));
                    }
                    if let Some(running) = &open {
                        violations.push(format!(
                            "Cache saved while '{}' was still running",
                            running
                        ));
                    }
                }
                _ => {}
            }
        }

        if let Some(running) = open {
            violations.push(format!("Stage '{}' was started but never finished", running));
        }
        if publishes > 1 {
            violations.push(format!("Artifacts published {} times", publishes));
        }
        if saves > 1 {
            violations.push(format!("Cache saved {} times", saves));
        }

        GateVerdict::from_violations(violations)
    }

    /// `evaluate`, plus: stages that ran or were skipped appear in the
    /// order of `stages`.
    pub fn evaluate_order(events: &[RunEvent], stages: &[String]) -> GateVerdict {
        let mut verdict = Self::evaluate(events);

        let position = |name: &str| stages.iter().position(|s| s == name);
        let mut last: Option<(usize, String)> = None;
        for event in events {
            if event.kind != events::STAGE_STARTED && event.kind != events::STAGE_SKIPPED {
                continue;
            }
            let stage = stage_of(event);
            let Some(pos) = position(stage) else {
                verdict
                    .violations
                    .push(format!("Stage '{}' is not part of the pipeline", stage));
                continue;
            };
            if let Some((prev, prev_name)) = &last {
                if pos <= *prev {
                    verdict.violations.push(format!(
                        "Stage '{}' ran out of order after '{}'",
                        stage, prev_name
                    ));
                }
            }
            last = Some((pos, stage.to_string()));
        }

        GateVerdict::from_violations(verdict.violations)
    }
}
