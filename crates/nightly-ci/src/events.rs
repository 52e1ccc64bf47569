//! Run ledger event kinds and payloads.

use serde_json::{json, Value};

use crate::runner::StageResult;

pub const STAGE_STARTED: &str = "stage_started";
pub const STAGE_SUCCEEDED: &str = "stage_succeeded";
pub const STAGE_FAILED: &str = "stage_failed";
pub const STAGE_SKIPPED: &str = "stage_skipped";
pub const CACHE_SAVED: &str = "cache_saved";
pub const ARTIFACTS_PUBLISHED: &str = "artifacts_published";

/// Bytes of stdout/stderr kept in an event payload (the tail).
pub const OUTPUT_TAIL_BYTES: usize = 8 * 1024;

/// Last `max` bytes of `s`, cut on a char boundary.
pub fn tail(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}

pub fn stage_result_payload(result: &StageResult) -> Value {
    json!({
        "stage": result.stage_name,
        "exit_code": result.exit_code,
        "stdout": tail(&result.stdout, OUTPUT_TAIL_BYTES),
        "stderr": tail(&result.stderr, OUTPUT_TAIL_BYTES),
        "duration_ms": result.duration_ms,
        "commands_run": result.commands_run,
    })
}
