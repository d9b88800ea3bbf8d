//! Run state snapshot (`<run>/state.json`), rewritten after every iteration.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::alignment::AlignmentSummary;
use crate::core::types::{FinalStatus, IterationRecord};
use crate::io::artifacts::write_json_atomic;

/// Where the run's context lives, relative to the run directory.
///
/// Empty when the run was rejected before a context was built.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextRef {
    pub object_id: String,
    pub dir: String,
    pub byte_length: usize,
    pub chunks: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalResult {
    pub status: FinalStatus,
    pub exit_code: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_answer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_var: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alignment: Option<AlignmentSummary>,
}

impl FinalResult {
    pub fn new(status: FinalStatus) -> Self {
        Self {
            status,
            exit_code: status.exit_code(),
            final_answer: None,
            final_var: None,
            error: None,
            alignment: None,
        }
    }
}

/// Persisted bookkeeping for one symbolic run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: String,
    pub goal: String,
    pub max_iterations: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_minutes: Option<u64>,
    pub context: ContextRef,
    pub iterations: Vec<IterationRecord>,
    #[serde(rename = "final", skip_serializing_if = "Option::is_none")]
    pub final_result: Option<FinalResult>,
}

/// Load run state from disk.
pub fn load_run_state(path: &Path) -> Result<RunState> {
    debug!(path = %path.display(), "loading run state");
    let contents =
        fs::read_to_string(path).with_context(|| format!("read run state {}", path.display()))?;
    let state: RunState = serde_json::from_str(&contents)
        .with_context(|| format!("parse run state {}", path.display()))?;
    debug!(run_id = %state.run_id, iterations = state.iterations.len(), "run state loaded");
    Ok(state)
}

/// Atomically write run state to disk (temp file + rename).
pub fn write_run_state(path: &Path, state: &RunState) -> Result<()> {
    debug!(
        path = %path.display(),
        run_id = %state.run_id,
        iterations = state.iterations.len(),
        "writing run state"
    );
    write_json_atomic(path, state)
}
