//! Run-directory artifact paths and atomic file writes.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::debug;

use crate::core::types::{DeliberationArtifactPaths, SubcallArtifactPaths};

pub const STATE_FILE: &str = "state.json";
pub const CONTEXT_DIR: &str = "context";
pub const PLANNER_DIR: &str = "planner";
pub const DELIBERATION_DIR: &str = "deliberation";
pub const ALIGNMENT_DIR: &str = "alignment";

/// Write `contents` next to `path` and rename it into place.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("artifact path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

/// Pretty JSON plus a trailing newline, written atomically.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)
        .with_context(|| format!("serialize {}", path.display()))?;
    buf.push('\n');
    write_atomic(path, buf.as_bytes())
}

/// Sub-call artifact paths for one iteration, relative to the run directory.
pub fn subcall_artifact_paths(iteration: u32, subcall_id: &str) -> SubcallArtifactPaths {
    let base = format!("{iteration}/{subcall_id}");
    SubcallArtifactPaths {
        input: format!("{base}.input.json"),
        prompt: format!("{base}.prompt"),
        output: format!("{base}.output"),
        meta: format!("{base}.meta.json"),
    }
}

pub fn deliberation_artifact_paths(iteration: u32) -> DeliberationArtifactPaths {
    let base = format!("{DELIBERATION_DIR}/iteration-{iteration:04}");
    DeliberationArtifactPaths {
        prompt: format!("{base}-prompt.txt"),
        output: format!("{base}-output.txt"),
        meta: format!("{base}-meta.json"),
    }
}

pub fn resolve(run_dir: &Path, relative: &str) -> PathBuf {
    run_dir.join(relative)
}

/// Persist a rejected planner response with the error codes it produced.
pub fn write_planner_failure(
    run_dir: &Path,
    iteration: u32,
    attempt: u32,
    raw: &str,
    errors: &[String],
) -> Result<PathBuf> {
    let path = run_dir
        .join(PLANNER_DIR)
        .join(format!("iteration-{iteration}-attempt-{attempt}.txt"));
    let contents = format!("# errors: {}\n{raw}", errors.join("; "));
    write_atomic(&path, contents.as_bytes())?;
    debug!(path = %path.display(), iteration, attempt, "planner failure recorded");
    Ok(path)
}
