//! Periodic deliberation briefs folded into later planner prompts.

use std::path::Path;

use anyhow::Result;
use serde_json::json;
use tracing::{debug, warn};

use crate::core::text::truncate_utf8_to_bytes;
use crate::core::types::{DeliberationRecord, DeliberationStatus, IterationRecord};
use crate::io::artifacts::{deliberation_artifact_paths, resolve, write_atomic, write_json_atomic};
use crate::io::config::{DeliberationConfig, DeliberationStrategy};
use crate::io::invoker::{DeliberationMeta, Deliberator};
use crate::io::prompt::{DeliberationPromptInputs, build_deliberation_prompt};

/// Run-scoped deliberation bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliberationState {
    pub runs: u32,
    pub last_run_iteration: Option<u32>,
}

/// Why a deliberation is due this iteration, or `None` when it is not.
pub fn select_reason(
    iteration: u32,
    previous: Option<&IterationRecord>,
    last_run_iteration: Option<u32>,
    min_interval: u32,
) -> Option<&'static str> {
    if iteration <= 1 {
        return Some("bootstrap");
    }
    if let Some(previous) = previous {
        if !previous.planner_errors.is_empty() {
            return Some("planner_recovery");
        }
        if previous.reads.is_empty() && previous.searches.is_empty() && previous.subcalls.is_empty()
        {
            return Some("no_subcall_progress");
        }
    }
    let since = iteration - last_run_iteration.unwrap_or(0);
    (since >= min_interval).then_some("cadence")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliberationOutcome {
    pub record: DeliberationRecord,
    /// The new brief, already truncated to `max_summary_bytes`.
    pub brief: Option<String>,
}

fn skipped(reason: &str, cfg: &DeliberationConfig) -> DeliberationOutcome {
    DeliberationOutcome {
        record: DeliberationRecord {
            status: DeliberationStatus::Skipped,
            reason: reason.to_string(),
            strategy: cfg.strategy.as_str().to_string(),
            prompt_bytes: None,
            output_bytes: None,
            artifact_paths: None,
            error: None,
        },
        brief: None,
    }
}

fn latest_lines(previous: Option<&IterationRecord>) -> (Option<String>, Option<String>, Option<String>) {
    let Some(previous) = previous else {
        return (None, None, None);
    };
    let search = previous
        .searches
        .last()
        .map(|search| format!("{:?} ({} hits)", search.query, search.hits.len()));
    let read = previous.reads.last().map(|read| match (&read.pointer, read.start_byte) {
        (Some(pointer), _) => format!("{pointer} (+{}, {} bytes)", read.offset.unwrap_or(0), read.bytes),
        (None, start) => format!("start_byte:{} ({} bytes)", start.unwrap_or(0), read.bytes),
    });
    let subcall = previous.subcalls.last().map(|subcall| {
        format!(
            "{} {} {:?} ({} bytes)",
            subcall.id,
            subcall.output_pointer,
            subcall.status,
            subcall.output_bytes
        )
    });
    (search, read, subcall)
}

/// Decide whether to deliberate and, if so, invoke the deliberator.
///
/// Invoker failures are recorded with `status: error` and never propagate;
/// only artifact write failures do.
pub fn run_deliberation(
    run_dir: &Path,
    cfg: &DeliberationConfig,
    state: &mut DeliberationState,
    deliberator: Option<&dyn Deliberator>,
    goal: &str,
    iteration: u32,
    previous: Option<&IterationRecord>,
) -> Result<DeliberationOutcome> {
    let Some(deliberator) = deliberator.filter(|_| cfg.enabled) else {
        return Ok(skipped("disabled", cfg));
    };
    if state.runs >= cfg.max_runs {
        return Ok(skipped("max_runs_reached", cfg));
    }
    let Some(reason) = select_reason(
        iteration,
        previous,
        state.last_run_iteration,
        cfg.min_interval_iterations,
    ) else {
        return Ok(skipped("not_due", cfg));
    };

    let (latest_search, latest_read, latest_subcall) = latest_lines(previous);
    let prompt = build_deliberation_prompt(&DeliberationPromptInputs {
        goal,
        iteration,
        reason,
        strategy: cfg.strategy.as_str(),
        collab: cfg.strategy == DeliberationStrategy::Collab,
        latest_search,
        latest_read,
        latest_subcall,
        planner_errors: previous
            .map(|record| record.planner_errors.clone())
            .unwrap_or_default(),
    })?;
    let meta = DeliberationMeta {
        iteration,
        reason: reason.to_string(),
        strategy: cfg.strategy.as_str().to_string(),
    };
    state.runs += 1;
    state.last_run_iteration = Some(iteration);

    let result = deliberator.deliberate(&prompt, &meta);
    let paths = cfg.log_artifacts.then(|| deliberation_artifact_paths(iteration));
    if let Some(paths) = &paths {
        write_atomic(&resolve(run_dir, &paths.prompt), prompt.as_bytes())?;
    }

    let mut record = DeliberationRecord {
        status: DeliberationStatus::Ran,
        reason: reason.to_string(),
        strategy: cfg.strategy.as_str().to_string(),
        prompt_bytes: Some(prompt.len()),
        output_bytes: None,
        artifact_paths: None,
        error: None,
    };
    let brief = match result {
        Ok(output) => {
            let brief = truncate_utf8_to_bytes(output.trim(), cfg.max_summary_bytes).to_string();
            record.output_bytes = Some(brief.len());
            if let Some(paths) = &paths {
                write_atomic(&resolve(run_dir, &paths.output), brief.as_bytes())?;
            }
            debug!(iteration, reason, bytes = brief.len(), "deliberation brief produced");
            Some(brief)
        }
        Err(err) => {
            warn!(iteration, reason, error = %format!("{err:#}"), "deliberation failed");
            record.status = DeliberationStatus::Error;
            record.error = Some(format!("{err:#}"));
            None
        }
    };
    if let Some(paths) = paths {
        write_json_atomic(
            &resolve(run_dir, &paths.meta),
            &json!({
                "iteration": iteration,
                "reason": reason,
                "strategy": cfg.strategy.as_str(),
                "status": record.status,
                "prompt_bytes": record.prompt_bytes,
                "output_bytes": record.output_bytes,
                "error": record.error,
            }),
        )?;
        record.artifact_paths = Some(paths);
    }
    Ok(DeliberationOutcome { record, brief })
}
