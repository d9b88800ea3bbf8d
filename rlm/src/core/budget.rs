//! Budget policy shared by the context store, the loop, and the sub-call pool.

use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};

/// Numeric limits consulted by every loop component.
///
/// Pure data: the loop clamps requests to these values and records a flag
/// whenever something was shortened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Budgets {
    pub max_subcalls_per_iteration: usize,
    pub max_searches_per_iteration: usize,
    pub max_chunk_reads_per_iteration: usize,
    pub max_bytes_per_chunk_read: usize,
    pub max_snippets_per_subcall: usize,
    pub max_bytes_per_snippet: usize,
    pub max_subcall_input_bytes: usize,
    pub max_planner_prompt_bytes: usize,
    pub search_top_k: usize,
    pub max_preview_bytes: usize,
    pub max_concurrency: usize,
}

impl Default for Budgets {
    fn default() -> Self {
        Self {
            max_subcalls_per_iteration: 4,
            max_searches_per_iteration: 4,
            max_chunk_reads_per_iteration: 8,
            max_bytes_per_chunk_read: 8192,
            max_snippets_per_subcall: 8,
            max_bytes_per_snippet: 8192,
            max_subcall_input_bytes: 120_000,
            max_planner_prompt_bytes: 32_768,
            search_top_k: 20,
            max_preview_bytes: 512,
            max_concurrency: 4,
        }
    }
}

impl Budgets {
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("max_bytes_per_chunk_read", self.max_bytes_per_chunk_read),
            ("max_bytes_per_snippet", self.max_bytes_per_snippet),
            ("max_subcall_input_bytes", self.max_subcall_input_bytes),
            ("max_planner_prompt_bytes", self.max_planner_prompt_bytes),
            ("search_top_k", self.search_top_k),
            ("max_concurrency", self.max_concurrency),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(anyhow!("budgets.{name} must be > 0"));
            }
        }
        Ok(())
    }

    /// Worker count for the sub-call pool; never below one.
    pub fn worker_limit(&self) -> usize {
        self.max_concurrency.max(1)
    }
}

/// Convert a minutes cap into a wall-clock deadline. `0` or `None` means no
/// cap, and so does a cap too large to represent as an `Instant`.
pub fn deadline_from_minutes(start: Instant, max_minutes: Option<u64>) -> Option<Instant> {
    let minutes = max_minutes.filter(|minutes| *minutes > 0)?;
    let secs = minutes.checked_mul(60)?;
    start.checked_add(Duration::from_secs(secs))
}

/// Return the remaining time budget until the provided deadline.
pub fn remaining_budget(deadline: Instant) -> Result<Duration> {
    let remaining = deadline
        .checked_duration_since(Instant::now())
        .unwrap_or(Duration::from_secs(0));
    if remaining.is_zero() {
        return Err(anyhow!("wall-clock budget exhausted"));
    }
    Ok(remaining)
}

/// True once an optional deadline has passed.
pub fn deadline_exceeded(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|deadline| remaining_budget(deadline).is_err())
}
