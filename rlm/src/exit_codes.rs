//! Stable exit codes for symbolic runs and the `rlm` CLI.

/// The run produced a final answer.
pub const PASSED: i32 = 0;
/// A CLI command failed (bad arguments, unreadable files, broken ledger chain).
pub const CLI_FAILURE: i32 = 1;
/// Iteration cap or wall-clock cap reached without a final answer.
pub const BUDGET_EXHAUSTED: i32 = 3;
/// Unresolvable plan, unbounded run, paused/failed intent, or an enforced alignment block.
pub const INVALID_CONFIG: i32 = 5;
/// Unexpected I/O or internal failure inside the loop.
pub const ERROR: i32 = 10;
