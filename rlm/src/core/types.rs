//! Shared deterministic types for the symbolic loop.
//!
//! These records are serialized into `state.json`; field names are part of
//! the persisted contract.

use serde::{Deserialize, Serialize};

use crate::core::alignment::AlignmentDecision;
use crate::exit_codes;

/// Planner-declared intent for an iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Intent {
    Continue,
    Final,
    Pause,
    Fail,
}

impl Intent {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "continue" => Some(Intent::Continue),
            "final" => Some(Intent::Final),
            "pause" => Some(Intent::Pause),
            "fail" => Some(Intent::Fail),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Intent::Continue => "continue",
            Intent::Final => "final",
            Intent::Pause => "pause",
            Intent::Fail => "fail",
        }
    }
}

/// What a sub-call is asked to do with its snippets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Purpose {
    #[default]
    Summarize,
    Extract,
    Classify,
    Verify,
}

impl Purpose {
    /// Unknown or missing purposes fall back to `summarize`.
    pub fn normalize(raw: Option<&str>) -> Self {
        match raw {
            Some("extract") => Purpose::Extract,
            Some("classify") => Purpose::Classify,
            Some("verify") => Purpose::Verify,
            _ => Purpose::Summarize,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Purpose::Summarize => "summarize",
            Purpose::Extract => "extract",
            Purpose::Classify => "classify",
            Purpose::Verify => "verify",
        }
    }
}

/// One context-store search hit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchHit {
    pub pointer: String,
    /// Offset of the first match inside the chunk.
    pub offset: usize,
    /// Absolute byte position of the first match.
    pub start_byte: usize,
    pub match_bytes: usize,
    pub score: usize,
    pub preview: String,
}

/// A validated read request: either a pointer (+offset) or an absolute start byte.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pointer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_byte: Option<usize>,
    pub bytes: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    pub top_k: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub clamped_top_k: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnippetRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pointer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_byte: Option<usize>,
    pub bytes: usize,
}

/// Explicit `[start_byte, end_byte)` range over the context source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpanRequest {
    pub start_byte: usize,
    pub end_byte: usize,
}

impl SpanRequest {
    pub fn len(&self) -> usize {
        self.end_byte.saturating_sub(self.start_byte)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A validated sub-call entry, before snippet/span clamping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubcallRequest {
    pub purpose: Purpose,
    pub parent_pointer: Option<String>,
    pub output_var: Option<String>,
    pub snippets: Vec<SnippetRequest>,
    pub spans: Vec<SpanRequest>,
    pub max_input_bytes: usize,
    /// At least one snippet asked for more than `max_bytes_per_snippet`.
    pub snippet_bytes_clamped: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchRecord {
    pub query: String,
    pub top_k: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub clamped_top_k: bool,
    pub hits: Vec<SearchHit>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubcallStatus {
    Succeeded,
    Failed,
}

/// Artifact paths relative to the run directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubcallArtifactPaths {
    pub input: String,
    pub prompt: String,
    pub output: String,
    pub meta: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubcallClamps {
    pub snippets: bool,
    pub bytes: bool,
}

/// Immutable record of one executed sub-call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubcallRecord {
    pub id: String,
    pub purpose: Purpose,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_pointer: Option<String>,
    pub output_pointer: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_var: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub snippets: Vec<SnippetRequest>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub spans: Vec<SpanRequest>,
    pub max_input_bytes: usize,
    pub input_bytes: usize,
    pub output_bytes: usize,
    pub artifact_paths: SubcallArtifactPaths,
    pub clamped: SubcallClamps,
    pub status: SubcallStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A name bound by `output_var` to a sub-call output pointer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableBinding {
    pub name: String,
    pub pointer: String,
    pub iteration: u32,
    pub subcall_id: String,
    pub output_bytes: usize,
    pub output_path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliberationStatus {
    Ran,
    Error,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliberationArtifactPaths {
    pub prompt: String,
    pub output: String,
    pub meta: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliberationRecord {
    pub status: DeliberationStatus,
    pub reason: String,
    pub strategy: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_bytes: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_bytes: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_paths: Option<DeliberationArtifactPaths>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanClamps {
    pub reads: bool,
    pub searches: bool,
    pub subcalls: bool,
}

/// Which planner prompt sections were dropped to fit the byte budget.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptTruncation {
    pub searches_dropped: bool,
    pub reads_dropped: bool,
    pub subcalls_dropped: bool,
    pub deliberation_dropped: bool,
    pub prompt_truncated: bool,
}

/// One loop pass, appended to the run state once it completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    pub iteration: u32,
    pub intent: Intent,
    pub planner_prompt_bytes: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub planner_errors: Vec<String>,
    pub reads: Vec<ReadRequest>,
    pub searches: Vec<SearchRecord>,
    pub subcalls: Vec<SubcallRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub variable_bindings: Vec<VariableBinding>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deliberation: Option<DeliberationRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alignment: Option<AlignmentDecision>,
    pub clamped: PlanClamps,
    pub truncation: PromptTruncation,
}

/// Terminal status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalStatus {
    Passed,
    MaxIterations,
    MaxMinutes,
    InvalidConfig,
    Error,
}

impl FinalStatus {
    pub fn exit_code(self) -> i32 {
        match self {
            FinalStatus::Passed => exit_codes::PASSED,
            FinalStatus::MaxIterations | FinalStatus::MaxMinutes => exit_codes::BUDGET_EXHAUSTED,
            FinalStatus::InvalidConfig => exit_codes::INVALID_CONFIG,
            FinalStatus::Error => exit_codes::ERROR,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FinalStatus::Passed => "passed",
            FinalStatus::MaxIterations => "max_iterations",
            FinalStatus::MaxMinutes => "max_minutes",
            FinalStatus::InvalidConfig => "invalid_config",
            FinalStatus::Error => "error",
        }
    }
}
