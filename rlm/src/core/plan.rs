//! Extraction of the planner's JSON plan from free-form model output.

use std::fmt;

use serde_json::{Map, Value};

/// Stable error codes fed back to the planner on retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanError {
    /// No JSON object in the output looked like a v1 plan.
    Parse,
    /// A plan was found but is structurally or referentially invalid.
    Validation(String),
    /// `intent: final` before any sub-call ran in this run.
    FinalRequiresSubcall,
    /// `final_var` names a variable no sub-call has bound.
    FinalVarUnbound,
}

impl PlanError {
    pub fn code(&self) -> &'static str {
        match self {
            PlanError::Parse => "plan_parse_error",
            PlanError::Validation(_) => "plan_validation_error",
            PlanError::FinalRequiresSubcall => "final_requires_subcall",
            PlanError::FinalVarUnbound => "final_var_unbound",
        }
    }
}

impl fmt::Display for PlanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanError::Validation(detail) => write!(f, "{}: {detail}", self.code()),
            _ => f.write_str(self.code()),
        }
    }
}

impl std::error::Error for PlanError {}

/// Parse raw planner output into a normalized plan object.
///
/// Balanced `{...}` candidates are extracted while tolerating prose and code
/// fences; the last candidate that parses and looks like a v1 plan wins. A
/// candidate may also wrap the plan in an array, `plan`, or `plans`.
pub fn parse_planner_output(raw: &str) -> Result<Map<String, Value>, PlanError> {
    let candidates = extract_json_candidates(raw);
    let found = candidates
        .iter()
        .rev()
        .filter_map(|candidate| serde_json::from_str::<Value>(candidate).ok())
        .find_map(unwrap_plan);
    if let Some(plan) = found {
        return Ok(plan);
    }
    if candidates.is_empty() {
        if let Some(plan) = serde_json::from_str::<Value>(raw.trim())
            .ok()
            .and_then(unwrap_plan)
        {
            return Ok(plan);
        }
    }
    Err(PlanError::Parse)
}

/// Top-level balanced brace groups, skipping braces inside JSON strings.
fn extract_json_candidates(raw: &str) -> Vec<&str> {
    let mut candidates = Vec::new();
    let mut depth = 0usize;
    let mut start = None;
    let mut in_string = false;
    let mut escaped = false;

    for (idx, ch) in raw.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => {
                if depth == 0 {
                    start = Some(idx);
                }
                depth += 1;
            }
            '}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    if let Some(begin) = start.take() {
                        candidates.push(&raw[begin..=idx]);
                    }
                }
            }
            _ => {}
        }
    }
    candidates
}

fn unwrap_plan(value: Value) -> Option<Map<String, Value>> {
    match value {
        Value::Array(items) => items.into_iter().rev().find_map(normalize_plan),
        Value::Object(mut record) => {
            if looks_like_plan(&record) {
                return normalize_plan(Value::Object(record));
            }
            if let Some(plan) = record.remove("plan").and_then(normalize_plan) {
                return Some(plan);
            }
            match record.remove("plans") {
                Some(Value::Array(plans)) => plans.into_iter().rev().find_map(normalize_plan),
                _ => None,
            }
        }
        _ => None,
    }
}

fn looks_like_plan(record: &Map<String, Value>) -> bool {
    record.get("intent").is_some_and(Value::is_string)
        && record.get("schema_version").and_then(schema_version) == Some(1.0)
}

/// Accept only `schema_version == 1` (number or numeric string) with a string intent.
fn normalize_plan(value: Value) -> Option<Map<String, Value>> {
    let Value::Object(mut record) = value else {
        return None;
    };
    if !looks_like_plan(&record) {
        return None;
    }
    record.insert("schema_version".to_string(), Value::from(1));
    Some(record)
}

fn schema_version(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(raw) => raw.trim().parse().ok(),
        _ => None,
    }
}
