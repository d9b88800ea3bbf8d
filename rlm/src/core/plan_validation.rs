//! Structural and referential validation of planner plans.

use std::sync::LazyLock;

use jsonschema::{Draft, Validator};
use serde_json::{Map, Value};

use crate::core::budget::Budgets;
use crate::core::lineage::Lineage;
use crate::core::plan::PlanError;
use crate::core::types::{
    Intent, PlanClamps, Purpose, ReadRequest, SearchRequest, SnippetRequest, SpanRequest,
    SubcallRequest,
};

const PLAN_SCHEMA: &str = include_str!("../../schemas/plan_v1.schema.json");

static PLAN_VALIDATOR: LazyLock<Validator> = LazyLock::new(|| {
    let schema: Value = serde_json::from_str(PLAN_SCHEMA).expect("plan schema should be json");
    jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .expect("plan schema should compile")
});

/// A plan that passed structural validation, clamped to the budgets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedPlan {
    pub intent: Intent,
    pub final_answer: Option<String>,
    pub final_var: Option<String>,
    pub reads: Vec<ReadRequest>,
    pub searches: Vec<SearchRequest>,
    pub subcalls: Vec<SubcallRequest>,
    pub clamped: PlanClamps,
}

fn invalid(detail: impl Into<String>) -> PlanError {
    PlanError::Validation(detail.into())
}

/// Validate a normalized plan object against the schema and the budgets.
pub fn validate_plan(
    plan: &Map<String, Value>,
    budgets: &Budgets,
) -> Result<ValidatedPlan, PlanError> {
    let instance = Value::Object(plan.clone());
    let messages: Vec<String> = PLAN_VALIDATOR
        .iter_errors(&instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        return Err(invalid(messages.join("; ")));
    }

    let intent = plan
        .get("intent")
        .and_then(Value::as_str)
        .and_then(Intent::parse)
        .ok_or_else(|| invalid("unknown intent"))?;

    let final_var = trimmed_optional(plan.get("final_var"), "final_var")?;
    let final_answer = plan
        .get("final_answer")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|answer| !answer.is_empty())
        .map(str::to_string);
    if intent == Intent::Final && final_answer.is_none() && final_var.is_none() {
        return Err(invalid("final intent needs final_answer or final_var"));
    }

    let reads = entries(plan, "reads")
        .map(|entry| validate_read(entry, budgets))
        .collect::<Result<Vec<_>, _>>()?;
    let searches = entries(plan, "searches")
        .map(|entry| validate_search(entry, budgets))
        .collect::<Result<Vec<_>, _>>()?;
    let subcalls = entries(plan, "subcalls")
        .map(|entry| validate_subcall(entry, budgets))
        .collect::<Result<Vec<_>, _>>()?;

    let clamped = PlanClamps {
        reads: reads.len() > budgets.max_chunk_reads_per_iteration,
        searches: searches.len() > budgets.max_searches_per_iteration,
        subcalls: subcalls.len() > budgets.max_subcalls_per_iteration,
    };

    Ok(ValidatedPlan {
        intent,
        final_answer,
        final_var,
        reads: truncated(reads, budgets.max_chunk_reads_per_iteration),
        searches: truncated(searches, budgets.max_searches_per_iteration),
        subcalls: truncated(subcalls, budgets.max_subcalls_per_iteration),
        clamped,
    })
}

/// Every pointer the plan references must resolve to a known chunk or a
/// registered sub-call output.
pub fn validate_plan_pointers(
    plan: &ValidatedPlan,
    is_known: impl Fn(&str) -> bool,
) -> Result<(), PlanError> {
    let read_pointers = plan.reads.iter().filter_map(|read| read.pointer.as_deref());
    let subcall_pointers = plan.subcalls.iter().flat_map(|subcall| {
        subcall
            .parent_pointer
            .as_deref()
            .into_iter()
            .chain(subcall.snippets.iter().filter_map(|s| s.pointer.as_deref()))
    });
    for pointer in read_pointers.chain(subcall_pointers) {
        if !is_known(pointer) {
            return Err(invalid(format!("unknown pointer {pointer}")));
        }
    }
    Ok(())
}

/// Final-intent rules that depend on run history.
pub fn check_final_intent(plan: &ValidatedPlan, lineage: &Lineage) -> Result<(), PlanError> {
    if plan.intent != Intent::Final {
        return Ok(());
    }
    if !lineage.has_subcalls() {
        return Err(PlanError::FinalRequiresSubcall);
    }
    if let Some(name) = plan.final_var.as_deref() {
        if lineage.resolve_variable(name).is_none() {
            return Err(PlanError::FinalVarUnbound);
        }
    }
    Ok(())
}

fn entries<'a>(plan: &'a Map<String, Value>, key: &str) -> impl Iterator<Item = &'a Value> {
    plan.get(key)
        .and_then(Value::as_array)
        .map(|items| items.iter())
        .into_iter()
        .flatten()
}

fn truncated<T>(mut items: Vec<T>, limit: usize) -> Vec<T> {
    items.truncate(limit);
    items
}

/// Numbers may arrive as JSON numbers or numeric strings.
fn to_number(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(number) => number.as_f64(),
        Value::String(raw) => raw.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|number| number.is_finite())
}

fn positive_bytes(value: Option<&Value>, field: &str) -> Result<usize, PlanError> {
    match to_number(value) {
        Some(bytes) if bytes >= 1.0 => Ok(bytes.floor() as usize),
        _ => Err(invalid(format!("{field} must be > 0"))),
    }
}

fn non_negative(value: Option<&Value>) -> Option<usize> {
    to_number(value).map(|number| number.max(0.0).floor() as usize)
}

fn optional_string(entry: &Value, key: &str) -> Option<String> {
    entry.get(key).and_then(Value::as_str).map(str::to_string)
}

/// Present values must be non-empty strings after trimming.
fn trimmed_optional(value: Option<&Value>, field: &str) -> Result<Option<String>, PlanError> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(raw)) if !raw.trim().is_empty() => Ok(Some(raw.trim().to_string())),
        Some(_) => Err(invalid(format!("{field} must be a non-empty string"))),
    }
}

fn validate_read(entry: &Value, budgets: &Budgets) -> Result<ReadRequest, PlanError> {
    let bytes = positive_bytes(entry.get("bytes"), "reads[].bytes")?;
    let pointer = optional_string(entry, "pointer");
    let start_byte = non_negative(entry.get("start_byte"));
    if pointer.is_none() && start_byte.is_none() {
        return Err(invalid("reads[] needs pointer or start_byte"));
    }
    Ok(ReadRequest {
        offset: pointer
            .is_some()
            .then(|| non_negative(entry.get("offset")).unwrap_or(0)),
        start_byte: if pointer.is_none() { start_byte } else { None },
        pointer,
        bytes: bytes.min(budgets.max_bytes_per_chunk_read),
        reason: optional_string(entry, "reason"),
    })
}

fn validate_search(entry: &Value, budgets: &Budgets) -> Result<SearchRequest, PlanError> {
    let query = entry
        .get("query")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|query| !query.is_empty())
        .ok_or_else(|| invalid("searches[].query is required"))?;
    let requested = match to_number(entry.get("top_k")) {
        Some(top_k) if top_k >= 1.0 => top_k.floor() as usize,
        _ => budgets.search_top_k,
    };
    Ok(SearchRequest {
        query: query.to_string(),
        top_k: requested.min(budgets.search_top_k),
        reason: optional_string(entry, "reason"),
        clamped_top_k: requested > budgets.search_top_k,
    })
}

fn validate_subcall(entry: &Value, budgets: &Budgets) -> Result<SubcallRequest, PlanError> {
    let purpose = Purpose::normalize(entry.get("purpose").and_then(Value::as_str));
    let parent_pointer = match entry.get("parent_pointer") {
        None | Some(Value::Null) => None,
        Some(Value::String(raw)) => Some(raw.trim().to_string()).filter(|p| !p.is_empty()),
        Some(_) => return Err(invalid("subcalls[].parent_pointer must be a string")),
    };
    let output_var = trimmed_optional(entry.get("output_var"), "subcalls[].output_var")?;
    let max_input_bytes =
        positive_bytes(entry.get("max_input_bytes"), "subcalls[].max_input_bytes")?;

    let mut snippet_bytes_clamped = false;
    let mut snippets = Vec::new();
    for snippet in entry.get("snippets").and_then(Value::as_array).into_iter().flatten() {
        let bytes = positive_bytes(snippet.get("bytes"), "snippets[].bytes")?;
        let pointer = optional_string(snippet, "pointer");
        let start_byte = non_negative(snippet.get("start_byte"));
        if pointer.is_none() && start_byte.is_none() {
            return Err(invalid("snippets[] needs pointer or start_byte"));
        }
        snippet_bytes_clamped |= bytes > budgets.max_bytes_per_snippet;
        snippets.push(SnippetRequest {
            offset: pointer
                .is_some()
                .then(|| non_negative(snippet.get("offset")).unwrap_or(0)),
            start_byte: if pointer.is_none() { start_byte } else { None },
            pointer,
            bytes: bytes.min(budgets.max_bytes_per_snippet),
        });
    }

    let mut spans = Vec::new();
    for span in entry.get("spans").and_then(Value::as_array).into_iter().flatten() {
        let start = non_negative(span.get("start_byte"));
        let end = non_negative(span.get("end_byte"));
        match (start, end) {
            (Some(start_byte), Some(end_byte)) if end_byte > start_byte => {
                spans.push(SpanRequest {
                    start_byte,
                    end_byte,
                });
            }
            _ => return Err(invalid("spans[] needs end_byte > start_byte")),
        }
    }

    if snippets.is_empty() && spans.is_empty() {
        return Err(invalid("subcalls[] needs at least one snippet or span"));
    }

    Ok(SubcallRequest {
        purpose,
        parent_pointer,
        output_var,
        snippets,
        spans,
        max_input_bytes,
        snippet_bytes_clamped,
    })
}
