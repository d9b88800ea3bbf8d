//! Planner, retry, sub-call, and deliberation prompt rendering.

use std::sync::LazyLock;

use anyhow::Result;
use minijinja::{Environment, context};
use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::core::budget::Budgets;
use crate::core::plan::PlanError;
use crate::core::pointer::POINTER_FORMAT_HINT;
use crate::core::text::{collapse_whitespace, truncate_utf8_to_bytes};
use crate::core::types::{PromptTruncation, Purpose, SearchRecord};

const PLANNER_TEMPLATE: &str = include_str!("prompts/planner.md");
const DELIBERATION_TEMPLATE: &str = include_str!("prompts/deliberation.md");

const SUBCALL_PREVIEW_BYTES: usize = 160;
const SECTION_SEPARATOR: &str = "\n\n";

static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->")
        .expect("section marker regex should be valid")
});

/// Template engine wrapper around minijinja.
struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("planner", PLANNER_TEMPLATE)
            .expect("planner template should be valid");
        env.add_template("deliberation", DELIBERATION_TEMPLATE)
            .expect("deliberation template should be valid");
        Self { env }
    }
}

static ENGINE: LazyLock<PromptEngine> = LazyLock::new(PromptEngine::new);

/// Excerpt from a previous iteration's read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReadExcerpt {
    pub pointer: String,
    pub text: String,
}

/// A prior sub-call as the planner sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubcallReference {
    pub id: String,
    pub pointer: String,
    pub output_bytes: usize,
    pub output_var: Option<String>,
    pub preview: String,
}

impl SubcallReference {
    pub fn new(
        id: &str,
        pointer: &str,
        output_var: Option<&str>,
        output: &str,
    ) -> Self {
        let collapsed = collapse_whitespace(output);
        Self {
            id: id.to_string(),
            pointer: pointer.to_string(),
            output_bytes: output.len(),
            output_var: output_var.map(str::to_string),
            preview: truncate_utf8_to_bytes(collapsed.trim(), SUBCALL_PREVIEW_BYTES).to_string(),
        }
    }

    fn render(&self) -> String {
        let var = self
            .output_var
            .as_deref()
            .map(|name| format!(" output_var={name}"))
            .unwrap_or_default();
        format!(
            "{}: {} ({} bytes){var} preview={:?}",
            self.id, self.pointer, self.output_bytes, self.preview
        )
    }
}

/// Everything the planner template can show.
#[derive(Debug, Clone)]
pub struct PlannerPromptInputs<'a> {
    pub goal: &'a str,
    pub iteration: u32,
    pub max_iterations: u32,
    pub object_id: &'a str,
    pub source_bytes: usize,
    pub chunk_count: usize,
    pub first_pointer: Option<&'a str>,
    pub budgets: &'a Budgets,
    pub searches: &'a [SearchRecord],
    pub reads: &'a [ReadExcerpt],
    pub subcalls: &'a [SubcallReference],
    pub variables: &'a [(String, String)],
    pub deliberation: Option<&'a str>,
}

/// A rendered planner prompt plus which sections were dropped to fit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannerPrompt {
    pub content: String,
    pub truncation: PromptTruncation,
}

#[derive(Debug, Clone)]
struct ParsedSection {
    key: String,
    required: bool,
    content: String,
}

/// Split rendered output on `<!-- section:KEY required|droppable -->` markers.
fn parse_sections(rendered: &str) -> Vec<ParsedSection> {
    let markers: Vec<_> = SECTION_RE.captures_iter(rendered).collect();
    let mut sections = Vec::with_capacity(markers.len());
    for (i, caps) in markers.iter().enumerate() {
        let (Some(whole), Some(key), Some(kind)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        let required = kind.as_str() == "required";
        let end = markers
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map_or(rendered.len(), |next| next.start());
        let content = rendered[whole.end()..end].trim().to_string();
        if !content.is_empty() || required {
            sections.push(ParsedSection {
                key: key.as_str().to_string(),
                required,
                content,
            });
        }
    }
    sections
}

fn rendered_len(sections: &[ParsedSection]) -> usize {
    let content: usize = sections.iter().map(|section| section.content.len()).sum();
    content + SECTION_SEPARATOR.len() * sections.len().saturating_sub(1)
}

/// Drop droppable sections (searches, reads, sub-calls, deliberation) until
/// the prompt fits, recording each drop.
fn apply_budget_to_sections(sections: &mut Vec<ParsedSection>, budget: usize) -> PromptTruncation {
    let mut truncation = PromptTruncation::default();
    for key in ["searches", "reads", "subcalls", "deliberation"] {
        if rendered_len(sections) <= budget {
            break;
        }
        if let Some(idx) = sections
            .iter()
            .position(|section| section.key == key && !section.required)
        {
            debug!(
                section = key,
                bytes_dropped = sections[idx].content.len(),
                "dropped section for budget"
            );
            sections.remove(idx);
            match key {
                "searches" => truncation.searches_dropped = true,
                "reads" => truncation.reads_dropped = true,
                "subcalls" => truncation.subcalls_dropped = true,
                _ => truncation.deliberation_dropped = true,
            }
        }
    }
    truncation
}

fn render_sections(sections: &[ParsedSection]) -> String {
    sections
        .iter()
        .map(|section| section.content.as_str())
        .collect::<Vec<_>>()
        .join(SECTION_SEPARATOR)
}

/// Builds planner prompts within a byte budget.
///
/// Over budget, the oldest search hits, then read excerpts, then sub-call
/// references are trimmed; whole droppable sections go after that, and a
/// hard byte cut is the last resort.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    budget_bytes: usize,
}

impl PromptBuilder {
    pub fn new(budget_bytes: usize) -> Self {
        Self { budget_bytes }
    }

    pub fn build_planner(&self, input: &PlannerPromptInputs<'_>) -> Result<PlannerPrompt> {
        let searches: Vec<String> = input
            .searches
            .iter()
            .flat_map(|record| {
                record.hits.iter().map(move |hit| {
                    serde_json::json!({
                        "query": record.query,
                        "pointer": hit.pointer,
                        "offset": hit.offset,
                        "start_byte": hit.start_byte,
                        "score": hit.score,
                        "preview": hit.preview,
                    })
                    .to_string()
                })
            })
            .collect();
        let subcalls: Vec<String> = input.subcalls.iter().map(SubcallReference::render).collect();
        let variables: Vec<String> = input
            .variables
            .iter()
            .map(|(name, pointer)| format!("{name} = {pointer}"))
            .collect();

        // Oldest entries go one at a time before any whole section is dropped.
        let mut truncation = PromptTruncation::default();
        let (mut searches_from, mut reads_from, mut subcalls_from) = (0, 0, 0);
        let mut sections = loop {
            let sections = render_planner_sections(
                input,
                &searches[searches_from..],
                &input.reads[reads_from..],
                &subcalls[subcalls_from..],
                &variables,
            )?;
            if rendered_len(&sections) <= self.budget_bytes {
                break sections;
            }
            if searches_from < searches.len() {
                searches_from += 1;
                truncation.searches_dropped = true;
            } else if reads_from < input.reads.len() {
                reads_from += 1;
                truncation.reads_dropped = true;
            } else if subcalls_from < subcalls.len() {
                subcalls_from += 1;
                truncation.subcalls_dropped = true;
            } else {
                break sections;
            }
        };
        if searches_from + reads_from + subcalls_from > 0 {
            debug!(
                searches = searches_from,
                reads = reads_from,
                subcalls = subcalls_from,
                "trimmed oldest prompt entries for budget"
            );
        }

        let dropped = apply_budget_to_sections(&mut sections, self.budget_bytes);
        truncation.searches_dropped |= dropped.searches_dropped;
        truncation.reads_dropped |= dropped.reads_dropped;
        truncation.subcalls_dropped |= dropped.subcalls_dropped;
        truncation.deliberation_dropped |= dropped.deliberation_dropped;
        let mut content = render_sections(&sections);
        if content.len() > self.budget_bytes {
            let before_len = content.len();
            content = truncate_utf8_to_bytes(&content, self.budget_bytes).to_string();
            truncation.prompt_truncated = true;
            debug!(before_len, after_len = content.len(), "truncated planner prompt for budget");
        }
        Ok(PlannerPrompt {
            content,
            truncation,
        })
    }
}

fn render_planner_sections(
    input: &PlannerPromptInputs<'_>,
    searches: &[String],
    reads: &[ReadExcerpt],
    subcalls: &[String],
    variables: &[String],
) -> Result<Vec<ParsedSection>> {
    let template = ENGINE.env.get_template("planner")?;
    let rendered = template.render(context! {
        goal => input.goal.trim(),
        iteration => input.iteration,
        max_iterations => input.max_iterations,
        object_id => input.object_id,
        source_bytes => input.source_bytes,
        chunk_count => input.chunk_count,
        pointer_hint => POINTER_FORMAT_HINT,
        first_pointer => input.first_pointer,
        budgets => input.budgets,
        searches => searches,
        reads => reads,
        subcalls => subcalls,
        variables => variables,
        deliberation => input.deliberation.map(str::trim).filter(|brief| !brief.is_empty()),
    })?;
    Ok(parse_sections(&rendered))
}

/// Prefix a planner prompt with corrective hints after a rejected attempt.
pub fn build_retry_prompt(prompt: &str, errors: &[String]) -> String {
    let mut parts = vec!["Return valid JSON only.".to_string()];
    if errors
        .iter()
        .any(|code| code == PlanError::FinalRequiresSubcall.code())
    {
        parts.push("Do not return intent=final until after at least one subcall.".to_string());
    }
    if errors
        .iter()
        .any(|code| code == PlanError::FinalVarUnbound.code())
    {
        parts.push(
            "Use final_var only when it matches a previously declared subcalls[].output_var."
                .to_string(),
        );
    }
    if !errors.is_empty() {
        parts.push(format!("Previous error: {}", errors.join("; ")));
    }
    format!("{}\n\n{prompt}", parts.join(" "))
}

pub fn build_subcall_prompt(purpose: Purpose, snippets: &[String]) -> String {
    let mut blocks = vec![format!(
        "Purpose: {}\nInstructions: respond with the requested output only.",
        purpose.as_str()
    )];
    blocks.extend(
        snippets
            .iter()
            .enumerate()
            .map(|(i, text)| format!("Snippet {}:\n{text}", i + 1)),
    );
    blocks.join(SECTION_SEPARATOR)
}

/// Inputs for the deliberation template.
#[derive(Debug, Clone, Default)]
pub struct DeliberationPromptInputs<'a> {
    pub goal: &'a str,
    pub iteration: u32,
    pub reason: &'a str,
    pub strategy: &'a str,
    pub collab: bool,
    pub latest_search: Option<String>,
    pub latest_read: Option<String>,
    pub latest_subcall: Option<String>,
    pub planner_errors: Vec<String>,
}

pub fn build_deliberation_prompt(input: &DeliberationPromptInputs<'_>) -> Result<String> {
    let template = ENGINE.env.get_template("deliberation")?;
    let rendered = template.render(context! {
        goal => input.goal.trim(),
        iteration => input.iteration,
        reason => input.reason,
        strategy => input.strategy,
        collab => input.collab,
        latest_search => input.latest_search,
        latest_read => input.latest_read,
        latest_subcall => input.latest_subcall,
        planner_errors => (!input.planner_errors.is_empty()).then(|| input.planner_errors.join("; ")),
    })?;
    Ok(rendered.trim().to_string())
}
