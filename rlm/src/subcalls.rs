//! Sub-call preparation, bounded parallel execution, and artifact recording.
//!
//! With a worker limit of one, sub-calls run strictly in declaration order.

use std::fs;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use anyhow::{Context, Result, anyhow};
use serde_json::json;
use tracing::{debug, instrument, warn};

use crate::core::budget::Budgets;
use crate::core::lineage::Lineage;
use crate::core::pointer::{Pointer, parse_pointer, subcall_id, subcall_pointer};
use crate::core::text::{decode_lossy, truncate_utf8_to_bytes};
use crate::core::types::{
    SnippetRequest, SpanRequest, SubcallArtifactPaths, SubcallClamps, SubcallRecord,
    SubcallRequest, SubcallStatus,
};
use crate::io::artifacts::{resolve, subcall_artifact_paths, write_atomic, write_json_atomic};
use crate::io::context_store::ContextStore;
use crate::io::invoker::{SubcallInvoker, SubcallMeta};
use crate::io::prompt::build_subcall_prompt;

/// Read-only state every sub-call in an iteration resolves against.
#[derive(Clone, Copy)]
pub struct SubcallContext<'a> {
    pub run_dir: &'a Path,
    pub store: &'a ContextStore,
    pub lineage: &'a Lineage,
    pub budgets: &'a Budgets,
}

impl SubcallContext<'_> {
    /// Resolve a snippet to text: context chunk, prior sub-call output, or
    /// absolute source range.
    pub fn resolve_snippet(&self, snippet: &SnippetRequest) -> Result<String> {
        let offset = snippet.offset.unwrap_or(0);
        match (snippet.pointer.as_deref(), snippet.start_byte) {
            (Some(pointer), _) => match parse_pointer(pointer) {
                Some(Pointer::Context { .. }) => {
                    Ok(self.store.read(pointer, offset, snippet.bytes)?.text)
                }
                Some(Pointer::Subcall { .. }) => {
                    self.read_subcall_output(pointer, offset, snippet.bytes)
                }
                None => Err(anyhow!("unparseable pointer {pointer}")),
            },
            (None, Some(start)) => Ok(self.store.read_span(start, snippet.bytes)?.text),
            (None, None) => Err(anyhow!("snippet has neither pointer nor start_byte")),
        }
    }

    /// Slice a registered sub-call output artifact.
    pub fn read_subcall_output(&self, pointer: &str, offset: usize, bytes: usize) -> Result<String> {
        let record = self
            .lineage
            .get(pointer)
            .ok_or_else(|| anyhow!("unknown sub-call pointer {pointer}"))?;
        let path = resolve(self.run_dir, &record.output_path);
        let output =
            fs::read(&path).with_context(|| format!("read sub-call output {}", path.display()))?;
        let start = offset.min(output.len());
        let end = start.saturating_add(bytes).min(output.len());
        Ok(decode_lossy(&output[start..end]))
    }
}

/// A sub-call ready to dispatch.
#[derive(Debug, Clone)]
struct PreparedSubcall {
    meta: SubcallMeta,
    prompt: String,
    snippets: Vec<SnippetRequest>,
    spans: Vec<SpanRequest>,
    max_input_bytes: usize,
    clamped: SubcallClamps,
}

/// The settled result of one sub-call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubcallOutcome {
    pub record: SubcallRecord,
    /// Output text on success.
    pub output: Option<String>,
}

fn prepare(
    ctx: &SubcallContext<'_>,
    iteration: u32,
    id: &str,
    request: &SubcallRequest,
) -> Result<PreparedSubcall> {
    let budgets = ctx.budgets;
    let cap = budgets.max_snippets_per_subcall;
    let snippets: Vec<SnippetRequest> = request.snippets.iter().take(cap).cloned().collect();
    let spans: Vec<SpanRequest> = request
        .spans
        .iter()
        .take(cap.saturating_sub(snippets.len()))
        .copied()
        .collect();
    let snippets_clamped =
        snippets.len() < request.snippets.len() || spans.len() < request.spans.len();

    let mut texts = Vec::with_capacity(snippets.len() + spans.len());
    for snippet in &snippets {
        texts.push(ctx.resolve_snippet(snippet)?);
    }
    let mut span_clamped = false;
    for span in &spans {
        let bytes = span.len().min(budgets.max_bytes_per_snippet);
        span_clamped |= bytes < span.len();
        texts.push(ctx.store.read_span(span.start_byte, bytes)?.text);
    }

    let max_input_bytes = request.max_input_bytes.min(budgets.max_subcall_input_bytes);
    let full_prompt = build_subcall_prompt(request.purpose, &texts);
    let prompt = truncate_utf8_to_bytes(&full_prompt, max_input_bytes).to_string();
    let clipped = prompt.len() < full_prompt.len();

    Ok(PreparedSubcall {
        meta: SubcallMeta {
            id: id.to_string(),
            iteration,
            purpose: request.purpose,
        },
        prompt,
        snippets,
        spans,
        max_input_bytes,
        clamped: SubcallClamps {
            snippets: snippets_clamped,
            bytes: clipped
                || max_input_bytes < request.max_input_bytes
                || span_clamped
                || request.snippet_bytes_clamped,
        },
    })
}

/// Run `task` over `items` on at most `workers` threads, returning results in
/// item order.
fn run_bounded<T, R, F>(items: &[T], workers: usize, task: F) -> Vec<Option<R>>
where
    T: Sync,
    R: Send,
    F: Fn(&T) -> R + Sync,
{
    let workers = workers.max(1).min(items.len());
    let next = AtomicUsize::new(0);
    let slots: Vec<Mutex<Option<R>>> = items.iter().map(|_| Mutex::new(None)).collect();
    thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| {
                loop {
                    let idx = next.fetch_add(1, Ordering::SeqCst);
                    let Some(item) = items.get(idx) else {
                        break;
                    };
                    let result = task(item);
                    if let Ok(mut slot) = slots[idx].lock() {
                        *slot = Some(result);
                    }
                }
            });
        }
    });
    slots
        .into_iter()
        .map(|slot| slot.into_inner().ok().flatten())
        .collect()
}

fn write_inputs(run_dir: &Path, paths: &SubcallArtifactPaths, job: &PreparedSubcall) -> Result<()> {
    write_json_atomic(
        &resolve(run_dir, &paths.input),
        &json!({
            "id": job.meta.id,
            "iteration": job.meta.iteration,
            "purpose": job.meta.purpose,
            "snippets": job.snippets,
            "spans": job.spans,
            "max_input_bytes": job.max_input_bytes,
            "input_bytes": job.prompt.len(),
            "clamped": job.clamped,
        }),
    )?;
    write_atomic(&resolve(run_dir, &paths.prompt), job.prompt.as_bytes())
}

/// Prepare, dispatch, and record every sub-call of one iteration.
///
/// Invoker and snippet-resolution failures become `failed` records; only
/// artifact write failures are returned as errors.
#[instrument(skip_all, fields(iteration = iteration, requested = requests.len()))]
pub fn execute_subcalls(
    ctx: &SubcallContext<'_>,
    iteration: u32,
    requests: &[SubcallRequest],
    invoker: &dyn SubcallInvoker,
) -> Result<Vec<SubcallOutcome>> {
    let mut prepared: Vec<(usize, PreparedSubcall)> = Vec::new();
    let mut results: Vec<Option<Result<String, String>>> = vec![None; requests.len()];
    let ids: Vec<String> = (1..=requests.len()).map(subcall_id).collect();

    for (idx, request) in requests.iter().enumerate() {
        let paths = subcall_artifact_paths(iteration, &ids[idx]);
        match prepare(ctx, iteration, &ids[idx], request) {
            Ok(job) => {
                write_inputs(ctx.run_dir, &paths, &job)?;
                prepared.push((idx, job));
            }
            Err(err) => {
                warn!(id = %ids[idx], error = %format!("{err:#}"), "sub-call preparation failed");
                results[idx] = Some(Err(format!("{err:#}")));
            }
        }
    }

    let dispatched = run_bounded(&prepared, ctx.budgets.worker_limit(), |(_, job)| {
        debug!(id = %job.meta.id, bytes = job.prompt.len(), "dispatching sub-call");
        invoker
            .invoke(&job.prompt, &job.meta)
            .map_err(|err| format!("{err:#}"))
    });
    for ((idx, _), result) in prepared.iter().zip(dispatched) {
        results[*idx] =
            Some(result.unwrap_or_else(|| Err("sub-call worker produced no result".to_string())));
    }

    let mut outcomes = Vec::with_capacity(requests.len());
    for (idx, request) in requests.iter().enumerate() {
        let id = &ids[idx];
        let paths = subcall_artifact_paths(iteration, id);
        let job = prepared
            .iter()
            .find(|(slot, _)| *slot == idx)
            .map(|(_, job)| job);
        let result = results[idx]
            .take()
            .unwrap_or_else(|| Err("sub-call was not dispatched".to_string()));
        let (status, output, error) = match result {
            Ok(output) => (SubcallStatus::Succeeded, Some(output), None),
            Err(err) => (SubcallStatus::Failed, None, Some(err)),
        };
        let output_text = output.as_deref().unwrap_or("");
        write_atomic(&resolve(ctx.run_dir, &paths.output), output_text.as_bytes())?;
        let input_bytes = job.map_or(0, |job| job.prompt.len());
        write_json_atomic(
            &resolve(ctx.run_dir, &paths.meta),
            &json!({
                "id": id,
                "iteration": iteration,
                "purpose": request.purpose,
                "status": status,
                "input_bytes": input_bytes,
                "output_bytes": output_text.len(),
                "clipped": job.is_some_and(|job| job.clamped.bytes),
                "error": error,
            }),
        )?;
        debug!(id = %id, status = ?status, output_bytes = output_text.len(), "sub-call settled");
        outcomes.push(SubcallOutcome {
            record: SubcallRecord {
                id: id.clone(),
                purpose: request.purpose,
                parent_pointer: request.parent_pointer.clone(),
                output_pointer: subcall_pointer(iteration, id),
                output_var: request.output_var.clone(),
                snippets: job.map_or_else(|| request.snippets.clone(), |job| job.snippets.clone()),
                spans: job.map_or_else(|| request.spans.clone(), |job| job.spans.clone()),
                max_input_bytes: job.map_or(request.max_input_bytes, |job| job.max_input_bytes),
                input_bytes,
                output_bytes: output_text.len(),
                artifact_paths: paths,
                clamped: job.map(|job| job.clamped).unwrap_or_default(),
                status,
                error,
            },
            output,
        });
    }
    Ok(outcomes)
}
