//! The symbolic execution loop: plan, execute searches/reads/sub-calls, repeat.
//!
//! One iteration is `Planning → Executing-Subcalls`; the run ends on a
//! resolvable `final`, on budget exhaustion, or when planner retries run out.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result, anyhow, bail};
use tracing::{debug, info, instrument, warn};

use crate::alignment::{AlignmentChecker, TurnInput};
use crate::core::alignment::RiskLevel;
use crate::core::budget::{deadline_exceeded, deadline_from_minutes};
use crate::core::lineage::{Lineage, SubcallPointerRecord};
use crate::core::plan::{PlanError, parse_planner_output};
use crate::core::plan_validation::{
    ValidatedPlan, check_final_intent, validate_plan, validate_plan_pointers,
};
use crate::core::types::{
    FinalStatus, Intent, IterationRecord, ReadRequest, SearchRecord, SnippetRequest,
    SubcallStatus,
};
use crate::deliberation::{DeliberationState, run_deliberation};
use crate::io::artifacts::{STATE_FILE, resolve, write_planner_failure};
use crate::io::config::RlmConfig;
use crate::io::context_store::{ContextSource, ContextStore};
use crate::io::invoker::{Deliberator, Planner, SubcallInvoker};
use crate::io::prompt::{
    PlannerPromptInputs, PromptBuilder, ReadExcerpt, SubcallReference, build_retry_prompt,
};
use crate::io::run_state::{ContextRef, FinalResult, RunState, write_run_state};
use crate::subcalls::{SubcallContext, execute_subcalls};

/// Most recent sub-call references carried into planner prompts. Older
/// outputs stay reachable through the lineage and variable table.
const SUBCALL_REFERENCE_WINDOW: usize = 32;

/// Model collaborators injected into a run.
#[derive(Clone, Copy)]
pub struct Collaborators<'a> {
    pub planner: &'a dyn Planner,
    pub subcalls: &'a dyn SubcallInvoker,
    pub deliberator: Option<&'a dyn Deliberator>,
}

/// What the caller sees when a run ends.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopOutcome {
    pub state: RunState,
    pub exit_code: i32,
    pub error: Option<String>,
}

/// Terminal result of a run, before alignment finalization.
struct Terminal {
    status: FinalStatus,
    final_answer: Option<String>,
    final_var: Option<String>,
    error: Option<String>,
}

impl Terminal {
    fn new(status: FinalStatus) -> Self {
        Self {
            status,
            final_answer: None,
            final_var: None,
            error: None,
        }
    }

    fn failed(status: FinalStatus, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::new(status)
        }
    }
}

struct Run<'a> {
    run_dir: &'a Path,
    config: &'a RlmConfig,
    collaborators: Collaborators<'a>,
    store: ContextStore,
    lineage: Lineage,
    checker: AlignmentChecker,
    deliberation: DeliberationState,
    brief: Option<String>,
    read_excerpts: Vec<ReadExcerpt>,
    subcall_refs: Vec<SubcallReference>,
    state: RunState,
    state_path: PathBuf,
}

/// Build the context, then drive the loop until a terminal status.
///
/// The wall-clock deadline starts now from `loop.max_minutes`.
pub fn run_symbolic_loop(
    run_dir: &Path,
    run_id: &str,
    goal: &str,
    source: ContextSource<'_>,
    config: &RlmConfig,
    collaborators: Collaborators<'_>,
) -> Result<LoopOutcome> {
    let deadline = deadline_from_minutes(Instant::now(), config.run.max_minutes());
    run_symbolic_loop_until(run_dir, run_id, goal, source, config, collaborators, deadline)
}

/// [`run_symbolic_loop`] against an explicit deadline (`None` disables the
/// wall-clock check).
///
/// An invalid config ends the run with status `invalid_config` before any
/// context is built. Setup failures before the run state exists are returned
/// as errors; any later failure finalizes the run with status `error`.
#[instrument(skip_all, fields(run_id = %run_id))]
pub fn run_symbolic_loop_until(
    run_dir: &Path,
    run_id: &str,
    goal: &str,
    source: ContextSource<'_>,
    config: &RlmConfig,
    collaborators: Collaborators<'_>,
    deadline: Option<Instant>,
) -> Result<LoopOutcome> {
    fs::create_dir_all(run_dir).with_context(|| format!("create {}", run_dir.display()))?;
    if let Err(err) = config.validate() {
        warn!(error = %format!("{err:#}"), "invalid configuration");
        return reject_config(run_dir, run_id, goal, config, &err);
    }
    let store = ContextStore::build(run_dir, source, &config.context)?;
    let checker = AlignmentChecker::new(run_dir, goal, run_id, &config.alignment)?;
    let context_dir = store
        .dir()
        .strip_prefix(run_dir)
        .unwrap_or(store.dir())
        .to_string_lossy()
        .into_owned();
    let state = RunState {
        run_id: run_id.to_string(),
        goal: goal.to_string(),
        max_iterations: config.run.max_iterations,
        max_minutes: config.run.max_minutes(),
        context: ContextRef {
            object_id: store.object_id().to_string(),
            dir: context_dir,
            byte_length: store.source_len(),
            chunks: store.chunks().len(),
        },
        iterations: Vec::new(),
        final_result: None,
    };
    let state_path = run_dir.join(STATE_FILE);
    write_run_state(&state_path, &state)?;
    info!(
        object_id = %state.context.object_id,
        chunks = state.context.chunks,
        "context ready"
    );

    let mut run = Run {
        run_dir,
        config,
        collaborators,
        store,
        lineage: Lineage::default(),
        checker,
        deliberation: DeliberationState::default(),
        brief: None,
        read_excerpts: Vec::new(),
        subcall_refs: Vec::new(),
        state,
        state_path,
    };
    let terminal = run
        .drive(deadline)
        .unwrap_or_else(|err| Terminal::failed(FinalStatus::Error, format!("{err:#}")));
    Ok(run.finish(terminal))
}

fn reject_config(
    run_dir: &Path,
    run_id: &str,
    goal: &str,
    config: &RlmConfig,
    err: &anyhow::Error,
) -> Result<LoopOutcome> {
    let final_result = FinalResult {
        error: Some(format!("{err:#}")),
        ..FinalResult::new(FinalStatus::InvalidConfig)
    };
    let state = RunState {
        run_id: run_id.to_string(),
        goal: goal.to_string(),
        max_iterations: config.run.max_iterations,
        max_minutes: config.run.max_minutes(),
        context: ContextRef::default(),
        iterations: Vec::new(),
        final_result: Some(final_result.clone()),
    };
    write_run_state(&run_dir.join(STATE_FILE), &state)?;
    Ok(LoopOutcome {
        state,
        exit_code: final_result.exit_code,
        error: final_result.error,
    })
}

impl Run<'_> {
    fn drive(&mut self, deadline: Option<Instant>) -> Result<Terminal> {
        let max_iterations = self.config.run.max_iterations;
        let max_minutes = self.config.run.max_minutes();
        if max_iterations == 0 && max_minutes.is_none() {
            return Ok(Terminal::failed(
                FinalStatus::InvalidConfig,
                "unbounded run: set loop.max_iterations or loop.max_minutes",
            ));
        }

        let mut iteration = 0u32;
        loop {
            if max_iterations > 0 && iteration >= max_iterations {
                return Ok(Terminal::failed(
                    FinalStatus::MaxIterations,
                    format!("no final answer after {max_iterations} iterations"),
                ));
            }
            if deadline_exceeded(deadline) {
                return Ok(Terminal::failed(
                    FinalStatus::MaxMinutes,
                    format!("wall-clock budget of {} minutes exhausted", max_minutes.unwrap_or(0)),
                ));
            }
            iteration += 1;
            if let Some(terminal) = self.iterate(iteration)? {
                return Ok(terminal);
            }
        }
    }

    #[instrument(skip_all, fields(iteration = iteration))]
    fn iterate(&mut self, iteration: u32) -> Result<Option<Terminal>> {
        let goal = self.state.goal.clone();
        let deliberation = run_deliberation(
            self.run_dir,
            &self.config.deliberation,
            &mut self.deliberation,
            self.collaborators.deliberator,
            &goal,
            iteration,
            self.state.iterations.last(),
        )?;
        if let Some(brief) = deliberation.brief {
            self.brief = Some(brief);
        }

        let variables: Vec<(String, String)> = self
            .lineage
            .bindings()
            .into_iter()
            .map(|(name, pointer)| (name.to_string(), pointer.to_string()))
            .collect();
        let first_pointer = self
            .store
            .chunks()
            .first()
            .map(|chunk| self.store.pointer_for(chunk));
        let previous_searches = self
            .state
            .iterations
            .last()
            .map(|record| record.searches.as_slice())
            .unwrap_or_default();
        let prompt = PromptBuilder::new(self.config.budgets.max_planner_prompt_bytes)
            .build_planner(&PlannerPromptInputs {
                goal: &goal,
                iteration,
                max_iterations: self.config.run.max_iterations,
                object_id: self.store.object_id(),
                source_bytes: self.store.source_len(),
                chunk_count: self.store.chunks().len(),
                first_pointer: first_pointer.as_deref(),
                budgets: &self.config.budgets,
                searches: previous_searches,
                reads: &self.read_excerpts,
                subcalls: &self.subcall_refs,
                variables: &variables,
                deliberation: self
                    .brief
                    .as_deref()
                    .filter(|_| self.config.deliberation.include_in_planner_prompt),
            })?;

        let (plan, planner_errors) = self.request_plan(iteration, &prompt.content)?;
        let Some(plan) = plan else {
            warn!(iteration, errors = ?planner_errors, "planner attempts exhausted");
            return Ok(Some(Terminal::failed(
                FinalStatus::InvalidConfig,
                format!(
                    "planner attempts exhausted at iteration {iteration}: {}",
                    planner_errors.join("; ")
                ),
            )));
        };

        let turn = TurnInput {
            turn: iteration,
            intent: plan.intent,
            contradictions: planner_errors.len() as u32
                + u32::from(matches!(plan.intent, Intent::Fail | Intent::Pause)),
            evidence_count: (plan.reads.len() + plan.searches.len() + plan.subcalls.len()) as u32,
            verbosity_tokens: (prompt.content.len() as u64).div_ceil(4),
            risk_level: turn_risk(&plan, &planner_errors),
            evidence_refs: self.evidence_refs(&plan),
        };
        let alignment = self.checker.evaluate_turn(&turn)?;

        let mut record = IterationRecord {
            iteration,
            intent: plan.intent,
            planner_prompt_bytes: prompt.content.len(),
            planner_errors,
            reads: Vec::new(),
            searches: Vec::new(),
            subcalls: Vec::new(),
            variable_bindings: Vec::new(),
            deliberation: Some(deliberation.record),
            alignment,
            clamped: plan.clamped,
            truncation: prompt.truncation,
        };

        if let Some(reason) = record
            .alignment
            .as_ref()
            .filter(|decision| decision.enforcement_blocked)
            .map(|decision| decision.enforcement_reason.clone().unwrap_or_default())
        {
            self.commit(record)?;
            return Ok(Some(Terminal::failed(
                FinalStatus::InvalidConfig,
                format!("alignment enforcement blocked the run: {reason}"),
            )));
        }

        let terminal = match plan.intent {
            Intent::Final => {
                let answer = self.resolve_final(&plan)?;
                info!(iteration, bytes = answer.len(), "final answer resolved");
                Some(Terminal {
                    final_answer: Some(answer),
                    final_var: plan.final_var.clone(),
                    ..Terminal::new(FinalStatus::Passed)
                })
            }
            Intent::Pause | Intent::Fail => Some(Terminal::failed(
                FinalStatus::InvalidConfig,
                format!("planner returned intent {}", plan.intent.as_str()),
            )),
            Intent::Continue => {
                self.execute(iteration, &plan, &mut record)?;
                None
            }
        };
        self.commit(record)?;
        Ok(terminal)
    }

    /// Ask the planner for a plan, retrying with error feedback.
    ///
    /// Returns the accepted plan (if any) and the codes of every rejected attempt.
    fn request_plan(
        &self,
        iteration: u32,
        prompt: &str,
    ) -> Result<(Option<ValidatedPlan>, Vec<String>)> {
        let mut errors: Vec<String> = Vec::new();
        for attempt in 1..=self.config.run.planner_attempts.max(1) {
            let attempt_prompt = if errors.is_empty() {
                prompt.to_string()
            } else {
                build_retry_prompt(prompt, &errors)
            };
            let raw = self
                .collaborators
                .planner
                .plan(&attempt_prompt)
                .with_context(|| format!("planner call (iteration {iteration}, attempt {attempt})"))?;
            match self.accept_plan(&raw) {
                Ok(plan) => {
                    debug!(iteration, attempt, intent = plan.intent.as_str(), "plan accepted");
                    return Ok((Some(plan), errors));
                }
                Err(err) => {
                    warn!(iteration, attempt, error = %err, "plan rejected");
                    write_planner_failure(self.run_dir, iteration, attempt, &raw, &[err.to_string()])?;
                    errors.push(err.code().to_string());
                }
            }
        }
        Ok((None, errors))
    }

    fn accept_plan(&self, raw: &str) -> Result<ValidatedPlan, PlanError> {
        let parsed = parse_planner_output(raw)?;
        let plan = validate_plan(&parsed, &self.config.budgets)?;
        validate_plan_pointers(&plan, |pointer| {
            self.store.validate_pointer(pointer) || self.lineage.contains(pointer)
        })?;
        check_final_intent(&plan, &self.lineage)?;
        Ok(plan)
    }

    fn evidence_refs(&self, plan: &ValidatedPlan) -> Vec<String> {
        let reads = plan
            .reads
            .iter()
            .filter_map(|read| read.pointer.clone())
            .take(2);
        let subcalls = self
            .subcall_refs
            .iter()
            .map(|reference| reference.pointer.clone())
            .take(2);
        reads.chain(subcalls).collect()
    }

    /// `final_var` wins over an inline `final_answer` when both are present.
    fn resolve_final(&self, plan: &ValidatedPlan) -> Result<String> {
        if let Some(name) = plan.final_var.as_deref() {
            let record = self
                .lineage
                .resolve_variable(name)
                .ok_or_else(|| anyhow!("final_var {name} is not bound"))?;
            let path = resolve(self.run_dir, &record.output_path);
            return fs::read_to_string(&path)
                .with_context(|| format!("read final output {}", path.display()));
        }
        match plan.final_answer.as_deref() {
            Some(answer) => Ok(answer.to_string()),
            None => bail!("final intent without final_answer or final_var"),
        }
    }

    /// Run one `continue` plan: searches, then reads, then the sub-call batch.
    fn execute(
        &mut self,
        iteration: u32,
        plan: &ValidatedPlan,
        record: &mut IterationRecord,
    ) -> Result<()> {
        let budgets = self.config.budgets;
        for search in &plan.searches {
            let results = self.store.search(&search.query, search.top_k, &budgets);
            debug!(query = %search.query, hits = results.hits.len(), "search executed");
            record.searches.push(SearchRecord {
                query: search.query.clone(),
                top_k: search.top_k,
                reason: search.reason.clone(),
                clamped_top_k: search.clamped_top_k || results.clamped_top_k,
                hits: results.hits,
            });
        }

        let ctx = SubcallContext {
            run_dir: self.run_dir,
            store: &self.store,
            lineage: &self.lineage,
            budgets: &budgets,
        };
        let mut excerpts = Vec::with_capacity(plan.reads.len());
        for read in &plan.reads {
            match ctx.resolve_snippet(&snippet_for_read(read)) {
                Ok(text) => excerpts.push(ReadExcerpt {
                    pointer: read_label(read),
                    text,
                }),
                Err(err) => warn!(read = %read_label(read), error = %format!("{err:#}"), "read skipped"),
            }
        }
        record.reads = plan.reads.clone();

        let outcomes = execute_subcalls(&ctx, iteration, &plan.subcalls, self.collaborators.subcalls)?;
        self.read_excerpts = excerpts;

        for outcome in outcomes {
            let subcall = outcome.record;
            self.lineage.register(SubcallPointerRecord {
                pointer: subcall.output_pointer.clone(),
                iteration,
                subcall_id: subcall.id.clone(),
                output_path: subcall.artifact_paths.output.clone(),
                output_bytes: subcall.output_bytes,
                status: subcall.status,
            });
            let mut bound_var = None;
            if subcall.status == SubcallStatus::Succeeded {
                if let Some(name) = subcall.output_var.as_deref() {
                    if let Some(binding) = self.lineage.bind(name, &subcall.output_pointer) {
                        bound_var = Some(binding.name.clone());
                        record.variable_bindings.push(binding);
                    }
                }
            }
            self.subcall_refs.push(SubcallReference::new(
                &subcall.id,
                &subcall.output_pointer,
                bound_var.as_deref(),
                outcome.output.as_deref().unwrap_or(""),
            ));
            record.subcalls.push(subcall);
        }
        let overflow = self.subcall_refs.len().saturating_sub(SUBCALL_REFERENCE_WINDOW);
        self.subcall_refs.drain(..overflow);
        Ok(())
    }

    fn commit(&mut self, record: IterationRecord) -> Result<()> {
        self.state.iterations.push(record);
        write_run_state(&self.state_path, &self.state)
    }

    fn finish(mut self, terminal: Terminal) -> LoopOutcome {
        let mut final_result = FinalResult {
            final_answer: terminal.final_answer,
            final_var: terminal.final_var,
            error: terminal.error,
            ..FinalResult::new(terminal.status)
        };
        if self.checker.enabled() {
            match self.checker.finalize() {
                Ok(summary) => final_result.alignment = Some(summary),
                Err(err) => {
                    warn!(error = %format!("{err:#}"), "alignment finalize failed");
                    final_result = FinalResult {
                        error: Some(format!("{err:#}")),
                        ..FinalResult::new(FinalStatus::Error)
                    };
                }
            }
        }
        let exit_code = final_result.exit_code;
        let error = final_result.error.clone();
        info!(
            status = final_result.status.as_str(),
            exit_code,
            iterations = self.state.iterations.len(),
            "run finished"
        );
        self.state.final_result = Some(final_result);
        if let Err(err) = write_run_state(&self.state_path, &self.state) {
            warn!(error = %format!("{err:#}"), "final state write failed");
        }
        LoopOutcome {
            state: self.state,
            exit_code,
            error,
        }
    }
}

fn turn_risk(plan: &ValidatedPlan, planner_errors: &[String]) -> RiskLevel {
    let no_evidence = plan.reads.is_empty() && plan.searches.is_empty() && plan.subcalls.is_empty();
    match plan.intent {
        Intent::Final | Intent::Fail => RiskLevel::High,
        Intent::Pause => RiskLevel::Medium,
        Intent::Continue if !planner_errors.is_empty() || no_evidence => RiskLevel::Medium,
        Intent::Continue => RiskLevel::Low,
    }
}

fn snippet_for_read(read: &ReadRequest) -> SnippetRequest {
    SnippetRequest {
        pointer: read.pointer.clone(),
        offset: read.offset,
        start_byte: read.start_byte,
        bytes: read.bytes,
    }
}

fn read_label(read: &ReadRequest) -> String {
    match (&read.pointer, read.start_byte) {
        (Some(pointer), _) => pointer.clone(),
        (None, start) => format!("start_byte:{}", start.unwrap_or(0)),
    }
}
