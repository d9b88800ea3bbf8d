//! Scripted collaborators and fixtures for loop tests.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tempfile::TempDir;

use crate::core::types::{Intent, IterationRecord, PlanClamps, PromptTruncation};
use crate::io::config::RlmConfig;
use crate::io::context_store::ContextSource;
use crate::io::invoker::{DeliberationMeta, Deliberator, Planner, SubcallInvoker, SubcallMeta};
use crate::symbolic::{Collaborators, LoopOutcome, run_symbolic_loop, run_symbolic_loop_until};

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Planner that replays queued raw outputs and records every prompt it saw.
pub struct ScriptedPlanner {
    outputs: Mutex<VecDeque<String>>,
    fallback: Option<String>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedPlanner {
    pub fn new<S: Into<String>>(outputs: Vec<S>) -> Self {
        Self {
            outputs: Mutex::new(outputs.into_iter().map(Into::into).collect()),
            fallback: None,
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Keep answering with `raw` once the queue is empty.
    pub fn then_repeat(mut self, raw: impl Into<String>) -> Self {
        self.fallback = Some(raw.into());
        self
    }

    pub fn prompts(&self) -> Vec<String> {
        lock(&self.prompts).clone()
    }
}

impl Planner for ScriptedPlanner {
    fn plan(&self, prompt: &str) -> Result<String> {
        lock(&self.prompts).push(prompt.to_string());
        lock(&self.outputs)
            .pop_front()
            .or_else(|| self.fallback.clone())
            .ok_or_else(|| anyhow!("scripted planner exhausted"))
    }
}

type Responder = Box<dyn Fn(&str, &SubcallMeta) -> String + Send + Sync>;

/// Sub-call invoker backed by a closure, with scripted failures and
/// in-flight tracking.
pub struct ScriptedSubcalls {
    responder: Responder,
    failures: HashMap<String, String>,
    delay: Option<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    events: Mutex<Vec<String>>,
}

impl ScriptedSubcalls {
    pub fn new(responder: impl Fn(&str, &SubcallMeta) -> String + Send + Sync + 'static) -> Self {
        Self {
            responder: Box::new(responder),
            failures: HashMap::new(),
            delay: None,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            events: Mutex::new(Vec::new()),
        }
    }

    /// Answer with the prompt itself.
    pub fn echo() -> Self {
        Self::new(|prompt, _| prompt.to_string())
    }

    /// Answer every sub-call with a fixed text.
    pub fn constant(output: impl Into<String>) -> Self {
        let output = output.into();
        Self::new(move |_, _| output.clone())
    }

    /// Fail every sub-call with this id, in any iteration.
    pub fn fail_on(mut self, id: &str, message: &str) -> Self {
        self.failures.insert(id.to_string(), message.to_string());
        self
    }

    /// Sleep inside each invocation so overlapping calls are observable.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// `start:<id>` / `end:<id>` in the order they happened.
    pub fn events(&self) -> Vec<String> {
        lock(&self.events).clone()
    }

    pub fn calls(&self) -> usize {
        self.events()
            .iter()
            .filter(|event| event.starts_with("start:"))
            .count()
    }
}

impl SubcallInvoker for ScriptedSubcalls {
    fn invoke(&self, prompt: &str, meta: &SubcallMeta) -> Result<String> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        lock(&self.events).push(format!("start:{}", meta.id));
        if let Some(delay) = self.delay {
            thread::sleep(delay);
        }
        let result = match self.failures.get(&meta.id) {
            Some(message) => Err(anyhow!(message.clone())),
            None => Ok((self.responder)(prompt, meta)),
        };
        lock(&self.events).push(format!("end:{}", meta.id));
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Deliberator that replays queued briefs (`Ok`) or failures (`Err`).
pub struct ScriptedDeliberator {
    outputs: Mutex<VecDeque<Result<String, String>>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedDeliberator {
    pub fn new(outputs: Vec<Result<String, String>>) -> Self {
        Self {
            outputs: Mutex::new(outputs.into()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn prompts(&self) -> Vec<String> {
        lock(&self.prompts).clone()
    }
}

impl Deliberator for ScriptedDeliberator {
    fn deliberate(&self, prompt: &str, _meta: &DeliberationMeta) -> Result<String> {
        lock(&self.prompts).push(prompt.to_string());
        match lock(&self.outputs).pop_front() {
            Some(Ok(brief)) => Ok(brief),
            Some(Err(message)) => Err(anyhow!(message)),
            None => Err(anyhow!("scripted deliberator exhausted")),
        }
    }
}

/// An empty `continue` iteration record.
pub fn iteration_record(iteration: u32) -> IterationRecord {
    IterationRecord {
        iteration,
        intent: Intent::Continue,
        planner_prompt_bytes: 0,
        planner_errors: Vec::new(),
        reads: Vec::new(),
        searches: Vec::new(),
        subcalls: Vec::new(),
        variable_bindings: Vec::new(),
        deliberation: None,
        alignment: None,
        clamped: PlanClamps::default(),
        truncation: PromptTruncation::default(),
    }
}

/// A throwaway run directory.
pub struct TestRun {
    temp: TempDir,
}

impl TestRun {
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir().context("create temp run dir")?;
        Ok(Self { temp })
    }

    pub fn path(&self) -> &Path {
        self.temp.path()
    }

    /// Run the loop over an in-memory context with run id `run-test`.
    pub fn run(
        &self,
        goal: &str,
        context: &str,
        config: &RlmConfig,
        planner: &dyn Planner,
        subcalls: &dyn SubcallInvoker,
        deliberator: Option<&dyn Deliberator>,
    ) -> Result<LoopOutcome> {
        run_symbolic_loop(
            self.path(),
            "run-test",
            goal,
            ContextSource::Text(context),
            config,
            Collaborators {
                planner,
                subcalls,
                deliberator,
            },
        )
    }

    /// Like [`TestRun::run`], against an explicit wall-clock deadline.
    pub fn run_until(
        &self,
        goal: &str,
        context: &str,
        config: &RlmConfig,
        planner: &dyn Planner,
        subcalls: &dyn SubcallInvoker,
        deadline: Option<Instant>,
    ) -> Result<LoopOutcome> {
        run_symbolic_loop_until(
            self.path(),
            "run-test",
            goal,
            ContextSource::Text(context),
            config,
            Collaborators {
                planner,
                subcalls,
                deliberator: None,
            },
            deadline,
        )
    }
}
