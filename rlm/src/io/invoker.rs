//! Injected model collaborators.
//!
//! The loop never talks to a model directly: planners, sub-call workers, and
//! deliberators are traits so tests can script them without any backend.
//! Timeouts and transport retries belong to the implementations.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::core::types::Purpose;

/// Metadata handed to a sub-call invoker alongside its prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubcallMeta {
    pub id: String,
    pub iteration: u32,
    pub purpose: Purpose,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliberationMeta {
    pub iteration: u32,
    pub reason: String,
    pub strategy: String,
}

/// Turns a planner prompt into raw planner text (expected to contain a JSON plan).
pub trait Planner {
    fn plan(&self, prompt: &str) -> Result<String>;
}

/// Runs one bounded sub-call. Called from pool worker threads, hence `Sync`.
pub trait SubcallInvoker: Sync {
    fn invoke(&self, prompt: &str, meta: &SubcallMeta) -> Result<String>;
}

/// Produces a deliberation brief folded into later planner prompts.
pub trait Deliberator {
    fn deliberate(&self, prompt: &str, meta: &DeliberationMeta) -> Result<String>;
}
