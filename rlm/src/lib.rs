//! Recursive language-model runner: a symbolic execution loop over a
//! pointer-addressed context, with bounded sub-calls and an auditable
//! alignment ledger.
//!
//! - **[`core`]**: Pure, deterministic logic (budgets, pointers, chunking, plan
//!   parsing and validation, lineage, alignment scoring). No I/O.
//! - **[`io`]**: Side effects (config, context store, artifacts, prompts, run
//!   state, ledger) and the injected model collaborator traits.
//!
//! Orchestration modules ([`symbolic`], [`subcalls`], [`deliberation`],
//! [`alignment`]) combine the two into a run.

pub mod alignment;
pub mod core;
pub mod deliberation;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod subcalls;
pub mod symbolic;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
