//! I/O helpers: configuration, on-disk stores, prompts, and injected invokers.

pub mod artifacts;
pub mod config;
pub mod context_store;
pub mod invoker;
pub mod ledger;
pub mod prompt;
pub mod run_state;
