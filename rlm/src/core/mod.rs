//! Deterministic, pure logic shared by the loop.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod alignment;
pub mod budget;
pub mod chunking;
pub mod lineage;
pub mod plan;
pub mod plan_validation;
pub mod pointer;
pub mod text;
pub mod types;
