//! Pointer strings that address context chunks and prior sub-call outputs.
//!
//! - Context: `ctx:<object_id>#chunk:<chunk_id>`
//! - Sub-call: `subcall:<iteration>:<subcall_id>`

pub const CONTEXT_POINTER_PREFIX: &str = "ctx:";
pub const CHUNK_SEPARATOR: &str = "#chunk:";
pub const SUBCALL_POINTER_PREFIX: &str = "subcall:";

/// Human-readable pointer grammar rendered into planner prompts.
pub const POINTER_FORMAT_HINT: &str =
    "ctx:<object_id>#chunk:<chunk_id> | subcall:<iteration>:<subcall_id>";

/// A parsed pointer borrowing from its source string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pointer<'a> {
    Context { object_id: &'a str, chunk_id: &'a str },
    Subcall { iteration: u32, subcall_id: &'a str },
}

pub fn parse_pointer(raw: &str) -> Option<Pointer<'_>> {
    parse_context_pointer(raw).or_else(|| parse_subcall_pointer(raw))
}

pub fn parse_context_pointer(raw: &str) -> Option<Pointer<'_>> {
    let body = raw.strip_prefix(CONTEXT_POINTER_PREFIX)?;
    let (object_id, chunk_id) = body.split_once(CHUNK_SEPARATOR)?;
    if object_id.is_empty() || chunk_id.is_empty() {
        return None;
    }
    Some(Pointer::Context {
        object_id,
        chunk_id,
    })
}

pub fn parse_subcall_pointer(raw: &str) -> Option<Pointer<'_>> {
    let body = raw.strip_prefix(SUBCALL_POINTER_PREFIX)?;
    let (iteration, subcall_id) = body.split_once(':')?;
    let iteration: u32 = iteration.parse().ok()?;
    if iteration == 0 || subcall_id.is_empty() {
        return None;
    }
    Some(Pointer::Subcall {
        iteration,
        subcall_id,
    })
}

pub fn is_context_pointer(raw: &str) -> bool {
    raw.starts_with(CONTEXT_POINTER_PREFIX)
}

pub fn context_pointer(object_id: &str, chunk_id: &str) -> String {
    format!("{CONTEXT_POINTER_PREFIX}{object_id}{CHUNK_SEPARATOR}{chunk_id}")
}

pub fn subcall_pointer(iteration: u32, subcall_id: &str) -> String {
    format!("{SUBCALL_POINTER_PREFIX}{iteration}:{subcall_id}")
}

/// 1-based, per-iteration sub-call id (`sc0001`).
pub fn subcall_id(ordinal: usize) -> String {
    format!("sc{ordinal:04}")
}

/// 1-based chunk id (`c000001`).
pub fn chunk_id(ordinal: usize) -> String {
    format!("c{ordinal:06}")
}
