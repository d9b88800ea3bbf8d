//! Pointer-addressed lineage of sub-call outputs and the run's variable table.
//!
//! Records live in an append-only arena and are resolved by pointer string,
//! so iterations never hold references into each other.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::core::types::{SubcallStatus, VariableBinding};

/// Where a registered sub-call output lives on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubcallPointerRecord {
    pub pointer: String,
    pub iteration: u32,
    pub subcall_id: String,
    /// Output artifact path relative to the run directory.
    pub output_path: String,
    pub output_bytes: usize,
    pub status: SubcallStatus,
}

#[derive(Debug, Clone, Default)]
pub struct Lineage {
    records: Vec<SubcallPointerRecord>,
    by_pointer: HashMap<String, usize>,
    variables: HashMap<String, usize>,
}

impl Lineage {
    /// Register a sub-call output. Pointers are unique per run; re-registering
    /// returns the existing slot.
    pub fn register(&mut self, record: SubcallPointerRecord) -> usize {
        if let Some(&slot) = self.by_pointer.get(&record.pointer) {
            return slot;
        }
        let slot = self.records.len();
        self.by_pointer.insert(record.pointer.clone(), slot);
        self.records.push(record);
        slot
    }

    pub fn get(&self, pointer: &str) -> Option<&SubcallPointerRecord> {
        self.by_pointer.get(pointer).map(|&slot| &self.records[slot])
    }

    pub fn contains(&self, pointer: &str) -> bool {
        self.by_pointer.contains_key(pointer)
    }

    pub fn has_subcalls(&self) -> bool {
        !self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Bind `name` to a registered pointer; the last binding for a name wins.
    pub fn bind(&mut self, name: &str, pointer: &str) -> Option<VariableBinding> {
        let slot = *self.by_pointer.get(pointer)?;
        self.variables.insert(name.to_string(), slot);
        let record = &self.records[slot];
        Some(VariableBinding {
            name: name.to_string(),
            pointer: record.pointer.clone(),
            iteration: record.iteration,
            subcall_id: record.subcall_id.clone(),
            output_bytes: record.output_bytes,
            output_path: record.output_path.clone(),
        })
    }

    pub fn resolve_variable(&self, name: &str) -> Option<&SubcallPointerRecord> {
        self.variables.get(name).map(|&slot| &self.records[slot])
    }

    /// Variable names with their pointers, sorted by name.
    pub fn bindings(&self) -> Vec<(&str, &str)> {
        let mut bound: Vec<_> = self
            .variables
            .iter()
            .map(|(name, &slot)| (name.as_str(), self.records[slot].pointer.as_str()))
            .collect();
        bound.sort_unstable();
        bound
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(iteration: u32, id: &str) -> SubcallPointerRecord {
        SubcallPointerRecord {
            pointer: format!("subcall:{iteration}:{id}"),
            iteration,
            subcall_id: id.to_string(),
            output_path: format!("{iteration}/{id}.output"),
            output_bytes: 5,
            status: SubcallStatus::Succeeded,
        }
    }

    #[test]
    fn last_binding_wins() {
        let mut lineage = Lineage::default();
        lineage.register(record(1, "sc0001"));
        lineage.register(record(2, "sc0001"));
        lineage.bind("x", "subcall:1:sc0001").expect("bind");
        let binding = lineage.bind("x", "subcall:2:sc0001").expect("rebind");
        assert_eq!(binding.iteration, 2);
        assert_eq!(
            lineage.resolve_variable("x").map(|r| r.pointer.as_str()),
            Some("subcall:2:sc0001")
        );
        assert_eq!(lineage.bindings(), vec![("x", "subcall:2:sc0001")]);
    }

    #[test]
    fn binding_unknown_pointer_fails() {
        let mut lineage = Lineage::default();
        assert!(lineage.bind("x", "subcall:1:sc0001").is_none());
        assert!(lineage.resolve_variable("x").is_none());
    }

    #[test]
    fn register_is_idempotent_per_pointer() {
        let mut lineage = Lineage::default();
        let first = lineage.register(record(1, "sc0001"));
        let again = lineage.register(record(1, "sc0001"));
        assert_eq!(first, again);
        assert_eq!(lineage.len(), 1);
        assert!(lineage.contains("subcall:1:sc0001"));
    }
}
