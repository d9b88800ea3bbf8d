//! Semantic intent versioning and the intent snapshot recorded per turn.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::RiskLevel;
use crate::core::types::Intent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeLevel {
    Patch,
    Minor,
    Major,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntentVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    pub label: String,
}

impl IntentVersion {
    pub fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
            label: format!("{major}.{minor}.{patch}"),
        }
    }
}

impl Default for IntentVersion {
    fn default() -> Self {
        Self::new(1, 0, 0)
    }
}

impl fmt::Display for IntentVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label)
    }
}

pub fn increment_intent_version(version: &IntentVersion, level: ChangeLevel) -> IntentVersion {
    match level {
        ChangeLevel::Patch => IntentVersion::new(version.major, version.minor, version.patch + 1),
        ChangeLevel::Minor => IntentVersion::new(version.major, version.minor + 1, 0),
        ChangeLevel::Major => IntentVersion::new(version.major + 1, 0, 0),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntentChange {
    pub level: ChangeLevel,
    pub from: String,
    pub to: String,
}

pub fn change_level(intent: Intent, contradictions: u32, risk_level: RiskLevel) -> ChangeLevel {
    if intent == Intent::Fail || contradictions >= 3 {
        ChangeLevel::Major
    } else if matches!(intent, Intent::Final | Intent::Pause) || risk_level == RiskLevel::High {
        ChangeLevel::Minor
    } else {
        ChangeLevel::Patch
    }
}

const MAX_EVIDENCE_REFS: usize = 12;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentConfidence {
    pub overall: f64,
    pub rationale: String,
}

/// What the run is currently trying to do, as recorded in `intent_update` events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentSnapshot {
    pub goals: Vec<String>,
    pub constraints: Vec<String>,
    pub priorities: Vec<String>,
    pub style_preferences: Vec<String>,
    pub evidence_refs: Vec<String>,
    pub confidence: IntentConfidence,
}

pub fn build_intent_snapshot(
    goal: &str,
    intent: Intent,
    contradictions: u32,
    evidence_refs: &[String],
    confidence: f64,
) -> IntentSnapshot {
    let mut constraints = vec!["respect per-iteration budgets".to_string()];
    if contradictions > 0 {
        constraints.push(format!("resolve {contradictions} contradiction(s)"));
    }
    let priorities = match intent {
        Intent::Final => vec!["deliver final answer".to_string()],
        Intent::Fail | Intent::Pause => vec!["surface blocker".to_string()],
        Intent::Continue => vec!["gather evidence".to_string()],
    };
    IntentSnapshot {
        goals: vec![goal.trim().to_string()],
        constraints,
        priorities,
        style_preferences: vec!["concise".to_string()],
        evidence_refs: evidence_refs.iter().take(MAX_EVIDENCE_REFS).cloned().collect(),
        confidence: IntentConfidence {
            overall: confidence,
            rationale: format!("intent={}", intent.as_str()),
        },
    }
}
