//! Pure alignment scoring: score bands, deep-audit triggers, consensus,
//! confirmation gating, anti-oscillation, and intent versioning.
//!
//! The stateful per-run wrapper lives in [`crate::alignment`].

pub mod consensus;
pub mod gate;
pub mod intent;
pub mod policy;
pub mod score;

use serde::{Deserialize, Serialize};

use self::consensus::ConsensusSnapshot;
use self::intent::{IntentChange, IntentVersion};

/// Per-turn governance action, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlignmentAction {
    Pass,
    Nudge,
    Replan,
    BlockEscalate,
}

impl AlignmentAction {
    pub const ALL: [AlignmentAction; 4] = [
        AlignmentAction::Pass,
        AlignmentAction::Nudge,
        AlignmentAction::Replan,
        AlignmentAction::BlockEscalate,
    ];

    pub fn severity(self) -> usize {
        self as usize
    }

    /// The next action up the severity ladder; saturates at `block_escalate`.
    pub fn more_severe(self) -> Self {
        Self::ALL[(self.severity() + 1).min(Self::ALL.len() - 1)]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AlignmentAction::Pass => "pass",
            AlignmentAction::Nudge => "nudge",
            AlignmentAction::Replan => "replan",
            AlignmentAction::BlockEscalate => "block_escalate",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|action| action.as_str() == raw)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn is_elevated(self) -> bool {
        matches!(self, RiskLevel::Medium | RiskLevel::High)
    }
}

/// Which evaluator route handled a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteStrategy {
    Sentinel,
    DeepAudit,
    Arbitration,
}

impl RouteStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            RouteStrategy::Sentinel => "sentinel",
            RouteStrategy::DeepAudit => "deep_audit",
            RouteStrategy::Arbitration => "arbitration",
        }
    }
}

/// One ledger-ready governance decision per loop turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlignmentDecision {
    pub turn: u32,
    pub action: AlignmentAction,
    pub score: u32,
    pub confidence: f64,
    pub risk_level: RiskLevel,
    /// Band implied by the score alone, before intent forcing and stabilization.
    pub policy_band: AlignmentAction,
    pub route_model: String,
    pub route_strategy: RouteStrategy,
    pub deep_audit: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deep_audit_reasons: Vec<String>,
    pub requires_confirmation: bool,
    pub confidence_gate_passed: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gate_reasons: Vec<String>,
    pub intent_version: IntentVersion,
    pub intent_change: IntentChange,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consensus_snapshot: Option<ConsensusSnapshot>,
    pub enforcement_blocked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enforcement_reason: Option<String>,
}

pub(crate) fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

pub(crate) fn clamp_f64(value: f64, min: f64, max: f64) -> f64 {
    if !value.is_finite() {
        return min;
    }
    value.clamp(min, max)
}
