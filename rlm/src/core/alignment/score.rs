use serde::{Deserialize, Serialize};

use super::policy::{AlignmentPolicy, Bands, ScoringWeights};
use super::{AlignmentAction, RiskLevel, clamp_f64, round2};
use crate::core::types::Intent;

/// Observable signals for one turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TurnSignals {
    pub contradictions: u32,
    pub evidence_count: u32,
    pub verbosity_tokens: u64,
    pub risk_level: RiskLevel,
    pub intent: Intent,
}

impl TurnSignals {
    pub fn new(risk_level: RiskLevel, intent: Intent) -> Self {
        Self {
            contradictions: 0,
            evidence_count: 0,
            verbosity_tokens: 0,
            risk_level,
            intent,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AlignmentScore {
    pub score: u32,
    pub action: AlignmentAction,
    /// Band from the score alone; differs from `action` when intent forces a block.
    pub policy_band: AlignmentAction,
}

pub fn action_from_score(score: u32, bands: &Bands) -> AlignmentAction {
    if score >= bands.pass_min {
        AlignmentAction::Pass
    } else if score >= bands.nudge_min {
        AlignmentAction::Nudge
    } else if score >= bands.replan_min {
        AlignmentAction::Replan
    } else {
        AlignmentAction::BlockEscalate
    }
}

fn verbosity_penalty(tokens: u64, weights: &ScoringWeights) -> f64 {
    let ceiling = weights.verbosity_free_tokens.max(1);
    if tokens <= ceiling {
        return 0.0;
    }
    let overflow = (tokens - ceiling) as f64 / ceiling as f64;
    (overflow * weights.verbosity_penalty_per_ceiling).min(weights.max_verbosity_penalty)
}

fn risk_penalty(risk: RiskLevel, weights: &ScoringWeights) -> f64 {
    match risk {
        RiskLevel::Low => 0.0,
        RiskLevel::Medium => weights.medium_risk_penalty,
        RiskLevel::High => weights.high_risk_penalty,
    }
}

pub fn score_alignment(signals: &TurnSignals, policy: &AlignmentPolicy) -> AlignmentScore {
    let weights = &policy.scoring;
    let evidence_bonus =
        (f64::from(signals.evidence_count) * weights.evidence_bonus).min(weights.max_evidence_bonus);
    let raw = 100.0
        - f64::from(signals.contradictions) * weights.contradiction_penalty
        - verbosity_penalty(signals.verbosity_tokens, weights)
        - risk_penalty(signals.risk_level, weights)
        + evidence_bonus;
    let score = clamp_f64(raw.round(), 0.0, 100.0) as u32;
    let policy_band = action_from_score(score, &policy.bands);
    let action = if signals.intent == Intent::Fail {
        AlignmentAction::BlockEscalate
    } else {
        policy_band
    };
    AlignmentScore {
        score,
        action,
        policy_band,
    }
}

/// Evaluator confidence derived from the score, discounted per contradiction.
pub fn score_confidence(score: u32, contradictions: u32, deep_audit: bool) -> f64 {
    let mut confidence = f64::from(score) / 100.0;
    confidence -= (0.05 * f64::from(contradictions)).min(0.25);
    if deep_audit {
        confidence += 0.04;
    }
    round2(clamp_f64(confidence, 0.05, 0.99))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeepAuditParams {
    pub contradictions: u32,
    pub override_streak: u32,
    pub risk_level: RiskLevel,
    pub low_consensus_confidence: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeepAuditTrigger {
    pub triggered: bool,
    pub reasons: Vec<String>,
}

pub fn should_run_deep_audit(params: &DeepAuditParams, policy: &AlignmentPolicy) -> DeepAuditTrigger {
    let rules = &policy.deep_audit;
    let mut reasons = Vec::new();
    if params.contradictions >= rules.min_contradictions {
        reasons.push("contradictions".to_string());
    }
    if params.override_streak >= rules.override_streak_trigger {
        reasons.push("override_streak".to_string());
    }
    if params.risk_level == RiskLevel::High && params.low_consensus_confidence {
        reasons.push("low_consensus_confidence".to_string());
    }
    if rules.on_high_risk && params.risk_level == RiskLevel::High {
        reasons.push("high_risk".to_string());
    }
    DeepAuditTrigger {
        triggered: !reasons.is_empty(),
        reasons,
    }
}
