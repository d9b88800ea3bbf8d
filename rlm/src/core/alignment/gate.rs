//! Confirmation gating and action stabilization.

use serde::{Deserialize, Serialize};

use super::policy::AlignmentPolicy;
use super::{AlignmentAction, RiskLevel};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GateInput {
    pub turn: u32,
    pub action: AlignmentAction,
    pub risk_level: RiskLevel,
    pub confidence: f64,
    /// `None` when no snapshot ran this turn.
    pub consensus_accepted: Option<bool>,
    pub consensus_lock_active: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateOutcome {
    pub requires_confirmation: bool,
    pub confidence_gate_passed: bool,
    pub reasons: Vec<String>,
}

pub fn evaluate_confirmation_gate(input: &GateInput, policy: &AlignmentPolicy) -> GateOutcome {
    let mut reasons = Vec::new();
    let elevated = input.risk_level.is_elevated();
    let severe = matches!(
        input.action,
        AlignmentAction::Replan | AlignmentAction::BlockEscalate
    );

    if input.turn <= policy.confirmation.mandatory_turn_window && elevated {
        reasons.push("turn_window_requires_confirmation");
    }
    if input.action == AlignmentAction::BlockEscalate {
        reasons.push("block_requires_confirmation");
    }
    if !policy.route.high_reasoning_available && (elevated || severe) {
        reasons.push("high_reasoning_unavailable");
    }
    if input.consensus_lock_active {
        reasons.push("consensus_lock_active");
    }

    let consensus_ok = input
        .consensus_accepted
        .unwrap_or(!input.consensus_lock_active);
    let confidence_gate_passed =
        input.confidence >= policy.consensus.top_score_min && consensus_ok;
    if !confidence_gate_passed {
        reasons.push("confidence_gate_failed");
    }

    GateOutcome {
        requires_confirmation: !reasons.is_empty(),
        confidence_gate_passed,
        reasons: reasons.into_iter().map(str::to_string).collect(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stabilized {
    pub action: AlignmentAction,
    pub cooldown_remaining: u32,
    pub held: bool,
}

/// Holds the previous action while a cooldown is running if the candidate
/// would relax it; otherwise restarts the cooldown on every change.
pub fn stabilize_action(
    candidate: AlignmentAction,
    previous: Option<AlignmentAction>,
    cooldown_remaining: u32,
    cooldown_turns: u32,
) -> Stabilized {
    if let Some(previous) = previous {
        if cooldown_remaining > 0 && candidate.severity() < previous.severity() {
            return Stabilized {
                action: previous,
                cooldown_remaining: cooldown_remaining - 1,
                held: true,
            };
        }
        if candidate != previous {
            return Stabilized {
                action: candidate,
                cooldown_remaining: cooldown_turns,
                held: false,
            };
        }
    }
    Stabilized {
        action: candidate,
        cooldown_remaining: cooldown_remaining.saturating_sub(1),
        held: false,
    }
}
