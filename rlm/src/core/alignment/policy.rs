//! Configurable alignment policy. Weights are tunable; the documented bands
//! are the contract.

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringWeights {
    pub contradiction_penalty: f64,
    /// Planner prompt tokens allowed before verbosity is penalized.
    pub verbosity_free_tokens: u64,
    /// Penalty per full ceiling of overflow tokens.
    pub verbosity_penalty_per_ceiling: f64,
    pub max_verbosity_penalty: f64,
    pub medium_risk_penalty: f64,
    pub high_risk_penalty: f64,
    pub evidence_bonus: f64,
    pub max_evidence_bonus: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            contradiction_penalty: 12.0,
            verbosity_free_tokens: 420,
            verbosity_penalty_per_ceiling: 10.0,
            max_verbosity_penalty: 20.0,
            medium_risk_penalty: 5.0,
            high_risk_penalty: 12.0,
            evidence_bonus: 2.0,
            max_evidence_bonus: 10.0,
        }
    }
}

/// Lower bounds (inclusive) for each action band; below `replan_min` blocks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Bands {
    pub pass_min: u32,
    pub nudge_min: u32,
    pub replan_min: u32,
}

impl Default for Bands {
    fn default() -> Self {
        Self {
            pass_min: 85,
            nudge_min: 65,
            replan_min: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeepAuditPolicy {
    pub min_contradictions: u32,
    pub override_streak_trigger: u32,
    /// Trigger on every high-risk turn, independent of consensus confidence.
    pub on_high_risk: bool,
}

impl Default for DeepAuditPolicy {
    fn default() -> Self {
        Self {
            min_contradictions: 2,
            override_streak_trigger: 2,
            on_high_risk: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusPolicy {
    pub top_score_min: f64,
    pub margin_min: f64,
    pub required_votes: usize,
    /// A consensus snapshot runs on every turn divisible by this.
    pub cadence_turns: u32,
}

impl Default for ConsensusPolicy {
    fn default() -> Self {
        Self {
            top_score_min: 0.7,
            margin_min: 0.15,
            required_votes: 2,
            cadence_turns: 20,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AntiOscillationPolicy {
    pub cooldown_turns: u32,
}

impl Default for AntiOscillationPolicy {
    fn default() -> Self {
        Self { cooldown_turns: 2 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfirmationPolicy {
    /// Elevated-risk turns up to this number always require confirmation.
    pub mandatory_turn_window: u32,
}

impl Default for ConfirmationPolicy {
    fn default() -> Self {
        Self {
            mandatory_turn_window: 20,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutePolicy {
    pub sentinel_model: String,
    pub high_reasoning_model: String,
    pub arbitration_model: String,
    pub high_reasoning_available: bool,
}

impl Default for RoutePolicy {
    fn default() -> Self {
        Self {
            sentinel_model: "sentinel".to_string(),
            high_reasoning_model: "high-reasoning".to_string(),
            arbitration_model: "arbiter".to_string(),
            high_reasoning_available: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RollbackPolicy {
    /// Rollback is recommended once block_escalate turns exceed this share.
    pub max_block_rate: f64,
    /// Rollback is recommended when snapshots ran and acceptance fell below this.
    pub min_consensus_acceptance: f64,
}

impl Default for RollbackPolicy {
    fn default() -> Self {
        Self {
            max_block_rate: 0.0,
            min_consensus_acceptance: 0.8,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlignmentPolicy {
    pub scoring: ScoringWeights,
    pub bands: Bands,
    pub deep_audit: DeepAuditPolicy,
    pub consensus: ConsensusPolicy,
    pub anti_oscillation: AntiOscillationPolicy,
    pub confirmation: ConfirmationPolicy,
    pub route: RoutePolicy,
    pub rollback: RollbackPolicy,
}

impl AlignmentPolicy {
    pub fn validate(&self) -> Result<()> {
        let bands = &self.bands;
        if bands.pass_min > 100 || bands.pass_min < bands.nudge_min || bands.nudge_min < bands.replan_min
        {
            bail!("alignment bands must satisfy 100 >= pass_min >= nudge_min >= replan_min");
        }
        if self.consensus.cadence_turns == 0 {
            bail!("alignment consensus.cadence_turns must be > 0");
        }
        if self.consensus.required_votes == 0 {
            bail!("alignment consensus.required_votes must be > 0");
        }
        if self.scoring.verbosity_free_tokens == 0 {
            bail!("alignment scoring.verbosity_free_tokens must be > 0");
        }
        Ok(())
    }
}
