//! Multi-evaluator consensus snapshots.

use serde::{Deserialize, Serialize};

use super::policy::ConsensusPolicy;
use super::{AlignmentAction, RiskLevel, clamp_f64, round2};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusVote {
    pub evaluator_id: String,
    pub action: AlignmentAction,
    pub confidence: f64,
    #[serde(default)]
    pub veto: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusResult {
    pub accepted: bool,
    pub top_action: AlignmentAction,
    pub top_votes: usize,
    pub top_confidence: f64,
    pub margin: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reasons: Vec<String>,
}

/// A consensus result plus the votes it was computed from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusSnapshot {
    pub turn: u32,
    pub votes: Vec<ConsensusVote>,
    #[serde(flatten)]
    pub result: ConsensusResult,
}

/// Three evaluators of decreasing leniency: each escalates one level unless
/// the primary confidence clears its bar.
pub fn build_consensus_votes(
    action: AlignmentAction,
    confidence: f64,
    risk_level: RiskLevel,
) -> Vec<ConsensusVote> {
    let spread = if risk_level == RiskLevel::High { 0.12 } else { 0.07 };
    let second = if confidence >= 0.74 {
        action
    } else {
        action.more_severe()
    };
    let third = if confidence >= 0.82 {
        action
    } else {
        second.more_severe()
    };
    let vote = |id: &str, action: AlignmentAction, confidence: f64| ConsensusVote {
        evaluator_id: id.to_string(),
        action,
        confidence: round2(clamp_f64(confidence, 0.05, 0.99)),
        veto: false,
    };
    let mut votes = vec![
        vote("e1", action, confidence),
        vote("e2", second, confidence - spread),
        vote("e3", third, confidence - spread * 1.4),
    ];
    votes[2].veto = third == AlignmentAction::BlockEscalate;
    votes
}

struct Group {
    action: AlignmentAction,
    count: usize,
    mean: f64,
}

pub fn evaluate_consensus(votes: &[ConsensusVote], policy: &ConsensusPolicy) -> ConsensusResult {
    let mut groups: Vec<Group> = AlignmentAction::ALL
        .into_iter()
        .map(|action| {
            let matching: Vec<f64> = votes
                .iter()
                .filter(|vote| vote.action == action)
                .map(|vote| vote.confidence)
                .collect();
            let mean = if matching.is_empty() {
                0.0
            } else {
                matching.iter().sum::<f64>() / matching.len() as f64
            };
            Group {
                action,
                count: matching.len(),
                mean,
            }
        })
        .collect();
    groups.sort_by(|a, b| {
        b.count
            .cmp(&a.count)
            .then_with(|| b.mean.total_cmp(&a.mean))
    });

    let top = &groups[0];
    let runner_up = groups.get(1).map_or(0.0, |group| group.mean);
    let margin = round2(top.mean - runner_up);

    let mut reasons = Vec::new();
    if top.count < policy.required_votes {
        reasons.push("insufficient_votes".to_string());
    }
    if top.mean < policy.top_score_min {
        reasons.push("low_confidence".to_string());
    }
    if margin < policy.margin_min {
        reasons.push("low_margin".to_string());
    }
    if votes.iter().any(|vote| vote.veto) {
        reasons.push("veto".to_string());
    }

    ConsensusResult {
        accepted: reasons.is_empty(),
        top_action: top.action,
        top_votes: top.count,
        top_confidence: round2(top.mean),
        margin,
        reasons,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vote(id: &str, action: AlignmentAction, confidence: f64) -> ConsensusVote {
        ConsensusVote {
            evaluator_id: id.to_string(),
            action,
            confidence,
            veto: false,
        }
    }

    #[test]
    fn two_confident_agreeing_votes_are_accepted() {
        let votes = vec![
            vote("e1", AlignmentAction::Pass, 0.86),
            vote("e2", AlignmentAction::Pass, 0.82),
            vote("e3", AlignmentAction::Nudge, 0.61),
        ];
        let result = evaluate_consensus(&votes, &ConsensusPolicy::default());
        assert!(result.accepted, "{:?}", result.reasons);
        assert_eq!(result.top_action, AlignmentAction::Pass);
        assert_eq!(result.top_votes, 2);
    }

    #[test]
    fn split_votes_with_close_confidence_are_rejected() {
        let votes = vec![
            vote("e1", AlignmentAction::Pass, 0.80),
            vote("e2", AlignmentAction::Nudge, 0.79),
            vote("e3", AlignmentAction::Replan, 0.78),
        ];
        let result = evaluate_consensus(&votes, &ConsensusPolicy::default());
        assert!(!result.accepted);
        assert!(result.reasons.iter().any(|reason| reason == "low_margin"));
    }

    #[test]
    fn low_average_confidence_is_rejected() {
        let votes = vec![
            vote("e1", AlignmentAction::Replan, 0.6),
            vote("e2", AlignmentAction::Replan, 0.55),
            vote("e3", AlignmentAction::Replan, 0.5),
        ];
        let result = evaluate_consensus(&votes, &ConsensusPolicy::default());
        assert!(!result.accepted);
        assert_eq!(result.reasons, vec!["low_confidence"]);
    }

    #[test]
    fn confident_votes_agree_with_the_primary() {
        let votes = build_consensus_votes(AlignmentAction::Pass, 0.95, RiskLevel::Low);
        assert!(votes.iter().all(|vote| vote.action == AlignmentAction::Pass));
        assert_eq!(votes[1].confidence, 0.88);
        let result = evaluate_consensus(&votes, &ConsensusPolicy::default());
        assert!(result.accepted);
    }

    #[test]
    fn weak_confidence_escalates_and_vetoes() {
        let votes = build_consensus_votes(AlignmentAction::Nudge, 0.6, RiskLevel::Medium);
        assert_eq!(votes[1].action, AlignmentAction::Replan);
        assert_eq!(votes[2].action, AlignmentAction::BlockEscalate);
        assert!(votes[2].veto);
        let result = evaluate_consensus(&votes, &ConsensusPolicy::default());
        assert!(!result.accepted);
        assert!(result.reasons.iter().any(|reason| reason == "veto"));
    }
}
