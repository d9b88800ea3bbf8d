//! Run-scoped alignment checker.
//!
//! Wraps the pure scoring functions in [`crate::core::alignment`] with the
//! memory a run needs (override streak, cooldown, sticky consensus lock,
//! intent version) and mirrors every decision into the ledger.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, instrument};

use crate::core::alignment::consensus::{
    ConsensusSnapshot, build_consensus_votes, evaluate_consensus,
};
use crate::core::alignment::gate::{GateInput, evaluate_confirmation_gate, stabilize_action};
use crate::core::alignment::intent::{
    IntentChange, IntentVersion, build_intent_snapshot, change_level, increment_intent_version,
};
use crate::core::alignment::score::{
    DeepAuditParams, TurnSignals, score_alignment, score_confidence, should_run_deep_audit,
};
use crate::core::alignment::{AlignmentAction, AlignmentDecision, RiskLevel, RouteStrategy, round2};
use crate::core::types::Intent;
use crate::io::config::AlignmentConfig;
use crate::io::ledger::{
    EventDraft, EventType, IngestionSession, LedgerIdentity, LedgerSummary, LedgerWriter,
    complete_session, load_or_start_session,
};

/// Signals the loop collects for one turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnInput {
    pub turn: u32,
    pub intent: Intent,
    pub contradictions: u32,
    pub evidence_count: u32,
    pub verbosity_tokens: u64,
    pub risk_level: RiskLevel,
    pub evidence_refs: Vec<String>,
}

/// End-of-run aggregate, attached to the run's final block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlignmentSummary {
    pub enabled: bool,
    pub enforce: bool,
    pub turns_evaluated: u32,
    pub deep_audit_count: u32,
    pub requires_confirmation_count: u32,
    pub override_rate: f64,
    pub consensus_snapshots: u32,
    pub consensus_acceptance_rate: f64,
    pub action_counts: BTreeMap<String, u64>,
    pub route_counts: BTreeMap<String, u64>,
    pub intent_version: String,
    pub rollback_recommended: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ledger: Option<LedgerSummary>,
}

#[derive(Debug)]
struct LedgerBinding {
    writer: LedgerWriter,
    session: IngestionSession,
}

#[derive(Debug)]
pub struct AlignmentChecker {
    config: AlignmentConfig,
    goal: String,
    run_dir: PathBuf,
    ledger: Option<LedgerBinding>,
    intent_version: IntentVersion,
    override_streak: u32,
    previous_action: Option<AlignmentAction>,
    cooldown_remaining: u32,
    /// Set by a rejected consensus snapshot, cleared only by an accepted one.
    consensus_lock: bool,
    last_consensus_low_confidence: bool,
    turns_evaluated: u32,
    deep_audit_count: u32,
    requires_confirmation_count: u32,
    snapshots_taken: u32,
    snapshots_accepted: u32,
    action_counts: BTreeMap<String, u64>,
    route_counts: BTreeMap<String, u64>,
}

impl AlignmentChecker {
    /// Create a checker. When alignment is enabled this validates the policy,
    /// opens the ledger, and resumes (or starts) the ingestion session for `run_id`.
    pub fn new(run_dir: &Path, goal: &str, run_id: &str, config: &AlignmentConfig) -> Result<Self> {
        let ledger = if config.enabled {
            config.policy.validate()?;
            let session = load_or_start_session(run_dir, run_id)?;
            let writer = LedgerWriter::open(
                run_dir,
                LedgerIdentity {
                    thread_id: config.thread_id.clone(),
                    task_id: config.task_id.clone(),
                    run_id: run_id.to_string(),
                    agent_id: config.agent_id.clone(),
                },
            )?;
            Some(LedgerBinding { writer, session })
        } else {
            None
        };
        Ok(Self {
            config: config.clone(),
            goal: goal.to_string(),
            run_dir: run_dir.to_path_buf(),
            ledger,
            intent_version: IntentVersion::default(),
            override_streak: 0,
            previous_action: None,
            cooldown_remaining: 0,
            consensus_lock: false,
            last_consensus_low_confidence: false,
            turns_evaluated: 0,
            deep_audit_count: 0,
            requires_confirmation_count: 0,
            snapshots_taken: 0,
            snapshots_accepted: 0,
            action_counts: BTreeMap::new(),
            route_counts: BTreeMap::new(),
        })
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn consensus_lock_active(&self) -> bool {
        self.consensus_lock
    }

    pub fn ledger(&self) -> Option<&LedgerWriter> {
        self.ledger.as_ref().map(|binding| &binding.writer)
    }

    /// Score one turn. Returns `None` when alignment is disabled.
    #[instrument(skip_all, fields(turn = input.turn))]
    pub fn evaluate_turn(&mut self, input: &TurnInput) -> Result<Option<AlignmentDecision>> {
        if !self.config.enabled {
            return Ok(None);
        }
        let policy = &self.config.policy;
        let scored = score_alignment(
            &TurnSignals {
                contradictions: input.contradictions,
                evidence_count: input.evidence_count,
                verbosity_tokens: input.verbosity_tokens,
                risk_level: input.risk_level,
                intent: input.intent,
            },
            policy,
        );

        let override_streak = if scored.action == AlignmentAction::Pass {
            0
        } else if input.intent == Intent::Continue {
            self.override_streak + 1
        } else {
            self.override_streak
        };
        let deep_audit = should_run_deep_audit(
            &DeepAuditParams {
                contradictions: input.contradictions,
                override_streak,
                risk_level: input.risk_level,
                low_consensus_confidence: self.last_consensus_low_confidence,
            },
            policy,
        );
        let confidence = score_confidence(scored.score, input.contradictions, deep_audit.triggered);

        let stabilized = stabilize_action(
            scored.action,
            self.previous_action,
            self.cooldown_remaining,
            policy.anti_oscillation.cooldown_turns,
        );
        let action = stabilized.action;

        let consensus_snapshot = if input.turn % policy.consensus.cadence_turns == 0 {
            let votes = build_consensus_votes(action, confidence, input.risk_level);
            let result = evaluate_consensus(&votes, &policy.consensus);
            self.snapshots_taken += 1;
            if result.accepted {
                self.snapshots_accepted += 1;
                self.consensus_lock = false;
            } else {
                self.consensus_lock = true;
            }
            self.last_consensus_low_confidence =
                result.reasons.iter().any(|reason| reason == "low_confidence");
            debug!(accepted = result.accepted, reasons = ?result.reasons, "consensus snapshot");
            Some(ConsensusSnapshot {
                turn: input.turn,
                votes,
                result,
            })
        } else {
            None
        };

        let route_strategy = if consensus_snapshot.is_some() {
            RouteStrategy::Arbitration
        } else if deep_audit.triggered {
            RouteStrategy::DeepAudit
        } else {
            RouteStrategy::Sentinel
        };
        let route = &policy.route;
        let route_model = match route_strategy {
            RouteStrategy::Arbitration => route.arbitration_model.clone(),
            RouteStrategy::DeepAudit if route.high_reasoning_available => {
                route.high_reasoning_model.clone()
            }
            _ => route.sentinel_model.clone(),
        };

        let mut gate = evaluate_confirmation_gate(
            &GateInput {
                turn: input.turn,
                action,
                risk_level: input.risk_level,
                confidence,
                consensus_accepted: consensus_snapshot.as_ref().map(|s| s.result.accepted),
                consensus_lock_active: self.consensus_lock,
            },
            policy,
        );

        let enforcement_reason = if !self.config.enforce {
            None
        } else if action == AlignmentAction::BlockEscalate {
            Some("block_escalate".to_string())
        } else if !route.high_reasoning_available && input.risk_level == RiskLevel::High {
            Some("high_reasoning_unavailable".to_string())
        } else {
            None
        };
        if enforcement_reason.is_some() {
            gate.requires_confirmation = true;
            gate.reasons.push("enforce_block".to_string());
        }

        let level = change_level(input.intent, input.contradictions, input.risk_level);
        let next_version = increment_intent_version(&self.intent_version, level);
        let intent_change = IntentChange {
            level,
            from: self.intent_version.label.clone(),
            to: next_version.label.clone(),
        };

        let decision = AlignmentDecision {
            turn: input.turn,
            action,
            score: scored.score,
            confidence,
            risk_level: input.risk_level,
            policy_band: scored.policy_band,
            route_model,
            route_strategy,
            deep_audit: deep_audit.triggered,
            deep_audit_reasons: deep_audit.reasons,
            requires_confirmation: gate.requires_confirmation,
            confidence_gate_passed: gate.confidence_gate_passed,
            gate_reasons: gate.reasons,
            intent_version: next_version.clone(),
            intent_change,
            consensus_snapshot,
            enforcement_blocked: enforcement_reason.is_some(),
            enforcement_reason,
        };

        self.intent_version = next_version;
        self.override_streak = override_streak;
        self.previous_action = Some(action);
        self.cooldown_remaining = stabilized.cooldown_remaining;
        self.turns_evaluated += 1;
        if decision.deep_audit {
            self.deep_audit_count += 1;
        }
        if decision.requires_confirmation {
            self.requires_confirmation_count += 1;
        }
        *self.action_counts.entry(action.as_str().to_string()).or_default() += 1;
        *self
            .route_counts
            .entry(route_strategy.as_str().to_string())
            .or_default() += 1;

        self.record_turn(input, &decision)?;
        debug!(
            action = action.as_str(),
            score = decision.score,
            confidence = decision.confidence,
            requires_confirmation = decision.requires_confirmation,
            "alignment decision"
        );
        Ok(Some(decision))
    }

    fn record_turn(&mut self, input: &TurnInput, decision: &AlignmentDecision) -> Result<()> {
        let Some(binding) = self.ledger.as_mut() else {
            return Ok(());
        };
        let version = decision.intent_version.label.clone();
        let provenance = json!({
            "source": "rlm",
            "turn": decision.turn,
            "route_model": decision.route_model,
            "route_strategy": decision.route_strategy,
        });

        let snapshot = build_intent_snapshot(
            &self.goal,
            input.intent,
            input.contradictions,
            &input.evidence_refs,
            decision.confidence,
        );
        binding.writer.append(EventDraft {
            event_type: EventType::IntentUpdate,
            intent_version: version.clone(),
            payload: json!({
                "turn": decision.turn,
                "intent": input.intent,
                "snapshot": snapshot,
                "change": decision.intent_change,
            }),
            score_metadata: json!({}),
            provenance: provenance.clone(),
            idempotency_key: binding.session.turn_key(decision.turn, "intent"),
        })?;

        binding.writer.append(EventDraft {
            event_type: if decision.deep_audit {
                EventType::DeepAudit
            } else {
                EventType::Sentinel
            },
            intent_version: version.clone(),
            payload: serde_json::to_value(decision)?,
            score_metadata: json!({
                "action": decision.action,
                "score": decision.score,
                "confidence": decision.confidence,
                "risk_level": decision.risk_level,
                "policy_band": decision.policy_band,
                "requires_confirmation": decision.requires_confirmation,
                "confidence_gate_passed": decision.confidence_gate_passed,
                "deep_audit": decision.deep_audit,
            }),
            provenance: provenance.clone(),
            idempotency_key: binding.session.turn_key(decision.turn, "check"),
        })?;

        if let Some(snapshot) = &decision.consensus_snapshot {
            binding.writer.append(EventDraft {
                event_type: EventType::ConsensusSnapshot,
                intent_version: version,
                payload: serde_json::to_value(snapshot)?,
                score_metadata: json!({
                    "accepted": snapshot.result.accepted,
                    "top_action": snapshot.result.top_action,
                    "confidence": snapshot.result.top_confidence,
                    "margin": snapshot.result.margin,
                }),
                provenance,
                idempotency_key: binding.session.turn_key(decision.turn, "consensus"),
            })?;
        }
        Ok(())
    }

    fn summary(&self) -> AlignmentSummary {
        let turns = f64::from(self.turns_evaluated.max(1));
        let count = |action: AlignmentAction| {
            self.action_counts
                .get(action.as_str())
                .copied()
                .unwrap_or(0) as f64
        };
        let overrides = count(AlignmentAction::Nudge)
            + count(AlignmentAction::Replan)
            + count(AlignmentAction::BlockEscalate);
        let block_rate = count(AlignmentAction::BlockEscalate) / turns;
        let consensus_acceptance_rate = if self.snapshots_taken == 0 {
            0.0
        } else {
            round2(f64::from(self.snapshots_accepted) / f64::from(self.snapshots_taken))
        };
        let rollback = &self.config.policy.rollback;
        let rollback_recommended = self.config.enabled
            && (block_rate > rollback.max_block_rate
                || (self.snapshots_taken > 0
                    && consensus_acceptance_rate < rollback.min_consensus_acceptance));
        AlignmentSummary {
            enabled: self.config.enabled,
            enforce: self.config.enforce,
            turns_evaluated: self.turns_evaluated,
            deep_audit_count: self.deep_audit_count,
            requires_confirmation_count: self.requires_confirmation_count,
            override_rate: round2(overrides / turns),
            consensus_snapshots: self.snapshots_taken,
            consensus_acceptance_rate,
            action_counts: self.action_counts.clone(),
            route_counts: self.route_counts.clone(),
            intent_version: self.intent_version.label.clone(),
            rollback_recommended,
            ledger: self.ledger.as_ref().map(|binding| binding.writer.summary()),
        }
    }

    /// Close the run: append the final summary event and mark the session done.
    pub fn finalize(&mut self) -> Result<AlignmentSummary> {
        let mut summary = self.summary();
        if let Some(binding) = self.ledger.as_mut() {
            binding.writer.append(EventDraft {
                event_type: EventType::FinalSummary,
                intent_version: self.intent_version.label.clone(),
                payload: serde_json::to_value(&summary)?,
                score_metadata: json!({
                    "override_rate": summary.override_rate,
                    "consensus_acceptance_rate": summary.consensus_acceptance_rate,
                    "rollback_recommended": summary.rollback_recommended,
                }),
                provenance: json!({ "source": "rlm", "turns": summary.turns_evaluated }),
                idempotency_key: binding.session.final_key(),
            })?;
            complete_session(&self.run_dir, &mut binding.session)?;
            summary.ledger = Some(binding.writer.summary());
            info!(
                turns = summary.turns_evaluated,
                events = binding.writer.records().len(),
                rollback = summary.rollback_recommended,
                "alignment finalized"
            );
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> AlignmentConfig {
        AlignmentConfig {
            enabled: true,
            ..AlignmentConfig::default()
        }
    }

    fn clean(turn: u32) -> TurnInput {
        TurnInput {
            turn,
            intent: Intent::Continue,
            contradictions: 0,
            evidence_count: 5,
            verbosity_tokens: 100,
            risk_level: RiskLevel::Low,
            evidence_refs: vec!["ctx:sha256:abc#chunk:c000001".to_string()],
        }
    }

    #[test]
    fn disabled_checker_writes_nothing() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut checker =
            AlignmentChecker::new(temp.path(), "goal", "run-1", &AlignmentConfig::default())
                .expect("checker");
        assert!(checker.evaluate_turn(&clean(1)).expect("evaluate").is_none());
        let summary = checker.finalize().expect("finalize");
        assert!(!summary.enabled);
        assert!(!summary.rollback_recommended);
        assert!(!temp.path().join("alignment").exists());
    }

    #[test]
    fn zero_consensus_cadence_is_rejected_before_any_turn() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut cfg = config();
        cfg.policy.consensus.cadence_turns = 0;
        let err = AlignmentChecker::new(temp.path(), "goal", "run-1", &cfg).expect_err("invalid");
        assert!(err.to_string().contains("cadence_turns"), "{err}");
        assert!(!temp.path().join("alignment").exists());
    }

    #[test]
    fn clean_turn_passes_and_bumps_patch_version() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut checker =
            AlignmentChecker::new(temp.path(), "goal", "run-1", &config()).expect("checker");
        let decision = checker.evaluate_turn(&clean(1)).expect("evaluate").expect("enabled");
        assert_eq!(decision.action, AlignmentAction::Pass);
        assert_eq!(decision.route_strategy, RouteStrategy::Sentinel);
        assert!(!decision.requires_confirmation);
        assert_eq!(decision.intent_version.label, "1.0.1");
        let ledger = checker.ledger().expect("ledger");
        assert_eq!(ledger.records().len(), 2);
    }

    #[test]
    fn override_streak_triggers_deep_audit_when_it_reaches_threshold() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut checker =
            AlignmentChecker::new(temp.path(), "goal", "run-1", &config()).expect("checker");
        let nudge = |turn| TurnInput {
            contradictions: 1,
            evidence_count: 0,
            verbosity_tokens: 100_000,
            ..clean(turn)
        };
        let first = checker.evaluate_turn(&nudge(21)).expect("evaluate").expect("enabled");
        assert_eq!(first.action, AlignmentAction::Nudge);
        assert!(!first.deep_audit);
        let second = checker.evaluate_turn(&nudge(22)).expect("evaluate").expect("enabled");
        assert!(second.deep_audit);
        assert_eq!(second.deep_audit_reasons, vec!["override_streak"]);
        assert_eq!(second.route_strategy, RouteStrategy::DeepAudit);
    }

    #[test]
    fn enforce_blocks_high_risk_without_high_reasoning_route() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut cfg = config();
        cfg.enforce = true;
        cfg.policy.route.high_reasoning_available = false;
        let mut checker = AlignmentChecker::new(temp.path(), "goal", "run-1", &cfg).expect("checker");
        let decision = checker
            .evaluate_turn(&TurnInput {
                risk_level: RiskLevel::High,
                ..clean(1)
            })
            .expect("evaluate")
            .expect("enabled");
        assert!(decision.enforcement_blocked);
        assert!(decision.requires_confirmation);
        assert_eq!(
            decision.enforcement_reason.as_deref(),
            Some("high_reasoning_unavailable")
        );
    }

    #[test]
    fn summary_tallies_match_ledger_projection() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut cfg = config();
        cfg.policy.consensus.cadence_turns = 2;
        let mut checker = AlignmentChecker::new(temp.path(), "goal", "run-1", &cfg).expect("checker");
        for turn in 1..=4 {
            checker.evaluate_turn(&clean(turn)).expect("evaluate");
        }
        let summary = checker.finalize().expect("finalize");
        assert_eq!(summary.turns_evaluated, 4);
        assert_eq!(summary.consensus_snapshots, 2);
        assert_eq!(summary.consensus_acceptance_rate, 1.0);
        assert!(!summary.rollback_recommended);

        let projection = checker.ledger().expect("ledger").projection();
        let tallied: u64 = projection.totals.actions.values().sum();
        assert_eq!(tallied, u64::from(summary.turns_evaluated));
        assert_eq!(projection.totals.actions, summary.action_counts);
        assert_eq!(
            projection.totals.confirmations,
            u64::from(summary.requires_confirmation_count)
        );
        // 4 intent + 4 check + 2 consensus + 1 final
        assert_eq!(projection.totals.events, 11);
    }
}
