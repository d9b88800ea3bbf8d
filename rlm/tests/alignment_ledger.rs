//! Alignment checker and ledger behavior across turns and writer restarts.

use std::fs;

use rlm::alignment::{AlignmentChecker, TurnInput};
use rlm::core::alignment::RiskLevel;
use rlm::core::types::Intent;
use rlm::io::config::AlignmentConfig;
use rlm::io::ledger::{
    EventDraft, EventType, LEDGER_FILE, LedgerIdentity, LedgerWriter, alignment_dir,
    complete_session, load_or_start_session, verify_chain,
};
use serde_json::{Value, json};

fn enabled(cadence_turns: u32) -> AlignmentConfig {
    let mut cfg = AlignmentConfig {
        enabled: true,
        ..AlignmentConfig::default()
    };
    cfg.policy.consensus.cadence_turns = cadence_turns;
    cfg
}

fn clean(turn: u32) -> TurnInput {
    TurnInput {
        turn,
        intent: Intent::Continue,
        contradictions: 0,
        evidence_count: 5,
        verbosity_tokens: 100,
        risk_level: RiskLevel::Low,
        evidence_refs: Vec::new(),
    }
}

fn contested(turn: u32) -> TurnInput {
    TurnInput {
        contradictions: 3,
        risk_level: RiskLevel::Medium,
        ..clean(turn)
    }
}

fn identity(run_id: &str) -> LedgerIdentity {
    LedgerIdentity {
        thread_id: "main".to_string(),
        task_id: "task".to_string(),
        run_id: run_id.to_string(),
        agent_id: "rlm".to_string(),
    }
}

fn draft(key: &str) -> EventDraft {
    EventDraft {
        event_type: EventType::IntentUpdate,
        intent_version: "1.0.1".to_string(),
        payload: json!({ "turn": 1 }),
        score_metadata: json!({}),
        provenance: json!({ "source": "test" }),
        idempotency_key: key.to_string(),
    }
}

fn ledger_lines(run_dir: &std::path::Path) -> Vec<String> {
    fs::read_to_string(alignment_dir(run_dir).join(LEDGER_FILE))
        .expect("read ledger")
        .lines()
        .map(str::to_string)
        .collect()
}

/// A rejected snapshot locks confirmation on until an accepted snapshot
/// clears it; the accepting turn and the one after report no confirmation.
#[test]
fn confirmation_stays_required_until_consensus_accepts() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut checker =
        AlignmentChecker::new(temp.path(), "goal", "run-1", &enabled(2)).expect("checker");

    let turns = [clean(1), contested(2), clean(3), clean(4), clean(5)];
    let mut required = Vec::new();
    for input in &turns {
        let decision = checker
            .evaluate_turn(input)
            .expect("evaluate")
            .expect("enabled checker decides");
        if input.turn == 2 {
            let snapshot = decision.consensus_snapshot.as_ref().expect("snapshot on turn 2");
            assert!(!snapshot.result.accepted);
        }
        if input.turn == 4 {
            let snapshot = decision.consensus_snapshot.as_ref().expect("snapshot on turn 4");
            assert!(snapshot.result.accepted, "{:?}", snapshot.result.reasons);
        }
        required.push(decision.requires_confirmation);
    }
    assert_eq!(required, vec![false, true, true, false, false]);
    assert!(!checker.consensus_lock_active());
}

#[test]
fn duplicate_idempotency_keys_store_one_record() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut writer = LedgerWriter::open(temp.path(), identity("run-1")).expect("open");
    assert!(writer.append(draft("k1")).expect("append").is_some());
    assert!(writer.append(draft("k1")).expect("append").is_none());
    assert!(writer.append(draft("k2")).expect("append").is_some());

    assert_eq!(writer.records().len(), 2);
    assert_eq!(writer.projection().totals.events, 2);
    assert_eq!(ledger_lines(temp.path()).len(), 2);

    let mut reopened = LedgerWriter::open(temp.path(), identity("run-1")).expect("reopen");
    assert_eq!(reopened.tail_hash(), writer.tail_hash());
    assert!(reopened.append(draft("k2")).expect("append").is_none());
    assert_eq!(reopened.records().len(), 2);
}

/// Re-instantiating the checker for the same unfinished run reuses the
/// session key, so replayed turns add nothing.
#[test]
fn replayed_turns_for_the_same_run_are_deduplicated() {
    let temp = tempfile::tempdir().expect("tempdir");
    let cfg = enabled(20);
    {
        let mut checker = AlignmentChecker::new(temp.path(), "goal", "run-1", &cfg).expect("checker");
        checker.evaluate_turn(&clean(1)).expect("turn 1");
        checker.evaluate_turn(&clean(2)).expect("turn 2");
    }
    assert_eq!(ledger_lines(temp.path()).len(), 4);

    let mut resumed = AlignmentChecker::new(temp.path(), "goal", "run-1", &cfg).expect("checker");
    resumed.evaluate_turn(&clean(1)).expect("turn 1 replay");
    resumed.evaluate_turn(&clean(2)).expect("turn 2 replay");
    assert_eq!(ledger_lines(temp.path()).len(), 4);

    resumed.evaluate_turn(&clean(3)).expect("turn 3");
    let summary = resumed.finalize().expect("finalize");
    let ledger = summary.ledger.expect("ledger summary");
    assert_eq!(ledger.events, 7);
    assert!(verify_chain(temp.path()).expect("verify").is_intact());
}

#[test]
fn a_different_or_completed_run_starts_a_fresh_session() {
    let temp = tempfile::tempdir().expect("tempdir");
    let first = load_or_start_session(temp.path(), "run-1").expect("session");
    let again = load_or_start_session(temp.path(), "run-1").expect("session");
    assert_eq!(first.session_key, again.session_key);
    assert!(first.session_key.starts_with("run-1:"));

    let other = load_or_start_session(temp.path(), "run-2").expect("session");
    assert_ne!(other.session_key, first.session_key);

    let mut current = load_or_start_session(temp.path(), "run-2").expect("session");
    assert_eq!(current.session_key, other.session_key);
    complete_session(temp.path(), &mut current).expect("complete");
    let fresh = load_or_start_session(temp.path(), "run-2").expect("session");
    assert_ne!(fresh.session_key, current.session_key);
    assert!(!fresh.completed);
}

/// A second run in the same directory appends to the existing chain instead
/// of starting a new one.
#[test]
fn a_new_run_id_keeps_extending_the_same_chain() {
    let temp = tempfile::tempdir().expect("tempdir");
    let cfg = enabled(20);
    {
        let mut first = AlignmentChecker::new(temp.path(), "goal", "run-1", &cfg).expect("checker");
        first.evaluate_turn(&clean(1)).expect("turn 1");
        first.evaluate_turn(&clean(2)).expect("turn 2");
    }
    let before = ledger_lines(temp.path());
    let last_run1: Value = serde_json::from_str(before.last().expect("run-1 records")).expect("parse");

    let mut second = AlignmentChecker::new(temp.path(), "goal", "run-2", &cfg).expect("checker");
    second.evaluate_turn(&clean(1)).expect("turn 1 of run-2");
    second.finalize().expect("finalize");

    let after = ledger_lines(temp.path());
    assert!(after.len() > before.len(), "{} -> {}", before.len(), after.len());
    let first_run2: Value = serde_json::from_str(&after[before.len()]).expect("parse");
    assert_eq!(first_run2["run_id"], "run-2");
    assert_eq!(first_run2["prev_hash"], last_run1["hash"]);
    assert!(after[..before.len()]
        .iter()
        .all(|line| line.contains("\"run_id\":\"run-1\"")));

    let report = verify_chain(temp.path()).expect("verify");
    assert_eq!(report.first_break, None);
    assert_eq!(report.records, after.len());
}

/// An interrupted append leaves a partial line; the next writer drops it and
/// the chain stays verifiable.
#[test]
fn torn_final_line_is_repaired_before_the_next_turn() {
    let temp = tempfile::tempdir().expect("tempdir");
    let cfg = enabled(20);
    {
        let mut checker = AlignmentChecker::new(temp.path(), "goal", "run-1", &cfg).expect("checker");
        checker.evaluate_turn(&clean(1)).expect("turn 1");
    }
    let path = alignment_dir(temp.path()).join(LEDGER_FILE);
    let mut contents = fs::read_to_string(&path).expect("read");
    contents.push_str(r#"{"event_id":"evt-partial","timestamp"#);
    fs::write(&path, contents).expect("write torn tail");

    let mut resumed = AlignmentChecker::new(temp.path(), "goal", "run-1", &cfg).expect("checker");
    resumed.evaluate_turn(&clean(2)).expect("turn 2");
    resumed.evaluate_turn(&clean(2)).expect("turn 2 replay");

    let lines = ledger_lines(temp.path());
    assert_eq!(lines.len(), 4);
    assert!(lines.iter().all(|line| !line.contains("evt-partial")));
    assert_eq!(verify_chain(temp.path()).expect("verify").first_break, None);
}

#[test]
fn verify_chain_reports_the_first_tampered_record() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut checker =
        AlignmentChecker::new(temp.path(), "goal", "run-1", &enabled(20)).expect("checker");
    for turn in 1..=2 {
        checker.evaluate_turn(&clean(turn)).expect("evaluate");
    }
    checker.finalize().expect("finalize");
    let report = verify_chain(temp.path()).expect("verify");
    assert!(report.is_intact());
    assert_eq!(report.records, 5);

    let mut lines = ledger_lines(temp.path());
    let mut record: Value = serde_json::from_str(&lines[1]).expect("parse line 2");
    record["payload"] = json!({ "tampered": true });
    lines[1] = serde_json::to_string(&record).expect("serialize");
    fs::write(
        alignment_dir(temp.path()).join(LEDGER_FILE),
        format!("{}\n", lines.join("\n")),
    )
    .expect("rewrite ledger");

    let report = verify_chain(temp.path()).expect("verify");
    let broken = report.first_break.expect("break detected");
    assert_eq!(broken.line, 2);
    assert!(broken.reason.contains("hash"), "{}", broken.reason);
    assert_eq!(report.records, 1);
}

#[test]
fn dropping_the_first_record_breaks_the_genesis_link() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut writer = LedgerWriter::open(temp.path(), identity("run-1")).expect("open");
    writer.append(draft("k1")).expect("append");
    writer.append(draft("k2")).expect("append");

    let lines = ledger_lines(temp.path());
    fs::write(
        alignment_dir(temp.path()).join(LEDGER_FILE),
        format!("{}\n", lines[1]),
    )
    .expect("rewrite ledger");
    let broken = verify_chain(temp.path())
        .expect("verify")
        .first_break
        .expect("break detected");
    assert_eq!(broken.line, 1);
    assert!(broken.reason.contains("prev_hash"), "{}", broken.reason);
}

#[test]
fn malformed_lines_are_skipped_on_open_but_fail_verification() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut writer = LedgerWriter::open(temp.path(), identity("run-1")).expect("open");
    writer.append(draft("k1")).expect("append");
    let path = alignment_dir(temp.path()).join(LEDGER_FILE);
    let mut contents = fs::read_to_string(&path).expect("read");
    contents.push_str("{not json\n");
    fs::write(&path, contents).expect("write");

    let reopened = LedgerWriter::open(temp.path(), identity("run-1")).expect("reopen");
    assert_eq!(reopened.records().len(), 1);
    let report = verify_chain(temp.path()).expect("verify");
    assert_eq!(report.first_break.map(|broken| broken.line), Some(2));
}
