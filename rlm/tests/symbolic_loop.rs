//! End-to-end loop scenarios driven by scripted planners and sub-call workers.

use std::fs;
use std::time::{Duration, Instant};

use rlm::core::chunking::sha256_hex;
use rlm::core::pointer::context_pointer;
use rlm::core::types::{DeliberationStatus, FinalStatus, SubcallStatus};
use rlm::io::artifacts::STATE_FILE;
use rlm::io::config::RlmConfig;
use rlm::io::ledger::verify_chain;
use rlm::io::run_state::load_run_state;
use rlm::test_support::{ScriptedDeliberator, ScriptedPlanner, ScriptedSubcalls, TestRun};
use serde_json::{Value, json};

const CONTEXT: &str = "alpha needle beta\ngamma delta needle\nomega\n";

fn plan(value: Value) -> String {
    value.to_string()
}

fn span_subcall(output_var: Option<&str>) -> Value {
    let mut subcall = json!({
        "purpose": "extract",
        "spans": [{"start_byte": 0, "end_byte": 17}],
        "max_input_bytes": 4000
    });
    if let Some(name) = output_var {
        subcall["output_var"] = json!(name);
    }
    subcall
}

fn continue_with_subcall(output_var: Option<&str>) -> String {
    plan(json!({
        "schema_version": 1,
        "intent": "continue",
        "subcalls": [span_subcall(output_var)]
    }))
}

fn final_answer(answer: &str) -> String {
    plan(json!({"schema_version": 1, "intent": "final", "final_answer": answer}))
}

fn config(max_iterations: u32) -> RlmConfig {
    let mut cfg = RlmConfig::default();
    cfg.run.max_iterations = max_iterations;
    cfg
}

fn first_chunk_pointer() -> String {
    let object_id = format!("sha256:{}", sha256_hex(CONTEXT.as_bytes()));
    context_pointer(&object_id, "c000001")
}

/// An early `final` is rejected, the retry runs a sub-call, and a later
/// `final_var` resolves to that sub-call's output.
#[test]
fn early_final_is_retried_and_final_var_resolves_subcall_output() {
    let run = TestRun::new().expect("run");
    let planner = ScriptedPlanner::new(vec![
        final_answer("too early"),
        continue_with_subcall(Some("x")),
        plan(json!({"schema_version": "1", "intent": "final", "final_var": "x"})),
    ]);
    let subcalls = ScriptedSubcalls::constant("the extracted answer");
    let outcome = run
        .run("find the needle", CONTEXT, &config(5), &planner, &subcalls, None)
        .expect("loop");

    assert_eq!(outcome.exit_code, 0, "{:?}", outcome.error);
    let final_result = outcome.state.final_result.as_ref().expect("final");
    assert_eq!(final_result.status, FinalStatus::Passed);
    assert_eq!(final_result.final_answer.as_deref(), Some("the extracted answer"));
    assert_eq!(final_result.final_var.as_deref(), Some("x"));

    let first = &outcome.state.iterations[0];
    assert_eq!(first.planner_errors, vec!["final_requires_subcall".to_string()]);
    assert_eq!(first.variable_bindings.len(), 1);
    assert_eq!(first.variable_bindings[0].pointer, "subcall:1:sc0001");

    let prompts = planner.prompts();
    assert_eq!(prompts.len(), 3);
    assert!(prompts[1].starts_with("Return valid JSON only."));
    assert!(prompts[1].contains("Do not return intent=final until after at least one subcall."));
    assert!(prompts[2].contains("x = subcall:1:sc0001"));
    assert!(run.path().join("planner/iteration-1-attempt-1.txt").exists());
}

#[test]
fn unbound_final_var_twice_ends_with_invalid_config() {
    let run = TestRun::new().expect("run");
    let unbound = plan(json!({"schema_version": 1, "intent": "final", "final_var": "missing"}));
    let planner = ScriptedPlanner::new(vec![
        continue_with_subcall(None),
        unbound.clone(),
        unbound,
    ]);
    let outcome = run
        .run("goal", CONTEXT, &config(5), &planner, &ScriptedSubcalls::echo(), None)
        .expect("loop");

    assert_eq!(outcome.exit_code, 5);
    let final_result = outcome.state.final_result.as_ref().expect("final");
    assert_eq!(final_result.status, FinalStatus::InvalidConfig);
    assert!(
        outcome
            .error
            .as_deref()
            .is_some_and(|err| err.contains("final_var_unbound"))
    );
    assert_eq!(outcome.state.iterations.len(), 1);
    assert!(run.path().join("planner/iteration-2-attempt-2.txt").exists());
}

#[test]
fn single_worker_runs_subcalls_strictly_in_order() {
    let run = TestRun::new().expect("run");
    let planner = ScriptedPlanner::new(vec![
        plan(json!({
            "schema_version": 1,
            "intent": "continue",
            "subcalls": [span_subcall(None), span_subcall(None), span_subcall(Some("last"))]
        })),
        final_answer("done"),
    ]);
    let subcalls = ScriptedSubcalls::echo().with_delay(Duration::from_millis(5));
    let mut cfg = config(3);
    cfg.budgets.max_concurrency = 1;
    let outcome = run
        .run("goal", CONTEXT, &cfg, &planner, &subcalls, None)
        .expect("loop");

    assert_eq!(outcome.exit_code, 0, "{:?}", outcome.error);
    assert_eq!(subcalls.max_in_flight(), 1);
    assert_eq!(
        subcalls.events(),
        vec![
            "start:sc0001",
            "end:sc0001",
            "start:sc0002",
            "end:sc0002",
            "start:sc0003",
            "end:sc0003",
        ]
    );
    let ids: Vec<&str> = outcome.state.iterations[0]
        .subcalls
        .iter()
        .map(|subcall| subcall.id.as_str())
        .collect();
    assert_eq!(ids, vec!["sc0001", "sc0002", "sc0003"]);
}

#[test]
fn parallel_workers_respect_the_ceiling_and_keep_declaration_order() {
    let run = TestRun::new().expect("run");
    let subcall_batch: Vec<Value> = (0..4).map(|_| span_subcall(None)).collect();
    let planner = ScriptedPlanner::new(vec![
        plan(json!({"schema_version": 1, "intent": "continue", "subcalls": subcall_batch})),
        final_answer("done"),
    ]);
    let subcalls = ScriptedSubcalls::new(|_, meta| format!("out {}", meta.id))
        .with_delay(Duration::from_millis(20));
    let mut cfg = config(3);
    cfg.budgets.max_concurrency = 2;
    let outcome = run
        .run("goal", CONTEXT, &cfg, &planner, &subcalls, None)
        .expect("loop");

    assert_eq!(outcome.exit_code, 0, "{:?}", outcome.error);
    assert!(subcalls.max_in_flight() <= 2);
    assert_eq!(subcalls.calls(), 4);
    for (idx, subcall) in outcome.state.iterations[0].subcalls.iter().enumerate() {
        let id = format!("sc{:04}", idx + 1);
        assert_eq!(subcall.id, id);
        let output = fs::read_to_string(run.path().join(&subcall.artifact_paths.output))
            .expect("output artifact");
        assert_eq!(output, format!("out {id}"));
    }
}

#[test]
fn failed_subcall_is_recorded_and_the_loop_continues() {
    let run = TestRun::new().expect("run");
    let planner = ScriptedPlanner::new(vec![
        plan(json!({
            "schema_version": 1,
            "intent": "continue",
            "subcalls": [span_subcall(Some("broken")), span_subcall(Some("fine"))]
        })),
        plan(json!({"schema_version": 1, "intent": "final", "final_var": "fine"})),
    ]);
    let subcalls = ScriptedSubcalls::constant("ok").fail_on("sc0001", "worker crashed");
    let outcome = run
        .run("goal", CONTEXT, &config(4), &planner, &subcalls, None)
        .expect("loop");

    assert_eq!(outcome.exit_code, 0, "{:?}", outcome.error);
    let records = &outcome.state.iterations[0].subcalls;
    assert_eq!(records[0].status, SubcallStatus::Failed);
    assert_eq!(records[0].error.as_deref(), Some("worker crashed"));
    assert_eq!(records[1].status, SubcallStatus::Succeeded);
    let bound: Vec<&str> = outcome.state.iterations[0]
        .variable_bindings
        .iter()
        .map(|binding| binding.name.as_str())
        .collect();
    assert_eq!(bound, vec!["fine"]);
    assert!(planner.prompts()[1].contains("subcall:1:sc0001"));
}

#[test]
fn iteration_cap_ends_with_budget_exhaustion() {
    let run = TestRun::new().expect("run");
    let planner = ScriptedPlanner::new(Vec::<String>::new()).then_repeat(continue_with_subcall(None));
    let outcome = run
        .run("goal", CONTEXT, &config(3), &planner, &ScriptedSubcalls::echo(), None)
        .expect("loop");

    assert_eq!(outcome.exit_code, 3);
    assert_eq!(
        outcome.state.final_result.as_ref().map(|result| result.status),
        Some(FinalStatus::MaxIterations)
    );
    assert_eq!(outcome.state.iterations.len(), 3);
    assert_eq!(planner.prompts().len(), 3);
}

#[test]
fn expired_deadline_ends_with_wall_clock_exhaustion() {
    let run = TestRun::new().expect("run");
    let planner = ScriptedPlanner::new(Vec::<String>::new()).then_repeat(continue_with_subcall(None));
    let mut cfg = config(10);
    cfg.run.max_minutes = 1;
    let outcome = run
        .run_until(
            "goal",
            CONTEXT,
            &cfg,
            &planner,
            &ScriptedSubcalls::echo(),
            Some(Instant::now()),
        )
        .expect("loop");

    assert_eq!(outcome.exit_code, 3);
    assert!(planner.prompts().is_empty());
    let state = load_run_state(&run.path().join(STATE_FILE)).expect("state");
    let final_result = state.final_result.expect("final result written");
    assert_eq!(final_result.status, FinalStatus::MaxMinutes);
    assert_eq!(final_result.exit_code, 3);
    assert!(
        final_result.error.as_deref().is_some_and(|err| err.contains("1 minutes")),
        "{:?}",
        final_result.error
    );
}

#[test]
fn oversized_minutes_cap_runs_without_a_deadline() {
    let run = TestRun::new().expect("run");
    let planner = ScriptedPlanner::new(Vec::<String>::new()).then_repeat(continue_with_subcall(None));
    let mut cfg = config(2);
    cfg.run.max_minutes = u64::MAX;
    let outcome = run
        .run("goal", CONTEXT, &cfg, &planner, &ScriptedSubcalls::echo(), None)
        .expect("loop");

    assert_eq!(outcome.exit_code, 3);
    assert_eq!(
        outcome.state.final_result.as_ref().map(|result| result.status),
        Some(FinalStatus::MaxIterations)
    );
    assert_eq!(planner.prompts().len(), 2);
}

#[test]
fn zero_consensus_cadence_is_rejected_as_invalid_config() {
    let run = TestRun::new().expect("run");
    let planner = ScriptedPlanner::new(vec![continue_with_subcall(None)]);
    let mut cfg = config(4);
    cfg.alignment.enabled = true;
    cfg.alignment.policy.consensus.cadence_turns = 0;
    let outcome = run
        .run("goal", CONTEXT, &cfg, &planner, &ScriptedSubcalls::echo(), None)
        .expect("loop");

    assert_eq!(outcome.exit_code, 5);
    assert!(planner.prompts().is_empty());
    assert!(
        outcome.error.as_deref().is_some_and(|err| err.contains("cadence_turns")),
        "{:?}",
        outcome.error
    );
    let state = load_run_state(&run.path().join(STATE_FILE)).expect("state");
    assert_eq!(
        state.final_result.map(|result| result.status),
        Some(FinalStatus::InvalidConfig)
    );
    assert!(!run.path().join("alignment").exists());
}

#[test]
fn planner_prompt_keeps_a_window_of_recent_subcalls() {
    let run = TestRun::new().expect("run");
    let planner = ScriptedPlanner::new(Vec::<String>::new()).then_repeat(continue_with_subcall(None));
    let outcome = run
        .run("goal", CONTEXT, &config(34), &planner, &ScriptedSubcalls::echo(), None)
        .expect("loop");

    assert_eq!(outcome.exit_code, 3);
    let prompts = planner.prompts();
    assert_eq!(prompts.len(), 34);
    assert!(prompts[32].contains("subcall:1:sc0001"));
    let last = &prompts[33];
    assert!(!last.contains("subcall:1:sc0001"));
    assert!(last.contains("subcall:2:sc0001"));
    assert!(last.contains("subcall:33:sc0001"));
}

#[test]
fn unbounded_runs_are_rejected_before_planning() {
    let run = TestRun::new().expect("run");
    let planner = ScriptedPlanner::new(vec![final_answer("never")]);
    let mut cfg = config(0);
    cfg.run.max_minutes = 0;
    let outcome = run
        .run("goal", CONTEXT, &cfg, &planner, &ScriptedSubcalls::echo(), None)
        .expect("loop");

    assert_eq!(outcome.exit_code, 5);
    assert!(planner.prompts().is_empty());
    assert!(outcome.state.iterations.is_empty());
}

#[test]
fn pause_intent_stops_with_invalid_config() {
    let run = TestRun::new().expect("run");
    let planner = ScriptedPlanner::new(vec![plan(json!({"schema_version": 1, "intent": "pause"}))]);
    let outcome = run
        .run("goal", CONTEXT, &config(4), &planner, &ScriptedSubcalls::echo(), None)
        .expect("loop");
    assert_eq!(outcome.exit_code, 5);
    assert_eq!(outcome.state.iterations.len(), 1);
}

#[test]
fn planner_transport_failure_ends_with_error_status() {
    let run = TestRun::new().expect("run");
    let planner = ScriptedPlanner::new(Vec::<String>::new());
    let outcome = run
        .run("goal", CONTEXT, &config(4), &planner, &ScriptedSubcalls::echo(), None)
        .expect("loop");
    assert_eq!(outcome.exit_code, 10);
    assert!(
        outcome
            .error
            .as_deref()
            .is_some_and(|err| err.contains("scripted planner exhausted"))
    );
}

/// Search hits and read excerpts from one iteration show up in the next prompt.
#[test]
fn searches_and_reads_feed_the_next_prompt() {
    let run = TestRun::new().expect("run");
    let pointer = first_chunk_pointer();
    let planner = ScriptedPlanner::new(vec![
        plan(json!({
            "schema_version": 1,
            "intent": "continue",
            "searches": [{"query": "needle", "top_k": 999}],
            "reads": [{"pointer": pointer, "offset": 6, "bytes": 6}],
            "subcalls": [span_subcall(None)]
        })),
        final_answer("done"),
    ]);
    let outcome = run
        .run("goal", CONTEXT, &config(3), &planner, &ScriptedSubcalls::echo(), None)
        .expect("loop");
    assert_eq!(outcome.exit_code, 0, "{:?}", outcome.error);

    let search = &outcome.state.iterations[0].searches[0];
    assert!(search.clamped_top_k);
    assert_eq!(search.hits.len(), 1);
    assert_eq!(search.hits[0].pointer, pointer);

    let second_prompt = &planner.prompts()[1];
    assert!(second_prompt.contains("\"query\":\"needle\""));
    assert!(second_prompt.contains(&format!("- {pointer}: needle")));
}

#[test]
fn unknown_pointer_is_a_validation_error() {
    let run = TestRun::new().expect("run");
    let bad = plan(json!({
        "schema_version": 1,
        "intent": "continue",
        "reads": [{"pointer": "subcall:9:sc0001", "bytes": 10}]
    }));
    let planner = ScriptedPlanner::new(vec![bad.clone(), bad]);
    let outcome = run
        .run("goal", CONTEXT, &config(3), &planner, &ScriptedSubcalls::echo(), None)
        .expect("loop");
    assert_eq!(outcome.exit_code, 5);
    assert!(
        outcome
            .error
            .as_deref()
            .is_some_and(|err| err.contains("plan_validation_error"))
    );
}

#[test]
fn state_file_round_trips_the_outcome() {
    let run = TestRun::new().expect("run");
    let planner = ScriptedPlanner::new(vec![continue_with_subcall(None), final_answer("done")]);
    let outcome = run
        .run("goal", CONTEXT, &config(3), &planner, &ScriptedSubcalls::echo(), None)
        .expect("loop");
    let stored = load_run_state(&run.path().join(STATE_FILE)).expect("load state");
    assert_eq!(stored, outcome.state);
    assert_eq!(stored.context.chunks, 1);
    assert_eq!(stored.context.byte_length, CONTEXT.len());

    let subcall = &stored.iterations[0].subcalls[0];
    for path in [
        &subcall.artifact_paths.input,
        &subcall.artifact_paths.prompt,
        &subcall.artifact_paths.output,
        &subcall.artifact_paths.meta,
    ] {
        assert!(run.path().join(path).exists(), "missing {path}");
    }
}

#[test]
fn deliberation_brief_reaches_the_planner_and_failures_are_swallowed() {
    let run = TestRun::new().expect("run");
    let planner = ScriptedPlanner::new(vec![
        continue_with_subcall(None),
        continue_with_subcall(None),
        final_answer("done"),
    ]);
    let deliberator = ScriptedDeliberator::new(vec![
        Ok("Decision focus: check the second line".to_string()),
        Err("deliberator offline".to_string()),
    ]);
    let mut cfg = config(5);
    cfg.deliberation.enabled = true;
    cfg.deliberation.min_interval_iterations = 1;
    let outcome = run
        .run("goal", CONTEXT, &cfg, &planner, &ScriptedSubcalls::echo(), Some(&deliberator))
        .expect("loop");
    assert_eq!(outcome.exit_code, 0, "{:?}", outcome.error);

    let statuses: Vec<DeliberationStatus> = outcome
        .state
        .iterations
        .iter()
        .filter_map(|record| record.deliberation.as_ref().map(|d| d.status))
        .collect();
    assert_eq!(
        statuses,
        vec![DeliberationStatus::Ran, DeliberationStatus::Error, DeliberationStatus::Error]
    );
    for prompt in planner.prompts() {
        assert!(prompt.contains("Decision focus: check the second line"));
    }
}

#[test]
fn enabled_alignment_attaches_a_summary_and_an_intact_ledger() {
    let run = TestRun::new().expect("run");
    let planner = ScriptedPlanner::new(vec![continue_with_subcall(None), final_answer("done")]);
    let mut cfg = config(4);
    cfg.alignment.enabled = true;
    let outcome = run
        .run("goal", CONTEXT, &cfg, &planner, &ScriptedSubcalls::echo(), None)
        .expect("loop");
    assert_eq!(outcome.exit_code, 0, "{:?}", outcome.error);

    let final_result = outcome.state.final_result.as_ref().expect("final");
    let summary = final_result.alignment.as_ref().expect("alignment summary");
    assert_eq!(summary.turns_evaluated, 2);
    assert!(outcome.state.iterations.iter().all(|record| record.alignment.is_some()));

    let report = verify_chain(run.path()).expect("verify");
    assert!(report.is_intact());
    // 2 intent + 2 check + 1 final summary
    assert_eq!(report.records, 5);
    assert_eq!(summary.ledger.as_ref().map(|ledger| ledger.events), Some(5));
}

#[test]
fn enforced_alignment_blocks_high_risk_finals_without_high_reasoning() {
    let run = TestRun::new().expect("run");
    let planner = ScriptedPlanner::new(vec![continue_with_subcall(None), final_answer("done")]);
    let mut cfg = config(4);
    cfg.alignment.enabled = true;
    cfg.alignment.enforce = true;
    cfg.alignment.policy.route.high_reasoning_available = false;
    let outcome = run
        .run("goal", CONTEXT, &cfg, &planner, &ScriptedSubcalls::echo(), None)
        .expect("loop");

    assert_eq!(outcome.exit_code, 5);
    let last = outcome.state.iterations.last().expect("iteration");
    let decision = last.alignment.as_ref().expect("decision");
    assert!(decision.enforcement_blocked);
    assert_eq!(
        decision.enforcement_reason.as_deref(),
        Some("high_reasoning_unavailable")
    );
    assert!(
        outcome
            .state
            .final_result
            .as_ref()
            .and_then(|result| result.final_answer.as_ref())
            .is_none()
    );
}
