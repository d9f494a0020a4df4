//! Workflow-level tests: definitions loaded from TOML, driven through the
//! orchestrator with scripted and real launchers.

use std::fs;
use std::path::Path;

use conductor::core::types::{OrchestratorState, RecoveryStrategy, Verdict};
use conductor::invoke::Invoker;
use conductor::io::config::{ConductorConfig, NotifyConfig};
use conductor::io::notifier::Notifier;
use conductor::io::report::{StageOutcome, load_report};
use conductor::orchestrate::{Orchestrator, Resolution};
use conductor::test_support::{LaunchBehavior, RecordingSink, Sandbox, ScriptedLauncher};
use conductor::workflow::load_workflow;

const WORKFLOW: &str = r#"
id = "story-11-2"
story = "Add CSV export"

[gate]
required_checks = ["tests_pass"]
advisory_checks = ["lint_clean"]

[[stage]]
name = "develop"
worker = "dev"
task = "develop-story"
instructions = "Implement {{ story }}"

[[stage]]
name = "review"
worker = "qa"
task = "review-story"
critical = true
"#;

fn write_workflow(dir: &Path, body: &str) -> conductor::workflow::WorkflowDef {
    let path = dir.join("workflow.toml");
    fs::write(&path, body).expect("write workflow");
    load_workflow(&path).expect("load workflow")
}

fn config(sandbox: &Sandbox) -> ConductorConfig {
    ConductorConfig {
        notify: NotifyConfig {
            events_path: Some(sandbox.path().join("events.jsonl")),
        },
        ..sandbox.config.clone()
    }
}

/// Full lifecycle: develop passes, review fails its required check and, as a
/// critical stage, aborts the workflow with reasons and history on record.
#[test]
fn critical_review_failure_aborts_workflow() {
    let sandbox = Sandbox::new();
    let workflow = write_workflow(sandbox.path(), WORKFLOW);
    let launcher = ScriptedLauncher::new(vec![
        LaunchBehavior::complete("tests_pass: pass\nlint_clean: pass"),
        LaunchBehavior::complete("tests_pass: fail\nlint_clean: pass"),
    ]);
    let cfg = config(&sandbox);
    let notifier = Notifier::from_config(&cfg.notify);
    let mut orch =
        Orchestrator::new(workflow, Invoker::new(&launcher, cfg), notifier).expect("orchestrator");

    let report = orch.run().expect("run");
    assert_eq!(report.state, OrchestratorState::Aborted("review".to_string()));
    assert_eq!(report.failing_stage.as_deref(), Some("review"));
    assert_eq!(report.stages[0].outcome, StageOutcome::Passed);
    assert_eq!(report.stages[1].verdict, Some(Verdict::Fail));
    assert_eq!(
        report.stages[1].reasons,
        vec!["required check 'tests_pass' failed"]
    );
    assert_eq!(
        report.stages[1].decisions[0].strategy,
        RecoveryStrategy::Abort
    );
    assert!(report.finished_at.is_some());

    let persisted = load_report(orch.report_path()).expect("report");
    assert_eq!(persisted, report);

    orch.shutdown();
    let events = fs::read_to_string(sandbox.path().join("events.jsonl")).expect("events");
    let states: Vec<String> = events
        .lines()
        .map(|line| {
            let value: serde_json::Value = serde_json::from_str(line).expect("event json");
            value["to"]["state"].as_str().unwrap_or_default().to_string()
        })
        .collect();
    assert_eq!(states, vec!["running", "running", "gated_fail", "aborted"]);
}

/// Develop keeps raising concerns until its attempts run out, escalates,
/// and completes after the operator waives it.
#[test]
fn concerns_escalate_and_waiver_completes() {
    let sandbox = Sandbox::new();
    let workflow = write_workflow(sandbox.path(), WORKFLOW);
    let launcher = ScriptedLauncher::new(vec![
        LaunchBehavior::complete("tests_pass: pass\nlint_clean: fail"),
        LaunchBehavior::complete("tests_pass: pass\nlint_clean: fail"),
        LaunchBehavior::complete("tests_pass: pass\nlint_clean: fail"),
        LaunchBehavior::complete("tests_pass: pass\nlint_clean: pass"),
    ]);
    let sink = RecordingSink::default();
    let mut orch = Orchestrator::new(
        workflow,
        Invoker::new(&launcher, config(&sandbox)),
        Notifier::spawn(vec![Box::new(sink.clone())]),
    )
    .expect("orchestrator");

    let report = orch.run().expect("run");
    assert_eq!(
        report.state,
        OrchestratorState::AwaitingInput("develop".to_string())
    );
    let strategies: Vec<RecoveryStrategy> = report.stages[0]
        .decisions
        .iter()
        .map(|d| d.strategy)
        .collect();
    assert_eq!(
        strategies,
        vec![
            RecoveryStrategy::Retry,
            RecoveryStrategy::Retry,
            RecoveryStrategy::Escalate
        ]
    );
    assert_eq!(report.stages[0].attempts, 3);

    orch.resolve(Resolution::Waive).expect("waive");
    let report = orch.run().expect("resume");
    assert_eq!(report.state, OrchestratorState::Completed);
    assert_eq!(report.stages[0].verdict, Some(Verdict::Waived));
    assert_eq!(report.stages[1].outcome, StageOutcome::Passed);

    orch.shutdown();
    let events = sink.events();
    assert!(events.windows(2).all(|w| w[0].seq + 1 == w[1].seq));
    assert!(
        events
            .iter()
            .any(|e| e.to == OrchestratorState::AwaitingInput("develop".to_string()))
    );
}

/// A worker-declared waiver is honored when the gate allows waivers.
#[test]
fn worker_waiver_passes_gate_when_allowed() {
    let sandbox = Sandbox::new();
    let body = WORKFLOW.replace(
        "advisory_checks = [\"lint_clean\"]",
        "advisory_checks = [\"lint_clean\"]\nallow_waivers = true",
    );
    let workflow = write_workflow(sandbox.path(), &body);
    let launcher = ScriptedLauncher::new(vec![LaunchBehavior::complete(
        r#"{"checks": {"tests_pass": false, "lint_clean": true}, "waiver": "known flaky test"}"#,
    )]);
    let mut orch = Orchestrator::new(
        workflow,
        Invoker::new(&launcher, config(&sandbox)),
        Notifier::disabled(),
    )
    .expect("orchestrator");

    let report = orch.run().expect("run");
    assert_eq!(report.state, OrchestratorState::Completed);
    for stage in &report.stages {
        assert_eq!(stage.outcome, StageOutcome::Waived);
        assert_eq!(
            stage.reasons.last().map(String::as_str),
            Some("waived: known flaky test")
        );
    }
}

/// A real bash launcher drives a one-stage workflow end to end.
#[cfg(unix)]
#[test]
fn real_launcher_workflow_completes() {
    let sandbox = Sandbox::new();
    let workflow = write_workflow(
        sandbox.path(),
        r#"
id = "smoke"

[gate]
required_checks = ["tests_pass"]

[[stage]]
name = "develop"
worker = "dev"
task = "develop-story"
"#,
    );
    let script = conductor::test_support::write_worker_script(sandbox.path(), "tests_pass: ok", 0.1);
    let cfg = ConductorConfig {
        launcher: script,
        ..config(&sandbox)
    };
    let launcher = conductor::io::launcher::ScriptLauncher::from_config(&cfg);
    let mut orch = Orchestrator::new(workflow, Invoker::new(launcher, cfg), Notifier::disabled())
        .expect("orchestrator");

    let report = orch.run().expect("run");
    assert_eq!(report.state, OrchestratorState::Completed);
    assert_eq!(report.stages[0].output_captured, Some(true));
}
