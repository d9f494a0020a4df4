//! Multi-stage workflow driver.
//!
//! One [`Orchestrator`] owns one workflow instance. Each stage is invoked,
//! gated and, on failure, routed through the recovery policy. Escalations
//! park the workflow in `AwaitingInput` until [`Orchestrator::resolve`] is
//! called; `run` then picks up where it stopped.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Result, anyhow};
use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::gate::evaluate;
use crate::core::recovery::{Failure, StageHistory, decide};
use crate::core::types::{OrchestratorState, RecoveryStrategy, Verdict};
use crate::error::FailureKind;
use crate::invoke::{ContextData, InvokeOptions, Invoker};
use crate::io::launcher::Launcher;
use crate::io::notifier::{Notifier, TransitionEvent};
use crate::io::report::{StageOutcome, StageReport, WorkflowReport, report_path, write_report};
use crate::workflow::{InstructionInputs, StageDef, WorkflowDef, render_instructions};

/// Operator answer to an escalated stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Start the stage over with a fresh attempt budget.
    Retry,
    /// Leave the stage unfinished and move on.
    Skip,
    /// Accept the stage's result as is.
    Waive,
    Abort,
}

pub struct Orchestrator<L: Launcher> {
    workflow: WorkflowDef,
    invoker: Invoker<L>,
    notifier: Notifier,
    state: OrchestratorState,
    current: usize,
    histories: Vec<StageHistory>,
    report: WorkflowReport,
    report_path: PathBuf,
    seq: u64,
}

impl<L: Launcher> Orchestrator<L> {
    pub fn new(workflow: WorkflowDef, invoker: Invoker<L>, notifier: Notifier) -> Result<Self> {
        workflow.validate()?;
        let report_path = report_path(&invoker.config().state_dir, &workflow.id);
        let report = WorkflowReport {
            workflow_id: workflow.id.clone(),
            state: OrchestratorState::Pending,
            started_at: Utc::now(),
            finished_at: None,
            failing_stage: None,
            stages: workflow
                .stages
                .iter()
                .map(|s| StageReport::pending(&s.name, &s.worker, &s.task))
                .collect(),
        };
        Ok(Self {
            histories: vec![StageHistory::default(); workflow.stages.len()],
            workflow,
            invoker,
            notifier,
            state: OrchestratorState::Pending,
            current: 0,
            report,
            report_path,
            seq: 0,
        })
    }

    pub fn state(&self) -> &OrchestratorState {
        &self.state
    }

    pub fn report(&self) -> &WorkflowReport {
        &self.report
    }

    pub fn report_path(&self) -> &PathBuf {
        &self.report_path
    }

    /// Drive stages until the workflow finishes, aborts or needs input.
    ///
    /// Calling `run` on a finished workflow, or one awaiting input, changes
    /// nothing and returns the current report.
    #[instrument(skip_all, fields(workflow = %self.workflow.id))]
    pub fn run(&mut self) -> Result<WorkflowReport> {
        match &self.state {
            state if state.is_terminal() => return Ok(self.report.clone()),
            OrchestratorState::AwaitingInput(stage) => {
                warn!(stage = %stage, "workflow awaits input; call resolve first");
                return Ok(self.report.clone());
            }
            OrchestratorState::Pending => {
                info!(stages = self.workflow.stages.len(), "starting workflow");
                self.enter_stage(0, None);
            }
            _ => {}
        }

        while matches!(self.state, OrchestratorState::Running(_)) {
            self.attempt_stage(self.current);
        }

        self.persist()?;
        Ok(self.report.clone())
    }

    /// Answer an escalation. Fails unless the workflow is awaiting input.
    #[instrument(skip_all, fields(workflow = %self.workflow.id, resolution = ?resolution))]
    pub fn resolve(&mut self, resolution: Resolution) -> Result<()> {
        let OrchestratorState::AwaitingInput(stage) = &self.state else {
            return Err(anyhow!(
                "workflow {} is not awaiting input (state {})",
                self.workflow.id,
                self.state
            ));
        };
        let detail = format!("operator chose {resolution:?} for {stage}");
        let idx = self.current;

        match resolution {
            Resolution::Retry => {
                self.histories[idx].reset();
                self.report.stages[idx].outcome = StageOutcome::Pending;
                self.report.failing_stage = None;
                self.enter_stage(idx, Some(detail));
            }
            Resolution::Skip => {
                self.report.stages[idx].outcome = StageOutcome::Skipped;
                self.report.failing_stage = None;
                self.enter_stage(idx + 1, Some(detail));
            }
            Resolution::Waive => {
                let stage = &mut self.report.stages[idx];
                stage.outcome = StageOutcome::Waived;
                stage.verdict = Some(Verdict::Waived);
                self.report.failing_stage = None;
                self.enter_stage(idx + 1, Some(detail));
            }
            Resolution::Abort => {
                self.abort(idx, Some(detail));
            }
        }
        self.persist()
    }

    /// Flush pending notifications and hand back the final report.
    pub fn shutdown(self) -> WorkflowReport {
        self.notifier.shutdown();
        self.report
    }

    fn attempt_stage(&mut self, idx: usize) {
        let stage = self.workflow.stages[idx].clone();
        let attempt = self.histories[idx].retries() + 1;
        debug!(stage = %stage.name, attempt, "attempting stage");

        let failure = match self.invoke_options(&stage, attempt) {
            Ok(options) => self.invoke_and_gate(idx, &stage, &options),
            Err(err) => {
                let message = format!("{err:#}");
                let record = &mut self.report.stages[idx];
                record.reasons = vec![message.clone()];
                record.error = Some(message.clone());
                record.error_kind = Some(FailureKind::Artifact);
                self.transition(
                    OrchestratorState::Recovering(stage.name.clone()),
                    Some(message),
                );
                Some(Failure::Invocation(FailureKind::Artifact))
            }
        };

        let Some(failure) = failure else {
            self.enter_stage(idx + 1, None);
            return;
        };

        let decision = decide(failure, &stage.policy(), &self.histories[idx]);
        self.histories[idx].record(decision);
        self.report.stages[idx].decisions.push(decision);
        info!(
            stage = %stage.name,
            strategy = %decision.strategy,
            attempt = decision.attempt,
            max_attempts = decision.max_attempts,
            "recovery decision"
        );

        let detail = Some(format!(
            "{} after attempt {}/{}",
            decision.strategy, decision.attempt, decision.max_attempts
        ));
        match decision.strategy {
            RecoveryStrategy::Retry => {
                self.transition(OrchestratorState::Running(stage.name.clone()), detail);
            }
            RecoveryStrategy::Escalate => {
                self.report.stages[idx].outcome = StageOutcome::Escalated;
                self.report.failing_stage = Some(stage.name.clone());
                self.transition(OrchestratorState::AwaitingInput(stage.name.clone()), detail);
            }
            RecoveryStrategy::Skip => {
                self.report.stages[idx].outcome = StageOutcome::Skipped;
                self.enter_stage(idx + 1, detail);
            }
            RecoveryStrategy::Abort => self.abort(idx, detail),
        }
    }

    /// Invoke the stage's worker and gate its output. Returns the failure to
    /// recover from, or `None` when the stage is accepted.
    fn invoke_and_gate(
        &mut self,
        idx: usize,
        stage: &StageDef,
        options: &InvokeOptions,
    ) -> Option<Failure> {
        let result = self.invoker.invoke(&stage.worker, &stage.task, options);
        let record = &mut self.report.stages[idx];
        record.attempts += 1;
        record.invocation_ids.push(result.invocation_id.clone());

        if !result.success {
            let message = result
                .error
                .clone()
                .unwrap_or_else(|| "invocation failed".to_string());
            let kind = result.error_kind.unwrap_or(FailureKind::DispatchFailure);
            record.output_captured = None;
            record.verdict = None;
            record.evaluated_at = None;
            record.reasons = vec![message.clone()];
            record.error = Some(message.clone());
            record.error_kind = Some(kind);
            self.transition(
                OrchestratorState::Recovering(stage.name.clone()),
                Some(message),
            );
            return Some(Failure::Invocation(kind));
        }

        let output = result.output.unwrap_or_default();
        let gate = evaluate(&output, stage.gate(&self.workflow.gate)).stamped(Utc::now());
        record.output_captured = Some(result.output_captured);
        record.error = None;
        record.error_kind = None;
        record.verdict = Some(gate.verdict);
        record.evaluated_at = gate.evaluated_at;
        record.reasons = gate.reasons.clone();
        info!(stage = %stage.name, verdict = %gate.verdict, reasons = gate.reasons.len(), "gate evaluated");

        match Failure::from_verdict(gate.verdict) {
            None => {
                record.outcome = if gate.verdict == Verdict::Waived {
                    StageOutcome::Waived
                } else {
                    StageOutcome::Passed
                };
                None
            }
            Some(failure) => {
                let detail = format!("{}: {}", gate.verdict, gate.reasons.join("; "));
                self.transition(
                    OrchestratorState::GatedFail(stage.name.clone()),
                    Some(detail),
                );
                Some(failure)
            }
        }
    }

    fn invoke_options(&self, stage: &StageDef, attempt: u32) -> Result<InvokeOptions> {
        let idx = self.current;
        let previous_reasons = if attempt > 1 {
            self.report.stages[idx].reasons.clone()
        } else {
            Vec::new()
        };
        let instructions = stage
            .instructions
            .as_deref()
            .map(|template| {
                render_instructions(
                    template,
                    &InstructionInputs {
                        workflow: &self.workflow.id,
                        story: self.workflow.story.as_deref(),
                        stage: &stage.name,
                        attempt,
                        previous_reasons: &previous_reasons,
                    },
                )
            })
            .transpose()?;

        let mut metadata = BTreeMap::new();
        metadata.insert("workflow".to_string(), Value::from(self.workflow.id.clone()));
        metadata.insert("stage".to_string(), Value::from(stage.name.clone()));
        metadata.insert("attempt".to_string(), Value::from(attempt));

        Ok(InvokeOptions {
            params: stage.params.clone(),
            context: Some(ContextData {
                story: self.workflow.story.clone(),
                files: stage.files.clone(),
                instructions,
                metadata,
            }),
            timeout: stage.timeout_ms.map(std::time::Duration::from_millis),
            retries: None,
        })
    }

    /// Start stage `idx`, or finish the workflow when there is none.
    fn enter_stage(&mut self, idx: usize, detail: Option<String>) {
        self.current = idx;
        match self.workflow.stages.get(idx) {
            Some(stage) => {
                let next = OrchestratorState::Running(stage.name.clone());
                self.transition(next, detail);
            }
            None => self.finish(detail),
        }
    }

    fn finish(&mut self, detail: Option<String>) {
        let skipped = self
            .report
            .stages
            .iter()
            .any(|s| s.outcome == StageOutcome::Skipped);
        let final_state = if skipped {
            OrchestratorState::CompletedWithSkips
        } else {
            OrchestratorState::Completed
        };
        self.report.finished_at = Some(Utc::now());
        info!(state = %final_state, "workflow finished");
        self.transition(final_state, detail);
    }

    fn abort(&mut self, idx: usize, detail: Option<String>) {
        let name = self.workflow.stages[idx].name.clone();
        self.report.stages[idx].outcome = StageOutcome::Aborted;
        self.report.failing_stage = Some(name.clone());
        self.report.finished_at = Some(Utc::now());
        warn!(stage = %name, "workflow aborted");
        self.transition(OrchestratorState::Aborted(name), detail);
    }

    fn transition(&mut self, next: OrchestratorState, detail: Option<String>) {
        let from = std::mem::replace(&mut self.state, next.clone());
        self.report.state = next.clone();
        self.seq += 1;
        debug!(from = %from, to = %next, "transition");
        self.notifier.emit(TransitionEvent {
            workflow_id: self.workflow.id.clone(),
            seq: self.seq,
            at: Utc::now(),
            from,
            to: next,
            detail,
        });
    }

    fn persist(&self) -> Result<()> {
        write_report(&self.report_path, &self.report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    use crate::core::gate::GateConfig;
    use crate::io::report::load_report;
    use crate::test_support::{
        FailingSink, LaunchBehavior, RecordingSink, Sandbox, ScriptedLauncher,
    };

    fn stage(name: &str) -> StageDef {
        StageDef {
            name: name.to_string(),
            worker: "dev".to_string(),
            task: format!("{name}-task"),
            params: Vec::new(),
            files: Vec::new(),
            instructions: None,
            critical: false,
            skippable: false,
            max_attempts: None,
            timeout_ms: None,
            gate: None,
        }
    }

    fn workflow(stages: Vec<StageDef>) -> WorkflowDef {
        WorkflowDef {
            id: "story-1".to_string(),
            story: Some("CSV export".to_string()),
            gate: GateConfig {
                required_checks: vec!["tests_pass".to_string()],
                ..GateConfig::default()
            },
            stages,
        }
    }

    fn orchestrator<'a>(
        sandbox: &Sandbox,
        launcher: &'a ScriptedLauncher,
        stages: Vec<StageDef>,
        sink: &RecordingSink,
    ) -> Orchestrator<&'a ScriptedLauncher> {
        Orchestrator::new(
            workflow(stages),
            Invoker::new(launcher, sandbox.config.clone()),
            Notifier::spawn(vec![Box::new(sink.clone()), Box::new(FailingSink)]),
        )
        .expect("orchestrator")
    }

    #[test]
    fn passing_stages_complete_and_persist_report() {
        let sandbox = Sandbox::new();
        let launcher = ScriptedLauncher::new(vec![LaunchBehavior::complete("tests_pass: pass")]);
        let sink = RecordingSink::default();
        let mut orch = orchestrator(&sandbox, &launcher, vec![stage("dev"), stage("qa")], &sink);

        let report = orch.run().expect("run");
        assert_eq!(report.state, OrchestratorState::Completed);
        assert!(report.stages.iter().all(|s| s.outcome == StageOutcome::Passed));
        for stage in &report.stages {
            let stamped = stage.evaluated_at.expect("gate timestamp");
            assert!(stamped >= report.started_at);
            assert!(stamped <= report.finished_at.expect("finished"));
        }
        assert_eq!(load_report(orch.report_path()).expect("load"), report);
        let json = fs::read_to_string(orch.report_path()).expect("report json");
        assert!(json.contains("\"evaluated_at\""));

        orch.shutdown();
        let states: Vec<String> = sink.events().iter().map(|e| e.to.to_string()).collect();
        assert_eq!(states, vec!["running(dev)", "running(qa)", "completed"]);
        let seqs: Vec<u64> = sink.events().iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    /// A critical stage whose required check fails aborts without retrying.
    #[test]
    fn failing_critical_stage_aborts() {
        let sandbox = Sandbox::new();
        let launcher = ScriptedLauncher::new(vec![LaunchBehavior::complete("tests_pass: fail")]);
        let sink = RecordingSink::default();
        let mut qa = stage("qa");
        qa.critical = true;
        let mut orch = orchestrator(&sandbox, &launcher, vec![qa, stage("docs")], &sink);

        let report = orch.run().expect("run");
        assert_eq!(report.state, OrchestratorState::Aborted("qa".to_string()));
        assert_eq!(report.failing_stage.as_deref(), Some("qa"));
        assert_eq!(report.stages[0].verdict, Some(Verdict::Fail));
        assert_eq!(
            report.stages[0].reasons,
            vec!["required check 'tests_pass' failed"]
        );
        assert_eq!(report.stages[0].decisions[0].strategy, RecoveryStrategy::Abort);
        assert_eq!(report.stages[1].outcome, StageOutcome::Pending);
        assert_eq!(launcher.launch_count(), 1);

        // Terminal: further runs do nothing.
        orch.run().expect("rerun");
        assert_eq!(launcher.launch_count(), 1);
    }

    #[test]
    fn concerns_retry_with_previous_reasons_then_pass() {
        let sandbox = Sandbox::new();
        let launcher = ScriptedLauncher::new(vec![
            LaunchBehavior::EchoContext,
            LaunchBehavior::complete("tests_pass: pass\nlint_clean: pass"),
        ]);
        let sink = RecordingSink::default();
        let mut dev = stage("dev");
        dev.instructions = Some("attempt {{ attempt }}".to_string());
        dev.gate = Some(GateConfig {
            advisory_checks: vec!["lint_clean".to_string()],
            require_output: false,
            ..GateConfig::default()
        });
        let mut orch = orchestrator(&sandbox, &launcher, vec![dev], &sink);

        let report = orch.run().expect("run");
        assert_eq!(report.state, OrchestratorState::Completed);
        let record = &report.stages[0];
        assert_eq!(record.attempts, 2);
        assert_eq!(record.decisions[0].strategy, RecoveryStrategy::Retry);
        assert_eq!(record.verdict, Some(Verdict::Pass));
        assert_eq!(record.invocation_ids.len(), 2);
    }

    #[test]
    fn escalation_waits_for_resolution() {
        let sandbox = Sandbox::new();
        let launcher = ScriptedLauncher::new(vec![
            LaunchBehavior::complete("tests_pass: fail"),
            LaunchBehavior::complete("tests_pass: pass"),
        ]);
        let sink = RecordingSink::default();
        let mut orch = orchestrator(&sandbox, &launcher, vec![stage("dev")], &sink);

        let report = orch.run().expect("run");
        assert_eq!(report.state, OrchestratorState::AwaitingInput("dev".to_string()));
        assert_eq!(report.stages[0].outcome, StageOutcome::Escalated);
        assert_eq!(report.failing_stage.as_deref(), Some("dev"));

        // Refuses to advance until resolved.
        orch.run().expect("run again");
        assert_eq!(launcher.launch_count(), 1);

        orch.resolve(Resolution::Retry).expect("resolve");
        let report = orch.run().expect("run after resolve");
        assert_eq!(report.state, OrchestratorState::Completed);
        assert_eq!(report.failing_stage, None);
        assert_eq!(report.stages[0].outcome, StageOutcome::Passed);
        assert_eq!(launcher.launch_count(), 2);
        let persisted = load_report(orch.report_path()).expect("load");
        assert_eq!(persisted.failing_stage, None);
        assert!(orch.resolve(Resolution::Skip).is_err());
    }

    #[test]
    fn skipped_stage_completes_with_skips() {
        let sandbox = Sandbox::new();
        let launcher = ScriptedLauncher::new(vec![
            LaunchBehavior::complete("tests_pass: fail"),
            LaunchBehavior::complete("tests_pass: pass"),
        ]);
        let sink = RecordingSink::default();
        let mut docs = stage("docs");
        docs.skippable = true;
        let mut orch = orchestrator(&sandbox, &launcher, vec![docs, stage("dev")], &sink);

        let report = orch.run().expect("run");
        assert_eq!(report.state, OrchestratorState::CompletedWithSkips);
        assert_eq!(report.stages[0].outcome, StageOutcome::Skipped);
        assert_eq!(report.stages[1].outcome, StageOutcome::Passed);
    }

    #[test]
    fn waive_and_abort_resolutions() {
        let sandbox = Sandbox::new();
        let launcher = ScriptedLauncher::new(vec![LaunchBehavior::complete("tests_pass: fail")]);
        let sink = RecordingSink::default();
        let mut orch = orchestrator(&sandbox, &launcher, vec![stage("a"), stage("b")], &sink);

        orch.run().expect("run");
        orch.resolve(Resolution::Waive).expect("waive");
        assert_eq!(orch.report().stages[0].verdict, Some(Verdict::Waived));
        assert_eq!(orch.state(), &OrchestratorState::Running("b".to_string()));

        let report = orch.run().expect("run b");
        assert_eq!(report.state, OrchestratorState::AwaitingInput("b".to_string()));
        orch.resolve(Resolution::Abort).expect("abort");
        assert_eq!(orch.state(), &OrchestratorState::Aborted("b".to_string()));
        let persisted = load_report(orch.report_path()).expect("load");
        assert_eq!(persisted.failing_stage.as_deref(), Some("b"));
    }

    #[test]
    fn fatal_invocation_failure_aborts() {
        let sandbox = Sandbox::new();
        let launcher = ScriptedLauncher::new(vec![LaunchBehavior::MissingLauncher]);
        let sink = RecordingSink::default();
        let mut orch = orchestrator(&sandbox, &launcher, vec![stage("dev")], &sink);

        let report = orch.run().expect("run");
        assert_eq!(report.state, OrchestratorState::Aborted("dev".to_string()));
        assert_eq!(
            report.stages[0].error_kind,
            Some(FailureKind::LauncherNotFound)
        );
        orch.shutdown();
        assert!(
            sink.events()
                .iter()
                .any(|e| e.to == OrchestratorState::Recovering("dev".to_string()))
        );
    }
}
