//! Workflow report storage (`<state_dir>/<workflow-id>.report.json`).

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::types::{OrchestratorState, RecoveryDecision, Verdict};
use crate::error::FailureKind;

/// Where a stage ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageOutcome {
    Pending,
    Passed,
    Waived,
    Skipped,
    /// Waiting for an operator resolution.
    Escalated,
    Aborted,
}

/// Per-stage record: verdict, last reasons and attempt history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageReport {
    pub name: String,
    pub worker: String,
    pub task: String,
    pub outcome: StageOutcome,
    pub verdict: Option<Verdict>,
    /// When the gate produced `verdict`.
    #[serde(default)]
    pub evaluated_at: Option<DateTime<Utc>>,
    pub reasons: Vec<String>,
    /// Invocations started for this stage.
    pub attempts: u32,
    pub invocation_ids: Vec<String>,
    pub decisions: Vec<RecoveryDecision>,
    pub output_captured: Option<bool>,
    pub error: Option<String>,
    pub error_kind: Option<FailureKind>,
}

impl StageReport {
    pub fn pending(name: &str, worker: &str, task: &str) -> Self {
        Self {
            name: name.to_string(),
            worker: worker.to_string(),
            task: task.to_string(),
            outcome: StageOutcome::Pending,
            verdict: None,
            evaluated_at: None,
            reasons: Vec::new(),
            attempts: 0,
            invocation_ids: Vec::new(),
            decisions: Vec::new(),
            output_captured: None,
            error: None,
            error_kind: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowReport {
    pub workflow_id: String,
    pub state: OrchestratorState,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Stage that aborted or escalated the run, if any.
    pub failing_stage: Option<String>,
    pub stages: Vec<StageReport>,
}

pub fn report_path(state_dir: &Path, workflow_id: &str) -> PathBuf {
    state_dir.join(format!("{workflow_id}.report.json"))
}

pub fn load_report(path: &Path) -> Result<WorkflowReport> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read report {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse report {}", path.display()))
}

/// Atomically write the report (temp file + rename).
pub fn write_report(path: &Path, report: &WorkflowReport) -> Result<()> {
    debug!(path = %path.display(), state = %report.state, "writing workflow report");
    let mut buf = serde_json::to_string_pretty(report).context("serialize report")?;
    buf.push('\n');
    super::write_atomic(path, &buf)
}
