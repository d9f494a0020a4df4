//! Shared deterministic types for conductor core logic.
//!
//! These types define stable contracts between the invoker, gate evaluator,
//! recovery handler and orchestrator. They hold no I/O handles.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of a single invocation.
///
/// `Succeeded` and `Failed` are terminal; `Retrying` sits between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationStatus {
    Pending,
    Running,
    Retrying,
    Succeeded,
    Failed,
}

impl InvocationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    fn can_transition_to(self, next: Self) -> bool {
        use InvocationStatus as S;
        matches!(
            (self, next),
            (S::Pending, S::Running)
                | (S::Pending, S::Failed)
                | (S::Running, S::Retrying)
                | (S::Running, S::Succeeded)
                | (S::Running, S::Failed)
                | (S::Retrying, S::Running)
                | (S::Retrying, S::Failed)
        )
    }
}

/// Rejected status change.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid invocation transition {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub from: InvocationStatus,
    pub to: InvocationStatus,
}

/// One request-response cycle dispatching a task to an external worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Invocation {
    pub id: String,
    pub worker_id: String,
    pub task_name: String,
    pub context_ref: Option<PathBuf>,
    pub started_at: DateTime<Utc>,
    pub timeout_ms: u64,
    /// 1-indexed once dispatch starts; 0 while pending.
    pub attempt: u32,
    pub status: InvocationStatus,
}

impl Invocation {
    pub fn new(
        id: impl Into<String>,
        worker_id: impl Into<String>,
        task_name: impl Into<String>,
        timeout_ms: u64,
    ) -> Self {
        Self {
            id: id.into(),
            worker_id: worker_id.into(),
            task_name: task_name.into(),
            context_ref: None,
            started_at: Utc::now(),
            timeout_ms,
            attempt: 0,
            status: InvocationStatus::Pending,
        }
    }

    /// Move to `next`, bumping `attempt` on every entry into `Running`.
    pub fn transition(&mut self, next: InvocationStatus) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        if next == InvocationStatus::Running {
            self.attempt += 1;
        }
        self.status = next;
        Ok(())
    }
}

/// Gate verdict for a completed invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Pass,
    Concerns,
    Fail,
    /// Otherwise failing result accepted through an explicit waiver.
    Waived,
}

impl Verdict {
    /// Whether the stage may advance on this verdict.
    pub fn is_accepted(self) -> bool {
        matches!(self, Self::Pass | Self::Waived)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Pass => "PASS",
            Self::Concerns => "CONCERNS",
            Self::Fail => "FAIL",
            Self::Waived => "WAIVED",
        };
        f.write_str(label)
    }
}

/// Outcome of a gate evaluation. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateResult {
    pub verdict: Verdict,
    pub reasons: Vec<String>,
    /// Stamped by the orchestrator; `evaluate` leaves it unset.
    pub evaluated_at: Option<DateTime<Utc>>,
}

impl GateResult {
    pub fn stamped(self, at: DateTime<Utc>) -> Self {
        Self {
            evaluated_at: Some(at),
            ..self
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecoveryStrategy {
    Retry,
    Escalate,
    Skip,
    Abort,
}

impl fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Retry => "RETRY",
            Self::Escalate => "ESCALATE",
            Self::Skip => "SKIP",
            Self::Abort => "ABORT",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryDecision {
    pub strategy: RecoveryStrategy,
    /// The attempt that just failed (1-indexed).
    pub attempt: u32,
    pub max_attempts: u32,
}

/// Workflow state machine. Stage-bearing states name the current stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "stage", rename_all = "snake_case")]
pub enum OrchestratorState {
    Pending,
    Running(String),
    GatedFail(String),
    Recovering(String),
    /// Escalated; waits for an operator resolution.
    AwaitingInput(String),
    Aborted(String),
    Completed,
    /// Finished, but at least one stage was skipped.
    CompletedWithSkips,
}

impl OrchestratorState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Aborted(_) | Self::Completed | Self::CompletedWithSkips
        )
    }

    pub fn stage(&self) -> Option<&str> {
        match self {
            Self::Running(stage)
            | Self::GatedFail(stage)
            | Self::Recovering(stage)
            | Self::AwaitingInput(stage)
            | Self::Aborted(stage) => Some(stage),
            Self::Pending | Self::Completed | Self::CompletedWithSkips => None,
        }
    }
}

impl fmt::Display for OrchestratorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => f.write_str("pending"),
            Self::Running(stage) => write!(f, "running({stage})"),
            Self::GatedFail(stage) => write!(f, "gated_fail({stage})"),
            Self::Recovering(stage) => write!(f, "recovering({stage})"),
            Self::AwaitingInput(stage) => write!(f, "awaiting_input({stage})"),
            Self::Aborted(stage) => write!(f, "aborted({stage})"),
            Self::Completed => f.write_str("completed"),
            Self::CompletedWithSkips => f.write_str("completed_with_skips"),
        }
    }
}
