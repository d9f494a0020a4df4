//! Recovery decisions for failed stages.
//!
//! A decision depends only on the failure, the stage policy and how many
//! retries the stage has already used, so replaying the same history yields
//! the same strategy.

use serde::{Deserialize, Serialize};

use crate::core::types::{RecoveryDecision, RecoveryStrategy, Verdict};
use crate::error::FailureKind;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// What went wrong in the stage attempt being recovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    /// The invocation itself failed.
    Invocation(FailureKind),
    /// The gate returned `FAIL`.
    GateRejected,
    /// The gate returned `CONCERNS`.
    GateConcerns,
}

impl Failure {
    /// Failure implied by a gate verdict, if any.
    pub fn from_verdict(verdict: Verdict) -> Option<Self> {
        match verdict {
            Verdict::Fail => Some(Self::GateRejected),
            Verdict::Concerns => Some(Self::GateConcerns),
            Verdict::Pass | Verdict::Waived => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StagePolicy {
    /// A rejected critical stage aborts the workflow.
    pub critical: bool,
    /// A rejected skippable stage is skipped instead of escalated.
    pub skippable: bool,
    pub max_attempts: u32,
}

impl Default for StagePolicy {
    fn default() -> Self {
        Self {
            critical: false,
            skippable: false,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// Decisions already taken for one stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StageHistory {
    decisions: Vec<RecoveryDecision>,
}

impl StageHistory {
    pub fn record(&mut self, decision: RecoveryDecision) {
        self.decisions.push(decision);
    }

    pub fn retries(&self) -> u32 {
        let count = self
            .decisions
            .iter()
            .filter(|d| d.strategy == RecoveryStrategy::Retry)
            .count();
        u32::try_from(count).unwrap_or(u32::MAX)
    }

    /// Forget retries, e.g. after an operator asks for a fresh attempt.
    pub fn reset(&mut self) {
        self.decisions.clear();
    }
}

/// Choose how to recover from `failure`.
///
/// Transient invocation failures retry while attempts remain, then escalate.
/// Fatal invocation failures abort. A gate rejection aborts critical stages,
/// skips skippable ones and escalates the rest. Concerns retry like
/// transient failures.
pub fn decide(failure: Failure, policy: &StagePolicy, history: &StageHistory) -> RecoveryDecision {
    let attempt = history.retries().saturating_add(1);
    let max_attempts = policy.max_attempts.max(1);
    let retry_or_escalate = if attempt < max_attempts {
        RecoveryStrategy::Retry
    } else {
        RecoveryStrategy::Escalate
    };

    let strategy = match failure {
        Failure::Invocation(kind) if kind.is_retryable() => retry_or_escalate,
        Failure::Invocation(_) => RecoveryStrategy::Abort,
        Failure::GateRejected if policy.critical => RecoveryStrategy::Abort,
        Failure::GateRejected if policy.skippable => RecoveryStrategy::Skip,
        Failure::GateRejected => RecoveryStrategy::Escalate,
        Failure::GateConcerns => retry_or_escalate,
    };

    RecoveryDecision {
        strategy,
        attempt,
        max_attempts,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn history_with_retries(n: u32) -> StageHistory {
        let mut history = StageHistory::default();
        for attempt in 1..=n {
            history.record(RecoveryDecision {
                strategy: RecoveryStrategy::Retry,
                attempt,
                max_attempts: 3,
            });
        }
        history
    }

    #[test]
    fn transient_failures_retry_until_bound_then_escalate() {
        let policy = StagePolicy::default();
        let kinds = [FailureKind::DispatchFailure, FailureKind::Timeout];
        for kind in kinds {
            let failure = Failure::Invocation(kind);
            assert_eq!(
                decide(failure, &policy, &history_with_retries(0)).strategy,
                RecoveryStrategy::Retry
            );
            assert_eq!(
                decide(failure, &policy, &history_with_retries(1)).strategy,
                RecoveryStrategy::Retry
            );
            let last = decide(failure, &policy, &history_with_retries(2));
            assert_eq!(last.strategy, RecoveryStrategy::Escalate);
            assert_eq!(last.attempt, 3);
        }
    }

    #[test]
    fn fatal_invocation_failures_abort() {
        let policy = StagePolicy::default();
        for kind in [
            FailureKind::InvalidArgument,
            FailureKind::LauncherNotFound,
            FailureKind::UnsupportedPlatform,
            FailureKind::Artifact,
        ] {
            let decision = decide(Failure::Invocation(kind), &policy, &StageHistory::default());
            assert_eq!(decision.strategy, RecoveryStrategy::Abort, "{kind}");
        }
    }

    #[test]
    fn rejected_critical_stage_aborts() {
        let policy = StagePolicy {
            critical: true,
            skippable: true,
            ..StagePolicy::default()
        };
        let decision = decide(Failure::GateRejected, &policy, &StageHistory::default());
        assert_eq!(decision.strategy, RecoveryStrategy::Abort);
    }

    #[test]
    fn rejected_skippable_stage_skips_and_plain_stage_escalates() {
        let skippable = StagePolicy {
            skippable: true,
            ..StagePolicy::default()
        };
        assert_eq!(
            decide(Failure::GateRejected, &skippable, &StageHistory::default()).strategy,
            RecoveryStrategy::Skip
        );
        assert_eq!(
            decide(
                Failure::GateRejected,
                &StagePolicy::default(),
                &StageHistory::default()
            )
            .strategy,
            RecoveryStrategy::Escalate
        );
    }

    #[test]
    fn concerns_retry_then_escalate() {
        let policy = StagePolicy {
            max_attempts: 2,
            ..StagePolicy::default()
        };
        assert_eq!(
            decide(Failure::GateConcerns, &policy, &history_with_retries(0)).strategy,
            RecoveryStrategy::Retry
        );
        assert_eq!(
            decide(Failure::GateConcerns, &policy, &history_with_retries(1)).strategy,
            RecoveryStrategy::Escalate
        );
    }

    #[test]
    fn zero_max_attempts_behaves_like_one() {
        let policy = StagePolicy {
            max_attempts: 0,
            ..StagePolicy::default()
        };
        let decision = decide(
            Failure::Invocation(FailureKind::Timeout),
            &policy,
            &StageHistory::default(),
        );
        assert_eq!(decision.strategy, RecoveryStrategy::Escalate);
        assert_eq!(decision.max_attempts, 1);
    }

    #[test]
    fn accepted_verdicts_are_not_failures() {
        assert_eq!(Failure::from_verdict(Verdict::Pass), None);
        assert_eq!(Failure::from_verdict(Verdict::Waived), None);
        assert_eq!(
            Failure::from_verdict(Verdict::Fail),
            Some(Failure::GateRejected)
        );
    }
}
