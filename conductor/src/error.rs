//! Typed failures at the dispatch boundary.
//!
//! Everything below the invocation controller reports failures as
//! [`DispatchError`] so the controller can tell fatal misconfiguration apart
//! from transient failures worth another attempt. [`FailureKind`] is the
//! serializable classification carried in results and reports.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("invalid {field}: {value:?} (expected a letter followed by letters, digits or '-')")]
    InvalidArgument { field: &'static str, value: String },

    #[error("launcher script not found at {}", .0.display())]
    LauncherNotFound(PathBuf),

    #[error("worker dispatch is not supported on platform '{0}'")]
    UnsupportedPlatform(String),

    #[error("dispatch failed: {0}")]
    DispatchFailure(String),

    #[error("timed out waiting for worker output after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
}

impl DispatchError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::InvalidArgument { .. } => FailureKind::InvalidArgument,
            Self::LauncherNotFound(_) => FailureKind::LauncherNotFound,
            Self::UnsupportedPlatform(_) => FailureKind::UnsupportedPlatform,
            Self::DispatchFailure(_) => FailureKind::DispatchFailure,
            Self::Timeout { .. } => FailureKind::Timeout,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

/// Classification of a failed invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    InvalidArgument,
    LauncherNotFound,
    UnsupportedPlatform,
    DispatchFailure,
    Timeout,
    /// Context artifact could not be written.
    Artifact,
}

impl FailureKind {
    /// Transient failures that another attempt may fix.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::DispatchFailure | Self::Timeout)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::InvalidArgument => "invalid_argument",
            Self::LauncherNotFound => "launcher_not_found",
            Self::UnsupportedPlatform => "unsupported_platform",
            Self::DispatchFailure => "dispatch_failure",
            Self::Timeout => "timeout",
            Self::Artifact => "artifact",
        };
        f.write_str(label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_dispatch_failure_and_timeout_are_retryable() {
        assert!(DispatchError::DispatchFailure("exit 1".into()).is_retryable());
        assert!(DispatchError::Timeout { timeout_ms: 10 }.is_retryable());
        assert!(
            !DispatchError::InvalidArgument {
                field: "worker id",
                value: "a b".into()
            }
            .is_retryable()
        );
        assert!(!DispatchError::LauncherNotFound(PathBuf::from("/nope.sh")).is_retryable());
        assert!(!DispatchError::UnsupportedPlatform("plan9".into()).is_retryable());
        assert!(!FailureKind::Artifact.is_retryable());
    }

    #[test]
    fn messages_carry_offending_values() {
        let err = DispatchError::InvalidArgument {
            field: "task name",
            value: "x;rm".into(),
        };
        assert!(err.to_string().contains("x;rm"));
        assert!(
            DispatchError::Timeout { timeout_ms: 1500 }
                .to_string()
                .contains("1500ms")
        );
    }

    #[test]
    fn failure_kind_serializes_snake_case() {
        let json = serde_json::to_string(&FailureKind::LauncherNotFound).expect("serialize");
        assert_eq!(json, "\"launcher_not_found\"");
        assert_eq!(FailureKind::Timeout.to_string(), "timeout");
    }
}
