//! Invocation dispatch and multi-stage workflow orchestration.
//!
//! Work is handed to externally executed workers (detached processes or
//! terminals) through a launcher script. Completion is detected with a
//! lock-file protocol, results are checked against quality gates, and failures
//! are routed to a recovery policy. The layout follows a strict split:
//!
//! - **[`core`]**: Pure, deterministic logic (identifier rules, gate verdicts,
//!   recovery decisions, backoff). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (artifacts, launcher processes,
//!   completion polling, notifications, reports).
//!
//! [`invoke`] wraps dispatch and completion with retries, and [`orchestrate`]
//! drives a [`workflow`] through its stages.

pub mod core;
pub mod error;
pub mod exit_codes;
pub mod invoke;
pub mod io;
pub mod logging;
pub mod orchestrate;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod workflow;
