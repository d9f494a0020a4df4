//! Stable exit codes for conductor CLI commands.

/// Command succeeded, or the workflow completed (with or without skips).
pub const OK: i32 = 0;
/// Command failed due to invalid config, workflow definition, or other errors.
pub const INVALID: i32 = 1;
/// The workflow was aborted by the recovery policy.
pub const ABORTED: i32 = 2;
/// The workflow escalated and is waiting for a human decision.
pub const AWAITING_INPUT: i32 = 3;
/// A single `dispatch` invocation exhausted its attempts.
pub const DISPATCH_FAILED: i32 = 4;
