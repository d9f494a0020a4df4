//! Time budget helpers for retries and polling.

use std::time::{Duration, Instant};

/// Linear backoff: the delay after failed attempt `attempt` (1-indexed) is
/// `attempt × base`.
pub fn retry_delay(attempt: u32, base: Duration) -> Duration {
    base.saturating_mul(attempt)
}

/// Time left until `deadline`, zero once it has passed.
pub fn remaining_budget(deadline: Instant) -> Duration {
    deadline
        .checked_duration_since(Instant::now())
        .unwrap_or(Duration::ZERO)
}

/// Next poll sleep: the poll interval, cut short so a wait never overshoots
/// its deadline.
pub fn next_poll_sleep(deadline: Instant, poll_interval: Duration) -> Duration {
    poll_interval.min(remaining_budget(deadline))
}
