//! Completion detection through the lock sentinel protocol.
//!
//! A worker is done once its sentinel is gone, whether it succeeded or
//! crashed. Exit codes are never consulted.

use std::fs;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, instrument, warn};

use crate::core::backoff::next_poll_sleep;
use crate::core::gate::NO_OUTPUT_CAPTURED;
use crate::error::DispatchError;
use crate::io::artifacts;

/// What a finished worker left behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerOutput {
    Captured(String),
    /// Sentinel removed but no readable output file.
    Missing,
}

impl WorkerOutput {
    pub fn is_captured(&self) -> bool {
        matches!(self, Self::Captured(_))
    }

    /// Output text, with a fixed marker when nothing was captured.
    pub fn into_text(self) -> String {
        match self {
            Self::Captured(text) => text,
            Self::Missing => NO_OUTPUT_CAPTURED.to_string(),
        }
    }
}

/// Block until `lock_ref` disappears, then read `output_ref`.
///
/// Sleeps `min(poll_interval, remaining)` between checks, so a timeout
/// returns no earlier than `timeout` and no later than `timeout + poll_interval`.
/// On timeout the sentinel is force-removed; the worker itself is left alone.
#[instrument(skip_all, fields(
    lock = %lock_ref.display(),
    timeout_ms = timeout.as_millis() as u64,
))]
pub fn await_completion(
    output_ref: &Path,
    lock_ref: &Path,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<WorkerOutput, DispatchError> {
    let started = Instant::now();
    let deadline = started + timeout;

    loop {
        if !lock_ref.exists() {
            debug!(waited_ms = started.elapsed().as_millis() as u64, "sentinel cleared");
            return Ok(read_output(output_ref));
        }
        if Instant::now() >= deadline {
            if let Err(err) = artifacts::remove_if_exists(lock_ref) {
                warn!(err = %format!("{err:#}"), "failed to clear sentinel after timeout");
            }
            warn!("worker did not finish before timeout");
            return Err(DispatchError::Timeout {
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            });
        }
        thread::sleep(next_poll_sleep(deadline, poll_interval));
    }
}

fn read_output(path: &Path) -> WorkerOutput {
    match fs::read_to_string(path) {
        Ok(text) => WorkerOutput::Captured(text),
        Err(err) => {
            warn!(output = %path.display(), err = %err, "worker finished without readable output");
            WorkerOutput::Missing
        }
    }
}
