//! Invocation controller: dispatch, await completion, retry.
//!
//! [`Invoker::invoke`] never returns an error. Every failure is folded into
//! an [`InvocationResult`] with `success = false`, so callers branch on the
//! result instead of unwinding.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::backoff::retry_delay;
use crate::core::ident::validate_identifier;
use crate::core::types::{Invocation, InvocationStatus};
use crate::error::{DispatchError, FailureKind};
use crate::io::artifacts::{self, ContextArtifact};
use crate::io::config::ConductorConfig;
use crate::io::launcher::{LaunchHandle, LaunchRequest, Launcher};
use crate::io::watcher::{WorkerOutput, await_completion};

/// Task context to hand to the worker.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContextData {
    pub story: Option<String>,
    pub files: Vec<String>,
    pub instructions: Option<String>,
    pub metadata: BTreeMap<String, Value>,
}

/// Per-call overrides.
#[derive(Debug, Clone, Default)]
pub struct InvokeOptions {
    /// Extra launcher arguments, passed verbatim.
    pub params: Vec<String>,
    pub context: Option<ContextData>,
    pub timeout: Option<Duration>,
    pub retries: Option<u32>,
}

/// Outcome of one invocation across all its attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvocationResult {
    pub invocation_id: String,
    pub success: bool,
    pub output: Option<String>,
    pub output_ref: Option<PathBuf>,
    /// False when the worker finished without writing output.
    pub output_captured: bool,
    pub duration_ms: u64,
    pub attempts: u32,
    /// Message of the last failure.
    pub error: Option<String>,
    pub error_kind: Option<FailureKind>,
}

/// Removes the context artifact when the invocation ends, however it ends.
struct ContextGuard {
    path: PathBuf,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        match artifacts::remove_if_exists(&self.path) {
            Ok(_) => debug!(path = %self.path.display(), "context artifact removed"),
            Err(err) => warn!(err = %format!("{err:#}"), "failed to remove context artifact"),
        }
    }
}

pub struct Invoker<L: Launcher> {
    launcher: L,
    config: ConductorConfig,
}

impl<L: Launcher> Invoker<L> {
    pub fn new(launcher: L, config: ConductorConfig) -> Self {
        Self { launcher, config }
    }

    pub fn config(&self) -> &ConductorConfig {
        &self.config
    }

    /// Dispatch `task` to `worker` and wait for its output.
    ///
    /// Makes up to `retries` attempts. Transient failures back off
    /// `attempt × retry_delay` between attempts; fatal ones stop at once.
    #[instrument(skip_all, fields(worker = %worker, task = %task))]
    pub fn invoke(&self, worker: &str, task: &str, options: &InvokeOptions) -> InvocationResult {
        let started = Instant::now();
        let timeout = options.timeout.unwrap_or_else(|| self.config.timeout());
        let retries = options.retries.unwrap_or(self.config.retries).max(1);
        let mut invocation = Invocation::new(
            artifacts::new_invocation_id(),
            worker,
            task,
            duration_ms(timeout),
        );

        if let Err(err) = validate_identifier("worker id", worker)
            .and_then(|()| validate_identifier("task name", task))
        {
            warn!(err = %err, "rejected invocation");
            advance(&mut invocation, InvocationStatus::Failed);
            return failure_result(&invocation, started, err.to_string(), err.kind());
        }

        let output_dir = self.config.output_dir();
        let _context_guard = match &options.context {
            Some(data) => match write_context_artifact(&output_dir, &invocation.id, data) {
                Ok(guard) => {
                    invocation.context_ref = Some(guard.path.clone());
                    Some(guard)
                }
                Err(err) => {
                    warn!(err = %format!("{err:#}"), "failed to write context artifact");
                    advance(&mut invocation, InvocationStatus::Failed);
                    return failure_result(
                        &invocation,
                        started,
                        format!("{err:#}"),
                        FailureKind::Artifact,
                    );
                }
            },
            None => None,
        };

        let mut last_error: Option<DispatchError> = None;
        for attempt in 1..=retries {
            advance(&mut invocation, InvocationStatus::Running);
            match self.attempt(&invocation, &output_dir, options, timeout) {
                Ok((handle, output)) => {
                    advance(&mut invocation, InvocationStatus::Succeeded);
                    let output_captured = output.is_captured();
                    info!(
                        invocation = %invocation.id,
                        attempt,
                        output_captured,
                        "invocation succeeded"
                    );
                    return InvocationResult {
                        invocation_id: invocation.id.clone(),
                        success: true,
                        output: Some(output.into_text()),
                        output_ref: Some(handle.output_ref),
                        output_captured,
                        duration_ms: elapsed_ms(started),
                        attempts: invocation.attempt,
                        error: None,
                        error_kind: None,
                    };
                }
                Err(err) => {
                    warn!(invocation = %invocation.id, attempt, retries, err = %err, "attempt failed");
                    let stop = !err.is_retryable() || attempt == retries;
                    last_error = Some(err);
                    if stop {
                        break;
                    }
                    advance(&mut invocation, InvocationStatus::Retrying);
                    let delay = retry_delay(attempt, self.config.retry_delay());
                    debug!(delay_ms = duration_ms(delay), "backing off before retry");
                    thread::sleep(delay);
                }
            }
        }

        advance(&mut invocation, InvocationStatus::Failed);
        let (message, kind) = match last_error {
            Some(err) => (err.to_string(), err.kind()),
            None => (
                "no attempt was made".to_string(),
                FailureKind::DispatchFailure,
            ),
        };
        failure_result(&invocation, started, message, kind)
    }

    fn attempt(
        &self,
        invocation: &Invocation,
        output_dir: &Path,
        options: &InvokeOptions,
        timeout: Duration,
    ) -> Result<(LaunchHandle, WorkerOutput), DispatchError> {
        let output_path = artifacts::output_path(output_dir, &invocation.id, invocation.attempt);
        let request = LaunchRequest {
            invocation_id: invocation.id.clone(),
            worker_id: invocation.worker_id.clone(),
            task_name: invocation.task_name.clone(),
            params: options.params.clone(),
            context_path: invocation.context_ref.clone(),
            lock_path: artifacts::lock_path_for(&output_path),
            output_path,
            timeout,
        };
        let handle = self.launcher.launch(&request)?;
        let output = await_completion(
            &handle.output_ref,
            &handle.lock_ref,
            timeout,
            self.config.poll_interval(),
        )?;
        Ok((handle, output))
    }
}

fn write_context_artifact(
    dir: &Path,
    invocation_id: &str,
    data: &ContextData,
) -> anyhow::Result<ContextGuard> {
    let guard = ContextGuard {
        path: artifacts::context_path(dir, invocation_id),
    };
    let artifact = ContextArtifact {
        story: data.story.clone(),
        files: data.files.clone(),
        instructions: data.instructions.clone(),
        metadata: data.metadata.clone(),
        created_at: Utc::now(),
    };
    artifacts::write_context(&guard.path, &artifact)?;
    Ok(guard)
}

/// Status changes here follow the lifecycle by construction; a rejected one
/// is a bug worth logging but not worth failing the invocation over.
fn advance(invocation: &mut Invocation, next: InvocationStatus) {
    if let Err(err) = invocation.transition(next) {
        warn!(invocation = %invocation.id, err = %err, "unexpected status transition");
    }
}

fn failure_result(
    invocation: &Invocation,
    started: Instant,
    message: String,
    kind: FailureKind,
) -> InvocationResult {
    InvocationResult {
        invocation_id: invocation.id.clone(),
        success: false,
        output: None,
        output_ref: None,
        output_captured: false,
        duration_ms: elapsed_ms(started),
        attempts: invocation.attempt,
        error: Some(message),
        error_kind: Some(kind),
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn elapsed_ms(started: Instant) -> u64 {
    duration_ms(started.elapsed())
}
