//! Run the launcher script under a deadline and judge how it ended.
//!
//! The launcher is expected to start a worker and exit promptly. Its stdout
//! names the output file, its stderr explains failures, and anything past the
//! capture limit is drained and dropped so the child never blocks on a full
//! pipe.

use std::io::{self, Read};
use std::process::{Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

use crate::error::DispatchError;

/// How the child finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Exited(ExitStatus),
    /// Still running at the deadline; it was killed.
    TimedOut(Duration),
}

/// Captured launcher run.
#[derive(Debug)]
pub struct CommandOutput {
    pub completion: Completion,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Bytes read past the capture limit and discarded, across both streams.
    pub dropped_bytes: u64,
}

impl CommandOutput {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Last non-empty stderr line, for error messages.
    pub fn stderr_tail(&self) -> Option<String> {
        String::from_utf8_lossy(&self.stderr)
            .lines()
            .rev()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(str::to_string)
    }

    /// A launch succeeded only if the script exited zero before the deadline.
    pub fn check_launch(&self) -> Result<(), DispatchError> {
        match self.completion {
            Completion::Exited(status) if status.success() => Ok(()),
            Completion::Exited(status) => {
                let detail = self
                    .stderr_tail()
                    .map(|line| format!(": {line}"))
                    .unwrap_or_default();
                Err(DispatchError::DispatchFailure(format!(
                    "launcher exited with status {:?}{detail}",
                    status.code()
                )))
            }
            Completion::TimedOut(limit) => Err(DispatchError::DispatchFailure(format!(
                "launcher did not exit within {}ms",
                limit.as_millis()
            ))),
        }
    }
}

/// Run `cmd` with stdin closed, killing it if it outlives `timeout`.
///
/// Errors cover only spawning and waiting; how the child ended is reported
/// through [`CommandOutput::completion`].
#[instrument(skip_all, fields(timeout_ms = timeout.as_millis() as u64))]
pub fn run_bounded(mut cmd: Command, timeout: Duration, capture_limit: usize) -> Result<CommandOutput> {
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .context("spawn launcher")?;

    let stdout = spawn_drain(child.stdout.take(), capture_limit)?;
    let stderr = spawn_drain(child.stderr.take(), capture_limit)?;

    let completion = match child.wait_timeout(timeout).context("wait for launcher")? {
        Some(status) => Completion::Exited(status),
        None => {
            warn!("launcher still running at deadline, killing");
            child.kill().context("kill launcher")?;
            child.wait().context("reap launcher")?;
            Completion::TimedOut(timeout)
        }
    };

    let (stdout, stdout_dropped) = join_drain(stdout).context("collect stdout")?;
    let (stderr, stderr_dropped) = join_drain(stderr).context("collect stderr")?;
    let dropped_bytes = stdout_dropped + stderr_dropped;
    if dropped_bytes > 0 {
        warn!(dropped_bytes, "launcher output exceeded capture limit");
    }

    debug!(?completion, "launcher finished");
    Ok(CommandOutput {
        completion,
        stdout,
        stderr,
        dropped_bytes,
    })
}

type Drain = JoinHandle<io::Result<(Vec<u8>, u64)>>;

fn spawn_drain<R: Read + Send + 'static>(stream: Option<R>, limit: usize) -> Result<Drain> {
    let stream = stream.ok_or_else(|| anyhow!("launcher stream was not piped"))?;
    Ok(thread::spawn(move || {
        let mut kept = stream.take(limit as u64);
        let mut buf = Vec::new();
        kept.read_to_end(&mut buf)?;
        let dropped = io::copy(&mut kept.into_inner(), &mut io::sink())?;
        Ok((buf, dropped))
    }))
}

fn join_drain(handle: Drain) -> Result<(Vec<u8>, u64)> {
    handle
        .join()
        .map_err(|_| anyhow!("output reader thread panicked"))?
        .context("read launcher output")
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn zero_exit_is_a_launch() {
        let output = run_bounded(sh("printf '/tmp/out.md\\n'"), Duration::from_secs(5), 1024)
            .expect("run");
        assert!(output.check_launch().is_ok());
        assert_eq!(output.stdout_lossy().trim(), "/tmp/out.md");
    }

    /// Non-zero exits carry the status and the last stderr line.
    #[test]
    fn failed_exit_reports_stderr_tail() {
        let output = run_bounded(
            sh("echo first >&2; echo 'no terminal' >&2; exit 3"),
            Duration::from_secs(5),
            1024,
        )
        .expect("run");
        let err = output.check_launch().unwrap_err();
        assert!(err.is_retryable());
        let message = err.to_string();
        assert!(message.contains("Some(3)"), "{message}");
        assert!(message.ends_with("no terminal"), "{message}");
    }

    #[test]
    fn output_past_limit_is_dropped_not_blocking() {
        let output =
            run_bounded(sh("head -c 200000 /dev/zero"), Duration::from_secs(5), 4).expect("run");
        assert_eq!(output.stdout.len(), 4);
        assert_eq!(output.dropped_bytes, 199_996);
        assert!(output.check_launch().is_ok());
    }

    #[test]
    fn slow_launcher_is_killed_and_rejected() {
        let output = run_bounded(sh("exec sleep 5"), Duration::from_millis(100), 1024).expect("run");
        assert_eq!(output.completion, Completion::TimedOut(Duration::from_millis(100)));
        let message = output.check_launch().unwrap_err().to_string();
        assert!(message.contains("within 100ms"), "{message}");
    }

    #[test]
    fn spawn_failure_is_an_error() {
        let err = run_bounded(
            Command::new("/definitely/not/a/binary"),
            Duration::from_secs(1),
            1024,
        )
        .unwrap_err();
        assert!(err.to_string().contains("spawn launcher"));
    }
}
