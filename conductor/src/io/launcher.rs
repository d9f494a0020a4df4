//! Launcher abstraction for worker dispatch.
//!
//! The [`Launcher`] trait decouples the invoker from how workers are started.
//! [`ScriptLauncher`] runs the configured shell script, which opens a
//! detached terminal or background process and returns immediately. Tests use
//! scripted launchers that complete in-process.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::core::ident::validate_identifier;
use crate::error::DispatchError;
use crate::io::artifacts::{self, lock_path_for};
use crate::io::config::ConductorConfig;
use crate::io::process::run_bounded;

/// Captured launcher stdout/stderr is capped at this many bytes.
const LAUNCHER_OUTPUT_LIMIT_BYTES: usize = 64 * 1024;

/// One dispatch attempt.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub invocation_id: String,
    pub worker_id: String,
    pub task_name: String,
    /// Extra positional arguments, passed through verbatim.
    pub params: Vec<String>,
    pub context_path: Option<PathBuf>,
    /// Where the worker is expected to write its output.
    pub output_path: PathBuf,
    /// Sentinel created before spawn; the worker removes it when done.
    pub lock_path: PathBuf,
    /// Upper bound on how long the launcher itself may run.
    pub timeout: Duration,
}

/// Where to look for the worker's result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchHandle {
    pub output_ref: PathBuf,
    pub lock_ref: PathBuf,
}

/// Abstraction over worker dispatch backends.
pub trait Launcher {
    /// Start the worker and return without waiting for it to finish.
    ///
    /// The returned `lock_ref` must exist while the worker runs. A launcher
    /// that reports its own output path takes over the sentinel: by the time
    /// `launch` returns, either the lock derived from that path or the output
    /// itself must be on disk.
    fn launch(&self, request: &LaunchRequest) -> Result<LaunchHandle, DispatchError>;
}

impl<L: Launcher + ?Sized> Launcher for &L {
    fn launch(&self, request: &LaunchRequest) -> Result<LaunchHandle, DispatchError> {
        (**self).launch(request)
    }
}

/// Host platform name: `macos`, `linux`, `windows` or `unknown`.
pub fn platform() -> &'static str {
    platform_name(std::env::consts::OS)
}

fn platform_name(os: &str) -> &'static str {
    match os {
        "macos" => "macos",
        "linux" => "linux",
        "windows" => "windows",
        _ => "unknown",
    }
}

/// Whether workers can be dispatched on this host.
pub fn is_dispatch_available() -> bool {
    platform() != "unknown"
}

/// Launcher that runs `bash <script> <worker> <task> [params...] [--context <path>]`.
#[derive(Debug, Clone)]
pub struct ScriptLauncher {
    pub script: PathBuf,
    pub output_dir: PathBuf,
    pub debug: bool,
}

impl ScriptLauncher {
    pub fn from_config(config: &ConductorConfig) -> Self {
        Self {
            script: config.launcher.clone(),
            output_dir: config.output_dir(),
            debug: config.debug,
        }
    }

    fn command(&self, request: &LaunchRequest) -> Command {
        let mut cmd = Command::new("bash");
        cmd.arg(&self.script)
            .arg(&request.worker_id)
            .arg(&request.task_name)
            .args(&request.params);
        if let Some(context) = &request.context_path {
            cmd.arg("--context").arg(context);
        }
        cmd.env("CONDUCTOR_DEBUG", if self.debug { "true" } else { "false" })
            .env("CONDUCTOR_OUTPUT_DIR", &self.output_dir)
            .env("CONDUCTOR_OUTPUT_FILE", &request.output_path)
            .env("CONDUCTOR_LOCK_FILE", &request.lock_path);
        cmd
    }
}

impl Launcher for ScriptLauncher {
    #[instrument(skip_all, fields(
        invocation = %request.invocation_id,
        worker = %request.worker_id,
        task = %request.task_name,
    ))]
    fn launch(&self, request: &LaunchRequest) -> Result<LaunchHandle, DispatchError> {
        validate_identifier("worker id", &request.worker_id)?;
        validate_identifier("task name", &request.task_name)?;
        if !is_dispatch_available() {
            return Err(DispatchError::UnsupportedPlatform(
                std::env::consts::OS.to_string(),
            ));
        }
        if !self.script.is_file() {
            return Err(DispatchError::LauncherNotFound(self.script.clone()));
        }

        artifacts::create_lock(&request.lock_path, &request.invocation_id)
            .map_err(|err| DispatchError::DispatchFailure(format!("{err:#}")))?;
        debug!(lock = %request.lock_path.display(), "lock sentinel created");

        let output = match run_bounded(
            self.command(request),
            request.timeout,
            LAUNCHER_OUTPUT_LIMIT_BYTES,
        ) {
            Ok(output) => output,
            Err(err) => {
                release_lock(&request.lock_path);
                return Err(DispatchError::DispatchFailure(format!("{err:#}")));
            }
        };
        if let Err(err) = output.check_launch() {
            release_lock(&request.lock_path);
            return Err(err);
        }

        let handle = resolve_handle(&output.stdout_lossy(), request)?;
        info!(output = %handle.output_ref.display(), "worker launched");
        Ok(handle)
    }
}

/// Pick the output reference from launcher stdout, falling back to the
/// expected path when nothing was printed.
///
/// Runs after the launcher has exited, so a reported path with neither its
/// lock nor its output present can never be tracked.
fn resolve_handle(stdout: &str, request: &LaunchRequest) -> Result<LaunchHandle, DispatchError> {
    let printed = stdout.trim();
    if printed.is_empty() || Path::new(printed) == request.output_path {
        return Ok(LaunchHandle {
            output_ref: request.output_path.clone(),
            lock_ref: request.lock_path.clone(),
        });
    }

    // The worker reports elsewhere; our sentinel would never be cleared.
    release_lock(&request.lock_path);
    let output_ref = PathBuf::from(printed);
    let lock_ref = lock_path_for(&output_ref);
    if !lock_ref.exists() && !output_ref.exists() {
        return Err(DispatchError::DispatchFailure(format!(
            "launcher reported {} but created no sentinel at {}",
            output_ref.display(),
            lock_ref.display()
        )));
    }
    debug!(
        output = %output_ref.display(),
        lock = %lock_ref.display(),
        "launcher reported a different output path"
    );
    Ok(LaunchHandle {
        output_ref,
        lock_ref,
    })
}

fn release_lock(path: &Path) {
    if let Err(err) = artifacts::remove_if_exists(path) {
        warn!(err = %format!("{err:#}"), "failed to remove lock sentinel");
    }
}
