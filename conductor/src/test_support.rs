//! Test-only launchers, worker scripts and notification sinks.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{Result, anyhow};

use crate::error::DispatchError;
use crate::io::artifacts;
use crate::io::config::ConductorConfig;
use crate::io::launcher::{LaunchHandle, LaunchRequest, Launcher};
use crate::io::notifier::{NotifySink, TransitionEvent};

/// Temp directory plus a fast-polling config rooted in it.
pub struct Sandbox {
    pub dir: tempfile::TempDir,
    pub config: ConductorConfig,
}

impl Sandbox {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = ConductorConfig {
            output_dir: Some(dir.path().join("artifacts")),
            state_dir: dir.path().join("state"),
            timeout_ms: 2_000,
            retries: 1,
            poll_interval_ms: 10,
            retry_delay_ms: 1,
            ..ConductorConfig::default()
        };
        Self { dir, config }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

impl Default for Sandbox {
    fn default() -> Self {
        Self::new()
    }
}

/// What a scripted launch does.
#[derive(Debug, Clone)]
pub enum LaunchBehavior {
    /// Write `output` after `delay`, then clear the sentinel.
    Complete { output: String, delay: Duration },
    /// Clear the sentinel without writing output.
    CompleteWithoutOutput,
    /// Copy the context artifact into the output.
    EchoContext,
    /// Fail to dispatch with a transient error.
    Fail(String),
    /// Fail as if the launcher script were absent.
    MissingLauncher,
    /// Create the sentinel and never clear it.
    Hang,
}

impl LaunchBehavior {
    pub fn complete(output: &str) -> Self {
        Self::complete_after(output, Duration::ZERO)
    }

    pub fn complete_after(output: &str, delay: Duration) -> Self {
        Self::Complete {
            output: output.to_string(),
            delay,
        }
    }
}

/// Launcher that plays back behaviors in order, repeating the last one.
#[derive(Debug)]
pub struct ScriptedLauncher {
    behaviors: Mutex<VecDeque<LaunchBehavior>>,
    requests: Mutex<Vec<LaunchRequest>>,
}

impl ScriptedLauncher {
    pub fn new(behaviors: Vec<LaunchBehavior>) -> Self {
        Self {
            behaviors: Mutex::new(behaviors.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<LaunchRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn launch_count(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or_default()
    }

    fn next_behavior(&self) -> Option<LaunchBehavior> {
        let mut queue = self.behaviors.lock().ok()?;
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }
}

impl Launcher for ScriptedLauncher {
    fn launch(&self, request: &LaunchRequest) -> Result<LaunchHandle, DispatchError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        let behavior = self
            .next_behavior()
            .ok_or_else(|| DispatchError::DispatchFailure("no scripted behavior".into()))?;

        let handle = LaunchHandle {
            output_ref: request.output_path.clone(),
            lock_ref: request.lock_path.clone(),
        };
        let lock = |req: &LaunchRequest| {
            artifacts::create_lock(&req.lock_path, &req.invocation_id)
                .map_err(|err| DispatchError::DispatchFailure(format!("{err:#}")))
        };

        match behavior {
            LaunchBehavior::Fail(message) => Err(DispatchError::DispatchFailure(message)),
            LaunchBehavior::MissingLauncher => Err(DispatchError::LauncherNotFound(
                PathBuf::from("scripts/launch-worker.sh"),
            )),
            LaunchBehavior::Hang => {
                lock(request)?;
                Ok(handle)
            }
            LaunchBehavior::CompleteWithoutOutput => Ok(handle),
            LaunchBehavior::EchoContext => {
                let context = request
                    .context_path
                    .as_ref()
                    .and_then(|path| fs::read_to_string(path).ok())
                    .unwrap_or_default();
                fs::write(&request.output_path, context)
                    .map_err(|err| DispatchError::DispatchFailure(err.to_string()))?;
                Ok(handle)
            }
            LaunchBehavior::Complete { output, delay } => {
                lock(request)?;
                let output_path = request.output_path.clone();
                let lock_path = request.lock_path.clone();
                thread::spawn(move || {
                    thread::sleep(delay);
                    let _ = fs::write(&output_path, output);
                    let _ = fs::remove_file(&lock_path);
                });
                Ok(handle)
            }
        }
    }
}

/// Write a launcher script that backgrounds a worker which writes `output`
/// after `delay_secs` and then clears its sentinel.
#[cfg(unix)]
pub fn write_worker_script(dir: &Path, output: &str, delay_secs: f32) -> PathBuf {
    let script = dir.join("launch-worker.sh");
    let body = format!(
        "#!/usr/bin/env bash\n\
         set -euo pipefail\n\
         ( sleep {delay_secs}; printf '%s' '{output}' > \"$CONDUCTOR_OUTPUT_FILE\"; rm -f \"$CONDUCTOR_LOCK_FILE\" ) >/dev/null 2>&1 &\n\
         echo \"$CONDUCTOR_OUTPUT_FILE\"\n"
    );
    fs::write(&script, body).expect("write worker script");
    script
}

/// Write a launcher script with an arbitrary body.
pub fn write_launcher_script(dir: &Path, body: &str) -> PathBuf {
    let script = dir.join("launch-worker.sh");
    fs::write(&script, format!("#!/usr/bin/env bash\n{body}\n")).expect("write launcher script");
    script
}

/// File names of conductor artifacts in `dir`, sorted.
pub fn artifact_names(dir: &Path) -> Vec<String> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut names: Vec<String> = entries
        .flatten()
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|name| name.starts_with("conductor-"))
        .collect();
    names.sort();
    names
}

/// Sink that keeps every event in memory.
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    events: Arc<Mutex<Vec<TransitionEvent>>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<TransitionEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl NotifySink for RecordingSink {
    fn notify(&mut self, event: &TransitionEvent) -> Result<()> {
        self.events
            .lock()
            .map_err(|_| anyhow!("recording sink poisoned"))?
            .push(event.clone());
        Ok(())
    }
}

/// Sink that rejects every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailingSink;

impl NotifySink for FailingSink {
    fn notify(&mut self, _event: &TransitionEvent) -> Result<()> {
        Err(anyhow!("sink unavailable"))
    }
}
