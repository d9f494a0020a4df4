//! Filesystem artifacts exchanged with workers.
//!
//! Every invocation owns a context file, and every attempt owns an output
//! file plus a lock sentinel:
//!
//! - `conductor-context-<id>.json`
//! - `conductor-output-<id>-<attempt>.md`
//! - `conductor-lock-<id>-<attempt>.md`
//!
//! Names are namespaced by invocation id so concurrent workflows sharing a
//! directory never collide.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use jsonschema::validator_for;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

const CONTEXT_SCHEMA: &str = include_str!("../../schemas/context_artifact.schema.json");

pub const CONTEXT_PREFIX: &str = "conductor-context-";
pub const OUTPUT_PREFIX: &str = "conductor-output-";
pub const LOCK_PREFIX: &str = "conductor-lock-";

/// Task context handed to a worker. Written once, read-only afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextArtifact {
    pub story: Option<String>,
    pub files: Vec<String>,
    pub instructions: Option<String>,
    pub metadata: BTreeMap<String, Value>,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

/// Millisecond timestamp plus a random fragment, e.g. `1760600000000-3f9a1c2e`.
pub fn new_invocation_id() -> String {
    let fragment = Uuid::new_v4().simple().to_string();
    format!("{}-{}", Utc::now().timestamp_millis(), &fragment[..8])
}

pub fn context_path(dir: &Path, invocation_id: &str) -> PathBuf {
    dir.join(format!("{CONTEXT_PREFIX}{invocation_id}.json"))
}

pub fn output_path(dir: &Path, invocation_id: &str, attempt: u32) -> PathBuf {
    dir.join(format!("{OUTPUT_PREFIX}{invocation_id}-{attempt}.md"))
}

/// Lock sentinel paired with an output path.
///
/// Replaces the first `output` in the file name with `lock`; names without it
/// get a `.lock` suffix. Directory components are never rewritten.
pub fn lock_path_for(output: &Path) -> PathBuf {
    let name = output
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let lock_name = if name.contains("output") {
        name.replacen("output", "lock", 1)
    } else {
        format!("{name}.lock")
    };
    output.with_file_name(lock_name)
}

/// Write a context artifact. Fails if the file already exists.
#[instrument(skip_all, fields(path = %path.display()))]
pub fn write_context(path: &Path, artifact: &ContextArtifact) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create context dir {}", parent.display()))?;
    }
    let mut buf = serde_json::to_string_pretty(artifact).context("serialize context")?;
    buf.push('\n');
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .with_context(|| format!("create context {}", path.display()))?;
    file.write_all(buf.as_bytes())
        .with_context(|| format!("write context {}", path.display()))?;
    debug!(files = artifact.files.len(), "context written");
    Ok(())
}

/// Read a context artifact, validating it against the embedded schema.
pub fn read_context(path: &Path) -> Result<ContextArtifact> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read context {}", path.display()))?;
    let value: Value = serde_json::from_str(&contents)
        .with_context(|| format!("parse context {}", path.display()))?;
    validate_context(&value)?;
    serde_json::from_value(value).with_context(|| format!("deserialize context {}", path.display()))
}

fn validate_context(value: &Value) -> Result<()> {
    let schema: Value = serde_json::from_str(CONTEXT_SCHEMA).context("parse context schema")?;
    let compiled = validator_for(&schema).map_err(|err| anyhow!("invalid schema: {}", err))?;
    if !compiled.is_valid(value) {
        let messages = compiled
            .iter_errors(value)
            .map(|err| err.to_string())
            .collect::<Vec<_>>();
        return Err(anyhow!(
            "context schema validation failed: {}",
            messages.join("; ")
        ));
    }
    Ok(())
}

/// Create the lock sentinel for an attempt.
pub fn create_lock(path: &Path, invocation_id: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create lock dir {}", parent.display()))?;
    }
    fs::write(path, format!("{invocation_id}\n"))
        .with_context(|| format!("create lock {}", path.display()))
}

/// Remove a file, treating "already gone" as success. Returns whether a file
/// was removed.
pub fn remove_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err).with_context(|| format!("remove {}", path.display())),
    }
}

/// Remove conductor artifacts in `dir` older than `max_age`.
///
/// Errors on individual entries, or on the directory itself, are logged and
/// skipped. Returns how many files were removed.
#[instrument(skip_all, fields(dir = %dir.display(), max_age_secs = max_age.as_secs()))]
pub fn sweep_stale_artifacts(dir: &Path, max_age: Duration) -> usize {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            warn!(err = %err, "cannot read artifact dir");
            return 0;
        }
    };
    let now = SystemTime::now();
    let mut removed = 0usize;

    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if ![CONTEXT_PREFIX, OUTPUT_PREFIX, LOCK_PREFIX]
            .iter()
            .any(|prefix| name.starts_with(prefix))
        {
            continue;
        }
        let age = entry
            .metadata()
            .and_then(|meta| meta.modified())
            .ok()
            .and_then(|modified| now.duration_since(modified).ok());
        let Some(age) = age else {
            continue;
        };
        if age <= max_age {
            continue;
        }
        match fs::remove_file(entry.path()) {
            Ok(()) => {
                debug!(file = %name, age_secs = age.as_secs(), "removed stale artifact");
                removed += 1;
            }
            Err(err) => warn!(file = %name, err = %err, "failed to remove stale artifact"),
        }
    }

    debug!(removed, "sweep finished");
    removed
}
