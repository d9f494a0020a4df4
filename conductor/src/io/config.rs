//! Conductor configuration stored as TOML (default `conductor.toml`).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Conductor configuration (TOML).
///
/// Passed explicitly to the invoker and orchestrator at construction. Missing
/// fields fall back to the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ConductorConfig {
    /// How long to wait for a worker to remove its lock sentinel.
    pub timeout_ms: u64,

    /// Total dispatch attempts per invocation.
    pub retries: u32,

    /// Sleep between sentinel checks.
    pub poll_interval_ms: u64,

    /// Base delay between attempts; attempt `n` waits `n * retry_delay_ms`.
    pub retry_delay_ms: u64,

    /// Directory for context, output and lock artifacts. Defaults to the
    /// platform temp dir when unset.
    pub output_dir: Option<PathBuf>,

    /// Forwarded to the launcher as `CONDUCTOR_DEBUG`.
    pub debug: bool,

    /// Launcher script run as `bash <launcher> <worker> <task> ...`.
    pub launcher: PathBuf,

    /// Artifacts older than this are removed by the sweeper.
    pub sweep_max_age_secs: u64,

    /// Where workflow reports are written.
    pub state_dir: PathBuf,

    pub notify: NotifyConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NotifyConfig {
    /// Append one JSON line per orchestrator transition to this file.
    pub events_path: Option<PathBuf>,
}

impl Default for ConductorConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 300_000,
            retries: 3,
            poll_interval_ms: 500,
            retry_delay_ms: 1_000,
            output_dir: None,
            debug: false,
            launcher: PathBuf::from("scripts/launch-worker.sh"),
            sweep_max_age_secs: 60 * 60,
            state_dir: PathBuf::from(".conductor"),
            notify: NotifyConfig::default(),
        }
    }
}

impl ConductorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.timeout_ms == 0 {
            return Err(anyhow!("timeout_ms must be > 0"));
        }
        if self.retries == 0 {
            return Err(anyhow!("retries must be > 0"));
        }
        if self.poll_interval_ms == 0 {
            return Err(anyhow!("poll_interval_ms must be > 0"));
        }
        if self.launcher.as_os_str().is_empty() {
            return Err(anyhow!("launcher must be a non-empty path"));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn sweep_max_age(&self) -> Duration {
        Duration::from_secs(self.sweep_max_age_secs)
    }

    /// Resolved artifact directory.
    pub fn output_dir(&self) -> PathBuf {
        self.output_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `ConductorConfig::default()`.
pub fn load_config(path: &Path) -> Result<ConductorConfig> {
    if !path.exists() {
        let cfg = ConductorConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: ConductorConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &ConductorConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    super::write_atomic(path, &buf)
}
