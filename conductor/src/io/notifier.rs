//! Fire-and-forget transition notifications.
//!
//! Events go over an mpsc channel to a dedicated thread that fans them out to
//! sinks. Sending never blocks orchestration, and a failing sink is logged
//! and skipped.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::mpsc::{self, Sender};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::core::types::OrchestratorState;
use crate::io::config::NotifyConfig;

/// One orchestrator state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransitionEvent {
    pub workflow_id: String,
    /// Monotonic per workflow, starting at 1.
    pub seq: u64,
    pub at: DateTime<Utc>,
    pub from: OrchestratorState,
    pub to: OrchestratorState,
    pub detail: Option<String>,
}

/// Destination for transition events.
pub trait NotifySink: Send {
    fn notify(&mut self, event: &TransitionEvent) -> Result<()>;
}

/// Appends one JSON object per event to a file.
#[derive(Debug, Clone)]
pub struct JsonlSink {
    path: PathBuf,
}

impl JsonlSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl NotifySink for JsonlSink {
    fn notify(&mut self, event: &TransitionEvent) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .with_context(|| format!("create events dir {}", parent.display()))?;
        }
        let mut line = serde_json::to_string(event).context("serialize event")?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open events {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("append events {}", self.path.display()))
    }
}

/// Logs events through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl NotifySink for TracingSink {
    fn notify(&mut self, event: &TransitionEvent) -> Result<()> {
        info!(
            workflow = %event.workflow_id,
            seq = event.seq,
            from = %event.from,
            to = %event.to,
            detail = event.detail.as_deref().unwrap_or(""),
            "workflow transition"
        );
        Ok(())
    }
}

/// Handle to the notification thread. Dropping it flushes pending events.
pub struct Notifier {
    tx: Option<Sender<TransitionEvent>>,
    worker: Option<JoinHandle<()>>,
}

impl Notifier {
    pub fn spawn(sinks: Vec<Box<dyn NotifySink>>) -> Self {
        let (tx, rx) = mpsc::channel::<TransitionEvent>();
        let spawned = thread::Builder::new()
            .name("conductor-notify".to_string())
            .spawn(move || {
                let mut sinks = sinks;
                for event in rx {
                    for sink in &mut sinks {
                        if let Err(err) = sink.notify(&event) {
                            warn!(seq = event.seq, err = %format!("{err:#}"), "notification sink failed");
                        }
                    }
                }
                debug!("notifier drained");
            });
        match spawned {
            Ok(worker) => Self {
                tx: Some(tx),
                worker: Some(worker),
            },
            Err(err) => {
                warn!(err = %err, "failed to start notifier thread; notifications disabled");
                Self::disabled()
            }
        }
    }

    /// Tracing sink always, plus a JSONL sink when `events_path` is set.
    pub fn from_config(config: &NotifyConfig) -> Self {
        let mut sinks: Vec<Box<dyn NotifySink>> = vec![Box::new(TracingSink)];
        if let Some(path) = &config.events_path {
            sinks.push(Box::new(JsonlSink::new(path)));
        }
        Self::spawn(sinks)
    }

    /// Notifier that drops every event.
    pub fn disabled() -> Self {
        Self {
            tx: None,
            worker: None,
        }
    }

    pub fn emit(&self, event: TransitionEvent) {
        let Some(tx) = &self.tx else {
            return;
        };
        if tx.send(event).is_err() {
            warn!("notifier thread is gone; event dropped");
        }
    }

    /// Close the channel and wait for queued events to be delivered.
    pub fn shutdown(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        self.tx.take();
        if let Some(worker) = self.worker.take()
            && worker.join().is_err()
        {
            warn!("notifier thread panicked");
        }
    }
}

impl Drop for Notifier {
    fn drop(&mut self) {
        self.finish();
    }
}
