//! Workflow definitions (TOML) and per-stage instruction rendering.
//!
//! ```toml
//! id = "story-11-2"
//! story = "Add CSV export"
//!
//! [gate]
//! required_checks = ["tests_pass"]
//!
//! [[stage]]
//! name = "develop"
//! worker = "dev"
//! task = "develop-story"
//! instructions = "Implement {{ story }} (attempt {{ attempt }})"
//!
//! [[stage]]
//! name = "review"
//! worker = "qa"
//! task = "review-story"
//! critical = true
//! ```

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use minijinja::{Environment, context};
use serde::{Deserialize, Serialize};

use crate::core::gate::GateConfig;
use crate::core::ident::is_valid_identifier;
use crate::core::recovery::{DEFAULT_MAX_ATTEMPTS, StagePolicy};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkflowDef {
    pub id: String,
    #[serde(default)]
    pub story: Option<String>,
    /// Gate applied to stages without their own.
    #[serde(default)]
    pub gate: GateConfig,
    #[serde(rename = "stage", default)]
    pub stages: Vec<StageDef>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StageDef {
    pub name: String,
    pub worker: String,
    pub task: String,
    #[serde(default)]
    pub params: Vec<String>,
    #[serde(default)]
    pub files: Vec<String>,
    /// minijinja template; see [`InstructionInputs`] for the variables.
    #[serde(default)]
    pub instructions: Option<String>,
    #[serde(default)]
    pub critical: bool,
    #[serde(default)]
    pub skippable: bool,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    /// Overrides the configured invocation timeout.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub gate: Option<GateConfig>,
}

impl StageDef {
    pub fn policy(&self) -> StagePolicy {
        StagePolicy {
            critical: self.critical,
            skippable: self.skippable,
            max_attempts: self.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS),
        }
    }

    pub fn gate<'a>(&'a self, workflow_gate: &'a GateConfig) -> &'a GateConfig {
        self.gate.as_ref().unwrap_or(workflow_gate)
    }
}

impl WorkflowDef {
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();
        if !is_valid_identifier(&self.id) {
            errors.push(format!("workflow id {:?} is not a valid identifier", self.id));
        }
        if self.stages.is_empty() {
            errors.push("workflow has no stages".to_string());
        }
        errors.extend(
            self.gate
                .validate()
                .into_iter()
                .map(|e| format!("gate: {e}")),
        );

        let mut seen = HashSet::new();
        for stage in &self.stages {
            for (field, value) in [
                ("name", &stage.name),
                ("worker", &stage.worker),
                ("task", &stage.task),
            ] {
                if !is_valid_identifier(value) {
                    errors.push(format!("stage {:?}: invalid {field} {value:?}", stage.name));
                }
            }
            if !seen.insert(stage.name.as_str()) {
                errors.push(format!("duplicate stage name {:?}", stage.name));
            }
            if stage.max_attempts == Some(0) {
                errors.push(format!("stage {:?}: max_attempts must be > 0", stage.name));
            }
            if stage.timeout_ms == Some(0) {
                errors.push(format!("stage {:?}: timeout_ms must be > 0", stage.name));
            }
            if let Some(gate) = &stage.gate {
                errors.extend(
                    gate.validate()
                        .into_iter()
                        .map(|e| format!("stage {:?} gate: {e}", stage.name)),
                );
            }
            if let Some(template) = &stage.instructions
                && let Err(err) = Environment::new().template_from_str(template)
            {
                errors.push(format!("stage {:?}: bad instructions template: {err}", stage.name));
            }
        }

        if errors.is_empty() {
            return Ok(());
        }
        Err(anyhow!("invalid workflow: {}", errors.join("; ")))
    }
}

/// Load and validate a workflow definition.
pub fn load_workflow(path: &Path) -> Result<WorkflowDef> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read workflow {}", path.display()))?;
    let workflow: WorkflowDef =
        toml::from_str(&contents).with_context(|| format!("parse workflow {}", path.display()))?;
    workflow
        .validate()
        .with_context(|| format!("validate workflow {}", path.display()))?;
    Ok(workflow)
}

/// Variables available to instruction templates.
#[derive(Debug, Clone, Copy)]
pub struct InstructionInputs<'a> {
    pub workflow: &'a str,
    pub story: Option<&'a str>,
    pub stage: &'a str,
    /// 1-indexed attempt of this stage.
    pub attempt: u32,
    /// Gate reasons from the previous attempt, empty on the first.
    pub previous_reasons: &'a [String],
}

pub fn render_instructions(template: &str, inputs: &InstructionInputs<'_>) -> Result<String> {
    let env = Environment::new();
    let rendered = env
        .render_str(
            template,
            context! {
                workflow => inputs.workflow,
                story => inputs.story,
                stage => inputs.stage,
                attempt => inputs.attempt,
                previous_reasons => inputs.previous_reasons,
            },
        )
        .with_context(|| format!("render instructions for stage {}", inputs.stage))?;
    Ok(rendered.trim().to_string())
}
