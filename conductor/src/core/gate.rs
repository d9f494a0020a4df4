//! Quality gate evaluation over a completed invocation's output.
//!
//! Workers report checks either as a JSON object
//! (`{"checks": {"tests_pass": true}, "waiver": "reason"}`) or as plain lines
//! (`tests_pass: fail`, `waiver: reason`). The gate combines those reports with
//! pattern rules into a verdict:
//!
//! - any required failure → `FAIL`
//! - only advisory failures → `CONCERNS` (`FAIL` once they exceed `failure_threshold`)
//! - nothing failing → `PASS`
//! - a failing result carrying a waiver while waivers are allowed → `WAIVED`
//!
//! Evaluation is pure: identical output and config always produce an
//! identical [`GateResult`].

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::types::{GateResult, Verdict};

/// Text substituted for a worker that finished without writing output.
pub const NO_OUTPUT_CAPTURED: &str = "No output captured";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GateConfig {
    /// Checks that must be reported as passing.
    pub required_checks: Vec<String>,
    /// Checks whose failure only raises concerns.
    pub advisory_checks: Vec<String>,
    /// Pattern rules evaluated after the named checks, in order.
    pub rules: Vec<GateRule>,
    /// Advisory failures tolerated before the verdict becomes `FAIL`.
    pub failure_threshold: Option<usize>,
    pub allow_waivers: bool,
    /// Treat empty or missing output as a required failure.
    pub require_output: bool,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            required_checks: Vec::new(),
            advisory_checks: Vec::new(),
            rules: Vec::new(),
            failure_threshold: None,
            allow_waivers: false,
            require_output: true,
        }
    }
}

impl GateConfig {
    /// Collect configuration problems (empty when valid).
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        for name in self.required_checks.iter().chain(&self.advisory_checks) {
            if !CHECK_NAME_RE.is_match(name) {
                errors.push(format!("invalid check name {name:?}"));
            }
        }
        for rule in &self.rules {
            if rule.kind != RuleKind::NonEmpty && rule.pattern.is_none() {
                errors.push(format!("rule '{}' needs a pattern", rule.name));
            }
            if let (RuleKind::Matches, Some(pattern)) = (rule.kind, &rule.pattern)
                && let Err(err) = Regex::new(pattern)
            {
                errors.push(format!("rule '{}' has an invalid regex: {err}", rule.name));
            }
        }
        errors
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Required,
    Advisory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    /// Output must contain `pattern`.
    Contains,
    /// Output must not contain `pattern`.
    Absent,
    /// Output must match the regex `pattern`.
    Matches,
    /// Output must contain non-whitespace text.
    NonEmpty,
}

/// A named predicate over output content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateRule {
    pub name: String,
    pub severity: Severity,
    pub kind: RuleKind,
    #[serde(default)]
    pub pattern: Option<String>,
}

static CHECK_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_-]*$").unwrap());

static CHECK_LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?im)^\s*([A-Za-z][A-Za-z0-9_-]*)\s*[:=]\s*(pass|passed|ok|true|fail|failed|false)\s*$",
    )
    .unwrap()
});

static WAIVER_LINE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?im)^\s*waiver\s*[:=]\s*(\S.*?)\s*$").unwrap());

/// Check reports and waiver parsed from worker output.
#[derive(Debug, Default, PartialEq, Eq)]
struct Reports {
    checks: BTreeMap<String, bool>,
    waiver: Option<String>,
}

fn parse_reports(output: &str) -> Reports {
    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(output.trim()) {
        return reports_from_json(&map);
    }

    let mut reports = Reports::default();
    for caps in CHECK_LINE_RE.captures_iter(output) {
        let passed = matches!(
            caps[2].to_ascii_lowercase().as_str(),
            "pass" | "passed" | "ok" | "true"
        );
        reports.checks.insert(caps[1].to_string(), passed);
    }
    reports.waiver = WAIVER_LINE_RE
        .captures_iter(output)
        .last()
        .map(|caps| caps[1].to_string());
    reports
}

fn reports_from_json(map: &serde_json::Map<String, Value>) -> Reports {
    let mut reports = Reports::default();
    if let Some(Value::Object(checks)) = map.get("checks") {
        for (name, value) in checks {
            let passed = match value {
                Value::Bool(b) => Some(*b),
                Value::String(s) => match s.to_ascii_lowercase().as_str() {
                    "pass" | "passed" | "ok" | "true" => Some(true),
                    "fail" | "failed" | "false" => Some(false),
                    _ => None,
                },
                _ => None,
            };
            if let Some(passed) = passed {
                reports.checks.insert(name.clone(), passed);
            }
        }
    }
    reports.waiver = match map.get("waiver") {
        Some(Value::String(reason)) if !reason.trim().is_empty() => Some(reason.trim().to_string()),
        Some(Value::Bool(true)) => Some("waived by worker".to_string()),
        _ => None,
    };
    reports
}

fn output_missing(output: &str) -> bool {
    let trimmed = output.trim();
    trimmed.is_empty() || trimmed == NO_OUTPUT_CAPTURED
}

/// Evaluate a rule, returning the failure reason when it does not hold.
fn check_rule(rule: &GateRule, output: &str) -> Option<String> {
    let pattern = rule.pattern.as_deref();
    match (rule.kind, pattern) {
        (RuleKind::NonEmpty, _) => output_missing(output).then(|| "output is empty".to_string()),
        (_, None) => Some("rule has no pattern".to_string()),
        (RuleKind::Contains, Some(p)) => {
            (!output.contains(p)).then(|| format!("expected pattern {p:?} not found"))
        }
        (RuleKind::Absent, Some(p)) => {
            output.contains(p).then(|| format!("forbidden pattern {p:?} found"))
        }
        (RuleKind::Matches, Some(p)) => match Regex::new(p) {
            Ok(re) => (!re.is_match(output)).then(|| format!("output does not match /{p}/")),
            Err(err) => Some(format!("invalid regex: {err}")),
        },
    }
}

/// Evaluate `output` against `config`.
///
/// The returned result has no `evaluated_at`; callers stamp it with
/// [`GateResult::stamped`].
pub fn evaluate(output: &str, config: &GateConfig) -> GateResult {
    let reports = parse_reports(output);
    let mut reasons = Vec::new();
    let mut required_failures = 0usize;
    let mut advisory_failures = 0usize;

    if config.require_output && output_missing(output) {
        required_failures += 1;
        reasons.push("no output captured from worker".to_string());
    }

    for (names, severity) in [
        (&config.required_checks, Severity::Required),
        (&config.advisory_checks, Severity::Advisory),
    ] {
        for name in names {
            let reason = match reports.checks.get(name) {
                Some(true) => continue,
                Some(false) => "failed",
                None => "not reported",
            };
            match severity {
                Severity::Required => required_failures += 1,
                Severity::Advisory => advisory_failures += 1,
            }
            reasons.push(format!(
                "{} check '{name}' {reason}",
                severity_label(severity)
            ));
        }
    }

    for rule in &config.rules {
        if let Some(reason) = check_rule(rule, output) {
            match rule.severity {
                Severity::Required => required_failures += 1,
                Severity::Advisory => advisory_failures += 1,
            }
            reasons.push(format!(
                "{} rule '{}': {reason}",
                severity_label(rule.severity),
                rule.name
            ));
        }
    }

    let mut verdict = if required_failures > 0 {
        Verdict::Fail
    } else if advisory_failures > 0 {
        match config.failure_threshold {
            Some(threshold) if advisory_failures > threshold => {
                reasons.push(format!(
                    "{advisory_failures} advisory failures exceed threshold {threshold}"
                ));
                Verdict::Fail
            }
            _ => Verdict::Concerns,
        }
    } else {
        Verdict::Pass
    };

    if verdict != Verdict::Pass
        && config.allow_waivers
        && let Some(waiver) = reports.waiver
    {
        reasons.push(format!("waived: {waiver}"));
        verdict = Verdict::Waived;
    }

    GateResult {
        verdict,
        reasons,
        evaluated_at: None,
    }
}

fn severity_label(severity: Severity) -> &'static str {
    match severity {
        Severity::Required => "required",
        Severity::Advisory => "advisory",
    }
}
