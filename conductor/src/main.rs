//! `conductor` CLI: run workflows, dispatch single invocations, sweep
//! stale artifacts.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;

use conductor::core::types::OrchestratorState;
use conductor::exit_codes;
use conductor::invoke::{ContextData, InvokeOptions, Invoker};
use conductor::io::artifacts::sweep_stale_artifacts;
use conductor::io::config::load_config;
use conductor::io::launcher::{ScriptLauncher, is_dispatch_available, platform};
use conductor::io::notifier::Notifier;
use conductor::logging;
use conductor::orchestrate::{Orchestrator, Resolution};
use conductor::workflow::load_workflow;

#[derive(Parser)]
#[command(
    name = "conductor",
    version,
    about = "Dispatch tasks to external workers and drive gated workflows"
)]
struct Cli {
    /// Configuration file (missing file means defaults).
    #[arg(long, global = true, default_value = "conductor.toml")]
    config: PathBuf,

    /// Verbose diagnostics and `CONDUCTOR_DEBUG=true` for workers.
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a workflow definition to completion, abort or escalation.
    Run {
        workflow: PathBuf,
        /// Answer an escalation once instead of stopping.
        #[arg(long, value_enum)]
        on_escalation: Option<ResolutionArg>,
    },
    /// Dispatch one task and print the invocation result as JSON.
    Dispatch {
        worker: String,
        task: String,
        /// Extra launcher arguments.
        params: Vec<String>,
        #[arg(long)]
        story: Option<String>,
        #[arg(long = "file")]
        files: Vec<String>,
        #[arg(long)]
        instructions: Option<String>,
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Remove stale conductor artifacts.
    Sweep {
        /// Artifact directory (defaults to the configured output dir).
        #[arg(long)]
        dir: Option<PathBuf>,
        #[arg(long)]
        max_age_secs: Option<u64>,
    },
    /// Print the host platform and whether dispatch is available.
    Platform,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ResolutionArg {
    Retry,
    Skip,
    Waive,
    Abort,
}

impl From<ResolutionArg> for Resolution {
    fn from(arg: ResolutionArg) -> Self {
        match arg {
            ResolutionArg::Retry => Resolution::Retry,
            ResolutionArg::Skip => Resolution::Skip,
            ResolutionArg::Waive => Resolution::Waive,
            ResolutionArg::Abort => Resolution::Abort,
        }
    }
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let mut config = load_config(&cli.config)?;
    config.debug |= cli.debug;
    logging::init(config.debug);

    match cli.command {
        Command::Run {
            workflow,
            on_escalation,
        } => {
            let workflow = load_workflow(&workflow)?;
            let notifier = Notifier::from_config(&config.notify);
            let invoker = Invoker::new(ScriptLauncher::from_config(&config), config);
            let mut orchestrator = Orchestrator::new(workflow, invoker, notifier)?;

            let mut report = orchestrator.run()?;
            if let (OrchestratorState::AwaitingInput(_), Some(answer)) =
                (&report.state, on_escalation)
            {
                orchestrator.resolve(answer.into())?;
                report = orchestrator.run()?;
            }
            print_json(&report)?;
            orchestrator.shutdown();

            Ok(match report.state {
                OrchestratorState::Completed | OrchestratorState::CompletedWithSkips => {
                    exit_codes::OK
                }
                OrchestratorState::AwaitingInput(_) => exit_codes::AWAITING_INPUT,
                _ => exit_codes::ABORTED,
            })
        }
        Command::Dispatch {
            worker,
            task,
            params,
            story,
            files,
            instructions,
            timeout_ms,
        } => {
            let with_context = story.is_some() || !files.is_empty() || instructions.is_some();
            let options = InvokeOptions {
                params,
                context: with_context.then(|| ContextData {
                    story,
                    files,
                    instructions,
                    ..ContextData::default()
                }),
                timeout: timeout_ms.map(Duration::from_millis),
                retries: None,
            };
            let invoker = Invoker::new(ScriptLauncher::from_config(&config), config);
            let result = invoker.invoke(&worker, &task, &options);
            print_json(&result)?;
            Ok(if result.success {
                exit_codes::OK
            } else {
                exit_codes::DISPATCH_FAILED
            })
        }
        Command::Sweep { dir, max_age_secs } => {
            let dir = dir.unwrap_or_else(|| config.output_dir());
            let max_age = max_age_secs
                .map(Duration::from_secs)
                .unwrap_or_else(|| config.sweep_max_age());
            let removed = sweep_stale_artifacts(&dir, max_age);
            println!("{removed}");
            Ok(exit_codes::OK)
        }
        Command::Platform => {
            println!(
                "{} (dispatch {})",
                platform(),
                if is_dispatch_available() {
                    "available"
                } else {
                    "unavailable"
                }
            );
            Ok(exit_codes::OK)
        }
    }
}

/// Print `value` as pretty JSON on stdout.
fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value).context("serialize json")?;
    println!("{payload}");
    Ok(())
}
