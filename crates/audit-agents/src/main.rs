//! `audit`: run a tribunal audit over a repository
//!
//! ```bash
//! # Offline rubric judges, report to stdout
//! audit run --workspace ./target-repo --document ./report.md
//!
//! # Model-backed judges, events streamed to stderr
//! AUDIT_JUDGE_URL=http://localhost:8080/v1 audit run --workspace . --judge http --events
//!
//! # Only failures and gate decisions
//! audit run --workspace . --events --event-filter type=node_failed,type=gate_decision
//!
//! # Check configuration and rubric without running
//! audit validate --config audit.toml --rubric rubric.json
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tribunal::{EventBus, EventFilter, Presenter};

use audit_agents::{
    AuditConfig, AuditWorkflow, Collaborators, JsonPresenter, JudgeBackend, ReportTarget, Rubric,
};

#[derive(Parser, Debug)]
#[command(name = "audit", author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Audit a workspace and print the verdict report
    Run(RunArgs),
    /// Build and validate the workflow without running it
    Validate(SourceArgs),
}

#[derive(Args, Debug)]
struct SourceArgs {
    /// TOML configuration file (overridden by AUDIT_* variables)
    #[arg(long)]
    config: Option<PathBuf>,

    /// JSON rubric (defaults to the built-in rubric)
    #[arg(long)]
    rubric: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Repository to audit
    #[arg(long)]
    workspace: PathBuf,

    /// Report document to check claims against
    #[arg(long)]
    document: Option<PathBuf>,

    #[command(flatten)]
    sources: SourceArgs,

    /// Quality-gate retry ceiling (overrides config and AUDIT_MAX_RETRIES)
    #[arg(long)]
    max_retries: Option<u32>,

    /// Judge backend
    #[arg(long, value_enum)]
    judge: Option<JudgeBackend>,

    /// Write the report here instead of stdout
    #[arg(long)]
    output: Option<PathBuf>,

    /// Stream workflow events to stderr as JSON lines
    #[arg(long, default_value_t = false)]
    events: bool,

    /// Restrict streamed events, e.g. `node=document,type=node_failed`
    #[arg(long, requires = "events", value_parser = EventFilter::parse)]
    event_filter: Option<EventFilter>,
}

fn load(sources: &SourceArgs) -> Result<(AuditConfig, Rubric)> {
    let config = AuditConfig::load(sources.config.as_deref()).context("Failed to load configuration")?;
    let rubric =
        Rubric::load_or_default(sources.rubric.as_deref()).context("Failed to load rubric")?;
    Ok((config, rubric))
}

async fn run(args: RunArgs) -> Result<()> {
    let (mut config, rubric) = load(&args.sources)?;
    if let Some(max_retries) = args.max_retries {
        config.engine.max_retries = max_retries;
    }
    if let Some(backend) = args.judge {
        config.judge.backend = backend;
    }

    let collaborators = Collaborators::from_config(&config, &rubric)?;
    let mut workflow = AuditWorkflow::build(&config, &rubric, collaborators)?;

    let streamer = if args.events {
        let bus = EventBus::new().shared();
        let mut rx = bus.subscribe();
        let filter = args.event_filter.clone().unwrap_or_default();
        workflow = workflow.with_events(bus);
        Some(tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) if !filter.matches(&event) => {}
                    Ok(event) => match serde_json::to_string(&event) {
                        Ok(line) => eprintln!("{line}"),
                        Err(e) => warn!("Failed to serialize event: {e}"),
                    },
                    Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event stream lagged"),
                    Err(RecvError::Closed) => break,
                }
            }
        }))
    } else {
        None
    };

    info!(
        workspace = %args.workspace.display(),
        document = ?args.document,
        judge = ?config.judge.backend,
        "Audit starting"
    );
    let outcome = workflow.run(&args.workspace, args.document.clone()).await;

    // Dropping the workflow closes the event bus and ends the streamer
    drop(workflow);
    if let Some(handle) = streamer {
        if let Err(e) = handle.await {
            warn!("Event streamer failed: {e}");
        }
    }
    let outcome = outcome?;

    let target = match args.output {
        Some(path) => ReportTarget::File(path),
        None => ReportTarget::Stdout,
    };
    JsonPresenter::new(target).present(&outcome.state)?;

    info!(
        verdict = %outcome.state.verdict,
        score = outcome.state.aggregated_score,
        steps = outcome.steps,
        flags = outcome.state.flags.len(),
        "Audit finished"
    );
    Ok(())
}

fn validate(sources: SourceArgs) -> Result<()> {
    let (config, rubric) = load(&sources)?;
    let collaborators = Collaborators::from_config(&config, &rubric)?;
    let workflow = AuditWorkflow::build(&config, &rubric, collaborators)?;
    info!(
        nodes = workflow.graph().len(),
        rubric = %rubric.version,
        source_checks = rubric.source_checks.len(),
        document_claims = rubric.document_claims.len(),
        "Configuration, rubric and graph are valid"
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => run(args).await,
        Command::Validate(sources) => validate(sources),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_filter_flag_parsed() {
        let cli = Cli::try_parse_from([
            "audit",
            "run",
            "--workspace",
            ".",
            "--events",
            "--event-filter",
            "node=quality_gate,type=gate_decision",
        ])
        .unwrap();
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        let filter = args.event_filter.unwrap();
        assert_eq!(filter.node.as_deref(), Some("quality_gate"));
        assert_eq!(filter.event_types, Some(vec!["gate_decision".to_string()]));
    }

    #[test]
    fn test_event_filter_requires_events() {
        assert!(Cli::try_parse_from([
            "audit",
            "run",
            "--workspace",
            ".",
            "--event-filter",
            "type=node_failed",
        ])
        .is_err());
        assert!(Cli::try_parse_from([
            "audit",
            "run",
            "--workspace",
            ".",
            "--events",
            "--event-filter",
            "type=bogus",
        ])
        .is_err());
    }
}
