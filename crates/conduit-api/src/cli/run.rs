//! `conduit run`: execute one workflow file to a terminal state.
//!
//! The instance runs against in-memory stores with real timers. Events
//! passed with `--event` are ingested right after start; events emitted
//! by the workflow itself are looped back to its own `listen` tasks.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use console::style;
use serde_json::Value;
use tracing::Instrument;
use uuid::Uuid;

use conduit_core::workflow::definition::load_workflow_file;
use conduit_observe::attrs;
use conduit_types::config::EngineConfig;
use conduit_types::correlation::CloudEvent;
use conduit_types::error::TaskError;
use conduit_types::event::EngineEvent;
use conduit_types::instance::WorkflowStatus;
use tokio::sync::broadcast::error::RecvError;

use crate::state::EngineState;

pub struct RunArgs {
    pub file: PathBuf,
    pub input: Option<String>,
    pub input_file: Option<PathBuf>,
    pub events: Vec<String>,
    pub definitions: Option<PathBuf>,
    pub timeout_secs: u64,
}

/// Final state of a run.
#[derive(Debug)]
pub struct RunReport {
    pub instance_id: Uuid,
    pub workflow: String,
    pub status: WorkflowStatus,
    pub output: Option<Value>,
    pub error: Option<TaskError>,
    pub faulted_task: Option<String>,
}

pub async fn handle_run(args: RunArgs, config: EngineConfig, json: bool) -> Result<()> {
    let report = execute(args, config).await?;

    if json {
        let out = serde_json::json!({
            "instance_id": report.instance_id.to_string(),
            "workflow": report.workflow,
            "status": report.status,
            "output": report.output,
            "error": report.error,
            "faulted_task": report.faulted_task,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        print_report(&report)?;
    }

    if report.status != WorkflowStatus::Completed {
        bail!("workflow {} ended {}", report.workflow, report.status);
    }
    Ok(())
}

pub async fn execute(args: RunArgs, config: EngineConfig) -> Result<RunReport> {
    let def = load_workflow_file(&args.file)
        .with_context(|| format!("failed to load {}", args.file.display()))?;
    let input = read_input(&args).await?;
    let events = args
        .events
        .iter()
        .enumerate()
        .map(|(i, raw)| {
            serde_json::from_str::<CloudEvent>(raw)
                .with_context(|| format!("--event #{} is not a valid CloudEvent", i + 1))
        })
        .collect::<Result<Vec<_>>>()?;

    let state = EngineState::init(config)?;
    if let Some(dir) = &args.definitions {
        state
            .definitions
            .load_dir(dir)
            .await
            .with_context(|| format!("failed to load definitions from {}", dir.display()))?;
    }

    let reference = def.definition_ref();
    let span = tracing::info_span!(
        attrs::OP_RUN,
        { attrs::WORKFLOW_NAMESPACE } = reference.namespace.as_str(),
        { attrs::WORKFLOW_NAME } = reference.name.as_str(),
        { attrs::WORKFLOW_VERSION } = reference.version.as_str(),
        { attrs::WORKFLOW_INSTANCE_ID } = tracing::field::Empty,
        { attrs::WORKFLOW_INSTANCE_STATUS } = tracing::field::Empty,
    );

    let runner = &state.runner;
    let report = async {
        runner.register(def).await?;
        let mut lifecycle = runner.event_bus().subscribe();
        let instance = runner.start(&reference, input).await?;
        tracing::Span::current().record(attrs::WORKFLOW_INSTANCE_ID, tracing::field::display(instance.id));

        for event in events {
            let (event_id, event_type) = (event.id.clone(), event.event_type.clone());
            let consumed = runner.ingest(event).await;
            tracing::info!(
                { attrs::EVENT_ID } = event_id.as_str(),
                { attrs::EVENT_TYPE } = event_type.as_str(),
                consumed,
                "delivered event"
            );
        }

        if !runner.load(instance.id).await?.is_terminal() {
            let deadline = Duration::from_secs(args.timeout_secs);
            tokio::select! {
                _ = wait_for_terminal(&mut lifecycle, instance.id) => {}
                _ = tokio::time::sleep(deadline) => {
                    tracing::warn!(timeout_secs = args.timeout_secs, "run timed out, cancelling");
                    runner.cancel(instance.id).await?;
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::warn!("interrupted, cancelling");
                    runner.cancel(instance.id).await?;
                }
            }
        }

        let finished = runner.load(instance.id).await?;
        tracing::Span::current().record(attrs::WORKFLOW_INSTANCE_STATUS, tracing::field::display(finished.status));
        let output = match finished.output {
            Some(doc) => Some(runner.document(doc).await?),
            None => None,
        };
        Ok::<_, anyhow::Error>(RunReport {
            instance_id: finished.id,
            workflow: reference.to_string(),
            status: finished.status,
            output,
            error: finished.error,
            faulted_task: finished.faulted_task.map(|t| t.to_string()),
        })
    }
    .instrument(span)
    .await?;

    Ok(report)
}

async fn read_input(args: &RunArgs) -> Result<Value> {
    let raw = match (&args.input, &args.input_file) {
        (Some(raw), _) => raw.clone(),
        (None, Some(path)) => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?,
        (None, None) => return Ok(serde_json::json!({})),
    };
    serde_json::from_str(&raw).context("workflow input is not valid JSON")
}

/// Resolves once the engine reports `instance_id` finished. A lagging
/// receiver falls back to polling the bus again; the caller re-reads the
/// instance afterwards either way.
async fn wait_for_terminal(
    lifecycle: &mut tokio::sync::broadcast::Receiver<EngineEvent>,
    instance_id: Uuid,
) {
    loop {
        match lifecycle.recv().await {
            Ok(
                EngineEvent::InstanceCompleted { instance_id: id, .. }
                | EngineEvent::InstanceFaulted { instance_id: id, .. }
                | EngineEvent::InstanceCancelled { instance_id: id },
            ) if id == instance_id => return,
            Ok(_) => {}
            Err(RecvError::Lagged(missed)) => {
                tracing::debug!(missed, "lifecycle receiver lagged");
            }
            Err(RecvError::Closed) => return,
        }
    }
}

fn print_report(report: &RunReport) -> Result<()> {
    let status = match report.status {
        WorkflowStatus::Completed => style(report.status.to_string()).green().bold(),
        WorkflowStatus::Faulted => style(report.status.to_string()).red().bold(),
        _ => style(report.status.to_string()).yellow().bold(),
    };
    println!();
    println!("  {} {}", style(&report.workflow).cyan(), status);
    println!("  Instance: {}", report.instance_id);
    if let Some(error) = &report.error {
        println!("  Error: {}", error.summary());
        if let Some(task) = &report.faulted_task {
            println!("  Task: {task}");
        }
    }
    if let Some(output) = &report.output {
        println!();
        for line in serde_json::to_string_pretty(output)?.lines() {
            println!("  {line}");
        }
    }
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
