//! `conduit validate`: parse and validate workflow files.

use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use console::style;

use conduit_core::workflow::definition::{load_workflow_file, WorkflowError};
use conduit_observe::attrs;

struct Checked {
    path: PathBuf,
    result: Result<String, WorkflowError>,
}

pub async fn handle_validate(files: &[PathBuf], json: bool) -> Result<()> {
    let span = tracing::info_span!(attrs::OP_VALIDATE, files = files.len());
    let _entered = span.enter();

    let checked: Vec<Checked> = files
        .iter()
        .map(|path| Checked {
            path: path.clone(),
            result: check(path),
        })
        .collect();
    let failures = checked.iter().filter(|c| c.result.is_err()).count();

    if json {
        let out: Vec<serde_json::Value> = checked
            .iter()
            .map(|c| match &c.result {
                Ok(workflow) => serde_json::json!({
                    "file": c.path.display().to_string(),
                    "valid": true,
                    "workflow": workflow,
                }),
                Err(e) => serde_json::json!({
                    "file": c.path.display().to_string(),
                    "valid": false,
                    "error": e.to_string(),
                }),
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!();
        for c in &checked {
            match &c.result {
                Ok(workflow) => println!(
                    "  {} {} ({})",
                    style("✓").green(),
                    c.path.display(),
                    style(workflow).cyan()
                ),
                Err(e) => println!(
                    "  {} {}: {}",
                    style("✗").red(),
                    c.path.display(),
                    describe(e)
                ),
            }
        }
        println!();
    }

    if failures > 0 {
        bail!("{failures} of {} workflow file(s) are invalid", checked.len());
    }
    Ok(())
}

fn check(path: &Path) -> Result<String, WorkflowError> {
    let def = load_workflow_file(path)?;
    tracing::debug!(path = %path.display(), workflow = %def.definition_ref(), "workflow file is valid");
    Ok(def.definition_ref().to_string())
}

fn describe(error: &WorkflowError) -> String {
    match error {
        WorkflowError::ParseError(msg) => format!("failed to parse: {msg}"),
        WorkflowError::ValidationError(msg) => format!("invalid: {msg}"),
        WorkflowError::IoError(e) => format!("cannot read: {e}"),
    }
}
