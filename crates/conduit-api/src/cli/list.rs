//! `conduit list`: show the workflow definitions under a directory.

use std::path::Path;

use anyhow::{Context, Result};
use console::style;

use conduit_core::workflow::definition::discover_workflows;

pub async fn handle_list(dir: &Path, json: bool) -> Result<()> {
    let base = dir.to_path_buf();
    let found = tokio::task::spawn_blocking(move || discover_workflows(&base))
        .await?
        .with_context(|| format!("failed to scan {}", dir.display()))?;

    if json {
        let out: Vec<serde_json::Value> = found
            .iter()
            .map(|(path, def)| {
                serde_json::json!({
                    "file": path.display().to_string(),
                    "namespace": def.document.namespace,
                    "name": def.document.name,
                    "version": def.document.version,
                    "tasks": def.tasks.len(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    if found.is_empty() {
        println!("  No workflow files found under {}", dir.display());
        println!();
        return Ok(());
    }
    for (path, def) in &found {
        println!(
            "  {}  {} task(s)  {}",
            style(def.definition_ref()).cyan().bold(),
            def.tasks.len(),
            style(path.display()).dim()
        );
    }
    println!();
    println!("  {} workflow(s)", found.len());
    println!();
    Ok(())
}
