//! CLI command definitions for the `conduit` binary.

pub mod list;
pub mod run;
pub mod validate;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Run serverless-style workflow definitions locally.
#[derive(Parser)]
#[command(name = "conduit", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Detailed logs (-v for info, -vv for debug, -vvv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Write logs as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Export spans to stdout through OpenTelemetry.
    #[arg(long, global = true, env = "CONDUIT_OTEL")]
    pub otel: bool,

    /// Engine config file (TOML).
    #[arg(long, global = true, env = "CONDUIT_CONFIG", default_value = "conduit.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Parse and validate workflow files without running them.
    Validate {
        /// Workflow files (.yaml, .yml or .json).
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// List the workflow definitions found under a directory.
    #[command(alias = "ls")]
    List {
        /// Directory to search recursively.
        #[arg(default_value = ".")]
        dir: PathBuf,
    },

    /// Run a workflow to completion.
    Run {
        /// Workflow file to run.
        file: PathBuf,

        /// Workflow input as a JSON document.
        #[arg(long, conflicts_with = "input_file")]
        input: Option<String>,

        /// Read the workflow input from a JSON file.
        #[arg(long)]
        input_file: Option<PathBuf>,

        /// CloudEvent (JSON) to deliver once the workflow is running.
        /// Repeat to deliver several, in order.
        #[arg(long = "event")]
        events: Vec<String>,

        /// Directory of additional definitions to register first.
        #[arg(long)]
        definitions: Option<PathBuf>,

        /// Give up and cancel the instance after this many seconds.
        #[arg(long, default_value = "300")]
        timeout_secs: u64,
    },
}

impl Cli {
    /// Log filter implied by `-v` when `RUST_LOG` is unset.
    pub fn default_filter(&self) -> &'static str {
        match self.verbose {
            0 => "warn",
            1 => "info",
            2 => "info,conduit_core=debug,conduit_infra=debug",
            _ => "trace",
        }
    }
}
