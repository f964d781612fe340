//! Conduit CLI entry point.
//!
//! Binary name: `conduit`
//!
//! Parses CLI arguments, sets up tracing and the engine config, then
//! dispatches to the command handler.

mod cli;
mod state;

use clap::Parser;

use cli::run::RunArgs;
use cli::{Cli, Commands};
use conduit_observe::tracing_setup::{self, LogFormat};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let format = if cli.log_json {
        LogFormat::Json
    } else {
        LogFormat::Pretty
    };
    tracing_setup::init_tracing_with(format, cli.default_filter(), cli.otel)
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    let result = dispatch(cli).await;
    tracing_setup::shutdown_tracing();
    result
}

async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Validate { files } => {
            cli::validate::handle_validate(&files, cli.json).await?;
        }

        Commands::List { dir } => {
            cli::list::handle_list(&dir, cli.json).await?;
        }

        Commands::Run {
            file,
            input,
            input_file,
            events,
            definitions,
            timeout_secs,
        } => {
            let config = conduit_infra::config::load_engine_config(&cli.config).await;
            let args = RunArgs {
                file,
                input,
                input_file,
                events,
                definitions,
                timeout_secs,
            };
            cli::run::handle_run(args, config, cli.json).await?;
        }
    }

    Ok(())
}
