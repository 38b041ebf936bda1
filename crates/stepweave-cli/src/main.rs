//! stepweave command-line entry point.
//!
//! Binary name: `stepweave`
//!
//! Parses CLI arguments, installs the tracing subscriber, then dispatches to
//! the validate / plan / run / handlers commands.

mod builtins;
mod cli;

use clap::Parser;
use stepweave_observe::TracingOptions;

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Set up tracing based on verbosity; RUST_LOG still wins when set
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "warn",
        1 => "info,stepweave_core=debug",
        _ => "trace",
    };
    let options = TracingOptions {
        json: cli.json,
        otel: cli.otel,
        default_filter: filter.to_string(),
    };
    stepweave_observe::init_tracing(&options)
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    let result = match cli.command {
        Commands::Validate { file } => cli::workflow::validate(&file, cli.json),
        Commands::Plan { file } => cli::workflow::plan(&file, cli.json),
        Commands::Handlers => cli::workflow::list_handlers(cli.json),
        Commands::Run(args) => {
            cli::run::run_workflow(args, cli.config.as_deref(), cli.json, cli.quiet).await
        }
    };

    stepweave_observe::shutdown_tracing();
    result
}
