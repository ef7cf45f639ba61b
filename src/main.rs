use clap::Parser;
use snafu::prelude::*;

mod cmd;

use cmd::{GraphArgs, RunArgs, ValidateArgs, handle_graph, handle_run, handle_validate};
use maestro::config::MaestroConfig;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Run error: {source}"))]
    Run { source: cmd::run::Error },

    #[snafu(display("Validate error: {source}"))]
    Validate { source: cmd::validate::Error },

    #[snafu(display("Graph error: {source}"))]
    Graph { source: cmd::graph::Error },
}

#[derive(Parser, Debug)]
#[command(name = "maestro")]
#[command(author = "Armin Graf")]
#[command(version = "0.1.0")]
#[command(about = "A deterministic, event-driven conducting engine for declarative workflows", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Conduct a workflow with the built-in echo runner
    Run(RunArgs),
    /// Validate workflow(s) without conducting
    Validate(ValidateArgs),
    /// Print the composed workflow graph document
    Graph(GraphArgs),
}

/// Initialize tracing/logging
fn init_tracing(verbose: bool) {
    let filter = if verbose {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug"))
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() -> Result<(), Error> {
    let cli = Cli::parse();

    // Load configuration from file, env vars, and defaults
    let global_config = MaestroConfig::load().unwrap_or_default();

    match cli.command {
        Commands::Run(args) => {
            init_tracing(args.verbose || global_config.run.verbose);
            let config = global_config.run;
            handle_run(args, config).context(RunSnafu)
        }
        Commands::Validate(args) => {
            init_tracing(args.verbose || global_config.validate.verbose);
            handle_validate(args).context(ValidateSnafu)
        }
        Commands::Graph(args) => {
            init_tracing(args.verbose);
            handle_graph(args).context(GraphSnafu)
        }
    }
}
