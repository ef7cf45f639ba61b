use clap::Parser;
use snafu::prelude::*;
use std::path::PathBuf;

use maestro::composer;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Unknown workflow catalog `{catalog}`"))]
    UnknownCatalog { catalog: String },

    #[snafu(display("I/O error: {source}"))]
    Io { source: std::io::Error },

    #[snafu(display("Composition error: {source}"))]
    Composition { source: composer::Error },

    #[snafu(display("JSON serialization error: {source}"))]
    Json { source: serde_json::Error },
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Parser, Debug)]
pub struct GraphArgs {
    /// Workflow file to compose
    #[arg(required = true, value_name = "WORKFLOW")]
    pub workflow: PathBuf,

    /// Workflow dialect catalog (native or mistral)
    #[arg(long, default_value = "native")]
    pub catalog: String,

    /// Emit compact JSON instead of pretty-printed output
    #[arg(long)]
    pub compact: bool,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,
}

/// Compose a workflow and print the graph document consumed by
/// external tooling.
pub fn handle_graph(args: GraphArgs) -> Result<()> {
    let composer = composer::composer_for(&args.catalog)
        .ok_or_else(|| Error::UnknownCatalog { catalog: args.catalog.clone() })?;

    let definition = std::fs::read_to_string(&args.workflow).context(IoSnafu)?;
    let (_spec, graph) = composer.compose(&definition).context(CompositionSnafu)?;

    let document = graph.to_value();
    let rendered = if args.compact {
        serde_json::to_string(&document).context(JsonSnafu)?
    } else {
        serde_json::to_string_pretty(&document).context(JsonSnafu)?
    };
    println!("{rendered}");

    Ok(())
}
