use clap::Parser;
use snafu::prelude::*;
use std::path::PathBuf;

use maestro::composer;
use maestro::output;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Unknown workflow catalog `{catalog}`"))]
    UnknownCatalog { catalog: String },

    #[snafu(display("I/O error: {source}"))]
    Io { source: std::io::Error },

    #[snafu(display("Composition error: {source}"))]
    Composition { source: composer::Error },

    #[snafu(display("Validation failed with {count} error(s)"))]
    ValidationFailed { count: usize },
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Parser, Debug)]
pub struct ValidateArgs {
    /// Workflow file(s) to validate
    #[arg(required = true, value_name = "WORKFLOW")]
    pub workflows: Vec<PathBuf>,

    /// Workflow dialect catalog (native or mistral)
    #[arg(long, default_value = "native")]
    pub catalog: String,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,
}

/// Statically validate workflow files: parse, compose the graph, and
/// inspect every expression in document order.
pub fn handle_validate(args: ValidateArgs) -> Result<()> {
    let composer = composer::composer_for(&args.catalog)
        .ok_or_else(|| Error::UnknownCatalog { catalog: args.catalog.clone() })?;

    let mut count = 0;
    for workflow in &args.workflows {
        let name = workflow.display().to_string();
        let definition = std::fs::read_to_string(workflow).context(IoSnafu)?;

        let (spec, _graph) = composer.compose(&definition).context(CompositionSnafu)?;
        let errors = spec.inspect();
        count += errors.len();
        output::format_spec_errors(&name, &errors);
    }

    ensure!(count == 0, ValidationFailedSnafu { count });
    Ok(())
}
