use clap::Parser;
use serde_json::Value;
use snafu::prelude::*;
use std::path::PathBuf;

use maestro::composer;
use maestro::conducting::{self, TaskUpdate, WorkflowConductor};
use maestro::config::RunConfig;
use maestro::output;
use maestro::statuses::Status;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Unknown workflow catalog `{catalog}`"))]
    UnknownCatalog { catalog: String },

    #[snafu(display("Invalid input argument `{argument}`: expected NAME=VALUE"))]
    InvalidInput { argument: String },

    #[snafu(display("I/O error: {source}"))]
    Io { source: std::io::Error },

    #[snafu(display("Composition error: {source}"))]
    Composition { source: composer::Error },

    #[snafu(display("Conducting error: {source}"))]
    Conducting { source: conducting::Error },

    #[snafu(display("Workflow finished with status {status}"))]
    WorkflowNotSucceeded { status: Status },
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Workflow file to conduct
    #[arg(required = true, value_name = "WORKFLOW")]
    pub workflow: PathBuf,

    /// Workflow input as NAME=VALUE pairs
    #[arg(short, long = "input", value_name = "NAME=VALUE")]
    pub input: Vec<String>,

    /// Workflow dialect catalog (native or mistral)
    #[arg(long)]
    pub catalog: Option<String>,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,
}

/// Conduct a workflow end to end with the built-in echo runner: every
/// dispatched action immediately succeeds with its rendered input as
/// the result. This exercises composition, staging, transition
/// evaluation, and output rendering without executing anything.
pub fn handle_run(args: RunArgs, config: RunConfig) -> Result<()> {
    let catalog = args
        .catalog
        .or(config.catalog)
        .unwrap_or_else(|| "native".to_string());
    let composer = composer::composer_for(&catalog)
        .ok_or_else(|| Error::UnknownCatalog { catalog: catalog.clone() })?;

    let definition = std::fs::read_to_string(&args.workflow).context(IoSnafu)?;
    let (spec, _graph) = composer.compose(&definition).context(CompositionSnafu)?;
    let input = parse_input_args(&args.input)?;

    let name = args
        .workflow
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_else(|| "workflow".to_string());
    output::format_workflow_start(&name);
    output::format_workflow_input(&input);

    let mut conductor = WorkflowConductor::with_input(spec, input).context(ConductingSnafu)?;
    conductor
        .request_workflow_status(Status::Running)
        .context(ConductingSnafu)?;

    while conductor.get_workflow_status() == Status::Running {
        let tasks = conductor.get_next_tasks();
        if tasks.is_empty() {
            break;
        }

        for task in tasks {
            output::format_task_dispatch(&task);
            for action in &task.actions {
                let result = action.input.clone().unwrap_or(Value::Null);
                echo_action(&mut conductor, &task.id, task.route, action.item_id, result)?;
            }
        }
    }

    if config.show_journal {
        output::format_journal(conductor.sequence());
    }

    let status = conductor.get_workflow_status();
    output::format_workflow_result(status, conductor.get_workflow_output());

    ensure!(status == Status::Succeeded, WorkflowNotSucceededSnafu { status });
    Ok(())
}

fn echo_action(
    conductor: &mut WorkflowConductor,
    task_id: &str,
    route: usize,
    item_id: Option<usize>,
    result: Value,
) -> Result<()> {
    let running = match item_id {
        Some(item_id) => TaskUpdate::new(Status::Running).with_item(item_id),
        None => TaskUpdate::new(Status::Running),
    };
    conductor
        .update_task_state(task_id, route, running)
        .context(ConductingSnafu)?;

    let succeeded = match item_id {
        Some(item_id) => TaskUpdate::new(Status::Succeeded)
            .with_result(result)
            .with_item(item_id),
        None => TaskUpdate::new(Status::Succeeded).with_result(result),
    };
    conductor
        .update_task_state(task_id, route, succeeded)
        .context(ConductingSnafu)?;

    Ok(())
}

fn parse_input_args(args: &[String]) -> Result<Value> {
    let mut input = serde_json::Map::new();

    for argument in args {
        let Some((name, raw)) = argument.split_once('=') else {
            return InvalidInputSnafu { argument: argument.clone() }.fail();
        };
        let value = serde_yaml::from_str::<Value>(raw)
            .unwrap_or_else(|_| Value::String(raw.to_string()));
        input.insert(name.trim().to_string(), value);
    }

    Ok(Value::Object(input))
}
