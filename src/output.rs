use console::style;
use serde_json::Value;

use crate::conducting::{TaskFlowEntry, TaskInstance};
use crate::spec::SpecError;
use crate::statuses::Status;

/// Print the workflow conducting header
pub fn format_workflow_start(name: &str) {
    println!("{} {}", style("Conducting workflow:").bold(), style(name).cyan().bold());
}

/// Print the workflow input if one was provided
pub fn format_workflow_input(input: &Value) {
    if !input.is_null() {
        println!("{}", style("Input:").bold());
        print_json(input);
    }
}

/// Print a dispatched task instance with its rendered actions
pub fn format_task_dispatch(task: &TaskInstance) {
    let label = format!("[{}:{}]", task.id, task.route);
    println!("{} dispatched", style(label).cyan().bold());

    for action in &task.actions {
        let name = action.action.as_deref().unwrap_or("(no action)");
        match action.item_id {
            Some(item_id) => println!("  {} item {item_id}: {name}", style("->").dim()),
            None => println!("  {} {name}", style("->").dim()),
        }
        if let Some(input) = &action.input {
            println!("     {}", style(compact_json(input)).dim());
        }
    }
}

/// Print the journal after conducting finishes
pub fn format_journal(sequence: &[TaskFlowEntry]) {
    println!("{}", style("Journal:").bold());
    for (idx, entry) in sequence.iter().enumerate() {
        let status = styled_status(entry.status);
        println!("  {idx:>3}  {}  route {}  {status}", entry.id, entry.route);
    }
}

/// Print the terminal workflow status and rendered output
pub fn format_workflow_result(status: Status, output: Option<&Value>) {
    let status = styled_status(status);
    println!("{} {status}", style("Workflow finished:").bold());

    if let Some(output) = output {
        println!("{}", style("Output:").bold());
        print_json(output);
    }
}

/// Print a validation report
pub fn format_spec_errors(name: &str, errors: &[SpecError]) {
    if errors.is_empty() {
        println!("{} {}", style("valid").green().bold(), name);
        return;
    }

    println!("{} {}", style("invalid").red().bold(), name);
    for error in errors {
        println!(
            "  {} {}: {}",
            style(&error.error_type).yellow(),
            style(&error.spec_path).dim(),
            error.message
        );
    }
}

fn styled_status(status: Status) -> String {
    let text = status.as_str();
    match status {
        Status::Succeeded => style(text).green().bold().to_string(),
        Status::Failed | Status::Expired | Status::Abandoned => {
            style(text).red().bold().to_string()
        }
        Status::Canceled | Status::Canceling => style(text).yellow().bold().to_string(),
        _ => style(text).cyan().to_string(),
    }
}

fn print_json(value: &Value) {
    match serde_json::to_string_pretty(value) {
        Ok(rendered) => {
            for line in rendered.lines() {
                println!("  {line}");
            }
        }
        Err(_) => println!("  {value}"),
    }
}

fn compact_json(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| value.to_string())
}
