#![allow(dead_code)]

use serde_json::Value;

use maestro::conducting::{TaskUpdate, WorkflowConductor};
use maestro::spec::WorkflowSpec;
use maestro::statuses::Status;

/// Builds a conductor from an inline workflow definition and requests
/// `RUNNING`.
pub fn running_conductor(definition: &str) -> WorkflowConductor {
    running_conductor_with_input(definition, Value::Null)
}

pub fn running_conductor_with_input(definition: &str, input: Value) -> WorkflowConductor {
    let spec = WorkflowSpec::from_yaml(definition).unwrap();
    assert!(spec.inspect().is_empty(), "workflow definition must inspect clean");

    let mut conductor = WorkflowConductor::with_input(spec, input).unwrap();
    conductor.request_workflow_status(Status::Running).unwrap();
    conductor
}

/// Forwards a task through `RUNNING` and then the given terminal
/// status, echoing the action input as the result on success.
pub fn forward_task(
    conductor: &mut WorkflowConductor,
    task_id: &str,
    route: usize,
    status: Status,
    result: Value,
) {
    conductor
        .update_task_state(task_id, route, TaskUpdate::new(Status::Running))
        .unwrap();

    let mut update = TaskUpdate::new(status);
    if status == Status::Succeeded {
        update = update.with_result(result);
    }
    conductor.update_task_state(task_id, route, update).unwrap();
}

/// Forwards one item of a with-items task through `RUNNING` and then
/// the given terminal status.
pub fn forward_item(
    conductor: &mut WorkflowConductor,
    task_id: &str,
    route: usize,
    item_id: usize,
    status: Status,
    result: Value,
) {
    conductor
        .update_task_state(
            task_id,
            route,
            TaskUpdate::new(Status::Running).with_item(item_id),
        )
        .unwrap();

    let mut update = TaskUpdate::new(status).with_item(item_id);
    if status == Status::Succeeded {
        update = update.with_result(result);
    }
    conductor.update_task_state(task_id, route, update).unwrap();
}

/// Drives the conductor to quiescence, resolving each dispatched
/// action with the next status from `mock_statuses` (succeeding with
/// the rendered input as the result once the list is exhausted).
/// Returns the task ids in dispatch order.
pub fn conduct(conductor: &mut WorkflowConductor, mock_statuses: &[Status]) -> Vec<String> {
    let mut dispatch_order = Vec::new();
    let mut cursor = 0;

    while conductor.get_workflow_status() == Status::Running {
        let tasks = conductor.get_next_tasks();
        if tasks.is_empty() {
            break;
        }

        for task in tasks {
            dispatch_order.push(task.id.clone());
            for action in &task.actions {
                let status = mock_statuses.get(cursor).copied().unwrap_or(Status::Succeeded);
                cursor += 1;
                let result = action.input.clone().unwrap_or(Value::Null);

                match action.item_id {
                    Some(item_id) => {
                        forward_item(conductor, &task.id, task.route, item_id, status, result);
                    }
                    None => forward_task(conductor, &task.id, task.route, status, result),
                }
            }
        }
    }

    dispatch_order
}

/// The journal's task ids, in order.
pub fn task_sequence(conductor: &WorkflowConductor) -> Vec<String> {
    conductor
        .sequence()
        .iter()
        .map(|entry| entry.id.clone())
        .collect()
}
