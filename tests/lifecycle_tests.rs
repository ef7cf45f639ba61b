#![allow(clippy::unwrap_used)]

/// Workflow lifecycle protocol: pause, resume, cancel, invalid
/// requests, update validation, and reruns.
use serde_json::{Value, json};

use maestro::conducting::{RerunTarget, TaskUpdate};
use maestro::statuses::Status;

mod common;
use common::{conduct, forward_task, running_conductor, task_sequence};

const TWO_TASK_CHAIN: &str = r"
version: 1.0

tasks:
  task1:
    action: core.noop
    next:
      - when: <% succeeded() %>
        do: task2
  task2:
    action: core.noop
";

#[test]
fn test_workflow_dormant_until_running_requested() {
    let definition = r"
    version: 1.0
    tasks:
      task1:
        action: core.noop
    ";

    let spec = maestro::spec::WorkflowSpec::from_yaml(definition).unwrap();
    let mut conductor = maestro::conducting::WorkflowConductor::new(spec).unwrap();

    assert_eq!(conductor.get_workflow_status(), Status::Unset);
    assert!(conductor.get_next_tasks().is_empty());

    conductor.request_workflow_status(Status::Running).unwrap();
    assert_eq!(conductor.get_next_tasks().len(), 1);
}

#[test]
fn test_request_rejects_non_lifecycle_status() {
    let mut conductor = running_conductor(TWO_TASK_CHAIN);

    let err = conductor.request_workflow_status(Status::Succeeded).unwrap_err();
    assert!(err.to_string().contains("Invalid workflow status transition"));
    assert_eq!(conductor.get_workflow_status(), Status::Running);
}

#[test]
fn test_cancel_waits_for_inflight_tasks() {
    let mut conductor = running_conductor(TWO_TASK_CHAIN);

    conductor.get_next_tasks();
    conductor
        .update_task_state("task1", 0, TaskUpdate::new(Status::Running))
        .unwrap();

    // The in-flight task keeps the workflow in canceling.
    conductor.request_workflow_status(Status::Canceling).unwrap();
    assert_eq!(conductor.get_workflow_status(), Status::Canceling);
    assert!(conductor.get_next_tasks().is_empty());

    // The task's completion settles the cancellation; nothing new is
    // dispatched.
    conductor
        .update_task_state("task1", 0, TaskUpdate::new(Status::Succeeded))
        .unwrap();
    assert_eq!(conductor.get_workflow_status(), Status::Canceled);
    assert!(conductor.get_next_tasks().is_empty());
    assert_eq!(task_sequence(&conductor), ["task1"]);
}

#[test]
fn test_cancel_collapses_when_idle() {
    let mut conductor = running_conductor(TWO_TASK_CHAIN);

    conductor.request_workflow_status(Status::Canceling).unwrap();
    assert_eq!(conductor.get_workflow_status(), Status::Canceled);
}

#[test]
fn test_pause_and_resume() {
    let mut conductor = running_conductor(TWO_TASK_CHAIN);

    conductor.get_next_tasks();
    conductor
        .update_task_state("task1", 0, TaskUpdate::new(Status::Running))
        .unwrap();

    conductor.request_workflow_status(Status::Pausing).unwrap();
    assert_eq!(conductor.get_workflow_status(), Status::Pausing);

    conductor
        .update_task_state("task1", 0, TaskUpdate::new(Status::Succeeded))
        .unwrap();
    assert_eq!(conductor.get_workflow_status(), Status::Paused);
    assert!(conductor.get_next_tasks().is_empty());

    // Resume and finish.
    conductor.request_workflow_status(Status::Running).unwrap();
    conduct(&mut conductor, &[]);

    assert_eq!(conductor.get_workflow_status(), Status::Succeeded);
    assert_eq!(task_sequence(&conductor), ["task1", "task2"]);
}

#[test]
fn test_update_for_unknown_task_or_route() {
    let mut conductor = running_conductor(TWO_TASK_CHAIN);

    let err = conductor
        .update_task_state("ghost", 0, TaskUpdate::new(Status::Running))
        .unwrap_err();
    assert!(err.to_string().contains("not a valid task state entry"));

    let err = conductor
        .update_task_state("task1", 7, TaskUpdate::new(Status::Running))
        .unwrap_err();
    assert!(err.to_string().contains("not a valid task state entry"));
}

#[test]
fn test_illegal_transition_is_rejected_and_recorded() {
    let mut conductor = running_conductor(TWO_TASK_CHAIN);
    conduct(&mut conductor, &[]);
    assert_eq!(conductor.get_workflow_status(), Status::Succeeded);

    // Terminal journal entries admit no further transitions.
    let err = conductor
        .update_task_state("task1", 0, TaskUpdate::new(Status::Running))
        .unwrap_err();
    assert!(err.to_string().contains("Invalid status transition"));

    let recorded = conductor.errors().last().unwrap();
    assert_eq!(recorded.error_type, "InvalidStatusTransition");
    assert_eq!(recorded.task_id.as_deref(), Some("task1"));

    // The settled workflow status is unaffected.
    assert_eq!(conductor.get_workflow_status(), Status::Succeeded);
}

#[test]
fn test_repeated_update_is_idempotent() {
    let mut conductor = running_conductor(TWO_TASK_CHAIN);
    conductor.get_next_tasks();

    forward_task(&mut conductor, "task1", 0, Status::Succeeded, json!({"ok": true}));
    let journal_len = conductor.sequence().len();

    // The exact same terminal report is absorbed silently.
    conductor
        .update_task_state(
            "task1",
            0,
            TaskUpdate::new(Status::Succeeded).with_result(json!({"ok": true})),
        )
        .unwrap();

    assert_eq!(conductor.sequence().len(), journal_len);
    assert!(conductor.errors().is_empty());
}

#[test]
fn test_rerun_failed_task() {
    let definition = r"
    version: 1.0

    tasks:
      task1:
        action: core.noop
        next:
          - when: <% succeeded() %>
            do: task2
      task2:
        action: core.noop
        next:
          - when: <% succeeded() %>
            do: task3
      task3:
        action: core.noop
    ";

    let mut conductor = running_conductor(definition);
    conduct(&mut conductor, &[Status::Succeeded, Status::Failed]);

    assert_eq!(conductor.get_workflow_status(), Status::Failed);
    assert_eq!(task_sequence(&conductor), ["task1", "task2"]);
    assert!(!conductor.errors().is_empty());

    conductor.request_workflow_rerun(None).unwrap();

    // The failed entry is pruned, its errors cleared, and the task is
    // staged again with its prior inbound context.
    assert_eq!(conductor.get_workflow_status(), Status::Running);
    assert_eq!(task_sequence(&conductor), ["task1"]);
    assert!(conductor.errors().is_empty());
    assert!(conductor.get_staged_task("task2", 0).is_some());

    conduct(&mut conductor, &[]);
    assert_eq!(conductor.get_workflow_status(), Status::Succeeded);
    assert_eq!(task_sequence(&conductor), ["task1", "task2", "task3"]);
}

#[test]
fn test_rerun_prunes_downstream_entries() {
    let definition = r"
    version: 1.0

    tasks:
      task1:
        action: core.noop
        next:
          - when: <% completed() %>
            do: task2
      task2:
        action: core.noop
    ";

    let mut conductor = running_conductor(definition);
    conduct(&mut conductor, &[Status::Failed, Status::Succeeded]);

    // The failure was routed onward, so task2 ran and the workflow
    // finished despite the abended entry.
    assert_eq!(task_sequence(&conductor), ["task1", "task2"]);
    assert_eq!(conductor.get_workflow_status(), Status::Succeeded);

    conductor
        .request_workflow_rerun(Some(vec![RerunTarget {
            task_id: "task1".to_string(),
            route: 0,
        }]))
        .unwrap();

    // Everything journaled downstream of the target went with it.
    assert!(task_sequence(&conductor).is_empty());

    conduct(&mut conductor, &[]);
    assert_eq!(task_sequence(&conductor), ["task1", "task2"]);
    assert_eq!(conductor.get_workflow_status(), Status::Succeeded);
}

#[test]
fn test_rerun_rejects_non_failed_target() {
    let mut conductor = running_conductor(TWO_TASK_CHAIN);
    conduct(&mut conductor, &[]);

    let err = conductor
        .request_workflow_rerun(Some(vec![RerunTarget {
            task_id: "task1".to_string(),
            route: 0,
        }]))
        .unwrap_err();
    assert!(err.to_string().contains("cannot be rerun"));
}

#[test]
fn test_missing_required_input_fails_workflow() {
    let definition = r"
    version: 1.0

    input:
      - required_name

    tasks:
      task1:
        action: core.noop
    ";

    let spec = maestro::spec::WorkflowSpec::from_yaml(definition).unwrap();
    let mut conductor =
        maestro::conducting::WorkflowConductor::with_input(spec, Value::Null).unwrap();

    assert_eq!(conductor.errors().len(), 1);
    assert_eq!(conductor.errors()[0].error_type, "VariableInaccessibleError");

    conductor.request_workflow_status(Status::Running).unwrap();
    conductor.get_next_tasks();

    assert_eq!(conductor.get_workflow_status(), Status::Failed);
}
