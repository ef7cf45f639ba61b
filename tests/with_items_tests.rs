#![allow(clippy::unwrap_used)]

/// Items-iteration scenarios: materialization, concurrency caps,
/// aggregation of per-item statuses, and cyclic retries.
use serde_json::{Value, json};

use maestro::conducting::{ActionCall, TaskUpdate};
use maestro::statuses::Status;

mod common;
use common::{forward_item, running_conductor, task_sequence};

#[test]
fn test_empty_items_list() {
    let definition = r"
    version: 1.0

    vars:
      - xs: []

    tasks:
      task1:
        with: <% ctx(xs) %>
        action: core.echo message=<% item() %>
        next:
          - publish:
              - items: <% result() %>

    output:
      - items: <% ctx(items) %>
    ";

    let mut conductor = running_conductor(definition);

    // An empty sequence completes the task without dispatch.
    let tasks = conductor.get_next_tasks();
    assert!(tasks.is_empty());

    assert!(conductor.get_staged_task("task1", 0).is_none());
    assert_eq!(conductor.get_task_status("task1", 0), Status::Succeeded);
    assert_eq!(conductor.get_workflow_status(), Status::Succeeded);
    assert_eq!(conductor.get_workflow_output(), Some(&json!({"items": []})));
}

#[test]
fn test_basic_items_list() {
    let definition = r"
    version: 1.0

    vars:
      - xs:
          - fee
          - fi
          - fo
          - fum

    tasks:
      task1:
        with: <% ctx(xs) %>
        action: core.echo message=<% item() %>
        next:
          - publish:
              - items: <% result() %>

    output:
      - items: <% ctx(items) %>
    ";

    let mut conductor = running_conductor(definition);

    let tasks = conductor.get_next_tasks();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].id, "task1");
    assert_eq!(tasks[0].ctx["xs"], json!(["fee", "fi", "fo", "fum"]));

    let expected_actions: Vec<ActionCall> = ["fee", "fi", "fo", "fum"]
        .iter()
        .enumerate()
        .map(|(item_id, message)| ActionCall {
            action: Some("core.echo".to_string()),
            input: Some(json!({"message": message})),
            item_id: Some(item_id),
        })
        .collect();
    assert_eq!(tasks[0].actions, expected_actions);

    // Resolve the items one at a time and watch the aggregate status.
    let items = ["fee", "fi", "fo", "fum"];
    for (item_id, message) in items.iter().enumerate() {
        forward_item(&mut conductor, "task1", 0, item_id, Status::Succeeded, json!(message));

        let expected = if item_id + 1 == items.len() {
            Status::Succeeded
        } else {
            Status::Running
        };
        assert_eq!(conductor.get_task_status("task1", 0), expected);
        assert_eq!(conductor.get_workflow_status(), expected);
    }

    assert!(conductor.get_staged_task("task1", 0).is_none());
    assert_eq!(
        conductor.get_workflow_output(),
        Some(&json!({"items": ["fee", "fi", "fo", "fum"]}))
    );
}

#[test]
fn test_items_list_with_concurrency() {
    let definition = r"
    version: 1.0

    vars:
      - concurrency: 2
      - xs:
          - fee
          - fi
          - fo
          - fum

    tasks:
      task1:
        with:
          items: <% ctx(xs) %>
          concurrency: <% ctx(concurrency) %>
        action: core.echo message=<% item() %>
        next:
          - publish:
              - items: <% result() %>

    output:
      - items: <% ctx(items) %>
    ";

    let mut conductor = running_conductor(definition);

    // Only the first two items fit under the cap.
    let tasks = conductor.get_next_tasks();
    let item_ids: Vec<Option<usize>> = tasks[0].actions.iter().map(|a| a.item_id).collect();
    assert_eq!(item_ids, [Some(0), Some(1)]);

    // Nothing else can be dispatched while both are in flight.
    assert!(conductor.get_next_tasks().is_empty());

    forward_item(&mut conductor, "task1", 0, 0, Status::Succeeded, json!("fee"));
    let tasks = conductor.get_next_tasks();
    assert_eq!(tasks[0].actions.len(), 1);
    assert_eq!(tasks[0].actions[0].item_id, Some(2));

    forward_item(&mut conductor, "task1", 0, 1, Status::Succeeded, json!("fi"));
    let tasks = conductor.get_next_tasks();
    assert_eq!(tasks[0].actions[0].item_id, Some(3));

    forward_item(&mut conductor, "task1", 0, 2, Status::Succeeded, json!("fo"));
    forward_item(&mut conductor, "task1", 0, 3, Status::Succeeded, json!("fum"));

    assert!(conductor.get_staged_task("task1", 0).is_none());
    assert_eq!(conductor.get_workflow_status(), Status::Succeeded);
    assert_eq!(
        conductor.get_workflow_output(),
        Some(&json!({"items": ["fee", "fi", "fo", "fum"]}))
    );
}

#[test]
fn test_multiple_items_list() {
    let definition = r"
    version: 1.0

    vars:
      - xs:
          - foo
          - fu
          - marco
      - ys:
          - bar
          - bar
          - polo

    tasks:
      task1:
        with: x, y in <% zip(ctx(xs), ctx(ys)) %>
        action: core.echo message=<% item(x) + item(y) %>
        next:
          - publish:
              - items: <% result() %>

    output:
      - items: <% ctx(items) %>
    ";

    let mut conductor = running_conductor(definition);

    let tasks = conductor.get_next_tasks();
    let inputs: Vec<Option<Value>> = tasks[0].actions.iter().map(|a| a.input.clone()).collect();
    assert_eq!(
        inputs,
        [
            Some(json!({"message": "foobar"})),
            Some(json!({"message": "fubar"})),
            Some(json!({"message": "marcopolo"})),
        ]
    );

    for (item_id, message) in ["foobar", "fubar", "marcopolo"].iter().enumerate() {
        forward_item(&mut conductor, "task1", 0, item_id, Status::Succeeded, json!(message));
    }

    assert_eq!(conductor.get_workflow_status(), Status::Succeeded);
    assert_eq!(
        conductor.get_workflow_output(),
        Some(&json!({"items": ["foobar", "fubar", "marcopolo"]}))
    );
}

#[test]
fn test_failed_item_task_dormant_other_items_unreported() {
    let definition = r"
    version: 1.0

    vars:
      - xs:
          - fee
          - fi
          - fo
          - fum

    tasks:
      task1:
        with: <% ctx(xs) %>
        action: core.echo message=<% item() %>
    ";

    let mut conductor = running_conductor(definition);
    let tasks = conductor.get_next_tasks();
    assert_eq!(tasks[0].actions.len(), 4);

    forward_item(&mut conductor, "task1", 0, 0, Status::Succeeded, json!("fee"));
    assert_eq!(conductor.get_task_status("task1", 0), Status::Running);
    assert_eq!(conductor.get_workflow_status(), Status::Running);

    // The failure lands while no other item is active, so the task
    // abends even though two items never reported.
    forward_item(&mut conductor, "task1", 0, 1, Status::Failed, Value::Null);
    assert_eq!(conductor.get_task_status("task1", 0), Status::Failed);
    assert_eq!(conductor.get_workflow_status(), Status::Failed);
    assert!(conductor.get_staged_task("task1", 0).is_none());
}

#[test]
fn test_failed_item_task_active_until_items_drain() {
    let definition = r"
    version: 1.0

    vars:
      - xs:
          - fee
          - fi
          - fo
          - fum

    tasks:
      task1:
        with: <% ctx(xs) %>
        action: core.echo message=<% item() %>
    ";

    let mut conductor = running_conductor(definition);
    conductor.get_next_tasks();

    // Mark every item as running first.
    for item_id in 0..4 {
        conductor
            .update_task_state("task1", 0, TaskUpdate::new(Status::Running).with_item(item_id))
            .unwrap();
    }

    let finals = [
        (0, Status::Succeeded, Status::Running),
        (1, Status::Failed, Status::Running),
        (2, Status::Succeeded, Status::Running),
        (3, Status::Succeeded, Status::Failed),
    ];

    for (item_id, status, expected_task_status) in finals {
        let mut update = TaskUpdate::new(status).with_item(item_id);
        if status == Status::Succeeded {
            update = update.with_result(json!("ok"));
        }
        conductor.update_task_state("task1", 0, update).unwrap();
        assert_eq!(conductor.get_task_status("task1", 0), expected_task_status);
    }

    assert_eq!(conductor.get_workflow_status(), Status::Failed);
}

#[test]
fn test_concurrency_cap_holds_under_failures() {
    let definition = r"
    version: 1.0

    vars:
      - xs:
          - fee
          - fi
          - fo
          - fum

    tasks:
      task1:
        with:
          items: <% ctx(xs) %>
          concurrency: 2
        action: core.echo message=<% item() %>
    ";

    let mut conductor = running_conductor(definition);

    let tasks = conductor.get_next_tasks();
    assert_eq!(tasks[0].actions.len(), 2);

    forward_item(&mut conductor, "task1", 0, 0, Status::Succeeded, json!("fee"));

    // One slot freed, one new item dispatched.
    let tasks = conductor.get_next_tasks();
    assert_eq!(tasks[0].actions.len(), 1);

    // The failure drains the slate: item 1 abends while item 2 is
    // dispatched but unreported, so the task stays running until the
    // in-flight item resolves.
    conductor
        .update_task_state(
            "task1",
            0,
            TaskUpdate::new(Status::Running).with_item(2),
        )
        .unwrap();
    forward_item(&mut conductor, "task1", 0, 1, Status::Failed, Value::Null);
    assert_eq!(conductor.get_task_status("task1", 0), Status::Running);

    forward_item(&mut conductor, "task1", 0, 2, Status::Succeeded, json!("fo"));
    assert_eq!(conductor.get_task_status("task1", 0), Status::Failed);
    assert_eq!(conductor.get_workflow_status(), Status::Failed);
}

#[test]
fn test_items_cycle_resets_slate() {
    let definition = r"
    version: 1.0

    vars:
      - xs:
          - fee
          - fi
          - fo
          - fum

    tasks:
      init:
        action: core.noop
        next:
          - do: task1
      task1:
        with: <% ctx(xs) %>
        action: core.echo message=<% item() %>
        next:
          - when: <% failed() %>
            do: task1
    ";

    let mut conductor = running_conductor(definition);
    common::forward_task(&mut conductor, "init", 0, Status::Succeeded, Value::Null);

    let tasks = conductor.get_next_tasks();
    assert_eq!(tasks[0].actions.len(), 4);

    forward_item(&mut conductor, "task1", 0, 0, Status::Succeeded, json!("fee"));
    forward_item(&mut conductor, "task1", 0, 1, Status::Failed, Value::Null);

    // The failure is remediated by the cycle: the task is staged anew
    // on a fresh route with a clean item slate.
    assert_eq!(conductor.get_task_status("task1", 0), Status::Failed);
    assert_eq!(conductor.get_workflow_status(), Status::Running);

    let staged = conductor.get_staged_task("task1", 1).unwrap();
    assert!(staged.items.is_none());

    let tasks = conductor.get_next_tasks();
    assert_eq!(tasks[0].id, "task1");
    assert_eq!(tasks[0].route, 1);
    assert_eq!(tasks[0].actions.len(), 4);

    for (item_id, message) in ["fee", "fi", "fo", "fum"].iter().enumerate() {
        forward_item(&mut conductor, "task1", 1, item_id, Status::Succeeded, json!(message));
    }

    assert!(conductor.get_staged_task("task1", 1).is_none());
    assert_eq!(conductor.get_workflow_status(), Status::Succeeded);
    assert_eq!(
        task_sequence(&conductor),
        ["init", "task1", "task1"]
    );
}

#[test]
fn test_item_updates_validated() {
    let definition = r"
    version: 1.0

    vars:
      - xs:
          - fee

    tasks:
      task1:
        with: <% ctx(xs) %>
        action: core.echo message=<% item() %>
    ";

    let mut conductor = running_conductor(definition);
    conductor.get_next_tasks();

    // An items task requires an item id on every update.
    let err = conductor
        .update_task_state("task1", 0, TaskUpdate::new(Status::Running))
        .unwrap_err();
    assert!(err.to_string().contains("item id is required"));

    // Out-of-range item ids are rejected.
    let err = conductor
        .update_task_state("task1", 0, TaskUpdate::new(Status::Running).with_item(7))
        .unwrap_err();
    assert!(err.to_string().contains("out of range"));
}
