//! # Maestro - Workflow Conducting Engine
//!
//! Maestro is a deterministic, event-driven conducting engine for declarative workflows.
//! It decides which tasks should run next, in what order, with what inputs and under
//! what conditions, and reports the overall workflow outcome. It never executes tasks
//! itself: an external runner dispatches the returned task instances and reports every
//! observed status change back through the conductor.
//!
//! ## Features
//!
//! - **Graph-Based Conducting**: Workflows are composed into a directed multigraph with
//!   guarded transitions, join barriers, and cycles
//! - **Expression-Driven Control Flow**: Guards, input bindings, and publishes use an
//!   embedded expression dialect evaluated with jq
//! - **Items Iteration**: Fan-out tasks iterate over a sequence with an optional
//!   concurrency bound
//! - **Deterministic**: Identical specs, inputs, and update sequences produce identical
//!   journals, routes, and outputs
//! - **Snapshot / Rehydrate**: The complete run state serializes on demand and restores
//!   byte-for-byte equivalent behavior
//!
//! ## Core Modules
//!
//! - [`conducting`] - The workflow conductor: staging, journal, transition engine
//! - [`composer`] - Dialect front-ends that compose workflow documents into graphs
//! - [`expressions`] - Expression facade with validation and evaluation
//! - [`graph`] - The workflow multigraph model
//! - [`spec`] - Native workflow definition documents
//! - [`statuses`] / [`machines`] - Status vocabulary and transition tables
//!
//! ## Example Usage
//!
//! ```rust
//! use maestro::conducting::{TaskUpdate, WorkflowConductor};
//! use maestro::spec::WorkflowSpec;
//! use maestro::statuses::Status;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let definition = r"
//! version: 1.0
//! tasks:
//!   task1:
//!     action: core.noop
//!     next:
//!       - when: <% succeeded() %>
//!         do: task2
//!   task2:
//!     action: core.noop
//! ";
//!
//! let spec = WorkflowSpec::from_yaml(definition)?;
//! let mut conductor = WorkflowConductor::new(spec)?;
//! conductor.request_workflow_status(Status::Running)?;
//!
//! for task in conductor.get_next_tasks() {
//!     // dispatch the task's actions, then report what happened
//!     conductor.update_task_state(&task.id, task.route, TaskUpdate::new(Status::Succeeded))?;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Command-Line Interface
//!
//! Maestro ships a command-line tool for conducting, validating, and exporting
//! workflows:
//!
//! ```bash
//! # Conduct a workflow with the built-in echo runner
//! maestro run workflow.yaml
//!
//! # Validate a workflow
//! maestro validate workflow.yaml
//!
//! # Print the composed graph document
//! maestro graph workflow.yaml
//! ```
//!
//! ## Configuration
//!
//! Maestro can be configured via a configuration file (`maestro.yaml`), environment
//! variables (prefix: `MAESTRO__`), and command-line arguments. See
//! [`config::MaestroConfig`] for available options.

pub mod composer;
pub mod conducting;
pub mod config;
pub mod context;
pub mod expressions;
pub mod graph;
pub mod machines;
pub mod output;
pub mod spec;
pub mod statuses;
