use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use snafu::prelude::*;

use crate::graph::WorkflowGraph;
use crate::spec::{DoSpec, JoinSpec, NextSpec, TaskSpec, WorkflowSpec};

use super::{Error, Result, SpecComposer};

/// Legacy dialect front-end. Documents carry `on-success` /
/// `on-error` / `on-complete` transition lists and task-level
/// `publish`; translation rewrites them into native `next` clauses
/// with the equivalent guards, then composition is shared with the
/// native front-end.
pub struct MistralComposer;

impl SpecComposer for MistralComposer {
    fn catalog(&self) -> &'static str {
        "mistral"
    }

    fn compose(&self, definition: &str) -> Result<(WorkflowSpec, WorkflowGraph)> {
        let legacy: MistralWorkflowSpec =
            serde_yaml::from_str(definition).map_err(|source| Error::Composition {
                message: format!("Workflow definition parse error: {source}"),
            })?;
        let spec = convert(&legacy);
        let graph = super::native::compose(&spec)?;
        Ok((spec, graph))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MistralWorkflowSpec {
    #[serde(default)]
    pub version: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vars: Option<IndexMap<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<IndexMap<String, Value>>,
    #[serde(default)]
    pub tasks: IndexMap<String, MistralTaskSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MistralTaskSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publish: Option<IndexMap<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join: Option<JoinSpec>,
    #[serde(rename = "on-success", default, skip_serializing_if = "Vec::is_empty")]
    pub on_success: Vec<OnClause>,
    #[serde(rename = "on-error", default, skip_serializing_if = "Vec::is_empty")]
    pub on_error: Vec<OnClause>,
    #[serde(rename = "on-complete", default, skip_serializing_if = "Vec::is_empty")]
    pub on_complete: Vec<OnClause>,
}

/// A legacy transition entry: a bare task name, or a single-entry
/// mapping of task name to an additional guard expression.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OnClause {
    Target(String),
    Guarded(IndexMap<String, String>),
}

/// Translates a legacy document into the common native spec.
#[must_use]
pub fn convert(legacy: &MistralWorkflowSpec) -> WorkflowSpec {
    let vars = legacy.vars.as_ref().map(|vars| {
        vars.iter()
            .map(|(name, value)| {
                let mut entry = IndexMap::new();
                entry.insert(name.clone(), value.clone());
                entry
            })
            .collect()
    });

    let output = legacy.output.as_ref().map(|output| {
        output
            .iter()
            .map(|(name, value)| {
                let mut entry = IndexMap::new();
                entry.insert(name.clone(), value.clone());
                entry
            })
            .collect()
    });

    let mut tasks = IndexMap::new();
    for (task_id, task) in &legacy.tasks {
        tasks.insert(task_id.clone(), convert_task(task));
    }

    WorkflowSpec {
        version: legacy.version.clone(),
        description: legacy.description.clone(),
        input: None,
        vars,
        output,
        tasks,
    }
}

fn convert_task(task: &MistralTaskSpec) -> TaskSpec {
    let mut next = Vec::new();

    let publish: Vec<IndexMap<String, Value>> = task
        .publish
        .as_ref()
        .map(|publish| {
            publish
                .iter()
                .map(|(name, value)| {
                    let mut entry = IndexMap::new();
                    entry.insert(name.clone(), value.clone());
                    entry
                })
                .collect()
        })
        .unwrap_or_default();

    append_clauses(&mut next, &task.on_success, "<% succeeded() %>", &publish);
    append_clauses(&mut next, &task.on_error, "<% failed() %>", &[]);
    append_clauses(&mut next, &task.on_complete, "<% completed() %>", &[]);

    // Publish without a transition still has to fire on success.
    if !publish.is_empty() && task.on_success.is_empty() {
        next.push(NextSpec {
            when: Some("<% succeeded() %>".to_string()),
            publish,
            do_: DoSpec::default(),
        });
    }

    TaskSpec {
        vars: None,
        action: task.action.clone(),
        input: task.input.clone(),
        delay: None,
        join: task.join.clone(),
        with: None,
        next,
    }
}

fn append_clauses(
    next: &mut Vec<NextSpec>,
    clauses: &[OnClause],
    condition: &str,
    publish: &[IndexMap<String, Value>],
) {
    if clauses.is_empty() {
        return;
    }

    let mut plain_targets = Vec::new();
    let mut guarded = Vec::new();

    for clause in clauses {
        match clause {
            OnClause::Target(target) => plain_targets.push(target.clone()),
            OnClause::Guarded(entry) => {
                for (target, guard) in entry {
                    guarded.push((target.clone(), guard.clone()));
                }
            }
        }
    }

    if !plain_targets.is_empty() {
        next.push(NextSpec {
            when: Some(condition.to_string()),
            publish: publish.to_vec(),
            do_: DoSpec::Many(plain_targets),
        });
    }

    for (target, guard) in guarded {
        let inner = guard
            .trim()
            .trim_start_matches("<%")
            .trim_end_matches("%>")
            .trim()
            .to_string();
        next.push(NextSpec {
            when: Some(format!(
                "<% {} and ({inner}) %>",
                condition.trim_start_matches("<%").trim_end_matches("%>").trim()
            )),
            publish: Vec::new(),
            do_: DoSpec::One(target),
        });
    }
}
