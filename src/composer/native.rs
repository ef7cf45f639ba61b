use crate::graph::{Barrier, WorkflowGraph};
use crate::spec::{JoinSpec, WorkflowSpec};

use super::{Error, Result, SpecComposer};

pub struct NativeComposer;

impl SpecComposer for NativeComposer {
    fn catalog(&self) -> &'static str {
        "native"
    }

    fn compose(&self, definition: &str) -> Result<(WorkflowSpec, WorkflowGraph)> {
        let spec = WorkflowSpec::from_yaml(definition)?;
        let graph = compose(&spec)?;
        Ok((spec, graph))
    }
}

/// Composes the workflow graph for a native spec: one node per task
/// in declared order, one edge per `(next clause, do target)` with
/// the clause index as the edge ref, and `join` materialized as the
/// node barrier.
pub fn compose(spec: &WorkflowSpec) -> Result<WorkflowGraph> {
    let mut graph = WorkflowGraph::new();

    for task_id in spec.tasks.keys() {
        graph.add_task(task_id);
    }

    for (task_id, task) in &spec.tasks {
        if let Some(join) = &task.join {
            graph.set_barrier(task_id, barrier_from(task_id, join)?);
        }

        for (clause_idx, clause) in task.next.iter().enumerate() {
            let criteria: Vec<String> = clause.when.iter().cloned().collect();

            for target in clause.do_.targets() {
                if !spec.tasks.contains_key(target) {
                    return Err(Error::Composition {
                        message: format!(
                            "The transition from `{task_id}` references the undeclared task `{target}`."
                        ),
                    });
                }
                graph.add_transition(task_id, target, criteria.clone(), clause_idx as u32);
            }
        }
    }

    Ok(graph)
}

fn barrier_from(task_id: &str, join: &JoinSpec) -> Result<Barrier> {
    match join {
        JoinSpec::Mode(mode) if mode == "all" => Ok(Barrier::All),
        JoinSpec::Count(n) if *n > 0 => Ok(Barrier::Count(*n)),
        _ => Err(Error::Composition {
            message: format!("The task `{task_id}` declares an invalid join."),
        }),
    }
}
