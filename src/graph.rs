use indexmap::IndexMap;
use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Join barrier attribute on a graph node: wait for all inbound
/// transitions, or for a positive count of satisfied ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Barrier {
    #[serde(rename = "*")]
    All,
    #[serde(untagged)]
    Count(u32),
}

#[derive(Debug, Clone)]
pub struct TaskNode {
    pub id: String,
    pub barrier: Option<Barrier>,
}

/// Edge weight of the workflow multigraph. `edge_ref` is the next
/// clause index within the source task and `key` disambiguates
/// parallel edges between the same pair of tasks.
#[derive(Debug, Clone)]
pub struct TaskTransition {
    pub criteria: Vec<String>,
    pub edge_ref: u32,
    pub key: u32,
}

/// An owned view of one transition, as returned by the ordered edge
/// queries.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionRef {
    pub src: String,
    pub dst: String,
    pub criteria: Vec<String>,
    pub edge_ref: u32,
    pub key: u32,
}

impl TransitionRef {
    /// Stable transition identifier, `<src>__t<edge_ref>`.
    #[must_use]
    pub fn id(&self) -> String {
        format!("{}__t{}", self.src, self.edge_ref)
    }
}

/// Directed multigraph of tasks. Node and edge insertion order is the
/// author-declared order and every query preserves it.
#[derive(Debug, Clone, Default)]
pub struct WorkflowGraph {
    graph: DiGraph<TaskNode, TaskTransition>,
    indices: IndexMap<String, NodeIndex>,
}

impl WorkflowGraph {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a task node if it does not exist yet and returns its
    /// index.
    pub fn add_task(&mut self, id: &str) -> NodeIndex {
        if let Some(&idx) = self.indices.get(id) {
            return idx;
        }
        let idx = self
            .graph
            .add_node(TaskNode { id: id.to_string(), barrier: None });
        self.indices.insert(id.to_string(), idx);
        idx
    }

    pub fn set_barrier(&mut self, id: &str, barrier: Barrier) {
        let idx = self.add_task(id);
        self.graph[idx].barrier = Some(barrier);
    }

    /// Adds one transition edge. The parallel-edge key is derived
    /// from the number of existing edges between the pair.
    pub fn add_transition(&mut self, src: &str, dst: &str, criteria: Vec<String>, edge_ref: u32) {
        let src_idx = self.add_task(src);
        let dst_idx = self.add_task(dst);

        let key = self
            .graph
            .edges_connecting(src_idx, dst_idx)
            .count() as u32;

        self.graph
            .add_edge(src_idx, dst_idx, TaskTransition { criteria, edge_ref, key });
    }

    #[must_use]
    pub fn has_task(&self, id: &str) -> bool {
        self.indices.contains_key(id)
    }

    #[must_use]
    pub fn barrier(&self, id: &str) -> Option<Barrier> {
        let idx = self.indices.get(id)?;
        self.graph[*idx].barrier
    }

    pub fn task_ids(&self) -> impl Iterator<Item = &str> {
        self.indices.keys().map(String::as_str)
    }

    /// Tasks with no inbound transitions, in declared order. These
    /// are staged when conducting starts.
    #[must_use]
    pub fn entry_tasks(&self) -> Vec<String> {
        self.indices
            .iter()
            .filter(|&(_, &idx)| {
                self.graph
                    .edges_directed(idx, Direction::Incoming)
                    .next()
                    .is_none()
            })
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Outbound transitions of `src` in declared order.
    #[must_use]
    pub fn out_transitions(&self, src: &str) -> Vec<TransitionRef> {
        self.transitions(src, Direction::Outgoing)
    }

    /// Inbound transitions of `dst` in declared order.
    #[must_use]
    pub fn in_transitions(&self, dst: &str) -> Vec<TransitionRef> {
        self.transitions(dst, Direction::Incoming)
    }

    fn transitions(&self, id: &str, direction: Direction) -> Vec<TransitionRef> {
        let Some(&idx) = self.indices.get(id) else {
            return Vec::new();
        };

        // petgraph yields a node's edges in reverse insertion order;
        // sorting by edge index restores the declared order.
        let mut edges: Vec<_> = self.graph.edges_directed(idx, direction).collect();
        edges.sort_by_key(|edge| edge.id().index());

        edges
            .into_iter()
            .map(|edge| {
                let weight = edge.weight();
                TransitionRef {
                    src: self.graph[edge.source()].id.clone(),
                    dst: self.graph[edge.target()].id.clone(),
                    criteria: weight.criteria.clone(),
                    edge_ref: weight.edge_ref,
                    key: weight.key,
                }
            })
            .collect()
    }

    /// Serializes the graph into the adjacency document consumed by
    /// external tooling: `{directed, multigraph, graph, nodes,
    /// adjacency}`.
    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut nodes = Vec::with_capacity(self.indices.len());
        let mut adjacency = Vec::with_capacity(self.indices.len());

        for (id, &idx) in &self.indices {
            let node = &self.graph[idx];
            let mut entry = serde_json::Map::new();
            entry.insert("id".to_string(), json!(id));
            if let Some(barrier) = node.barrier {
                let barrier_value = match barrier {
                    Barrier::All => json!("*"),
                    Barrier::Count(n) => json!(n),
                };
                entry.insert("barrier".to_string(), barrier_value);
            }
            nodes.push(Value::Object(entry));

            let out: Vec<Value> = self
                .out_transitions(id)
                .into_iter()
                .map(|edge| {
                    json!({
                        "id": edge.dst,
                        "key": edge.key,
                        "criteria": edge.criteria,
                    })
                })
                .collect();
            adjacency.push(Value::Array(out));
        }

        json!({
            "directed": true,
            "multigraph": true,
            "graph": {},
            "nodes": nodes,
            "adjacency": adjacency,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diamond() -> WorkflowGraph {
        let mut graph = WorkflowGraph::new();
        graph.add_task("task1");
        graph.add_transition("task1", "task2", vec!["<% succeeded() %>".to_string()], 0);
        graph.add_transition("task1", "task3", vec!["<% succeeded() %>".to_string()], 0);
        graph.add_transition("task2", "task4", vec![], 0);
        graph.add_transition("task3", "task4", vec![], 0);
        graph.set_barrier("task4", Barrier::All);
        graph
    }

    #[test]
    fn test_entry_tasks_and_declared_order() {
        let graph = diamond();
        assert_eq!(graph.entry_tasks(), vec!["task1".to_string()]);

        let out = graph.out_transitions("task1");
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].dst, "task2");
        assert_eq!(out[1].dst, "task3");
    }

    #[test]
    fn test_parallel_edges_get_distinct_keys() {
        let mut graph = WorkflowGraph::new();
        graph.add_transition("a", "b", vec![], 0);
        graph.add_transition("a", "b", vec![], 1);

        let out = graph.out_transitions("a");
        assert_eq!(out[0].key, 0);
        assert_eq!(out[1].key, 1);
        assert_eq!(out[0].id(), "a__t0");
        assert_eq!(out[1].id(), "a__t1");
    }

    #[test]
    fn test_adjacency_document_shape() {
        let graph = diamond();
        let doc = graph.to_value();

        assert_eq!(doc["directed"], true);
        assert_eq!(doc["multigraph"], true);
        assert_eq!(doc["nodes"][3]["barrier"], "*");
        assert_eq!(doc["adjacency"][0][0]["id"], "task2");
        assert_eq!(doc["adjacency"][3], json!([]));
    }
}
