use std::collections::{BTreeMap, HashMap, HashSet};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use snafu::prelude::*;
use tracing::{debug, warn};

use crate::composer;
use crate::context::ContextStore;
use crate::expressions::{self, RenderScope};
use crate::graph::{Barrier, WorkflowGraph};
use crate::machines;
use crate::spec::{InputSpec, TaskSpec, WithSpec, WorkflowSpec};
use crate::statuses::Status;

mod items;
mod snapshot;

pub use items::{ItemState, ItemsSlate, StagedItem};
pub use snapshot::{SNAPSHOT_VERSION, WorkflowSnapshot};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("The task `{task_id}` on route {route} is not a valid task state entry."))]
    InvalidTaskStateEntry { task_id: String, route: usize },

    #[snafu(display("Invalid status transition for task `{task_id}`: {from} -> {to}."))]
    InvalidStatusTransition { task_id: String, from: Status, to: Status },

    #[snafu(display("Invalid workflow status transition: {from} -> {to}."))]
    InvalidWorkflowStatusTransition { from: Status, to: Status },

    #[snafu(display("Invalid item for task `{task_id}`: {message}"))]
    InvalidItemId { task_id: String, message: String },

    #[snafu(display("The task `{task_id}` on route {route} has not failed and cannot be rerun."))]
    InvalidTaskRerun { task_id: String, route: usize },

    #[snafu(display("Workflow composition error: {source}"))]
    Composition { source: composer::Error },

    #[snafu(display("Snapshot serialization error: {source}"))]
    Serialization { source: serde_json::Error },

    #[snafu(display("Snapshot version {found} is not supported."))]
    SnapshotVersion { found: u32 },
}

pub type Result<T> = std::result::Result<T, Error>;

/// One recorded conductor error, in the external report shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReport {
    #[serde(rename = "type")]
    pub error_type: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_transition_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorReport {
    fn new(error_type: &str, message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.to_string(),
            message: message.into(),
            task_id: None,
            route: None,
            task_transition_id: None,
            data: None,
        }
    }

    fn for_task(mut self, task_id: &str, route: usize) -> Self {
        self.task_id = Some(task_id.to_string());
        self.route = Some(route);
        self
    }

    fn with_transition(mut self, task_transition_id: String) -> Self {
        self.task_transition_id = Some(task_transition_id);
        self
    }
}

/// A status report handed to [`WorkflowConductor::update_task_state`].
#[derive(Debug, Clone)]
pub struct TaskUpdate {
    pub status: Status,
    pub result: Option<Value>,
    pub item_id: Option<usize>,
}

impl TaskUpdate {
    #[must_use]
    pub fn new(status: Status) -> Self {
        Self { status, result: None, item_id: None }
    }

    #[must_use]
    pub fn with_result(mut self, result: Value) -> Self {
        self.result = Some(result);
        self
    }

    #[must_use]
    pub fn with_item(mut self, item_id: usize) -> Self {
        self.item_id = Some(item_id);
        self
    }
}

/// Inbound and published context frame indices of a journal entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryContexts {
    #[serde(rename = "in")]
    pub in_: Vec<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub out: Option<usize>,
}

/// One journal record. Entries are append-only; once `term` is set
/// the status, result and published frame never change again (only a
/// rerun may prune the entry altogether).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFlowEntry {
    pub id: String,
    pub route: usize,
    pub ctxs: EntryContexts,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub prev: Vec<usize>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub next: BTreeMap<u32, bool>,
    pub status: Status,
    #[serde(default)]
    pub term: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Vec<ItemState>>,
}

/// A task instance waiting in the staging area: either ready for
/// dispatch, or gated behind a join barrier accumulating inbound
/// contexts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagedTask {
    pub id: String,
    pub route: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ctxs: Vec<usize>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub prev: Vec<usize>,
    pub ready: bool,
    #[serde(default)]
    pub dispatched: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<ItemsSlate>,
}

/// One dispatchable action execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionCall {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item_id: Option<usize>,
}

/// A dispatchable task instance returned by `get_next_tasks`.
#[derive(Debug, Clone, Serialize)]
pub struct TaskInstance {
    pub id: String,
    pub route: usize,
    /// The composed inbound context the actions were rendered under.
    pub ctx: Value,
    pub actions: Vec<ActionCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay: Option<u64>,
    pub spec: TaskSpec,
}

/// A rerun target, naming the latest journal entry of a task on a
/// route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RerunTarget {
    pub task_id: String,
    pub route: usize,
}

/// The conductor's complete mutable state; everything needed to
/// rehydrate behavior from a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConductorState {
    pub status: Status,
    pub tasks: IndexMap<String, usize>,
    pub sequence: Vec<TaskFlowEntry>,
    pub contexts: ContextStore,
    pub staged: Vec<StagedTask>,
    pub errors: Vec<ErrorReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
}

enum JoinState {
    Ready,
    Waiting,
    Unsatisfiable,
}

fn flow_key(task_id: &str, route: usize) -> String {
    format!("{task_id}__r{route}")
}

fn expression_error_type(error: &expressions::Error) -> &'static str {
    match error {
        expressions::Error::ContextValue { .. } => "ContextValueError",
        expressions::Error::Evaluation { .. } => "ExpressionEvaluationError",
    }
}

/// The workflow conductor: a value that owns the composed graph and
/// all run state, advanced exclusively through its public surface.
/// It performs no I/O and never executes actions itself; callers pull
/// dispatchable work with `get_next_tasks` and feed observed statuses
/// back through `update_task_state`.
#[derive(Debug, Clone)]
pub struct WorkflowConductor {
    spec: WorkflowSpec,
    graph: WorkflowGraph,
    state: ConductorState,
}

impl WorkflowConductor {
    /// Compiles the spec and stages the entry tasks. The workflow
    /// stays dormant until `RUNNING` is requested.
    pub fn new(spec: WorkflowSpec) -> Result<Self> {
        Self::with_input(spec, Value::Null)
    }

    pub fn with_input(spec: WorkflowSpec, input: Value) -> Result<Self> {
        let graph = composer::native::compose(&spec).context(CompositionSnafu)?;

        let mut errors = Vec::new();
        let mut root = serde_json::Map::new();
        let provided = input.as_object().cloned().unwrap_or_default();

        if let Some(inputs) = &spec.input {
            for entry in inputs {
                match entry {
                    InputSpec::Name(name) => match provided.get(name) {
                        Some(value) => {
                            root.insert(name.clone(), value.clone());
                        }
                        None => errors.push(
                            ErrorReport::new(
                                "VariableInaccessibleError",
                                format!("The required workflow input `{name}` was not provided."),
                            ),
                        ),
                    },
                    InputSpec::Defaulted(defaults) => {
                        for (name, default) in defaults {
                            let value =
                                provided.get(name).cloned().unwrap_or_else(|| default.clone());
                            root.insert(name.clone(), value);
                        }
                    }
                }
            }
        }

        if let Some(vars) = &spec.vars {
            for entry in vars {
                for (name, value) in entry {
                    let ctx = json!({
                        "__vars": Value::Object(root.clone()),
                        "__current_task": Value::Null,
                        "__current_status": Value::Null,
                        "__task_states": {},
                        "__result": Value::Null,
                        "__item": Value::Null,
                    });
                    match expressions::evaluate(value, &ctx) {
                        Ok(rendered) => {
                            root.insert(name.clone(), rendered);
                        }
                        Err(e) => errors.push(ErrorReport::new(
                            "ExpressionEvaluationError",
                            e.to_string(),
                        )),
                    }
                }
            }
        }

        let state = ConductorState {
            status: Status::Unset,
            tasks: IndexMap::new(),
            sequence: Vec::new(),
            contexts: ContextStore::new(Value::Object(root)),
            staged: Vec::new(),
            errors,
            output: None,
        };

        let mut conductor = Self { spec, graph, state };
        for task_id in conductor.graph.entry_tasks() {
            conductor.state.staged.push(StagedTask {
                id: task_id,
                route: 0,
                ctxs: Vec::new(),
                prev: Vec::new(),
                ready: true,
                dispatched: false,
                items: None,
            });
        }

        Ok(conductor)
    }

    #[must_use]
    pub fn spec(&self) -> &WorkflowSpec {
        &self.spec
    }

    #[must_use]
    pub fn graph(&self) -> &WorkflowGraph {
        &self.graph
    }

    #[must_use]
    pub fn contexts(&self) -> &ContextStore {
        &self.state.contexts
    }

    #[must_use]
    pub fn sequence(&self) -> &[TaskFlowEntry] {
        &self.state.sequence
    }

    #[must_use]
    pub fn errors(&self) -> &[ErrorReport] {
        &self.state.errors
    }

    #[must_use]
    pub fn get_workflow_status(&self) -> Status {
        self.state.status
    }

    /// The rendered workflow output, available once the workflow has
    /// succeeded.
    #[must_use]
    pub fn get_workflow_output(&self) -> Option<&Value> {
        self.state.output.as_ref()
    }

    /// The staged instance of a task, if any.
    #[must_use]
    pub fn get_staged_task(&self, task_id: &str, route: usize) -> Option<&StagedTask> {
        self.state
            .staged
            .iter()
            .find(|staged| staged.id == task_id && staged.route == route)
    }

    /// The status of the latest journal entry of `task_id` visible
    /// from `route`, or `Unset`.
    #[must_use]
    pub fn get_task_status(&self, task_id: &str, route: usize) -> Status {
        self.latest_visible_entry(task_id, route)
            .map(|entry| entry.status)
            .unwrap_or(Status::Unset)
    }

    /// Admits a lifecycle request. Pause and cancel requests collapse
    /// directly to their settled form when nothing is in flight.
    pub fn request_workflow_status(&mut self, status: Status) -> Result<()> {
        let current = self.state.status;

        if !machines::requestable_workflow_status(status) {
            return InvalidWorkflowStatusTransitionSnafu { from: current, to: status }.fail();
        }

        let idle = !self.has_inflight();
        match machines::resolve_workflow_request(current, status, idle) {
            Some(resolved) => {
                debug!(from = current.as_str(), to = resolved.as_str(), "workflow lifecycle request");
                self.state.status = resolved;
                Ok(())
            }
            None => InvalidWorkflowStatusTransitionSnafu { from: current, to: status }.fail(),
        }
    }

    /// Returns the dispatchable task instances, rendering their
    /// actions on the way out. Items sequences are materialized here,
    /// empty sequences complete their task immediately, and a render
    /// failure moves the task to `FAILED` without dispatch.
    pub fn get_next_tasks(&mut self) -> Vec<TaskInstance> {
        // Settle pending lifecycle requests and recorded errors
        // before handing out new work.
        self.update_workflow_status();
        if self.state.status != Status::Running {
            return Vec::new();
        }

        let mut instances = Vec::new();
        let staged_keys: Vec<(String, usize)> = self
            .state
            .staged
            .iter()
            .map(|staged| (staged.id.clone(), staged.route))
            .collect();

        for (id, route) in staged_keys {
            let Some(pos) = self.staged_pos(&id, route) else {
                continue;
            };
            if !self.state.staged[pos].ready {
                continue;
            }
            let Some(task_spec) = self.spec.tasks.get(&id).cloned() else {
                continue;
            };

            let instance = match task_spec.with.clone() {
                Some(with) => self.next_items_instance(pos, &id, route, &task_spec, &with),
                None => self.next_task_instance(pos, &id, route, &task_spec),
            };
            if let Some(instance) = instance {
                instances.push(instance);
            }
        }

        self.update_workflow_status();
        instances
    }

    /// Applies one observed status change. Invalid updates are
    /// recorded as errors and leave the state untouched; an update
    /// that repeats the already-applied status and result is a no-op.
    pub fn update_task_state(
        &mut self,
        task_id: &str,
        route: usize,
        update: TaskUpdate,
    ) -> Result<()> {
        let applied = self.apply_task_update(task_id, route, update);
        if let Err(error) = &applied {
            warn!(task = task_id, route, %error, "rejected task state update");
            self.record_update_error(error, task_id, route);
        }
        self.update_workflow_status();
        applied
    }

    /// Rewinds failed tasks: their journal entries and everything
    /// journaled downstream of them are pruned, errors scoped to the
    /// pruned entries are cleared, and the tasks are staged again
    /// with their prior inbound contexts. Entries of still-succeeded
    /// tasks keep their order and published frames.
    pub fn request_workflow_rerun(&mut self, targets: Option<Vec<RerunTarget>>) -> Result<()> {
        let target_idxs: Vec<usize> = match &targets {
            None => {
                let mut idxs: Vec<usize> = self
                    .state
                    .tasks
                    .values()
                    .copied()
                    .filter(|&idx| self.state.sequence[idx].status.is_abended())
                    .collect();
                idxs.sort_unstable();
                idxs
            }
            Some(list) => {
                let mut idxs = Vec::new();
                for target in list {
                    let key = flow_key(&target.task_id, target.route);
                    let Some(&idx) = self.state.tasks.get(&key) else {
                        return InvalidTaskStateEntrySnafu {
                            task_id: target.task_id.clone(),
                            route: target.route,
                        }
                        .fail();
                    };
                    if !self.state.sequence[idx].status.is_abended() {
                        return InvalidTaskRerunSnafu {
                            task_id: target.task_id.clone(),
                            route: target.route,
                        }
                        .fail();
                    }
                    idxs.push(idx);
                }
                idxs.sort_unstable();
                idxs.dedup();
                idxs
            }
        };

        if target_idxs.is_empty() {
            return Ok(());
        }

        // Transitive closure of journal entries downstream of the
        // targets, following prev links.
        let mut removed: HashSet<usize> = target_idxs.iter().copied().collect();
        loop {
            let mut changed = false;
            for (idx, entry) in self.state.sequence.iter().enumerate() {
                if !removed.contains(&idx) && entry.prev.iter().any(|p| removed.contains(p)) {
                    removed.insert(idx);
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }

        let restage: Vec<(StagedTask, Vec<usize>)> = target_idxs
            .iter()
            .map(|&idx| {
                let entry = &self.state.sequence[idx];
                (
                    StagedTask {
                        id: entry.id.clone(),
                        route: entry.route,
                        ctxs: entry.ctxs.in_.clone(),
                        prev: Vec::new(),
                        ready: true,
                        dispatched: false,
                        items: None,
                    },
                    entry.prev.clone(),
                )
            })
            .collect();

        let removed_tasks: HashSet<(String, usize)> = removed
            .iter()
            .map(|&idx| {
                let entry = &self.state.sequence[idx];
                (entry.id.clone(), entry.route)
            })
            .collect();

        // Journal entries only reference earlier entries, so a single
        // forward pass remaps every retained prev link.
        let mut remap: HashMap<usize, usize> = HashMap::new();
        let mut sequence = Vec::new();
        for (idx, entry) in self.state.sequence.iter().enumerate() {
            if removed.contains(&idx) {
                continue;
            }
            let mut entry = entry.clone();
            entry.prev = entry
                .prev
                .iter()
                .filter_map(|p| remap.get(p).copied())
                .collect();
            remap.insert(idx, sequence.len());
            sequence.push(entry);
        }

        let mut tasks = IndexMap::new();
        for (idx, entry) in sequence.iter().enumerate() {
            tasks.insert(flow_key(&entry.id, entry.route), idx);
        }

        self.state.staged.retain(|staged| {
            !removed_tasks.contains(&(staged.id.clone(), staged.route))
                && !staged.prev.iter().any(|p| removed.contains(p))
        });
        for staged in &mut self.state.staged {
            staged.prev = staged
                .prev
                .iter()
                .filter_map(|p| remap.get(p).copied())
                .collect();
        }

        self.state.errors.retain(|error| match (&error.task_id, error.route) {
            (Some(task_id), Some(route)) => !removed_tasks.contains(&(task_id.clone(), route)),
            _ => true,
        });

        self.state.sequence = sequence;
        self.state.tasks = tasks;
        self.state.output = None;

        for (mut staged, prev) in restage {
            staged.prev = prev.iter().filter_map(|p| remap.get(p).copied()).collect();
            if self.staged_pos(&staged.id, staged.route).is_none() {
                self.state.staged.push(staged);
            }
        }

        debug!("workflow rerun requested; journal pruned and targets restaged");
        self.state.status = Status::Running;
        Ok(())
    }

    fn apply_task_update(
        &mut self,
        task_id: &str,
        route: usize,
        update: TaskUpdate,
    ) -> Result<()> {
        if !self.graph.has_task(task_id) || !self.state.contexts.has_route(route) {
            return InvalidTaskStateEntrySnafu { task_id, route }.fail();
        }

        let is_items_task = self
            .spec
            .tasks
            .get(task_id)
            .is_some_and(|task| task.with.is_some());

        if is_items_task {
            self.apply_item_update(task_id, route, update)
        } else {
            self.apply_entry_update(task_id, route, update)
        }
    }

    fn apply_entry_update(
        &mut self,
        task_id: &str,
        route: usize,
        update: TaskUpdate,
    ) -> Result<()> {
        let key = flow_key(task_id, route);

        let entry_idx = match self.state.tasks.get(&key).copied() {
            Some(idx) => idx,
            None => {
                let Some(pos) = self.staged_pos(task_id, route) else {
                    return InvalidTaskStateEntrySnafu { task_id, route }.fail();
                };
                if !machines::valid_task_transition(Status::Unset, update.status) {
                    return InvalidStatusTransitionSnafu {
                        task_id,
                        from: Status::Unset,
                        to: update.status,
                    }
                    .fail();
                }
                self.state.staged[pos].dispatched = true;
                let staged = self.state.staged[pos].clone();
                self.push_journal_entry(&staged, Status::Unset)
            }
        };

        let (current, current_result) = {
            let entry = &self.state.sequence[entry_idx];
            (entry.status, entry.result.clone())
        };

        if current == update.status
            && (update.result.is_none() || current_result == update.result)
        {
            return Ok(());
        }
        if !machines::valid_task_transition(current, update.status) {
            return InvalidStatusTransitionSnafu { task_id, from: current, to: update.status }
                .fail();
        }

        {
            let entry = &mut self.state.sequence[entry_idx];
            entry.status = update.status;
            if let Some(result) = update.result {
                entry.result = Some(result);
            }
        }
        debug!(task = task_id, route, status = update.status.as_str(), "task state updated");

        if update.status.is_completed() {
            if let Some(pos) = self.staged_pos(task_id, route) {
                self.state.staged.remove(pos);
            }
            self.complete_entry(entry_idx);
        }

        Ok(())
    }

    fn apply_item_update(
        &mut self,
        task_id: &str,
        route: usize,
        update: TaskUpdate,
    ) -> Result<()> {
        let Some(item_id) = update.item_id else {
            return InvalidItemIdSnafu {
                task_id,
                message: "an item id is required for updates to an items task".to_string(),
            }
            .fail();
        };

        let Some(pos) = self.staged_pos(task_id, route) else {
            // The task may already be terminal; absorb exact repeats.
            if let Some(&idx) = self.state.tasks.get(&flow_key(task_id, route)) {
                let entry = &self.state.sequence[idx];
                if let Some(states) = &entry.items {
                    if let Some(state) = states.iter().find(|state| state.item_id == item_id) {
                        if state.status == update.status
                            && (update.result.is_none() || state.result == update.result)
                        {
                            return Ok(());
                        }
                    }
                    return InvalidStatusTransitionSnafu {
                        task_id,
                        from: entry.status,
                        to: update.status,
                    }
                    .fail();
                }
            }
            return InvalidTaskStateEntrySnafu { task_id, route }.fail();
        };

        {
            let Some(slate) = self.state.staged[pos].items.as_ref() else {
                return InvalidItemIdSnafu {
                    task_id,
                    message: "the item sequence has not been materialized yet".to_string(),
                }
                .fail();
            };
            if item_id >= slate.len() {
                return InvalidItemIdSnafu {
                    task_id,
                    message: format!(
                        "item id {item_id} is out of range for {} items",
                        slate.len()
                    ),
                }
                .fail();
            }

            let item = &slate.items[item_id];
            if item.status == update.status
                && (update.result.is_none() || item.result == update.result)
            {
                return Ok(());
            }
            if !machines::valid_task_transition(item.status, update.status) {
                return InvalidStatusTransitionSnafu {
                    task_id,
                    from: item.status,
                    to: update.status,
                }
                .fail();
            }
        }

        if let Some(slate) = self.state.staged[pos].items.as_mut() {
            let item = &mut slate.items[item_id];
            item.status = update.status;
            item.dispatched = true;
            if let Some(result) = update.result {
                item.result = Some(result);
            }
        }
        debug!(task = task_id, route, item_id, status = update.status.as_str(), "item state updated");

        let entry_idx = match self.state.tasks.get(&flow_key(task_id, route)).copied() {
            Some(idx) => idx,
            None => {
                let staged = self.state.staged[pos].clone();
                self.push_journal_entry(&staged, Status::Unset)
            }
        };

        let Some(aggregate) = self.state.staged[pos]
            .items
            .as_ref()
            .map(ItemsSlate::aggregate_status)
        else {
            return Ok(());
        };

        let current = self.state.sequence[entry_idx].status;
        if current != aggregate && machines::valid_task_transition(current, aggregate) {
            self.state.sequence[entry_idx].status = aggregate;
        }

        if aggregate.is_completed() {
            let staged = self.state.staged.remove(pos);
            if let Some(slate) = staged.items {
                let entry = &mut self.state.sequence[entry_idx];
                entry.items = Some(slate.to_states());
                entry.result = Some(Value::Array(slate.results()));
            }
            self.complete_entry(entry_idx);
        }

        Ok(())
    }

    /// The transition engine: runs when a journal entry reaches a
    /// terminal status. Publishes the entry's out frame, evaluates
    /// every outgoing clause in declared order, and stages the
    /// satisfied destinations.
    fn complete_entry(&mut self, seq_idx: usize) {
        let (id, route, status, result, in_ctxs) = {
            let entry = &self.state.sequence[seq_idx];
            (
                entry.id.clone(),
                entry.route,
                entry.status,
                entry.result.clone(),
                entry.ctxs.in_.clone(),
            )
        };
        self.state.sequence[seq_idx].term = true;
        debug!(task = id.as_str(), route, status = status.as_str(), "evaluating task transitions");

        let Some(task_spec) = self.spec.tasks.get(&id).cloned() else {
            return;
        };

        let in_vars = match self.task_in_context(&task_spec, route, &in_ctxs) {
            Ok(vars) => vars,
            Err(error) => {
                self.state.errors.push(
                    ErrorReport::new("ExpressionEvaluationError", error.to_string())
                        .for_task(&id, route),
                );
                self.state.contexts.compose(route, &in_ctxs)
            }
        };
        let base_ctx = self.build_render_ctx(&in_vars, Some((&id, status)), route, result.as_ref(), None);

        let mut clause_ok = Vec::with_capacity(task_spec.next.len());
        let mut publish_frame = serde_json::Map::new();
        let mut publish_vars = in_vars.clone();

        for (clause_idx, clause) in task_spec.next.iter().enumerate() {
            let edge_ref = clause_idx as u32;
            let ok = match &clause.when {
                None => true,
                Some(when) => match expressions::evaluate_str(when, &base_ctx) {
                    Ok(value) => expressions::is_truthy(&value),
                    Err(error) => {
                        self.state.errors.push(
                            ErrorReport::new("ExpressionEvaluationError", error.to_string())
                                .for_task(&id, route)
                                .with_transition(format!("{id}__t{edge_ref}")),
                        );
                        false
                    }
                },
            };

            self.state.sequence[seq_idx].next.insert(edge_ref, ok);
            clause_ok.push(ok);
            if !ok {
                continue;
            }

            for entry_map in &clause.publish {
                for (name, expr) in entry_map {
                    let publish_ctx = self.build_render_ctx(
                        &publish_vars,
                        Some((&id, status)),
                        route,
                        result.as_ref(),
                        None,
                    );
                    match expressions::evaluate(expr, &publish_ctx) {
                        Ok(value) => {
                            publish_frame.insert(name.clone(), value.clone());
                            if let Some(vars) = publish_vars.as_object_mut() {
                                vars.insert(name.clone(), value);
                            }
                        }
                        Err(error) => {
                            self.state.errors.push(
                                ErrorReport::new("ExpressionEvaluationError", error.to_string())
                                    .for_task(&id, route)
                                    .with_transition(format!("{id}__t{edge_ref}")),
                            );
                        }
                    }
                }
            }
        }

        let out_idx = if publish_frame.is_empty() {
            None
        } else {
            Some(self.state.contexts.push_frame(Value::Object(publish_frame)))
        };
        self.state.sequence[seq_idx].ctxs.out = out_idx;

        let mut any_satisfied = false;
        for (clause_idx, clause) in task_spec.next.iter().enumerate() {
            if !clause_ok[clause_idx] {
                continue;
            }
            any_satisfied = true;

            let mut ctxs_to_add = in_ctxs.clone();
            if let Some(out) = out_idx {
                ctxs_to_add.push(out);
            }
            for target in clause.do_.targets() {
                self.stage_transition(seq_idx, route, target, &ctxs_to_add);
            }
        }

        if status.is_abended() && !any_satisfied {
            let message = match status {
                Status::Expired => "Execution expired before the task could complete.",
                Status::Abandoned => "Execution was abandoned.",
                _ => "Execution failed. See result for details.",
            };
            self.state
                .errors
                .push(ErrorReport::new("TaskExecutionError", message).for_task(&id, route));
        }
    }

    /// Stages `dst` after a satisfied transition out of the entry at
    /// `src_seq_idx`. Re-entering a terminal task spawns a new route
    /// (cycles); barrier tasks accumulate inbound contexts until the
    /// join fires and absorb excess completions afterwards.
    fn stage_transition(
        &mut self,
        src_seq_idx: usize,
        src_route: usize,
        dst: &str,
        ctxs_to_add: &[usize],
    ) {
        let barrier = self.graph.barrier(dst);
        let mut route = src_route;
        let mut ctxs = ctxs_to_add.to_vec();

        if let Some(&existing_idx) = self.state.tasks.get(&flow_key(dst, src_route)) {
            let existing_status = self.state.sequence[existing_idx].status;
            if existing_status.is_completed() {
                if barrier.is_some() {
                    // Excess inbound completion into a finished join.
                    return;
                }
                route = self.state.contexts.spawn_route(src_route, ctxs_to_add);
                ctxs = Vec::new();
                debug!(task = dst, route, "cycle re-entry spawned a new route");
            } else {
                // Already journaled and in flight on this route.
                return;
            }
        }

        if let Some(pos) = self.staged_pos(dst, route) {
            let staged = &mut self.state.staged[pos];
            for idx in &ctxs {
                if !staged.ctxs.contains(idx) {
                    staged.ctxs.push(*idx);
                }
            }
            if !staged.prev.contains(&src_seq_idx) {
                staged.prev.push(src_seq_idx);
            }
        } else {
            self.state.staged.push(StagedTask {
                id: dst.to_string(),
                route,
                ctxs,
                prev: vec![src_seq_idx],
                ready: barrier.is_none(),
                dispatched: false,
                items: None,
            });
        }

        if let Some(barrier) = barrier {
            match self.join_state(dst, route, barrier) {
                JoinState::Ready => {
                    if let Some(pos) = self.staged_pos(dst, route) {
                        self.state.staged[pos].ready = true;
                        debug!(task = dst, route, "join barrier satisfied");
                    }
                }
                JoinState::Waiting => {}
                JoinState::Unsatisfiable => {
                    if let Some(pos) = self.staged_pos(dst, route) {
                        self.expire_staged(pos);
                    }
                }
            }
        }
    }

    /// Join readiness per the barrier mode. `All` waits for every
    /// inbound edge to be evaluated by a terminal source and needs at
    /// least one satisfied edge; a count barrier fires on the N-th
    /// satisfied edge.
    fn join_state(&self, dst: &str, route: usize, barrier: Barrier) -> JoinState {
        let inbound = self.graph.in_transitions(dst);
        let total = inbound.len();
        let mut evaluated = 0usize;
        let mut satisfied = 0usize;

        for edge in &inbound {
            let Some(entry) = self.latest_visible_entry(&edge.src, route) else {
                continue;
            };
            if !entry.status.is_completed() {
                continue;
            }
            if let Some(ok) = entry.next.get(&edge.edge_ref) {
                evaluated += 1;
                if *ok {
                    satisfied += 1;
                }
            }
        }

        match barrier {
            Barrier::All => {
                if evaluated == total {
                    if satisfied > 0 {
                        JoinState::Ready
                    } else {
                        JoinState::Unsatisfiable
                    }
                } else {
                    JoinState::Waiting
                }
            }
            Barrier::Count(n) => {
                if satisfied >= n as usize {
                    JoinState::Ready
                } else if evaluated == total {
                    JoinState::Unsatisfiable
                } else {
                    JoinState::Waiting
                }
            }
        }
    }

    fn next_task_instance(
        &mut self,
        pos: usize,
        id: &str,
        route: usize,
        task_spec: &TaskSpec,
    ) -> Option<TaskInstance> {
        if self.state.staged[pos].dispatched {
            return None;
        }

        let staged_ctxs = self.state.staged[pos].ctxs.clone();
        let ctx_vars = match self.task_in_context(task_spec, route, &staged_ctxs) {
            Ok(vars) => vars,
            Err(error) => {
                self.fail_staged_render(pos, expression_error_type(&error), &error.to_string());
                return None;
            }
        };

        let render_ctx = self.build_render_ctx(&ctx_vars, None, route, None, None);
        let input = match self.render_input(task_spec, &render_ctx, RenderScope::default()) {
            Ok(input) => input,
            Err(error) => {
                self.fail_staged_render(pos, expression_error_type(&error), &error.to_string());
                return None;
            }
        };
        let delay = match self.render_delay(task_spec, &render_ctx) {
            Ok(delay) => delay,
            Err(error) => {
                self.fail_staged_render(pos, expression_error_type(&error), &error.to_string());
                return None;
            }
        };

        self.state.staged[pos].dispatched = true;
        Some(TaskInstance {
            id: id.to_string(),
            route,
            ctx: ctx_vars,
            actions: vec![ActionCall {
                action: task_spec.action_name().map(str::to_string),
                input,
                item_id: None,
            }],
            delay,
            spec: task_spec.clone(),
        })
    }

    fn next_items_instance(
        &mut self,
        pos: usize,
        id: &str,
        route: usize,
        task_spec: &TaskSpec,
        with: &WithSpec,
    ) -> Option<TaskInstance> {
        let staged_ctxs = self.state.staged[pos].ctxs.clone();
        let ctx_vars = match self.task_in_context(task_spec, route, &staged_ctxs) {
            Ok(vars) => vars,
            Err(error) => {
                self.fail_staged_render(pos, expression_error_type(&error), &error.to_string());
                return None;
            }
        };
        let binding = with.binding();

        if self.state.staged[pos].items.is_none() {
            let base_ctx = self.build_render_ctx(&ctx_vars, None, route, None, None);

            let sequence = match expressions::evaluate_str(&binding.expression, &base_ctx) {
                Ok(Value::Array(items)) => items,
                Ok(other) => {
                    self.fail_staged_render(
                        pos,
                        "ExpressionEvaluationError",
                        &format!("The items expression did not evaluate to a list: {other}"),
                    );
                    return None;
                }
                Err(error) => {
                    self.fail_staged_render(pos, expression_error_type(&error), &error.to_string());
                    return None;
                }
            };

            let concurrency = match self.render_concurrency(with, &base_ctx) {
                Ok(concurrency) => concurrency,
                Err(message) => {
                    self.fail_staged_render(pos, "ExpressionEvaluationError", &message);
                    return None;
                }
            };

            if sequence.is_empty() {
                // Nothing to iterate: the task succeeds immediately
                // and publishes an empty result list.
                let staged = self.state.staged.remove(pos);
                let entry_idx = self.push_journal_entry(&staged, Status::Succeeded);
                {
                    let entry = &mut self.state.sequence[entry_idx];
                    entry.items = Some(Vec::new());
                    entry.result = Some(json!([]));
                }
                self.complete_entry(entry_idx);
                return None;
            }

            self.state.staged[pos].items = Some(ItemsSlate::new(sequence, concurrency));
        }

        let slate = self.state.staged[pos].items.clone()?;
        let cap = slate.concurrency.unwrap_or(usize::MAX);
        let mut in_flight = slate.in_flight();
        let mut calls = Vec::new();

        for (item_id, item) in slate.items.iter().enumerate() {
            if item.dispatched {
                continue;
            }
            if in_flight >= cap {
                break;
            }

            let item_binding = items::bind_item(&binding.names, &item.item);
            let render_ctx =
                self.build_render_ctx(&ctx_vars, None, route, None, Some(&item_binding));
            let scope = RenderScope::default().with_item(true);
            let input = match self.render_input(task_spec, &render_ctx, scope) {
                Ok(input) => input,
                Err(error) => {
                    self.fail_staged_render(pos, expression_error_type(&error), &error.to_string());
                    return None;
                }
            };

            calls.push(ActionCall {
                action: task_spec.action_name().map(str::to_string),
                input,
                item_id: Some(item_id),
            });
            in_flight += 1;
        }

        if calls.is_empty() {
            return None;
        }

        if let Some(slate) = self.state.staged[pos].items.as_mut() {
            for call in &calls {
                if let Some(item_id) = call.item_id {
                    slate.items[item_id].dispatched = true;
                }
            }
        }

        let render_ctx = self.build_render_ctx(&ctx_vars, None, route, None, None);
        let delay = match self.render_delay(task_spec, &render_ctx) {
            Ok(delay) => delay,
            Err(error) => {
                self.fail_staged_render(pos, expression_error_type(&error), &error.to_string());
                return None;
            }
        };

        Some(TaskInstance {
            id: id.to_string(),
            route,
            ctx: ctx_vars,
            actions: calls,
            delay,
            spec: task_spec.clone(),
        })
    }

    fn render_input(
        &self,
        task_spec: &TaskSpec,
        render_ctx: &Value,
        scope: RenderScope,
    ) -> expressions::Result<Option<Value>> {
        let Some(input) = task_spec.merged_input() else {
            return Ok(None);
        };
        expressions::check_scope(&input, scope)?;
        expressions::evaluate(&input, render_ctx).map(Some)
    }

    fn render_delay(
        &self,
        task_spec: &TaskSpec,
        render_ctx: &Value,
    ) -> expressions::Result<Option<u64>> {
        let Some(delay) = &task_spec.delay else {
            return Ok(None);
        };
        let rendered = expressions::evaluate(delay, render_ctx)?;
        Ok(rendered.as_u64())
    }

    fn render_concurrency(
        &self,
        with: &WithSpec,
        render_ctx: &Value,
    ) -> std::result::Result<Option<usize>, String> {
        let Some(concurrency) = with.concurrency() else {
            return Ok(None);
        };
        let rendered =
            expressions::evaluate(concurrency, render_ctx).map_err(|e| e.to_string())?;
        match rendered.as_u64() {
            Some(n) if n > 0 => Ok(Some(n as usize)),
            _ => Err(format!(
                "The concurrency expression did not evaluate to a positive integer: {rendered}"
            )),
        }
    }

    /// Journals a staged task as `FAILED` after a render failure; the
    /// error is recorded and the task is never dispatched.
    fn fail_staged_render(&mut self, pos: usize, error_type: &str, message: &str) {
        let staged = self.state.staged.remove(pos);
        warn!(task = staged.id.as_str(), route = staged.route, error = message, "task input rendering failed");
        self.state.errors.push(
            ErrorReport::new(error_type, message).for_task(&staged.id, staged.route),
        );
        let entry_idx = self.push_journal_entry(&staged, Status::Failed);
        self.complete_entry(entry_idx);
    }

    /// Journals a gated task as `EXPIRED` when its join barrier can
    /// no longer be satisfied.
    fn expire_staged(&mut self, pos: usize) {
        let staged = self.state.staged.remove(pos);
        warn!(task = staged.id.as_str(), route = staged.route, "join barrier cannot be satisfied");
        let entry_idx = self.push_journal_entry(&staged, Status::Expired);
        self.complete_entry(entry_idx);
    }

    fn push_journal_entry(&mut self, staged: &StagedTask, status: Status) -> usize {
        let idx = self.state.sequence.len();
        self.state.sequence.push(TaskFlowEntry {
            id: staged.id.clone(),
            route: staged.route,
            ctxs: EntryContexts { in_: staged.ctxs.clone(), out: None },
            prev: staged.prev.clone(),
            next: BTreeMap::new(),
            status,
            term: false,
            result: None,
            items: None,
        });
        self.state.tasks.insert(flow_key(&staged.id, staged.route), idx);
        idx
    }

    /// Terminal resolution, run after every update and dispatch pull.
    /// Pending lifecycle requests settle first; otherwise recorded
    /// errors fail the workflow once nothing is in flight, and a
    /// fully drained workflow succeeds.
    fn update_workflow_status(&mut self) {
        loop {
            let current = self.state.status;
            if !matches!(
                current,
                Status::Running | Status::Pausing | Status::Canceling | Status::Resuming
            ) {
                return;
            }

            let inflight = self.has_inflight();
            match current {
                Status::Canceling => {
                    if !inflight {
                        self.transition_workflow(Status::Canceled);
                    }
                    return;
                }
                Status::Pausing => {
                    if !inflight {
                        self.transition_workflow(Status::Paused);
                    }
                    return;
                }
                _ => {}
            }

            if inflight {
                return;
            }
            if !self.state.errors.is_empty() {
                self.transition_workflow(Status::Failed);
                return;
            }
            if self.state.staged.iter().any(|staged| staged.ready) {
                return;
            }
            if !self.state.staged.is_empty() {
                // Only gated joins remain and nothing can fire them.
                self.expire_staged(0);
                continue;
            }

            if self.render_workflow_output() {
                self.transition_workflow(Status::Succeeded);
            } else {
                self.transition_workflow(Status::Failed);
            }
            return;
        }
    }

    fn transition_workflow(&mut self, to: Status) {
        let from = self.state.status;
        if from == to {
            return;
        }
        if machines::valid_workflow_transition(from, to) {
            debug!(from = from.as_str(), to = to.as_str(), "workflow status changed");
            self.state.status = to;
        } else {
            warn!(from = from.as_str(), to = to.as_str(), "suppressed invalid workflow transition");
        }
    }

    /// Renders the top-level output against the terminal context.
    /// Returns false when rendering failed (the error is recorded).
    fn render_workflow_output(&mut self) -> bool {
        let Some(output_spec) = self.spec.output.clone() else {
            return true;
        };

        let terminal = self.state.contexts.terminal_context();
        let render_ctx = self.build_render_ctx(&terminal, None, 0, None, None);
        let mut output = serde_json::Map::new();
        let mut ok = true;

        for entry in &output_spec {
            for (name, expr) in entry {
                match expressions::evaluate(expr, &render_ctx) {
                    Ok(value) => {
                        output.insert(name.clone(), value);
                    }
                    Err(error) => {
                        ok = false;
                        self.state
                            .errors
                            .push(ErrorReport::new("ExpressionEvaluationError", error.to_string()));
                    }
                }
            }
        }

        if ok {
            self.state.output = Some(Value::Object(output));
        }
        ok
    }

    fn has_inflight(&self) -> bool {
        if self.state.sequence.iter().any(|entry| entry.status.is_active()) {
            return true;
        }
        self.state.staged.iter().any(|staged| match &staged.items {
            Some(slate) => slate.in_flight() > 0,
            None => staged.dispatched,
        })
    }

    fn staged_pos(&self, task_id: &str, route: usize) -> Option<usize> {
        self.state
            .staged
            .iter()
            .position(|staged| staged.id == task_id && staged.route == route)
    }

    fn latest_visible_entry(&self, task_id: &str, route: usize) -> Option<&TaskFlowEntry> {
        for r in self.state.contexts.route_ancestry(route) {
            if let Some(&idx) = self.state.tasks.get(&flow_key(task_id, r)) {
                return self.state.sequence.get(idx);
            }
        }
        None
    }

    /// Composes a task's inbound context: route-visible frames plus
    /// the task's own vars evaluated on top.
    fn task_in_context(
        &self,
        task_spec: &TaskSpec,
        route: usize,
        ctxs: &[usize],
    ) -> expressions::Result<Value> {
        let mut vars = self.state.contexts.compose(route, ctxs);

        if let Some(task_vars) = &task_spec.vars {
            for entry in task_vars {
                for (name, value) in entry {
                    let render_ctx = self.build_render_ctx(&vars, None, route, None, None);
                    let rendered = expressions::evaluate(value, &render_ctx)?;
                    if let Some(map) = vars.as_object_mut() {
                        map.insert(name.clone(), rendered);
                    }
                }
            }
        }

        Ok(vars)
    }

    /// Builds the object handed to the expression backend. The
    /// reserved keys carry the conductor-provided callables.
    fn build_render_ctx(
        &self,
        vars: &Value,
        current: Option<(&str, Status)>,
        route: usize,
        result: Option<&Value>,
        item: Option<&Value>,
    ) -> Value {
        let (current_task, current_status) = match current {
            Some((id, status)) => (
                json!({"id": id, "route": route}),
                json!(status.as_str()),
            ),
            None => (Value::Null, Value::Null),
        };

        json!({
            "__vars": vars,
            "__current_task": current_task,
            "__current_status": current_status,
            "__task_states": self.task_states_for_route(route),
            "__result": result.cloned().unwrap_or(Value::Null),
            "__item": item.cloned().unwrap_or(Value::Null),
        })
    }

    /// The statuses visible to `task_state()` from a route: latest
    /// entries along the route's ancestry, nearest route winning.
    fn task_states_for_route(&self, route: usize) -> Value {
        let ancestry = self.state.contexts.route_ancestry(route);
        let mut map = serde_json::Map::new();

        for r in ancestry.iter().rev() {
            for (idx, entry) in self.state.sequence.iter().enumerate() {
                if entry.route == *r
                    && self.state.tasks.get(&flow_key(&entry.id, entry.route)) == Some(&idx)
                {
                    map.insert(entry.id.clone(), json!(entry.status.as_str()));
                }
            }
        }

        Value::Object(map)
    }

    fn record_update_error(&mut self, error: &Error, task_id: &str, route: usize) {
        let error_type = match error {
            Error::InvalidTaskStateEntry { .. } => "InvalidTaskStateEntry",
            Error::InvalidStatusTransition { .. } => "InvalidStatusTransition",
            Error::InvalidItemId { .. } => "InvalidItemId",
            _ => "WorkflowError",
        };
        self.state
            .errors
            .push(ErrorReport::new(error_type, error.to_string()).for_task(task_id, route));
    }
}
