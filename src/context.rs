use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A concurrent branch of execution. Routes are spawned when a cycle
/// re-enters a task; the new route inherits the parent's frame chain
/// plus the frame published by the entry that closed the cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub parent: Option<usize>,
    pub ctxs: Vec<usize>,
}

/// Append-only store of context frames plus the route table. Frames
/// are immutable once inserted; tasks read them through ordered
/// merges and publish new frames instead of mutating old ones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextStore {
    frames: Vec<Value>,
    routes: Vec<Route>,
}

impl ContextStore {
    /// Creates the store with the root frame (workflow input merged
    /// with top-level vars) at index 0 and the root route.
    #[must_use]
    pub fn new(root: Value) -> Self {
        Self {
            frames: vec![root],
            routes: vec![Route { parent: None, ctxs: Vec::new() }],
        }
    }

    pub fn push_frame(&mut self, frame: Value) -> usize {
        self.frames.push(frame);
        self.frames.len() - 1
    }

    #[must_use]
    pub fn frame(&self, idx: usize) -> Option<&Value> {
        self.frames.get(idx)
    }

    #[must_use]
    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    #[must_use]
    pub fn route(&self, idx: usize) -> Option<&Route> {
        self.routes.get(idx)
    }

    #[must_use]
    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    #[must_use]
    pub fn has_route(&self, idx: usize) -> bool {
        idx < self.routes.len()
    }

    /// Appends a new route that inherits `parent`'s frame chain plus
    /// `extra` frames, and returns its index.
    pub fn spawn_route(&mut self, parent: usize, extra: &[usize]) -> usize {
        let mut ctxs = self
            .routes
            .get(parent)
            .map(|route| route.ctxs.clone())
            .unwrap_or_default();
        for &idx in extra {
            if !ctxs.contains(&idx) {
                ctxs.push(idx);
            }
        }
        self.routes.push(Route { parent: Some(parent), ctxs });
        self.routes.len() - 1
    }

    /// The route chain from `route` back to the root, nearest first.
    #[must_use]
    pub fn route_ancestry(&self, route: usize) -> Vec<usize> {
        let mut chain = Vec::new();
        let mut cursor = Some(route);
        while let Some(idx) = cursor {
            chain.push(idx);
            cursor = self.routes.get(idx).and_then(|r| r.parent);
        }
        chain
    }

    /// Composes a task's inbound context: the root frame, the route's
    /// inherited chain, then the given published frames, merged in
    /// ascending frame order so later publishes win.
    #[must_use]
    pub fn compose(&self, route: usize, ctxs: &[usize]) -> Value {
        let mut indices: Vec<usize> = vec![0];
        if let Some(route) = self.routes.get(route) {
            indices.extend(route.ctxs.iter().copied());
        }
        indices.extend(ctxs.iter().copied());
        indices.sort_unstable();
        indices.dedup();

        let mut merged = serde_json::Map::new();
        for idx in indices {
            if let Some(frame) = self.frames.get(idx) {
                merge_frame(&mut merged, frame);
            }
        }
        Value::Object(merged)
    }

    /// Merges every frame in insertion order. Used for the terminal
    /// context the workflow output is rendered against.
    #[must_use]
    pub fn terminal_context(&self) -> Value {
        let mut merged = serde_json::Map::new();
        for frame in &self.frames {
            merge_frame(&mut merged, frame);
        }
        Value::Object(merged)
    }
}

fn merge_frame(target: &mut serde_json::Map<String, Value>, frame: &Value) {
    if let Value::Object(map) = frame {
        for (key, value) in map {
            target.insert(key.clone(), value.clone());
        }
    }
}
