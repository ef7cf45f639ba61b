use serde::{Deserialize, Serialize};
use serde_json::Value;
use snafu::prelude::*;

use crate::composer;
use crate::spec::WorkflowSpec;

use super::{
    CompositionSnafu, ConductorState, Result, SerializationSnafu, SnapshotVersionSnafu,
    WorkflowConductor,
};

/// Current snapshot document version.
pub const SNAPSHOT_VERSION: u32 = 1;

/// The on-demand persistence document: `{version, spec, graph,
/// state}`. The graph member is informational; rehydration always
/// recomposes it from the spec so the two cannot drift.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSnapshot {
    pub version: u32,
    pub spec: WorkflowSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graph: Option<Value>,
    pub state: ConductorState,
}

impl WorkflowConductor {
    /// Produces a structured snapshot. Repeated serialize and
    /// deserialize round trips yield identical documents.
    pub fn serialize(&self) -> Result<Value> {
        let snapshot = WorkflowSnapshot {
            version: SNAPSHOT_VERSION,
            spec: self.spec.clone(),
            graph: Some(self.graph.to_value()),
            state: self.state.clone(),
        };
        serde_json::to_value(&snapshot).context(SerializationSnafu)
    }

    /// Rehydrates a conductor whose behavior is equivalent to the one
    /// that produced the snapshot.
    pub fn deserialize(snapshot: &Value) -> Result<Self> {
        let snapshot: WorkflowSnapshot =
            serde_json::from_value(snapshot.clone()).context(SerializationSnafu)?;
        ensure!(
            snapshot.version == SNAPSHOT_VERSION,
            SnapshotVersionSnafu { found: snapshot.version }
        );

        let graph = composer::native::compose(&snapshot.spec).context(CompositionSnafu)?;
        Ok(Self { spec: snapshot.spec, graph, state: snapshot.state })
    }
}
