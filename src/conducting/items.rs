use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::statuses::Status;

/// Journal form of one item's final state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemState {
    pub item_id: usize,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

/// One materialized item while the task is in staging.
///
/// `dispatched` tracks emission by `get_next_tasks`; the status stays
/// `Unset` until the runner reports, so only reported statuses feed
/// the aggregation table while dispatch bookkeeping still bounds
/// concurrency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagedItem {
    pub item: Value,
    pub status: Status,
    #[serde(default)]
    pub dispatched: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

/// The per-item slate of a with-items task, created when the item
/// sequence is materialized at dispatch time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemsSlate {
    pub items: Vec<StagedItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<usize>,
}

impl ItemsSlate {
    #[must_use]
    pub fn new(items: Vec<Value>, concurrency: Option<usize>) -> Self {
        Self {
            items: items
                .into_iter()
                .map(|item| StagedItem {
                    item,
                    status: Status::Unset,
                    dispatched: false,
                    result: None,
                })
                .collect(),
            concurrency,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Items that were handed to the dispatcher and have not reported
    /// a terminal status yet. This is the quantity the concurrency
    /// cap bounds.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.items
            .iter()
            .filter(|item| item.dispatched && !item.status.is_completed())
            .count()
    }

    /// Effective task status derived from the reported item statuses.
    #[must_use]
    pub fn aggregate_status(&self) -> Status {
        let mut any_active = false;
        let mut any_abended = false;
        let mut any_canceled = false;
        let mut all_succeeded = true;

        for item in &self.items {
            if item.status.is_active() {
                any_active = true;
            }
            if item.status.is_abended() {
                any_abended = true;
            }
            if item.status == Status::Canceled {
                any_canceled = true;
            }
            if item.status != Status::Succeeded {
                all_succeeded = false;
            }
        }

        if any_abended && !any_active {
            Status::Failed
        } else if any_canceled && !any_active {
            Status::Canceled
        } else if all_succeeded {
            Status::Succeeded
        } else {
            Status::Running
        }
    }

    /// Per-item results in sequence order, with `null` holes for
    /// items that did not succeed.
    #[must_use]
    pub fn results(&self) -> Vec<Value> {
        self.items
            .iter()
            .map(|item| {
                if item.status == Status::Succeeded {
                    item.result.clone().unwrap_or(Value::Null)
                } else {
                    Value::Null
                }
            })
            .collect()
    }

    #[must_use]
    pub fn to_states(&self) -> Vec<ItemState> {
        self.items
            .iter()
            .enumerate()
            .map(|(item_id, item)| ItemState {
                item_id,
                status: item.status,
                result: item.result.clone(),
            })
            .collect()
    }
}

/// Builds the `item()` binding for one element of the materialized
/// sequence. The multi-name form expects list elements (one slot per
/// name, as produced by `zip`).
#[must_use]
pub fn bind_item(names: &[String], item: &Value) -> Value {
    match names {
        [] => item.clone(),
        [name] => {
            let mut map = serde_json::Map::new();
            map.insert(name.clone(), item.clone());
            Value::Object(map)
        }
        names => {
            let mut map = serde_json::Map::new();
            for (idx, name) in names.iter().enumerate() {
                let slot = item.get(idx).cloned().unwrap_or(Value::Null);
                map.insert(name.clone(), slot);
            }
            Value::Object(map)
        }
    }
}
