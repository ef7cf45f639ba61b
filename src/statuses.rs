use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

/// Status vocabulary shared by task executions, per-item executions,
/// and the workflow itself.
///
/// `Unset` is the pseudo status of a task that has no journal entry
/// yet; it is what `task_state()` reports from expressions before a
/// task runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Requested,
    Scheduled,
    Delayed,
    Running,
    Pending,
    Pausing,
    Paused,
    Resuming,
    Succeeded,
    Failed,
    Expired,
    Abandoned,
    Canceling,
    Canceled,
    Unset,
}

/// Statuses that count as in-flight work for terminal resolution.
pub const ACTIVE_STATUSES: &[Status] = &[
    Status::Requested,
    Status::Scheduled,
    Status::Delayed,
    Status::Running,
    Status::Pending,
    Status::Pausing,
    Status::Resuming,
    Status::Canceling,
];

/// Terminal statuses.
pub const COMPLETED_STATUSES: &[Status] = &[
    Status::Succeeded,
    Status::Failed,
    Status::Expired,
    Status::Abandoned,
    Status::Canceled,
];

/// Terminal statuses that represent abnormal endings.
pub const ABENDED_STATUSES: &[Status] = &[Status::Failed, Status::Expired, Status::Abandoned];

pub const RUNNING_STATUSES: &[Status] = &[
    Status::Requested,
    Status::Scheduled,
    Status::Delayed,
    Status::Running,
];

pub const PAUSE_STATUSES: &[Status] = &[Status::Pausing, Status::Paused, Status::Pending];

pub const CANCEL_STATUSES: &[Status] = &[Status::Canceling, Status::Canceled];

impl Status {
    #[must_use]
    pub fn is_active(self) -> bool {
        ACTIVE_STATUSES.contains(&self)
    }

    #[must_use]
    pub fn is_completed(self) -> bool {
        COMPLETED_STATUSES.contains(&self)
    }

    #[must_use]
    pub fn is_abended(self) -> bool {
        ABENDED_STATUSES.contains(&self)
    }

    #[must_use]
    pub fn is_running(self) -> bool {
        RUNNING_STATUSES.contains(&self)
    }

    #[must_use]
    pub fn is_pausing(self) -> bool {
        PAUSE_STATUSES.contains(&self)
    }

    #[must_use]
    pub fn is_canceling(self) -> bool {
        CANCEL_STATUSES.contains(&self)
    }

    /// Lowercase wire form, identical to the serde representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Requested => "requested",
            Status::Scheduled => "scheduled",
            Status::Delayed => "delayed",
            Status::Running => "running",
            Status::Pending => "pending",
            Status::Pausing => "pausing",
            Status::Paused => "paused",
            Status::Resuming => "resuming",
            Status::Succeeded => "succeeded",
            Status::Failed => "failed",
            Status::Expired => "expired",
            Status::Abandoned => "abandoned",
            Status::Canceling => "canceling",
            Status::Canceled => "canceled",
            Status::Unset => "unset",
        }
    }
}

impl Display for Status {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_sets_are_disjoint_where_expected() {
        for status in ACTIVE_STATUSES {
            assert!(!status.is_completed(), "{status} cannot be both active and completed");
        }

        for status in ABENDED_STATUSES {
            assert!(status.is_completed(), "{status} must be terminal");
        }
    }

    #[test]
    fn test_status_wire_form_round_trip() {
        let statuses = [
            Status::Requested,
            Status::Running,
            Status::Succeeded,
            Status::Failed,
            Status::Canceled,
            Status::Unset,
        ];

        for status in statuses {
            let encoded = serde_json::to_string(&status).unwrap();
            assert_eq!(encoded, format!("\"{}\"", status.as_str()));
            let decoded: Status = serde_json::from_str(&encoded).unwrap();
            assert_eq!(decoded, status);
        }
    }
}
