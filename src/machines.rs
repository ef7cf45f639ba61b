use crate::statuses::Status;

/// Returns true when a task (or a single item of a with-items task)
/// may move from `from` to `to`.
///
/// `Unset` is the state of a staged task before its first reported
/// status, so anything dispatchable is reachable from it. Terminal
/// statuses admit no further transitions; rerun resets entries by
/// pruning rather than by transitioning them.
#[must_use]
pub fn valid_task_transition(from: Status, to: Status) -> bool {
    use Status::*;

    match from {
        Unset => matches!(
            to,
            Requested | Scheduled | Delayed | Running | Pending | Succeeded | Failed | Expired
                | Abandoned | Canceling | Canceled
        ),
        Requested => matches!(
            to,
            Scheduled | Delayed | Running | Pausing | Paused | Canceling | Canceled | Failed
                | Expired | Abandoned
        ),
        Scheduled => matches!(
            to,
            Delayed | Running | Pausing | Paused | Canceling | Canceled | Failed | Expired
                | Abandoned
        ),
        Delayed => matches!(
            to,
            Scheduled | Running | Pausing | Paused | Canceling | Canceled | Failed | Expired
                | Abandoned
        ),
        Running => matches!(
            to,
            Pending | Pausing | Paused | Canceling | Canceled | Succeeded | Failed | Expired
                | Abandoned
        ),
        Pending => matches!(to, Resuming | Running | Succeeded | Failed | Canceling | Canceled),
        Pausing => matches!(to, Paused | Resuming | Running | Canceling | Canceled | Failed),
        Paused => matches!(to, Resuming | Running | Canceling | Canceled),
        Resuming => matches!(to, Running | Canceling | Canceled),
        Canceling => matches!(to, Canceled | Failed | Expired | Abandoned),
        Succeeded | Failed | Expired | Abandoned | Canceled => false,
    }
}

/// Returns true when the workflow may move from `from` to `to`.
#[must_use]
pub fn valid_workflow_transition(from: Status, to: Status) -> bool {
    use Status::*;

    match from {
        Unset => matches!(to, Requested | Running | Failed),
        Requested => matches!(to, Running | Pausing | Paused | Canceling | Canceled | Failed),
        Running => matches!(
            to,
            Succeeded | Failed | Pausing | Paused | Canceling | Canceled | Expired
        ),
        Pausing => matches!(to, Paused | Resuming | Running | Canceling | Canceled | Failed),
        Paused => matches!(to, Resuming | Running | Canceling | Canceled),
        Resuming => matches!(to, Running | Pausing | Canceling | Canceled | Failed),
        Canceling => matches!(to, Canceled | Failed),
        Pending => matches!(to, Running | Canceling | Canceled | Failed),
        // The workflow itself never takes the dispatch-side statuses.
        Scheduled | Delayed => false,
        Succeeded | Failed | Expired | Abandoned | Canceled => false,
    }
}

/// Statuses callers are allowed to hand to `request_workflow_status`.
#[must_use]
pub fn requestable_workflow_status(status: Status) -> bool {
    matches!(
        status,
        Status::Running
            | Status::Pausing
            | Status::Paused
            | Status::Resuming
            | Status::Canceling
            | Status::Canceled
    )
}

/// Resolves a lifecycle request against the current workflow status.
///
/// Pause and cancel requests collapse straight to their terminal form
/// when the caller reports no in-flight work, which is how a paused
/// or quiesced workflow settles without an extra status update.
/// Returns `None` when the request is not admissible from `current`.
#[must_use]
pub fn resolve_workflow_request(current: Status, requested: Status, idle: bool) -> Option<Status> {
    use Status::*;

    let target = match requested {
        Running => match current {
            Unset | Requested => Running,
            Paused | Pausing | Resuming => Running,
            // Re-requesting RUNNING while running is a no-op.
            Running => Running,
            _ => return None,
        },
        Pausing | Paused => match current {
            Running | Requested | Resuming => {
                if idle {
                    Paused
                } else {
                    Pausing
                }
            }
            Pausing => {
                if idle {
                    Paused
                } else {
                    Pausing
                }
            }
            Paused => Paused,
            _ => return None,
        },
        Resuming => match current {
            Paused | Pausing => Running,
            _ => return None,
        },
        Canceling | Canceled => match current {
            Unset | Requested | Running | Pausing | Paused | Resuming => {
                if idle {
                    Canceled
                } else {
                    Canceling
                }
            }
            Canceling => {
                if idle {
                    Canceled
                } else {
                    Canceling
                }
            }
            Canceled => Canceled,
            _ => return None,
        },
        _ => return None,
    };

    Some(target)
}
