//! Consistency repair: idempotent passes that restore the ordering
//! invariant between step statuses and saved step data.

use serde::Serialize;

use super::policy::StepDataPresence;
use super::sequence::StepSequence;
use super::state::{StepId, StepStatus, WorkflowState};

/// One status rewrite made by a repair pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusChange {
    pub step: StepId,
    pub from: StepStatus,
    pub to: StepStatus,
}

fn rewrite(
    state: &mut WorkflowState,
    step: &StepId,
    to: StepStatus,
    changes: &mut Vec<StatusChange>,
) {
    let from = state.set_status(step, to);
    if from != to {
        changes.push(StatusChange {
            step: step.clone(),
            from,
            to,
        });
    }
}

/// Demote statuses that claim more progress than the data supports.
///
/// 1. A `completed` step without data becomes `not_started`.
/// 2. Walking adjacent pairs in order, a `completed`/`in_progress` step
///    that follows a `failed`/`cancelled`/`not_started` one becomes
///    `not_started`. The walk is ordered, so one demotion cascades down the
///    rest of the sequence.
pub fn validate_step_statuses(
    sequence: &StepSequence,
    state: &mut WorkflowState,
    data: &impl StepDataPresence,
) -> Vec<StatusChange> {
    let mut changes = Vec::new();

    for step in sequence.iter() {
        if state.status(step) == StepStatus::Completed && !data.has_data(step) {
            rewrite(state, step, StepStatus::NotStarted, &mut changes);
        }
    }

    for pair in sequence.as_slice().windows(2) {
        let (a, b) = (&pair[0], &pair[1]);
        if state.status(a).is_blocking() && state.status(b).is_advanced() {
            rewrite(state, b, StepStatus::NotStarted, &mut changes);
        }
    }

    changes
}

/// Promote an `in_progress` step that already has data when some later
/// step is `completed`.
///
/// This is the "status lagging behind data" case, typically a status write
/// that lost a race with navigation. Promoting keeps the user's finished
/// work instead of demoting the later step.
pub fn fix_inconsistent_state(
    sequence: &StepSequence,
    state: &mut WorkflowState,
    data: &impl StepDataPresence,
) -> Vec<StatusChange> {
    let mut changes = Vec::new();

    for (idx, step) in sequence.iter().enumerate() {
        if state.status(step) != StepStatus::InProgress || !data.has_data(step) {
            continue;
        }
        let later_completed = sequence.as_slice()[idx + 1..]
            .iter()
            .any(|s| state.status(s) == StepStatus::Completed);
        if later_completed {
            rewrite(state, step, StepStatus::Completed, &mut changes);
        }
    }

    changes
}
