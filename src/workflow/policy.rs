//! Access policy: which step a user may currently occupy.
//!
//! Everything here is a pure function of the `WorkflowState` and of which
//! steps have saved data.

use std::collections::BTreeSet;

use super::sequence::StepSequence;
use super::state::{StepId, StepStatus, WorkflowState};

/// Whether a step has real, submitted content.
///
/// Data presence is authoritative and independent of `StepStatus`.
pub trait StepDataPresence {
    fn has_data(&self, step: &StepId) -> bool;
}

impl StepDataPresence for BTreeSet<StepId> {
    fn has_data(&self, step: &StepId) -> bool {
        self.contains(step)
    }
}

/// `completed` and backed by data.
fn is_settled(state: &WorkflowState, data: &impl StepDataPresence, step: &StepId) -> bool {
    state.status(step) == StepStatus::Completed && data.has_data(step)
}

/// Whether every step strictly before `step` is settled.
pub fn earlier_steps_settled(
    sequence: &StepSequence,
    state: &WorkflowState,
    data: &impl StepDataPresence,
    step: &StepId,
) -> bool {
    sequence
        .before(step)
        .iter()
        .all(|s| is_settled(state, data, s))
}

/// Decide whether `step` may be entered.
///
/// The first step is always open and a completed step may always be
/// revisited for editing. Any other step requires every earlier step to be
/// completed with data present. Unknown steps are denied.
pub fn can_access_step(
    sequence: &StepSequence,
    state: &WorkflowState,
    data: &impl StepDataPresence,
    step: &StepId,
) -> bool {
    let Some(idx) = sequence.index_of(step) else {
        return false;
    };
    if idx == 0 {
        return true;
    }
    if state.status(step) == StepStatus::Completed {
        return true;
    }
    if idx == 1 {
        // A first-step status without data means the sign-in never really happened.
        return is_settled(state, data, sequence.first());
    }
    earlier_steps_settled(sequence, state, data, step)
}

/// The furthest step whose predecessors are all settled.
///
/// Keeps the current step when it already satisfies that test, so a user
/// revisiting an earlier step is not bounced forward.
pub fn find_correct_step(
    sequence: &StepSequence,
    state: &WorkflowState,
    data: &impl StepDataPresence,
) -> StepId {
    if sequence.contains(&state.current_step)
        && earlier_steps_settled(sequence, state, data, &state.current_step)
    {
        return state.current_step.clone();
    }

    let settled_prefix = sequence
        .iter()
        .take_while(|s| is_settled(state, data, s))
        .count();
    let idx = settled_prefix.min(sequence.len() - 1);
    sequence.as_slice()[idx].clone()
}
