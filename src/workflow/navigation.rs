//! Navigation controller: the single path for moving between steps.
//!
//! Guarded exits park the target as a pending navigation until the user
//! confirms or cancels. Overlapping calls are dropped by an `OpLatch`.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::FlowError;
use crate::events::{FlowEvent, NoticeLevel};

use super::engine::{WorkflowEngine, lock};
use super::latch::{OpLatch, OpState};
use super::policy::{self, StepDataPresence};
use super::state::{StepId, StepStatus};

/// Result of a navigation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum NavigationOutcome {
    /// Moved to the requested step.
    Navigated { step: StepId, url: String },
    /// Moved, but to a different step than requested.
    Redirected {
        requested: StepId,
        step: StepId,
        url: String,
    },
    /// Parked behind the confirmation gate.
    AwaitingConfirmation { from: StepId, to: StepId },
    /// Already where it should be.
    Stayed { step: StepId },
    /// Another navigation was in flight.
    Busy,
    /// Confirm was called with nothing pending.
    NothingPending,
    /// A reset happened while the move was in flight.
    Abandoned { requested: StepId },
}

impl NavigationOutcome {
    /// The step the user ended up on, when a move happened.
    pub fn destination(&self) -> Option<&StepId> {
        match self {
            Self::Navigated { step, .. } | Self::Redirected { step, .. } => Some(step),
            _ => None,
        }
    }

    pub fn url(&self) -> Option<&str> {
        match self {
            Self::Navigated { url, .. } | Self::Redirected { url, .. } => Some(url),
            _ => None,
        }
    }
}

/// Observable controller state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NavigationSnapshot {
    pub state: OpState,
    pub redirect_state: OpState,
    pub pending_target: Option<StepId>,
    pub confirmation_shown: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Gate {
    Check,
    Bypass,
}

#[derive(Debug, Default)]
pub struct NavigationController {
    op: OpLatch,
    redirect_op: OpLatch,
    pending: Mutex<Option<StepId>>,
    confirmation_shown: AtomicBool,
}

impl NavigationController {
    pub(super) fn snapshot(&self) -> NavigationSnapshot {
        NavigationSnapshot {
            state: self.op.state(),
            redirect_state: self.redirect_op.state(),
            pending_target: lock(&self.pending).clone(),
            confirmation_shown: self.confirmation_shown.load(Ordering::Acquire),
        }
    }

    fn raise(&self, target: &StepId) {
        *lock(&self.pending) = Some(target.clone());
        self.confirmation_shown.store(true, Ordering::Release);
    }

    fn take_pending(&self) -> Option<StepId> {
        self.confirmation_shown.store(false, Ordering::Release);
        lock(&self.pending).take()
    }

    pub(super) fn clear_pending(&self) {
        self.take_pending();
    }
}

impl WorkflowEngine {
    pub fn navigation_state(&self) -> NavigationSnapshot {
        self.nav.snapshot()
    }

    /// `/flow/{step}`, with the session id appended for every step but the
    /// first.
    pub async fn step_url(&self, step: &StepId) -> String {
        if self.sequence().is_first(step) {
            return format!("/flow/{step}");
        }
        match self.store.session().session_id().await {
            Some(id) => format!("/flow/{step}?session_id={id}"),
            None => format!("/flow/{step}"),
        }
    }

    /// Move to `target`, raising the confirmation gate when leaving an
    /// unfinished guarded step.
    pub async fn navigate_to_step(&self, target: &StepId) -> Result<NavigationOutcome, FlowError> {
        if !self.sequence().contains(target) {
            return Err(FlowError::UnknownStep(target.to_string()));
        }
        Ok(self.navigate_inner(target, Gate::Check).await)
    }

    /// Proceed with the parked navigation.
    pub async fn confirm_navigation(&self) -> NavigationOutcome {
        match self.nav.take_pending() {
            Some(target) => {
                info!(step = %target, "Navigation confirmed");
                self.navigate_inner(&target, Gate::Bypass).await
            }
            None => NavigationOutcome::NothingPending,
        }
    }

    /// Drop the parked navigation. Returns the target that was pending.
    pub fn cancel_navigation(&self) -> Option<StepId> {
        let target = self.nav.take_pending();
        if let Some(target) = &target {
            info!(step = %target, "Navigation cancelled");
        }
        target
    }

    pub async fn navigate_to_previous_step(&self) -> NavigationOutcome {
        let current = self.current_step().await;
        match self.sequence().previous(&current).cloned() {
            Some(previous) => self.navigate_inner(&previous, Gate::Check).await,
            None => {
                self.events
                    .notice(NoticeLevel::Info, "You are already at the first step.");
                NavigationOutcome::Stayed { step: current }
            }
        }
    }

    /// The furthest step whose predecessors are all completed with data,
    /// or the current step when it already qualifies.
    pub async fn find_correct_step(&self) -> StepId {
        let presence = self.data_presence().await;
        let state = self.state.read().await;
        policy::find_correct_step(self.sequence(), &state, &presence)
    }

    pub async fn redirect_to_correct_step(&self) -> NavigationOutcome {
        let Some(_guard) = self.nav.redirect_op.try_enter() else {
            debug!("Redirect already in flight");
            return NavigationOutcome::Busy;
        };
        let target = self.find_correct_step().await;
        let current = self.current_step().await;
        if target == current {
            return NavigationOutcome::Stayed { step: current };
        }
        info!(from = %current, to = %target, "Redirecting to correct step");
        self.navigate_inner(&target, Gate::Bypass).await
    }

    pub(super) async fn navigate_inner(&self, target: &StepId, gate: Gate) -> NavigationOutcome {
        let Some(_guard) = self.nav.op.try_enter() else {
            debug!(step = %target, "Navigation in flight, dropping request");
            return NavigationOutcome::Busy;
        };
        let epoch = self.reset_epoch();

        for attempt in 0..2 {
            if gate == Gate::Check {
                if let Some(from) = self.gated_exit(target).await {
                    self.nav.raise(target);
                    self.events.emit(FlowEvent::ConfirmationRequested {
                        from: from.clone(),
                        to: target.clone(),
                    });
                    info!(from = %from, to = %target, "Navigation awaiting confirmation");
                    return NavigationOutcome::AwaitingConfirmation {
                        from,
                        to: target.clone(),
                    };
                }
            }
            if !self.fix_inconsistent_state().await {
                break;
            }
            if attempt == 0 {
                debug!(step = %target, "State repaired before navigation, retrying");
                tokio::time::sleep(self.config.retry_delay).await;
                if self.reset_since(epoch) {
                    return self.abandon(target);
                }
            }
        }

        let Some(destination) = self.fail_closed_destination(target, epoch).await else {
            return self.abandon(target);
        };
        let url = self.step_url(&destination).await;
        {
            let mut state = self.state.write().await;
            if self.reset_since(epoch) {
                return self.abandon(target);
            }
            state.current_step = destination.clone();
            self.store.save(&state).await;
        }
        self.announce_move(&destination, &url);
        if &destination == target {
            NavigationOutcome::Navigated {
                step: destination,
                url,
            }
        } else {
            NavigationOutcome::Redirected {
                requested: target.clone(),
                step: destination,
                url,
            }
        }
    }

    /// The current step, when leaving it for `target` needs confirmation.
    async fn gated_exit(&self, target: &StepId) -> Option<StepId> {
        let state = self.state.read().await;
        let current = &state.current_step;
        (current != target
            && self.config.is_guarded(current)
            && state.status(current) != StepStatus::Completed)
            .then(|| current.clone())
    }

    fn abandon(&self, target: &StepId) -> NavigationOutcome {
        info!(step = %target, "Workflow reset during navigation, dropping move");
        NavigationOutcome::Abandoned {
            requested: target.clone(),
        }
    }

    /// Demote the first earlier step that is completed without data and
    /// return it; otherwise `target`. `None` after a reset.
    async fn fail_closed_destination(&self, target: &StepId, epoch: u64) -> Option<StepId> {
        let presence = self.data_presence().await;
        let mut state = self.state.write().await;
        if self.reset_since(epoch) {
            return None;
        }
        for step in self.sequence().before(target) {
            if state.status(step) == StepStatus::Completed && !presence.has_data(step) {
                state.set_status(step, StepStatus::NotStarted);
                self.store.save(&state).await;
                warn!(
                    step = %step,
                    requested = %target,
                    "Completed step has no data, sending user back"
                );
                return Some(step.clone());
            }
        }
        Some(target.clone())
    }

    fn announce_move(&self, step: &StepId, url: &str) {
        self.nav.clear_pending();
        self.events.emit(FlowEvent::Navigate {
            step: step.clone(),
            url: url.to_string(),
        });
        info!(step = %step, url = %url, "Navigated");
    }

    /// Move to the first step without persisting anything.
    pub(crate) async fn force_to_first(&self) -> String {
        let first = self.sequence().first().clone();
        let url = self.step_url(&first).await;
        self.state.write().await.current_step = first.clone();
        self.announce_move(&first, &url);
        url
    }
}
