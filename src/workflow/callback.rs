//! External callback reconciler.
//!
//! The verification provider redirects back with `status`, `documentId`
//! and an optional `message`. The outcome applies to the step *before* the
//! one the user landed on. A success may also restore downstream progress
//! recorded in the completion ledger.

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::events::{FlowEvent, NoticeLevel};

use super::engine::{EntryQuery, WorkflowEngine};
use super::navigation::{Gate, NavigationOutcome};
use super::policy::StepDataPresence;
use super::sequence::StepSequence;
use super::state::{StepId, StepStatus, WorkflowState};

/// Outcome reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderStatus {
    Success,
    Failure,
    Cancel,
}

impl ProviderStatus {
    /// Anything other than `success` or `cancel` counts as a failure.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "success" => Self::Success,
            "cancel" => Self::Cancel,
            _ => Self::Failure,
        }
    }

    pub fn step_status(self) -> StepStatus {
        match self {
            Self::Success => StepStatus::Completed,
            Self::Cancel => StepStatus::Cancelled,
            Self::Failure => StepStatus::Failed,
        }
    }
}

/// Provider redirect parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackParams {
    pub status: ProviderStatus,
    pub document_id: String,
    pub message: Option<String>,
}

impl CallbackParams {
    /// Present only when both `status` and `documentId` are set.
    pub fn from_query(query: &EntryQuery) -> Option<Self> {
        let status = query.status.as_deref().filter(|s| !s.is_empty())?;
        let document_id = query.document_id.as_deref().filter(|s| !s.is_empty())?;
        Some(Self {
            status: ProviderStatus::parse(status),
            document_id: document_id.to_string(),
            message: query.message.clone().filter(|m| !m.trim().is_empty()),
        })
    }
}

/// What a reconciliation changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reconciliation {
    pub verified_step: StepId,
    pub outcome: StepStatus,
    /// Later steps restored to `completed` from the ledger.
    pub restored: Vec<StepId>,
    /// Where the user must go back to, if anywhere.
    pub return_to: Option<StepId>,
}

/// Apply provider parameters to `state` for a user who landed on `current`.
///
/// Returns `None` when `current` has no predecessor, since no step can have
/// been under verification.
pub fn reconcile(
    sequence: &StepSequence,
    state: &mut WorkflowState,
    data: &impl StepDataPresence,
    current: &StepId,
    params: &CallbackParams,
    retry_in_place: impl Fn(&StepId) -> bool,
) -> Option<Reconciliation> {
    let verified = sequence.previous(current)?.clone();
    let outcome = params.status.step_status();

    state.set_status(&verified, outcome);
    state
        .provider_documents
        .insert(verified.clone(), params.document_id.clone());
    state.provider_document_id = Some(params.document_id.clone());

    let mut restored = Vec::new();
    if outcome == StepStatus::Completed {
        state.mark_previously_completed(&verified);
        for step in sequence.after(&verified) {
            if !(state.was_previously_completed(step) && data.has_data(step)) {
                break;
            }
            state.set_status(step, StepStatus::Completed);
            restored.push(step.clone());
        }
    }

    let return_to = match params.status {
        ProviderStatus::Success => None,
        _ if retry_in_place(&verified) => None,
        _ => Some(verified.clone()),
    };

    Some(Reconciliation {
        verified_step: verified,
        outcome,
        restored,
        return_to,
    })
}

/// Reconciliation plus any navigation it triggered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallbackOutcome {
    pub reconciliation: Reconciliation,
    pub navigation: Option<NavigationOutcome>,
}

impl WorkflowEngine {
    /// Reconcile provider parameters against the current step.
    ///
    /// At most once per active step; repeats return `None`.
    pub async fn process_callback(&self, params: &CallbackParams) -> Option<CallbackOutcome> {
        let current = self.current_step().await;
        self.apply_callback(&current, params).await
    }

    pub(super) async fn apply_callback(
        &self,
        current: &StepId,
        params: &CallbackParams,
    ) -> Option<CallbackOutcome> {
        if !self.latches.callback.try_fire() {
            debug!(step = %current, "Callback already processed for this step");
            return None;
        }

        let presence = self.data_presence().await;
        let reconciliation = {
            let mut state = self.state.write().await;
            let result = reconcile(
                self.sequence(),
                &mut state,
                &presence,
                current,
                params,
                |step| self.config.retries_in_place(step),
            );
            if result.is_some() {
                self.store.save(&state).await;
            }
            result
        };

        self.strip_callback_params(current).await;

        let Some(reconciliation) = reconciliation else {
            warn!(step = %current, "Provider callback on the first step, ignoring");
            self.events.notice(
                NoticeLevel::Warning,
                "The verification result could not be matched to a step.",
            );
            return None;
        };

        info!(
            step = %reconciliation.verified_step,
            outcome = %reconciliation.outcome,
            document_id = %params.document_id,
            restored = reconciliation.restored.len(),
            "Reconciled provider callback"
        );
        self.notify_outcome(params);
        if !reconciliation.restored.is_empty() {
            self.events.notice(
                NoticeLevel::Info,
                format!(
                    "Restored {} previously completed step(s).",
                    reconciliation.restored.len()
                ),
            );
        }

        let navigation = match &reconciliation.return_to {
            Some(step) => Some(self.navigate_inner(step, Gate::Bypass).await),
            None => None,
        };

        Some(CallbackOutcome {
            reconciliation,
            navigation,
        })
    }

    fn notify_outcome(&self, params: &CallbackParams) {
        let (level, fallback) = match params.status {
            ProviderStatus::Success => (NoticeLevel::Success, "Verification successful."),
            ProviderStatus::Cancel => (NoticeLevel::Warning, "Verification was cancelled."),
            ProviderStatus::Failure => (
                NoticeLevel::Error,
                "Verification failed. Please try again.",
            ),
        };
        let message = match (params.status, &params.message) {
            (ProviderStatus::Success, _) | (_, None) => fallback.to_string(),
            (_, Some(message)) => message.clone(),
        };
        self.events.notice(level, message);
    }

    /// Replace the visible location with the bare step URL.
    async fn strip_callback_params(&self, step: &StepId) {
        let url = self.step_url(step).await;
        self.events.emit(FlowEvent::LocationReplaced { url });
    }
}
