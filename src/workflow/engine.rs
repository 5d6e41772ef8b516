//! WorkflowEngine: owns the workflow state and coordinates persistence,
//! repair, step completion and page entry.
//!
//! Navigation lives in `navigation.rs` and provider callbacks in
//! `callback.rs`; both are further `impl WorkflowEngine` blocks.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::FlowConfig;
use crate::error::FlowError;
use crate::events::{EventBus, FlowEvent, NoticeLevel};
use crate::store::Database;

use super::callback::CallbackParams;
use super::latch::OneShotLatch;
use super::navigation::{Gate, NavigationController, NavigationOutcome, NavigationSnapshot};
use super::persist::WorkflowStore;
use super::policy::{StepDataPresence, can_access_step};
use super::repair::{self, StatusChange};
use super::schedule::ScheduledTask;
use super::sequence::StepSequence;
use super::state::{FlowMode, StepId, StepStatus, WorkflowState};

/// Query parameters carried by a page entry.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EntryQuery {
    pub status: Option<String>,
    #[serde(rename = "documentId")]
    pub document_id: Option<String>,
    pub message: Option<String>,
    #[serde(rename = "sessionId", alias = "session_id")]
    pub session_id: Option<String>,
}

/// Why a page entry ended somewhere other than the requested step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RedirectReason {
    UnknownStep,
    AccessDenied,
    ProviderOutcome,
}

/// Result of entering a step.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EntryOutcome {
    Entered {
        step: StepId,
    },
    Redirected {
        reason: RedirectReason,
        navigation: NavigationOutcome,
    },
    SessionLost {
        url: String,
    },
}

/// Snapshot returned by status queries.
#[derive(Debug, Clone, Serialize)]
pub struct FlowStatus {
    pub state: WorkflowState,
    pub mode: FlowMode,
    pub session_id: Option<String>,
    pub steps_with_data: BTreeSet<StepId>,
    pub navigation: NavigationSnapshot,
}

/// One-shot latches scoped to the active step.
#[derive(Default)]
pub(super) struct EntryLatches {
    pub(super) callback: OneShotLatch,
    pub(super) repair: OneShotLatch,
    active_step: Mutex<Option<StepId>>,
}

impl EntryLatches {
    /// Record the active step, resetting the latches when it changed.
    fn observe_step(&self, step: &StepId) -> bool {
        let mut active = lock(&self.active_step);
        if active.as_ref() == Some(step) {
            return false;
        }
        *active = Some(step.clone());
        self.callback.reset();
        self.repair.reset();
        true
    }

    fn reset(&self) {
        *lock(&self.active_step) = None;
        self.callback.reset();
        self.repair.reset();
    }
}

/// Lock a std mutex, recovering the data from a poisoned lock.
pub(super) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// The workflow engine.
pub struct WorkflowEngine {
    pub(super) config: FlowConfig,
    pub(super) store: WorkflowStore,
    pub(super) state: RwLock<WorkflowState>,
    pub(super) events: EventBus,
    pub(super) nav: NavigationController,
    pub(super) latches: EntryLatches,
    pending_redirect: Mutex<Option<ScheduledTask>>,
    /// Bumped by every reset, under the state write lock.
    reset_epoch: AtomicU64,
}

impl WorkflowEngine {
    /// Build an engine and load any stored state.
    pub async fn open(
        config: FlowConfig,
        durable: Arc<dyn Database>,
        session: Arc<dyn Database>,
        events: EventBus,
    ) -> Arc<Self> {
        let store = WorkflowStore::new(durable, session, &config.scope);
        let state = store.load(&config.sequence).await;
        info!(
            current_step = %state.current_step,
            mode = %state.mode,
            "Workflow engine ready"
        );
        Arc::new(Self {
            config,
            store,
            state: RwLock::new(state),
            events,
            nav: NavigationController::default(),
            latches: EntryLatches::default(),
            pending_redirect: Mutex::new(None),
            reset_epoch: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &FlowConfig {
        &self.config
    }

    pub fn sequence(&self) -> &StepSequence {
        &self.config.sequence
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn store(&self) -> &WorkflowStore {
        &self.store
    }

    pub async fn snapshot(&self) -> WorkflowState {
        self.state.read().await.clone()
    }

    pub async fn current_step(&self) -> StepId {
        self.state.read().await.current_step.clone()
    }

    pub async fn data_presence(&self) -> BTreeSet<StepId> {
        self.store.presence(self.sequence()).await
    }

    pub async fn has_data(&self, step: &StepId) -> bool {
        self.data_presence().await.has_data(step)
    }

    pub async fn status(&self) -> FlowStatus {
        let steps_with_data = self.data_presence().await;
        let state = self.snapshot().await;
        FlowStatus {
            mode: state.mode,
            state,
            session_id: self.store.session().session_id().await,
            steps_with_data,
            navigation: self.nav.snapshot(),
        }
    }

    // ── Access policy ───────────────────────────────────────────────

    pub async fn can_access_step(&self, step: &StepId) -> bool {
        let presence = self.data_presence().await;
        let state = self.state.read().await;
        can_access_step(self.sequence(), &state, &presence, step)
    }

    // ── Consistency repair ──────────────────────────────────────────

    /// Demote impossible statuses, at most once per active step.
    pub async fn validate_step_statuses(&self) -> Vec<StatusChange> {
        if !self.latches.repair.try_fire() {
            debug!("Status validation already ran for this step");
            return Vec::new();
        }
        self.revalidate_step_statuses().await
    }

    /// Demote impossible statuses regardless of the per-step latch.
    pub async fn revalidate_step_statuses(&self) -> Vec<StatusChange> {
        let presence = self.data_presence().await;
        let mut state = self.state.write().await;
        let changes = repair::validate_step_statuses(self.sequence(), &mut state, &presence);
        if !changes.is_empty() {
            for change in &changes {
                info!(
                    step = %change.step,
                    from = %change.from,
                    to = %change.to,
                    "Repaired step status"
                );
            }
            self.store.save(&state).await;
        }
        changes
    }

    /// Promote steps whose status lags behind their data. Returns whether
    /// anything changed.
    pub async fn fix_inconsistent_state(&self) -> bool {
        let presence = self.data_presence().await;
        let mut state = self.state.write().await;
        let changes = repair::fix_inconsistent_state(self.sequence(), &mut state, &presence);
        if changes.is_empty() {
            return false;
        }
        for change in &changes {
            info!(step = %change.step, "Promoted lagging step to completed");
        }
        self.store.save(&state).await;
        true
    }

    // ── Step mutations ──────────────────────────────────────────────

    /// Persist a step's data, mark it completed, and schedule navigation to
    /// `next` (or the following step) after the redirect delay.
    ///
    /// Returns the step that will be navigated to, if any.
    pub async fn complete_step(
        self: &Arc<Self>,
        step: &StepId,
        data: serde_json::Value,
        next: Option<&StepId>,
    ) -> crate::error::Result<Option<StepId>> {
        let sequence = self.sequence();
        if !sequence.contains(step) {
            return Err(FlowError::UnknownStep(step.to_string()).into());
        }
        if let Some(next) = next {
            if !sequence.contains(next) {
                return Err(FlowError::UnknownStep(next.to_string()).into());
            }
        }

        if let Err(e) = self.store.save_step_data(step, data).await {
            warn!(step = %step, "Failed to save step data: {}", e);
            self.events.notice(
                NoticeLevel::Error,
                "We could not save your details. Please try again.",
            );
            return Err(e.into());
        }

        {
            let mut state = self.state.write().await;
            state.set_status(step, StepStatus::Completed);
            state.mark_previously_completed(step);
            self.store.save(&state).await;
        }
        info!(step = %step, "Step completed");
        self.events
            .notice(NoticeLevel::Success, format!("Step {step} completed"));

        let next = next.cloned().or_else(|| sequence.next(step).cloned());
        if let Some(next) = &next {
            self.schedule_navigation(next.clone());
        }
        Ok(next)
    }

    fn schedule_navigation(self: &Arc<Self>, to: StepId) {
        let delay = self.config.redirect_delay;
        self.events.emit(FlowEvent::Redirecting {
            to: to.clone(),
            delay_ms: delay.as_millis() as u64,
        });

        let engine = Arc::clone(self);
        let task = ScheduledTask::after(delay, async move {
            if let Err(e) = engine.navigate_to_step(&to).await {
                warn!(step = %to, "Delayed navigation failed: {}", e);
            }
        });
        *lock(&self.pending_redirect) = Some(task);
    }

    /// Drop a delayed navigation that has not fired yet.
    pub fn cancel_scheduled_navigation(&self) -> bool {
        match lock(&self.pending_redirect).take() {
            Some(task) => {
                let pending = !task.is_finished();
                task.cancel();
                pending
            }
            None => false,
        }
    }

    /// Mark a step `in_progress` if it has not been started.
    pub async fn start_step(&self, step: &StepId) -> Result<(), FlowError> {
        if !self.sequence().contains(step) {
            return Err(FlowError::UnknownStep(step.to_string()));
        }
        let mut state = self.state.write().await;
        if state.status(step) == StepStatus::NotStarted {
            state.set_status(step, StepStatus::InProgress);
            self.store.save(&state).await;
        }
        Ok(())
    }

    /// Direct status write. Marking `completed` also sets the ledger flag.
    pub async fn set_step_status(&self, step: &StepId, status: StepStatus) -> Result<(), FlowError> {
        if !self.sequence().contains(step) {
            return Err(FlowError::UnknownStep(step.to_string()));
        }
        let mut state = self.state.write().await;
        let from = state.set_status(step, status);
        if status == StepStatus::Completed {
            state.mark_previously_completed(step);
        }
        self.store.save(&state).await;
        debug!(step = %step, from = %from, to = %status, "Step status set");
        Ok(())
    }

    /// Remove a step's data blob. The next repair pass demotes the step if
    /// it was completed.
    pub async fn remove_step_data(&self, step: &StepId) -> bool {
        self.store.remove_step_data(step).await
    }

    pub async fn set_mode(&self, mode: FlowMode) {
        self.state.write().await.mode = mode;
        self.store.save_mode(mode).await;
        info!(mode = %mode, "Flow mode set");
    }

    /// Record identifiers issued by the provider or backend.
    pub async fn set_provider_ids(
        &self,
        provider_session_id: Option<String>,
        workflow_id: Option<String>,
    ) {
        let mut state = self.state.write().await;
        if provider_session_id.is_some() {
            state.provider_session_id = provider_session_id;
        }
        if workflow_id.is_some() {
            state.workflow_id = workflow_id;
        }
        self.store.save(&state).await;
    }

    // ── Reset ───────────────────────────────────────────────────────

    /// Erase all stored data and return to the initial state, without
    /// persisting the fresh state.
    pub async fn reset_all(&self) {
        self.cancel_scheduled_navigation();
        {
            let mut state = self.state.write().await;
            self.reset_epoch.fetch_add(1, Ordering::AcqRel);
            self.store.clear_all().await;
            *state = WorkflowState::initial(self.sequence());
        }
        self.nav.clear_pending();
        self.latches.reset();
        info!("Workflow reset");
    }

    pub(super) fn reset_epoch(&self) -> u64 {
        self.reset_epoch.load(Ordering::Acquire)
    }

    /// Whether a reset happened after `epoch` was read.
    pub(super) fn reset_since(&self, epoch: u64) -> bool {
        self.reset_epoch() != epoch
    }

    /// Explicit restart: reset and send the user to the first step.
    pub async fn restart(&self) -> String {
        self.reset_all().await;
        self.events
            .notice(NoticeLevel::Info, "Verification restarted");
        self.force_to_first().await
    }

    // ── Page entry ──────────────────────────────────────────────────

    /// Handle the user landing on `/flow/{step_id}`.
    pub async fn enter_step(&self, step_id: &str, query: &EntryQuery) -> EntryOutcome {
        let Some(step) = self.sequence().get(step_id).cloned() else {
            warn!(step = step_id, "Entry to unknown step");
            self.events
                .notice(NoticeLevel::Warning, "That step does not exist.");
            return self.redirect_to_computed(RedirectReason::UnknownStep).await;
        };

        if !self.store.has_state().await {
            if !self.sequence().is_first(&step) {
                warn!(step = %step, "Workflow state missing on entry, restarting flow");
                self.events.notice(
                    NoticeLevel::Warning,
                    "Your session was lost. Please start again.",
                );
                self.reset_all().await;
                let url = self.force_to_first().await;
                return EntryOutcome::SessionLost { url };
            }
            let mode = self.store.load_mode().await;
            let mut state = self.state.write().await;
            *state = WorkflowState::initial(self.sequence());
            state.mode = mode;
            self.store.save(&state).await;
            info!("Created workflow state");
        }

        if self.latches.observe_step(&step) {
            debug!(step = %step, "Active step changed, entry latches reset");
        }

        match query.session_id.as_deref() {
            Some(id) if !id.is_empty() => self.store.session().set_session_id(id).await,
            _ => {
                self.store.session().ensure_session_id().await;
            }
        }

        self.validate_step_statuses().await;

        // A failed or cancelled verification on a retry-in-place step keeps
        // the user here even though that step is no longer settled.
        let mut kept_in_place = false;
        if let Some(params) = CallbackParams::from_query(query) {
            if let Some(outcome) = self.apply_callback(&step, &params).await {
                if let Some(navigation) = outcome.navigation {
                    return EntryOutcome::Redirected {
                        reason: RedirectReason::ProviderOutcome,
                        navigation,
                    };
                }
                kept_in_place = outcome.reconciliation.outcome != StepStatus::Completed;
                if kept_in_place {
                    debug!(
                        step = %step,
                        verified = %outcome.reconciliation.verified_step,
                        "Verification retried in place"
                    );
                }
            }
        }

        let presence = self.data_presence().await;
        let allowed = kept_in_place || {
            let state = self.state.read().await;
            can_access_step(self.sequence(), &state, &presence, &step)
        };
        if !allowed {
            info!(step = %step, "Access denied, redirecting");
            self.events.notice(
                NoticeLevel::Warning,
                "Please complete the earlier steps first.",
            );
            return self.redirect_to_computed(RedirectReason::AccessDenied).await;
        }

        {
            let mut state = self.state.write().await;
            state.current_step = step.clone();
            if state.status(&step) == StepStatus::NotStarted {
                state.set_status(&step, StepStatus::InProgress);
            }
            self.store.save(&state).await;
        }
        EntryOutcome::Entered { step }
    }

    async fn redirect_to_computed(&self, reason: RedirectReason) -> EntryOutcome {
        let target = self.find_correct_step().await;
        let navigation = self.navigate_inner(&target, Gate::Bypass).await;
        EntryOutcome::Redirected { reason, navigation }
    }
}
