//! Persistent workflow store: the durable aggregate, the mode, and the
//! per-step data blobs.
//!
//! Every method is best-effort on the read and save paths: failures are
//! logged and the caller sees "no state" or a silently skipped write.
//! Saving step data is the exception, since a step must never be marked
//! completed without its data.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::DatabaseError;
use crate::store::Database;

use super::sequence::StepSequence;
use super::session::SessionBinder;
use super::state::{FlowMode, StepId, WorkflowState};

/// Keys used for workflow persistence within a scope.
pub mod keys {
    /// The `WorkflowState` JSON blob.
    pub const WORKFLOW_STATE: &str = "workflow_state";
    /// The `FlowMode`, stored apart from the aggregate.
    pub const WORKFLOW_MODE: &str = "workflow_mode";
    /// Prefix of per-step data blobs: `step_data:{step}`.
    pub const STEP_DATA_PREFIX: &str = "step_data:";
}

fn step_data_key(step: &StepId) -> String {
    format!("{}{}", keys::STEP_DATA_PREFIX, step)
}

/// Data submitted by a step's own form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub data: serde_json::Value,
    pub saved_at: DateTime<Utc>,
}

/// Durable workflow persistence plus the ephemeral session binder.
#[derive(Clone)]
pub struct WorkflowStore {
    durable: Arc<dyn Database>,
    session: SessionBinder,
    scope: String,
}

impl WorkflowStore {
    pub fn new(durable: Arc<dyn Database>, session: Arc<dyn Database>, scope: &str) -> Self {
        Self {
            durable,
            session: SessionBinder::new(session, scope),
            scope: scope.to_string(),
        }
    }

    pub fn session(&self) -> &SessionBinder {
        &self.session
    }

    /// Load the aggregate, falling back to the initial state when nothing
    /// is stored or the stored value does not parse.
    pub async fn load(&self, sequence: &StepSequence) -> WorkflowState {
        let mut state = match self
            .durable
            .get_setting(&self.scope, keys::WORKFLOW_STATE)
            .await
        {
            Ok(Some(value)) => match serde_json::from_value::<WorkflowState>(value) {
                Ok(state) => state,
                Err(e) => {
                    warn!("Stored workflow state is unreadable, starting fresh: {}", e);
                    WorkflowState::initial(sequence)
                }
            },
            Ok(None) => WorkflowState::initial(sequence),
            Err(e) => {
                warn!("Failed to load workflow state: {}", e);
                WorkflowState::initial(sequence)
            }
        };

        if state.normalize(sequence) {
            info!("Normalized stored workflow state against the step sequence");
        }
        state.mode = self.load_mode().await;
        state
    }

    /// Whether a parseable aggregate exists in durable storage.
    pub async fn has_state(&self) -> bool {
        match self
            .durable
            .get_setting(&self.scope, keys::WORKFLOW_STATE)
            .await
        {
            Ok(Some(value)) => serde_json::from_value::<WorkflowState>(value).is_ok(),
            Ok(None) => false,
            Err(e) => {
                warn!("Failed to check for workflow state: {}", e);
                false
            }
        }
    }

    /// Persist the aggregate (without the mode).
    pub async fn save(&self, state: &WorkflowState) {
        let value = match serde_json::to_value(state) {
            Ok(v) => v,
            Err(e) => {
                warn!("Failed to serialize workflow state: {}", e);
                return;
            }
        };
        if let Err(e) = self
            .durable
            .set_setting(&self.scope, keys::WORKFLOW_STATE, &value)
            .await
        {
            warn!("Failed to persist workflow state: {}", e);
        }
    }

    pub async fn load_mode(&self) -> FlowMode {
        match self
            .durable
            .get_setting(&self.scope, keys::WORKFLOW_MODE)
            .await
        {
            Ok(Some(value)) => serde_json::from_value(value).unwrap_or_default(),
            Ok(None) => FlowMode::default(),
            Err(e) => {
                warn!("Failed to load workflow mode: {}", e);
                FlowMode::default()
            }
        }
    }

    pub async fn save_mode(&self, mode: FlowMode) {
        let value = serde_json::Value::String(mode.to_string());
        if let Err(e) = self
            .durable
            .set_setting(&self.scope, keys::WORKFLOW_MODE, &value)
            .await
        {
            warn!("Failed to persist workflow mode: {}", e);
        }
    }

    /// Write a step's data blob. Errors are returned, not swallowed.
    pub async fn save_step_data(
        &self,
        step: &StepId,
        data: serde_json::Value,
    ) -> Result<(), DatabaseError> {
        let record = StepRecord {
            data,
            saved_at: Utc::now(),
        };
        let value = serde_json::to_value(&record)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        self.durable
            .set_setting(&self.scope, &step_data_key(step), &value)
            .await
    }

    pub async fn load_step_data(&self, step: &StepId) -> Option<StepRecord> {
        match self
            .durable
            .get_setting(&self.scope, &step_data_key(step))
            .await
        {
            Ok(Some(value)) => serde_json::from_value(value).ok(),
            Ok(None) => None,
            Err(e) => {
                warn!(step = %step, "Failed to load step data: {}", e);
                None
            }
        }
    }

    pub async fn remove_step_data(&self, step: &StepId) -> bool {
        match self
            .durable
            .delete_setting(&self.scope, &step_data_key(step))
            .await
        {
            Ok(removed) => removed,
            Err(e) => {
                warn!(step = %step, "Failed to remove step data: {}", e);
                false
            }
        }
    }

    /// Snapshot of which steps currently have readable data.
    pub async fn presence(&self, sequence: &StepSequence) -> BTreeSet<StepId> {
        let mut present = BTreeSet::new();
        for step in sequence.iter() {
            if self.load_step_data(step).await.is_some() {
                present.insert(step.clone());
            }
        }
        present
    }

    /// Erase the aggregate, the mode, every step blob and the session id.
    pub async fn clear_all(&self) {
        match self.durable.clear_scope(&self.scope).await {
            Ok(count) => info!(count, scope = %self.scope, "Cleared workflow storage"),
            Err(e) => warn!("Failed to clear workflow storage: {}", e),
        }
        self.session.clear_session().await;
    }
}
