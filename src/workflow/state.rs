//! Workflow state model: step identifiers, step statuses, and the
//! persisted `WorkflowState` aggregate.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::sequence::StepSequence;

/// Identifier of one step in the sequence, e.g. `"personal-details"`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepId(String);

impl StepId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for StepId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl std::fmt::Display for StepId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle state of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    NotStarted,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl StepStatus {
    /// `completed` or `in_progress`: a status that claims progress.
    pub fn is_advanced(&self) -> bool {
        matches!(self, Self::Completed | Self::InProgress)
    }

    /// `failed`, `cancelled` or `not_started`: a status that blocks the
    /// steps after it.
    pub fn is_blocking(&self) -> bool {
        matches!(self, Self::Failed | Self::Cancelled | Self::NotStarted)
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NotStarted => "not_started",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Which sub-path of the later steps applies to this user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowMode {
    #[default]
    Online,
    Offline,
}

impl std::fmt::Display for FlowMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Online => write!(f, "online"),
            Self::Offline => write!(f, "offline"),
        }
    }
}

/// The persisted workflow aggregate.
///
/// `mode` is stored under its own key and is therefore skipped when the
/// aggregate itself is serialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub steps: BTreeMap<StepId, StepStatus>,
    pub current_step: StepId,
    #[serde(skip)]
    pub mode: FlowMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_document_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    /// Monotonic "ever completed" ledger, cleared only by a full reset.
    #[serde(default)]
    pub previously_completed_steps: BTreeMap<StepId, bool>,
    /// Provider document id recorded against the step it verified.
    #[serde(default)]
    pub provider_documents: BTreeMap<StepId, String>,
}

impl WorkflowState {
    /// Every step `not_started`, positioned on the first step.
    pub fn initial(sequence: &StepSequence) -> Self {
        Self {
            steps: sequence
                .iter()
                .map(|s| (s.clone(), StepStatus::NotStarted))
                .collect(),
            current_step: sequence.first().clone(),
            mode: FlowMode::default(),
            provider_session_id: None,
            provider_document_id: None,
            workflow_id: None,
            previously_completed_steps: BTreeMap::new(),
            provider_documents: BTreeMap::new(),
        }
    }

    /// Status of a step; steps missing from the map read as `not_started`.
    pub fn status(&self, step: &StepId) -> StepStatus {
        self.steps.get(step).copied().unwrap_or_default()
    }

    /// Set a step's status. Returns the previous status.
    pub fn set_status(&mut self, step: &StepId, status: StepStatus) -> StepStatus {
        self.steps.insert(step.clone(), status).unwrap_or_default()
    }

    pub fn mark_previously_completed(&mut self, step: &StepId) {
        self.previously_completed_steps.insert(step.clone(), true);
    }

    pub fn was_previously_completed(&self, step: &StepId) -> bool {
        self.previously_completed_steps
            .get(step)
            .copied()
            .unwrap_or(false)
    }

    /// Force the key set to be exactly the sequence and `current_step` to
    /// be a member of it. Returns `true` if anything was adjusted.
    pub fn normalize(&mut self, sequence: &StepSequence) -> bool {
        let mut changed = false;

        let before = self.steps.len();
        self.steps.retain(|step, _| sequence.contains(step));
        changed |= self.steps.len() != before;

        for step in sequence.iter() {
            if !self.steps.contains_key(step) {
                self.steps.insert(step.clone(), StepStatus::NotStarted);
                changed = true;
            }
        }

        self.previously_completed_steps
            .retain(|step, _| sequence.contains(step));

        if !sequence.contains(&self.current_step) {
            self.current_step = sequence.first().clone();
            changed = true;
        }

        changed
    }
}
