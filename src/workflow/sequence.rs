//! The fixed, ordered list of onboarding steps.

use crate::error::FlowError;

use super::state::StepId;

/// Steps of the default KYC onboarding flow, in order.
pub const DEFAULT_STEPS: &[&str] = &[
    "signin",
    "personal-details",
    "nominee-poa",
    "bank",
    "exchange",
    "completion",
];

/// Ordered, non-empty, duplicate-free list of steps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepSequence {
    steps: Vec<StepId>,
}

impl StepSequence {
    pub fn new<I, S>(steps: I) -> Result<Self, FlowError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut out: Vec<StepId> = Vec::new();
        for step in steps {
            let raw: String = step.into();
            let id = StepId::new(raw.trim());
            if id.as_str().is_empty() {
                return Err(FlowError::InvalidRequest("empty step id".into()));
            }
            if out.contains(&id) {
                return Err(FlowError::InvalidRequest(format!("duplicate step: {id}")));
            }
            out.push(id);
        }
        if out.is_empty() {
            return Err(FlowError::InvalidRequest(
                "step sequence must not be empty".into(),
            ));
        }
        Ok(Self { steps: out })
    }

    pub fn first(&self) -> &StepId {
        &self.steps[0]
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, StepId> {
        self.steps.iter()
    }

    pub fn as_slice(&self) -> &[StepId] {
        &self.steps
    }

    pub fn index_of(&self, step: &StepId) -> Option<usize> {
        self.steps.iter().position(|s| s == step)
    }

    pub fn contains(&self, step: &StepId) -> bool {
        self.index_of(step).is_some()
    }

    pub fn is_first(&self, step: &StepId) -> bool {
        self.first() == step
    }

    /// Look up a step by its string id.
    pub fn get(&self, id: &str) -> Option<&StepId> {
        self.steps.iter().find(|s| s.as_str() == id)
    }

    /// Like [`get`](Self::get) but reports unknown ids as an error.
    pub fn require(&self, id: &str) -> Result<StepId, FlowError> {
        self.get(id)
            .cloned()
            .ok_or_else(|| FlowError::UnknownStep(id.to_string()))
    }

    pub fn next(&self, step: &StepId) -> Option<&StepId> {
        let idx = self.index_of(step)?;
        self.steps.get(idx + 1)
    }

    pub fn previous(&self, step: &StepId) -> Option<&StepId> {
        let idx = self.index_of(step)?;
        idx.checked_sub(1).map(|i| &self.steps[i])
    }

    /// Steps strictly before `step`. Empty for the first or an unknown step.
    pub fn before(&self, step: &StepId) -> &[StepId] {
        match self.index_of(step) {
            Some(idx) => &self.steps[..idx],
            None => &[],
        }
    }

    /// Steps strictly after `step`. Empty for the last or an unknown step.
    pub fn after(&self, step: &StepId) -> &[StepId] {
        match self.index_of(step) {
            Some(idx) => &self.steps[idx + 1..],
            None => &[],
        }
    }
}

impl Default for StepSequence {
    fn default() -> Self {
        Self {
            steps: DEFAULT_STEPS.iter().map(|s| StepId::from(*s)).collect(),
        }
    }
}
