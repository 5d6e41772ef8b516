//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;
use crate::workflow::sequence::StepSequence;
use crate::workflow::state::StepId;

/// Workflow engine configuration.
#[derive(Debug, Clone)]
pub struct FlowConfig {
    /// Ordered steps of the flow.
    pub sequence: StepSequence,
    /// Steps whose exit needs confirmation while not yet completed.
    pub guarded_steps: Vec<StepId>,
    /// Verified steps that keep the user in place after a provider
    /// failure or cancellation instead of sending them back.
    pub retry_in_place_steps: Vec<StepId>,
    /// Storage scope grouping every key of one workflow instance.
    pub scope: String,
    /// Delay between a step completion and the follow-up navigation.
    pub redirect_delay: Duration,
    /// Yield before retrying a navigation whose consistency check changed state.
    pub retry_delay: Duration,
    /// Length of the forced-restart countdown after token expiry.
    pub expiry_countdown: Duration,
    /// Countdown progress publishing interval.
    pub countdown_tick: Duration,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            sequence: StepSequence::default(),
            guarded_steps: vec![StepId::from("bank")],
            retry_in_place_steps: vec![StepId::from("nominee-poa")],
            scope: "kyc".to_string(),
            redirect_delay: Duration::from_millis(1500),
            retry_delay: Duration::from_millis(50),
            expiry_countdown: Duration::from_secs(10),
            countdown_tick: Duration::from_millis(100),
        }
    }
}

fn env_list(key: &str) -> Option<Vec<String>> {
    let raw = std::env::var(key).ok()?;
    Some(
        raw.split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
    )
}

fn env_parse<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("{e}"),
            }),
        Err(_) => Ok(None),
    }
}

impl FlowConfig {
    /// Build config from `KYC_FLOW_*` environment variables.
    ///
    /// Unset variables keep their defaults; malformed ones are rejected.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(steps) = env_list("KYC_FLOW_STEPS") {
            config.sequence =
                StepSequence::new(steps).map_err(|e| ConfigError::InvalidValue {
                    key: "KYC_FLOW_STEPS".to_string(),
                    message: e.to_string(),
                })?;
        }
        if let Some(steps) = env_list("KYC_FLOW_GUARDED_STEPS") {
            config.guarded_steps = steps.into_iter().map(StepId::new).collect();
        }
        if let Some(steps) = env_list("KYC_FLOW_RETRY_IN_PLACE_STEPS") {
            config.retry_in_place_steps = steps.into_iter().map(StepId::new).collect();
        }
        if let Ok(scope) = std::env::var("KYC_FLOW_SCOPE") {
            if !scope.trim().is_empty() {
                config.scope = scope.trim().to_string();
            }
        }
        if let Some(ms) = env_parse::<u64>("KYC_FLOW_REDIRECT_DELAY_MS")? {
            config.redirect_delay = Duration::from_millis(ms);
        }
        if let Some(secs) = env_parse::<u64>("KYC_FLOW_EXPIRY_SECS")? {
            config.expiry_countdown = Duration::from_secs(secs);
        }

        for step in config.guarded_steps.iter().chain(&config.retry_in_place_steps) {
            if !config.sequence.contains(step) {
                tracing::warn!(step = %step, "Configured step is not in the sequence");
            }
        }

        Ok(config)
    }

    /// Config for an explicit step list, defaults elsewhere.
    pub fn with_sequence(sequence: StepSequence) -> Self {
        Self {
            sequence,
            ..Self::default()
        }
    }

    pub fn is_guarded(&self, step: &StepId) -> bool {
        self.guarded_steps.contains(step)
    }

    pub fn retries_in_place(&self, step: &StepId) -> bool {
        self.retry_in_place_steps.contains(step)
    }
}

/// Server process configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub db_path: PathBuf,
    pub port: u16,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let db_path = std::env::var("KYC_FLOW_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data/kyc-flow.db"));
        let port = env_parse::<u16>("KYC_FLOW_PORT")?.unwrap_or(8080);
        Ok(Self { db_path, port })
    }
}
