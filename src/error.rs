//! Error types for the KYC flow.

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Flow error: {0}")]
    Flow(#[from] FlowError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Errors surfaced to callers of the workflow engine.
///
/// Repair and navigation never produce these; they only reject input that
/// cannot name a step in the sequence or carries an unusable payload.
#[derive(Debug, thiserror::Error)]
pub enum FlowError {
    #[error("Unknown step: {0}")]
    UnknownStep(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Result type alias for the flow.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flow_error_converts_into_top_level() {
        let err: Error = FlowError::UnknownStep("kyc-video".into()).into();
        assert_eq!(err.to_string(), "Flow error: Unknown step: kyc-video");
    }

    #[test]
    fn database_error_message() {
        let err = DatabaseError::Query("set_setting: locked".into());
        assert_eq!(err.to_string(), "Query failed: set_setting: locked");
    }
}
