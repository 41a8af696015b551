//! Error types for the Tollgate engine.

use thiserror::Error;

/// Main error type for Tollgate operations.
#[derive(Error, Debug)]
pub enum TollgateError {
    /// A rule or configuration value was rejected at registration time
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The counter store could not be reached or did not answer in time
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// A user-supplied matcher or target extractor failed
    #[error("Rule '{rule_id}' failed to evaluate: {source}")]
    RuleEvaluation {
        rule_id: String,
        #[source]
        source: anyhow::Error,
    },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TollgateError {
    /// Whether the error came from the counter store rather than from a rule.
    pub fn is_storage(&self) -> bool {
        matches!(self, TollgateError::StorageUnavailable(_))
    }
}

/// Result type alias for Tollgate operations.
pub type Result<T> = std::result::Result<T, TollgateError>;
