//! Engine-level error types.
//!
//! Collaborator and IO failures travel as `anyhow::Error` with context; the
//! variants here cover what the decision pass itself can reject.

use thiserror::Error;

/// Result alias for the pure decision pass.
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Errors raised by the decision engine.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    /// Configuration values are out of range or inconsistent
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Balance/position data cannot form a consistent portfolio
    #[error("Invalid portfolio snapshot: {0}")]
    InvalidSnapshot(String),

    /// A decision failed validation at construction
    #[error("Invalid decision for {ticker}: {reason}")]
    InvalidDecision { ticker: String, reason: String },

    /// The reconciled decision set breaks a portfolio invariant
    #[error("Invariant violated: {0}")]
    InvariantViolation(String),

    /// Inputs could not be serialized for the cycle fingerprint
    #[error("Failed to fingerprint cycle inputs: {0}")]
    Fingerprint(String),
}

impl EngineError {
    pub fn invalid_decision(ticker: &str, reason: impl Into<String>) -> Self {
        Self::InvalidDecision {
            ticker: ticker.to_string(),
            reason: reason.into(),
        }
    }
}
